//! Bootstrap helpers for starting a training run from a single YAML config.

use std::path::{Path, PathBuf};
use std::sync::{Arc, OnceLock};

use thiserror::Error;

use tessera_config::{ConfigError, ConfigManager, ObservabilityConfig, TesseraConfig};
use tessera_core::lm::LanguageModel;
use tessera_core::optimizer::OproOptimizer;
use tessera_core::store::StoreError;
use tessera_lm::{ConfigLanguageModelResolver, LmBuildError};
use tessera_stores::InMemoryVariableStore;

use crate::hooks::HookRegistry;
use crate::trainer::{RewardSource, Trainer, TrainerConfig, TrainerError, TrainingHistory};

static TRACING_INIT: OnceLock<()> = OnceLock::new();

/// Runtime bootstrap errors.
#[derive(Debug, Error)]
pub enum BootstrapError {
    #[error("config error: {0}")]
    Config(#[from] ConfigError),
    #[error("language model build error: {0}")]
    LmBuild(#[from] LmBuildError),
    #[error("no model profile configured for the optimizer")]
    MissingModelProfile,
    #[error("store error: {0}")]
    Store(#[from] StoreError),
    #[error("training error: {0}")]
    Training(#[from] TrainerError),
    #[error("snapshot io error at '{path}': {source}")]
    Io {
        path: String,
        #[source]
        source: std::io::Error,
    },
    #[error("snapshot parse error: {0}")]
    Snapshot(#[from] serde_json::Error),
}

/// Training bundle created from unified config.
pub struct TrainingApp {
    pub config_manager: ConfigManager,
    pub store: Arc<InMemoryVariableStore>,
    pub optimizer: Arc<OproOptimizer>,
    pub trainer: Trainer,
    pub hooks: Arc<HookRegistry>,
    epochs: usize,
    snapshot_path: Option<PathBuf>,
}

impl TrainingApp {
    /// Create a training app from a single `tessera.yaml`.
    pub async fn from_config_path(path: impl Into<PathBuf>) -> Result<Self, BootstrapError> {
        let config_manager = ConfigManager::new(path);
        config_manager.load().await?;
        let config = config_manager.config().read().await.clone();
        init_tracing_if_needed(&config.observability);

        let profile = config
            .optimizer_model()
            .ok_or(BootstrapError::MissingModelProfile)?;
        let resolver = ConfigLanguageModelResolver::new(config.providers.clone());
        let language_model = resolver.build_profile(&profile.name)?;
        tracing::info!(
            profile = %profile.name,
            model = %language_model.model_name(),
            "optimizer language model resolved"
        );
        Self::assemble(config_manager, &config, language_model)
    }

    /// Same as [`TrainingApp::from_config_path`] with a caller-supplied
    /// optimizer language model; the providers table is not consulted.
    pub async fn from_config_path_with_model(
        path: impl Into<PathBuf>,
        language_model: Arc<dyn LanguageModel>,
    ) -> Result<Self, BootstrapError> {
        let config_manager = ConfigManager::new(path);
        config_manager.load().await?;
        let config = config_manager.config().read().await.clone();
        init_tracing_if_needed(&config.observability);
        Self::assemble(config_manager, &config, language_model)
    }

    fn assemble(
        config_manager: ConfigManager,
        config: &TesseraConfig,
        language_model: Arc<dyn LanguageModel>,
    ) -> Result<Self, BootstrapError> {
        let store_spec = &config.stores.variables;
        let store = Arc::new(InMemoryVariableStore::with_max_variables(
            store_spec.max_variables,
        ));
        let snapshot_path = store_spec.snapshot_path.as_ref().map(PathBuf::from);
        if let Some(path) = snapshot_path.as_deref().filter(|p| p.exists()) {
            let restored = restore_snapshot(&store, path)?;
            tracing::info!(
                path = %path.display(),
                variables = restored,
                "variable snapshot restored"
            );
        }

        let optimizer_config = &config.optimizer;
        let mut optimizer =
            OproOptimizer::new(language_model).with_k_best(optimizer_config.k_best);
        if let Some(name) = &optimizer_config.name {
            optimizer = optimizer.with_name(name.clone());
        }
        if let Some(meta) = &optimizer_config.meta_instructions {
            optimizer = optimizer.with_meta_instructions(meta.clone());
        }
        let optimizer = Arc::new(optimizer);

        let hooks = Arc::new(HookRegistry::new());
        let trainer = Trainer::new(optimizer.clone(), store.clone())
            .with_config(TrainerConfig::from(&config.training))
            .with_hooks(hooks.clone());

        tracing::info!(
            app = %config.app.name,
            environment = %config.app.environment,
            k_best = optimizer_config.k_best,
            epochs = config.training.epochs,
            max_variables = store_spec.max_variables,
            "training app assembled"
        );

        Ok(Self {
            config_manager,
            store,
            optimizer,
            trainer,
            hooks,
            epochs: config.training.epochs,
            snapshot_path,
        })
    }

    /// Configured epoch count.
    pub fn epochs(&self) -> usize {
        self.epochs
    }

    pub fn snapshot_path(&self) -> Option<&Path> {
        self.snapshot_path.as_deref()
    }

    /// Run the configured number of epochs.
    pub async fn fit(&self, rewards: &dyn RewardSource) -> Result<TrainingHistory, BootstrapError> {
        Ok(self.trainer.fit(self.epochs, rewards).await?)
    }

    /// Write the store snapshot to the configured path.
    ///
    /// Returns the path written, or `None` when no snapshot path is configured.
    pub fn persist(&self) -> Result<Option<PathBuf>, BootstrapError> {
        let Some(path) = &self.snapshot_path else {
            return Ok(None);
        };
        let snapshot = self.store.snapshot()?;
        let body = serde_json::to_string_pretty(&snapshot)?;
        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            std::fs::create_dir_all(parent).map_err(|source| io_error(parent, source))?;
        }
        std::fs::write(path, body).map_err(|source| io_error(path, source))?;
        tracing::info!(path = %path.display(), "variable snapshot written");
        Ok(Some(path.clone()))
    }
}

/// Load config, train for the configured epochs and persist the snapshot.
pub async fn train_from_config(
    path: impl Into<PathBuf>,
    rewards: &dyn RewardSource,
) -> anyhow::Result<TrainingHistory> {
    let app = TrainingApp::from_config_path(path).await?;
    let history = app.fit(rewards).await?;
    app.persist()?;
    Ok(history)
}

fn restore_snapshot(store: &InMemoryVariableStore, path: &Path) -> Result<usize, BootstrapError> {
    let body = std::fs::read_to_string(path).map_err(|source| io_error(path, source))?;
    let snapshot: serde_json::Value = serde_json::from_str(&body)?;
    Ok(store.restore(&snapshot)?)
}

fn io_error(path: &Path, source: std::io::Error) -> BootstrapError {
    BootstrapError::Io {
        path: path.display().to_string(),
        source,
    }
}

fn init_tracing_if_needed(observability: &ObservabilityConfig) {
    TRACING_INIT.get_or_init(|| {
        let log_file_path = std::env::var("TESSERA_LOG_FILE")
            .ok()
            .filter(|v| !v.trim().is_empty())
            .or_else(|| observability.log_file.clone());
        let file_writer = log_file_path.as_deref().and_then(create_log_writer);
        let fallback_level = match observability.log_level.trim().to_ascii_lowercase().as_str() {
            "trace" => "trace",
            "debug" => "debug",
            "info" => "info",
            "warn" => "warn",
            "error" => "error",
            _ => "info",
        };

        let make_filter = || {
            tracing_subscriber::EnvFilter::try_from_default_env()
                .or_else(|_| tracing_subscriber::EnvFilter::try_new(fallback_level))
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info"))
        };

        match (observability.traces_enabled, file_writer) {
            (true, Some(writer)) => {
                let _ = tracing_subscriber::fmt()
                    .with_env_filter(make_filter())
                    .with_target(true)
                    .with_ansi(false)
                    .with_writer(writer)
                    .with_span_events(
                        tracing_subscriber::fmt::format::FmtSpan::NEW
                            | tracing_subscriber::fmt::format::FmtSpan::CLOSE,
                    )
                    .try_init();
            }
            (true, None) => {
                let _ = tracing_subscriber::fmt()
                    .with_env_filter(make_filter())
                    .with_target(true)
                    .with_span_events(
                        tracing_subscriber::fmt::format::FmtSpan::NEW
                            | tracing_subscriber::fmt::format::FmtSpan::CLOSE,
                    )
                    .try_init();
            }
            (false, Some(writer)) => {
                let _ = tracing_subscriber::fmt()
                    .with_env_filter(make_filter())
                    .with_target(true)
                    .with_ansi(false)
                    .with_writer(writer)
                    .try_init();
            }
            (false, None) => {
                let _ = tracing_subscriber::fmt()
                    .with_env_filter(make_filter())
                    .with_target(true)
                    .try_init();
            }
        }

        tracing::info!(
            log_level = %observability.log_level,
            traces_enabled = observability.traces_enabled,
            log_file = log_file_path.as_deref().unwrap_or("(stdout)"),
            "tracing initialized"
        );
    });
}

fn create_log_writer(path: &str) -> Option<SharedFileMakeWriter> {
    use std::fs::{create_dir_all, OpenOptions};

    let file_path = Path::new(path);
    if let Some(parent) = file_path.parent() {
        if !parent.as_os_str().is_empty() {
            if let Err(err) = create_dir_all(parent) {
                eprintln!(
                    "failed to create log directory '{}': {}",
                    parent.display(),
                    err
                );
                return None;
            }
        }
    }
    let file = match OpenOptions::new().create(true).append(true).open(file_path) {
        Ok(f) => f,
        Err(err) => {
            eprintln!("failed to open log file '{}': {}", file_path.display(), err);
            return None;
        }
    };
    Some(SharedFileMakeWriter::new(file))
}

#[derive(Clone)]
struct SharedFileMakeWriter {
    file: Arc<std::sync::Mutex<std::fs::File>>,
}

impl SharedFileMakeWriter {
    fn new(file: std::fs::File) -> Self {
        Self {
            file: Arc::new(std::sync::Mutex::new(file)),
        }
    }
}

struct SharedFileWriter {
    file: Arc<std::sync::Mutex<std::fs::File>>,
}

impl<'a> tracing_subscriber::fmt::MakeWriter<'a> for SharedFileMakeWriter {
    type Writer = SharedFileWriter;

    fn make_writer(&'a self) -> Self::Writer {
        SharedFileWriter {
            file: self.file.clone(),
        }
    }
}

impl std::io::Write for SharedFileWriter {
    fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
        let mut file = self
            .file
            .lock()
            .map_err(|_| std::io::Error::other("log file mutex poisoned"))?;
        std::io::Write::write(&mut *file, buf)
    }

    fn flush(&mut self) -> std::io::Result<()> {
        let mut file = self
            .file
            .lock()
            .map_err(|_| std::io::Error::other("log file mutex poisoned"))?;
        std::io::Write::flush(&mut *file)
    }
}
