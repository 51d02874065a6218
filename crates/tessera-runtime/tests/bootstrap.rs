//! Single-config bootstrap: snapshot persistence and config-driven training.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use serde_json::{json, Map};
use tessera_core::prelude::*;
use tessera_runtime::{train_from_config, FixedReward, TrainingApp};

fn temp_dir() -> PathBuf {
    let dir = std::env::temp_dir().join(format!("tessera-run-{}", uuid::Uuid::new_v4()));
    std::fs::create_dir_all(&dir).unwrap();
    dir
}

fn write_config(dir: &Path, snapshot: &Path) -> PathBuf {
    let path = dir.join("tessera.yaml");
    let yaml = format!(
        r#"
version: 1
app:
  name: qa-trainer
providers:
  default_model: meta
  backends:
    - name: local
      kind: ollama
  models:
    - name: meta
      backend: local
      model: llama3
optimizer:
  k_best: 3
training:
  epochs: 2
  generation_timeout_secs: 5
stores:
  variables:
    max_variables: 16
    snapshot_path: {}
"#,
        snapshot.display()
    );
    std::fs::write(&path, yaml).unwrap();
    path
}

#[tokio::test]
async fn trained_state_survives_a_restart() -> anyhow::Result<()> {
    let dir = temp_dir();
    let snapshot = dir.join("state").join("variables.json");
    let config = write_config(&dir, &snapshot);
    let model = Arc::new(
        ScriptedLanguageModel::new("meta")
            .with_fallback(json!({"instructions": ["answer in one word"]})),
    );

    let app = TrainingApp::from_config_path_with_model(&config, model.clone()).await?;
    assert_eq!(app.epochs(), 2);
    app.store
        .register("qa", Some(Instructions::new(["be helpful"])))
        .await?;
    app.store
        .append_prediction("qa", Prediction::new(Map::new(), Map::new()))
        .await?;

    let history = app.fit(&FixedReward(0.7)).await?;
    assert_eq!(history.epochs.len(), 2);
    assert_eq!(history.total_optimized(), 1);
    assert_eq!(app.persist()?, Some(snapshot.clone()));
    assert!(snapshot.exists());

    let restarted = TrainingApp::from_config_path_with_model(&config, model).await?;
    let variable = restarted
        .store
        .get("qa")
        .await?
        .ok_or_else(|| anyhow::anyhow!("variable not restored"))?;
    assert_eq!(variable.predictions[0].reward, Some(0.7));
    assert_eq!(
        variable.instructions.map(|i| i.instructions),
        Some(vec!["answer in one word".to_string()])
    );
    assert_eq!(variable.phase, VariablePhase::Finalized);

    std::fs::remove_dir_all(&dir).ok();
    Ok(())
}

#[tokio::test]
async fn train_from_config_writes_snapshot() -> anyhow::Result<()> {
    let dir = temp_dir();
    let snapshot = dir.join("variables.json");
    let config = write_config(&dir, &snapshot);

    let history = train_from_config(&config, &FixedReward(0.5)).await?;
    assert_eq!(history.epochs.len(), 2);
    assert!(history.epochs.iter().all(|e| e.variables.is_empty()));

    let body: serde_json::Value = serde_json::from_str(&std::fs::read_to_string(&snapshot)?)?;
    assert_eq!(body, json!({"variables": []}));

    std::fs::remove_dir_all(&dir).ok();
    Ok(())
}

#[tokio::test]
async fn invalid_config_is_rejected() {
    let dir = temp_dir();
    let path = dir.join("tessera.yaml");
    std::fs::write(&path, "training:\n  epochs: 0\n").unwrap();
    assert!(TrainingApp::from_config_path(&path).await.is_err());
    std::fs::remove_dir_all(&dir).ok();
}
