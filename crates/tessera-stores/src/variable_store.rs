//! VariableStore in-memory implementation.

use async_trait::async_trait;
use serde_json::{json, Value};
use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::{Arc, Mutex, RwLock};

use tessera_core::store::{StoreError, VariableGuard, VariableStore};
use tessera_core::variable::{
    is_valid_reward, Instructions, Prediction, TrainableVariable, VariableKey, VariableUpdate,
};

const DEFAULT_IN_MEMORY_VARIABLE_LIMIT: usize = 1_024;

#[derive(Debug, Clone, Copy)]
enum InsertMode {
    /// Register: keep an existing entry untouched.
    IfAbsent,
    /// Committed write: continue the stored version sequence.
    Commit,
    /// Snapshot load: keep version and timestamp as-is.
    Restore,
}

/// In-memory implementation for development and testing.
///
/// Keys are kept in registration order; when the capacity limit is reached
/// the oldest variable is evicted. Mutations wait for the per-key lock, so a
/// write issued during an optimization pass lands after its commit.
pub struct InMemoryVariableStore {
    variables: RwLock<HashMap<VariableKey, TrainableVariable>>,
    order: RwLock<VecDeque<VariableKey>>,
    locks: Mutex<HashMap<VariableKey, Arc<tokio::sync::Mutex<()>>>>,
    max_variables: usize,
}

impl InMemoryVariableStore {
    /// Create a new in-memory store.
    pub fn new() -> Self {
        Self::with_max_variables(DEFAULT_IN_MEMORY_VARIABLE_LIMIT)
    }

    /// Create a new in-memory store with a hard capacity limit.
    pub fn with_max_variables(max_variables: usize) -> Self {
        Self {
            variables: RwLock::new(HashMap::new()),
            order: RwLock::new(VecDeque::new()),
            locks: Mutex::new(HashMap::new()),
            max_variables: max_variables.max(1),
        }
    }

    fn insert(&self, variable: TrainableVariable, mode: InsertMode) -> Result<bool, StoreError> {
        let (inserted, evicted) = self.insert_entry(variable, mode)?;
        if evicted.is_some() {
            self.prune_locks()?;
        }
        Ok(inserted)
    }

    /// Returns whether the entry was written and the key evicted to make room.
    fn insert_entry(
        &self,
        mut variable: TrainableVariable,
        mode: InsertMode,
    ) -> Result<(bool, Option<VariableKey>), StoreError> {
        let mut variables = self
            .variables
            .write()
            .map_err(|e| StoreError::Internal(e.to_string()))?;
        let mut order = self
            .order
            .write()
            .map_err(|e| StoreError::Internal(e.to_string()))?;

        let existing_version = variables.get(&variable.key).map(|v| v.version);
        match (mode, existing_version) {
            (InsertMode::IfAbsent, Some(_)) => return Ok((false, None)),
            (InsertMode::IfAbsent, None) => variable.touch(),
            (InsertMode::Commit, Some(version)) => {
                variable.version = version;
                variable.touch();
            }
            (InsertMode::Commit, None) => variable.touch(),
            (InsertMode::Restore, _) => {}
        }

        let mut evicted = None;
        if existing_version.is_none() {
            if variables.len() >= self.max_variables {
                if let Some(oldest) = order.pop_front() {
                    tracing::debug!(variable = %oldest, "evicting variable at capacity");
                    variables.remove(&oldest);
                    evicted = Some(oldest);
                }
            }
            order.push_back(variable.key.clone());
        }
        variables.insert(variable.key.clone(), variable);
        Ok((true, evicted))
    }

    /// Drop lock entries for keys that are gone and not currently held.
    fn prune_locks(&self) -> Result<(), StoreError> {
        let live: HashSet<VariableKey> = self
            .variables
            .read()
            .map_err(|e| StoreError::Internal(e.to_string()))?
            .keys()
            .cloned()
            .collect();
        let mut locks = self
            .locks
            .lock()
            .map_err(|e| StoreError::Internal(e.to_string()))?;
        locks.retain(|key, lock| live.contains(key) || Arc::strong_count(lock) > 1);
        Ok(())
    }

    fn modify<T>(
        &self,
        key: &str,
        f: impl FnOnce(&mut TrainableVariable) -> Result<T, StoreError>,
    ) -> Result<T, StoreError> {
        let mut variables = self
            .variables
            .write()
            .map_err(|e| StoreError::Internal(e.to_string()))?;
        let variable = variables
            .get_mut(key)
            .ok_or_else(|| StoreError::NotFound(key.to_string()))?;
        let out = f(variable)?;
        variable.touch();
        Ok(out)
    }

    /// Export every variable as a portable JSON document.
    pub fn snapshot(&self) -> Result<Value, StoreError> {
        let variables = self
            .variables
            .read()
            .map_err(|e| StoreError::Internal(e.to_string()))?;
        let order = self
            .order
            .read()
            .map_err(|e| StoreError::Internal(e.to_string()))?;
        let ordered: Vec<&TrainableVariable> =
            order.iter().filter_map(|key| variables.get(key)).collect();
        let variables =
            serde_json::to_value(ordered).map_err(|e| StoreError::Serialization(e.to_string()))?;
        Ok(json!({ "variables": variables }))
    }

    /// Load variables from a snapshot, replacing entries with the same key.
    pub fn restore(&self, snapshot: &Value) -> Result<usize, StoreError> {
        let variables = snapshot
            .get("variables")
            .cloned()
            .ok_or_else(|| StoreError::Serialization("missing 'variables'".to_string()))?;
        let variables: Vec<TrainableVariable> = serde_json::from_value(variables)
            .map_err(|e| StoreError::Serialization(e.to_string()))?;
        let count = variables.len();
        for variable in variables {
            self.insert_entry(variable, InsertMode::Restore)?;
        }
        self.prune_locks()?;
        Ok(count)
    }
}

impl Default for InMemoryVariableStore {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl VariableStore for InMemoryVariableStore {
    async fn register(
        &self,
        key: &str,
        initial: Option<Instructions>,
    ) -> Result<bool, StoreError> {
        let mut variable = TrainableVariable::new(key);
        variable.instructions = initial;
        self.insert(variable, InsertMode::IfAbsent)
    }

    async fn append_prediction(
        &self,
        key: &str,
        prediction: Prediction,
    ) -> Result<usize, StoreError> {
        let _guard = self.lock(key).await?;
        self.modify(key, |variable| {
            variable.predictions.push(prediction);
            Ok(variable.predictions.len() - 1)
        })
    }

    async fn attach_reward(&self, key: &str, index: usize, reward: f64) -> Result<(), StoreError> {
        if !is_valid_reward(reward) {
            return Err(StoreError::InvalidArgument(format!(
                "reward must be in [0, 1], got {}",
                reward
            )));
        }
        let _guard = self.lock(key).await?;
        self.modify(key, |variable| {
            let count = variable.predictions.len();
            let prediction = variable.predictions.get_mut(index).ok_or_else(|| {
                StoreError::InvalidArgument(format!(
                    "prediction index {} out of range ({} recorded)",
                    index, count
                ))
            })?;
            prediction.reward = Some(reward);
            Ok(())
        })
    }

    async fn get(&self, key: &str) -> Result<Option<TrainableVariable>, StoreError> {
        let variables = self
            .variables
            .read()
            .map_err(|e| StoreError::Internal(e.to_string()))?;
        Ok(variables.get(key).cloned())
    }

    async fn set(
        &self,
        key: &str,
        update: VariableUpdate,
    ) -> Result<TrainableVariable, StoreError> {
        let _guard = self.lock(key).await?;
        self.modify(key, |variable| {
            variable.apply(update);
            Ok(())
        })?;
        self.get(key)
            .await?
            .ok_or_else(|| StoreError::NotFound(key.to_string()))
    }

    async fn replace(&self, variable: TrainableVariable) -> Result<(), StoreError> {
        self.insert(variable, InsertMode::Commit)?;
        Ok(())
    }

    async fn keys(&self) -> Result<Vec<VariableKey>, StoreError> {
        let order = self
            .order
            .read()
            .map_err(|e| StoreError::Internal(e.to_string()))?;
        Ok(order.iter().cloned().collect())
    }

    async fn lock(&self, key: &str) -> Result<VariableGuard, StoreError> {
        let registered = self
            .variables
            .read()
            .map_err(|e| StoreError::Internal(e.to_string()))?
            .contains_key(key);
        if !registered {
            return Err(StoreError::NotFound(key.to_string()));
        }
        let lock = {
            let mut locks = self
                .locks
                .lock()
                .map_err(|e| StoreError::Internal(e.to_string()))?;
            locks
                .entry(key.to_string())
                .or_insert_with(|| Arc::new(tokio::sync::Mutex::new(())))
                .clone()
        };
        Ok(lock.lock_owned().await)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::Map;
    use tessera_core::variable::VariablePhase;

    fn prediction() -> Prediction {
        Prediction::new(Map::new(), Map::new())
    }

    #[test]
    fn test_register_is_idempotent() {
        tokio_test::block_on(async {
            let store = InMemoryVariableStore::new();
            assert!(store
                .register("qa/generator", Some(Instructions::new(["be brief"])))
                .await
                .unwrap());
            assert!(!store.register("qa/generator", None).await.unwrap());

            let variable = store.get("qa/generator").await.unwrap().unwrap();
            assert_eq!(variable.instructions.unwrap().instructions, vec!["be brief"]);
            assert_eq!(variable.phase, VariablePhase::Unbuilt);
            assert_eq!(variable.version, 1);
        });
    }

    #[test]
    fn test_append_and_attach_reward() {
        tokio_test::block_on(async {
            let store = InMemoryVariableStore::new();
            store.register("v", None).await.unwrap();
            assert_eq!(store.append_prediction("v", prediction()).await.unwrap(), 0);
            assert_eq!(store.append_prediction("v", prediction()).await.unwrap(), 1);

            store.attach_reward("v", 1, 0.75).await.unwrap();
            let variable = store.get("v").await.unwrap().unwrap();
            assert_eq!(variable.predictions[0].reward, None);
            assert_eq!(variable.predictions[1].reward, Some(0.75));
            assert_eq!(variable.version, 4);

            assert!(matches!(
                store.attach_reward("v", 5, 0.5).await,
                Err(StoreError::InvalidArgument(_))
            ));
            assert!(matches!(
                store.attach_reward("v", 0, 1.5).await,
                Err(StoreError::InvalidArgument(_))
            ));
            assert!(matches!(
                store.append_prediction("missing", prediction()).await,
                Err(StoreError::NotFound(_))
            ));
        });
    }

    #[test]
    fn test_set_merges_field_wise() {
        tokio_test::block_on(async {
            let store = InMemoryVariableStore::new();
            store
                .register("v", Some(Instructions::new(["keep me"])))
                .await
                .unwrap();
            store.append_prediction("v", prediction()).await.unwrap();
            let updated = store
                .set("v", VariableUpdate::new().phase(VariablePhase::Idle))
                .await
                .unwrap();
            assert_eq!(updated.phase, VariablePhase::Idle);
            assert_eq!(updated.predictions.len(), 1);
            assert!(updated.instructions.is_some());
        });
    }

    #[test]
    fn test_replace_bumps_version() {
        tokio_test::block_on(async {
            let store = InMemoryVariableStore::new();
            store.register("v", None).await.unwrap();
            let mut variable = store.get("v").await.unwrap().unwrap();
            variable.instructions_candidates.push(Instructions::new(["x"]));
            store.replace(variable).await.unwrap();
            let stored = store.get("v").await.unwrap().unwrap();
            assert_eq!(stored.version, 2);
            assert_eq!(stored.instructions_candidates.len(), 1);
        });
    }

    #[test]
    fn test_capacity_evicts_oldest() {
        tokio_test::block_on(async {
            let store = InMemoryVariableStore::with_max_variables(2);
            store.register("a", None).await.unwrap();
            store.register("b", None).await.unwrap();
            store.register("c", None).await.unwrap();
            assert!(store.get("a").await.unwrap().is_none());
            assert_eq!(store.keys().await.unwrap(), vec!["b", "c"]);
        });
    }

    #[test]
    fn test_snapshot_restore() {
        tokio_test::block_on(async {
            let store = InMemoryVariableStore::new();
            store
                .register("v", Some(Instructions::new(["a"])))
                .await
                .unwrap();
            store
                .append_prediction("v", prediction().with_reward(0.5))
                .await
                .unwrap();
            let snapshot = store.snapshot().unwrap();

            let restored = InMemoryVariableStore::new();
            assert_eq!(restored.restore(&snapshot).unwrap(), 1);
            assert_eq!(
                restored.get("v").await.unwrap(),
                store.get("v").await.unwrap()
            );
            assert!(matches!(
                restored.restore(&json!({})),
                Err(StoreError::Serialization(_))
            ));
        });
    }

    #[test]
    fn test_lock_is_per_key() {
        tokio_test::block_on(async {
            let store = InMemoryVariableStore::new();
            store.register("a", None).await.unwrap();
            store.register("b", None).await.unwrap();
            let guard = store.lock("a").await.unwrap();
            let other = store.lock("b").await.unwrap();
            drop(other);
            let lock = store.locks.lock().unwrap().get("a").cloned().unwrap();
            assert!(lock.try_lock().is_err());
            drop(guard);
            assert!(lock.try_lock().is_ok());
        });
    }

    #[test]
    fn test_lock_requires_registered_key() {
        tokio_test::block_on(async {
            let store = InMemoryVariableStore::new();
            assert!(matches!(
                store.lock("missing").await,
                Err(StoreError::NotFound(_))
            ));
            assert!(store.locks.lock().unwrap().is_empty());
        });
    }

    #[test]
    fn test_locks_are_pruned_on_eviction_and_restore() {
        tokio_test::block_on(async {
            let store = InMemoryVariableStore::with_max_variables(2);
            store.register("a", None).await.unwrap();
            store.register("b", None).await.unwrap();
            drop(store.lock("a").await.unwrap());
            let held = store.lock("b").await.unwrap();

            store.register("c", None).await.unwrap();
            assert!(!store.locks.lock().unwrap().contains_key("a"));

            // A held lock survives eviction of its key.
            store.register("d", None).await.unwrap();
            assert!(store.locks.lock().unwrap().contains_key("b"));
            drop(held);

            let snapshot = InMemoryVariableStore::new().snapshot().unwrap();
            store.restore(&snapshot).unwrap();
            assert!(store.locks.lock().unwrap().is_empty());
        });
    }

    #[test]
    fn test_mutations_wait_for_key_lock() {
        tokio_test::block_on(async {
            let store = InMemoryVariableStore::new();
            store.register("v", None).await.unwrap();
            let guard = store.lock("v").await.unwrap();

            let blocked = tokio::time::timeout(
                std::time::Duration::from_millis(20),
                store.append_prediction("v", prediction()),
            )
            .await;
            assert!(blocked.is_err());
            assert!(store.get("v").await.unwrap().unwrap().predictions.is_empty());

            drop(guard);
            assert_eq!(store.append_prediction("v", prediction()).await.unwrap(), 0);
        });
    }
}
