//! Store-level optimization: commit semantics, per-key serialization and
//! cancellation.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde_json::{json, Map};
use tessera_core::prelude::*;
use tessera_stores::InMemoryVariableStore;

fn new_instructions() -> serde_json::Value {
    json!({"instructions": ["answer in one word"]})
}

fn prediction() -> Prediction {
    let mut inputs = Map::new();
    inputs.insert("query".to_string(), json!("capital of France?"));
    let mut outputs = Map::new();
    outputs.insert("answer".to_string(), json!("Paris"));
    Prediction::new(inputs, outputs)
}

async fn seeded_store(key: &str, unscored: usize) -> Arc<InMemoryVariableStore> {
    let store = Arc::new(InMemoryVariableStore::new());
    store
        .register(key, Some(Instructions::new(["be helpful"])))
        .await
        .unwrap();
    for _ in 0..unscored {
        store.append_prediction(key, prediction()).await.unwrap();
    }
    store
}

/// Delegates to a scripted model after a fixed delay.
struct SlowLanguageModel {
    inner: ScriptedLanguageModel,
    delay: Duration,
}

#[async_trait]
impl LanguageModel for SlowLanguageModel {
    fn model_name(&self) -> &str {
        self.inner.model_name()
    }

    async fn generate(&self, request: GenerationRequest) -> Result<StructuralValue, LmError> {
        tokio::time::sleep(self.delay).await;
        self.inner.generate(request).await
    }
}

/// Never answers.
struct PendingLanguageModel;

#[async_trait]
impl LanguageModel for PendingLanguageModel {
    fn model_name(&self) -> &str {
        "pending"
    }

    async fn generate(&self, _request: GenerationRequest) -> Result<StructuralValue, LmError> {
        std::future::pending().await
    }
}

#[tokio::test]
async fn build_marks_every_variable_idle() {
    let store = seeded_store("qa", 0).await;
    store.register("summary", None).await.unwrap();
    let optimizer = OproOptimizer::new(Arc::new(ScriptedLanguageModel::new("meta")));

    build_stored(&optimizer, store.as_ref()).await.unwrap();

    for key in ["qa", "summary"] {
        let variable = store.get(key).await.unwrap().unwrap();
        assert_eq!(variable.phase, VariablePhase::Idle);
    }
}

#[tokio::test]
async fn optimize_commits_new_instructions() {
    let store = seeded_store("qa", 2).await;
    let lm = Arc::new(ScriptedLanguageModel::new("meta").with_response(new_instructions()));
    let optimizer = OproOptimizer::new(lm.clone());
    build_stored(&optimizer, store.as_ref()).await.unwrap();
    let before = store.get("qa").await.unwrap().unwrap();

    let report = optimize_stored(&optimizer, store.as_ref(), "qa", 0.8)
        .await
        .unwrap();
    assert_eq!(report.backpropagated, 2);
    assert!(report.regenerated);

    let after = store.get("qa").await.unwrap().unwrap();
    assert_eq!(after.version, before.version + 1);
    assert_eq!(
        after.instructions.unwrap().instructions,
        vec!["answer in one word"]
    );
    assert!(after.predictions.iter().all(|p| p.reward == Some(0.8)));
    assert_eq!(after.instructions_candidates[0].instructions, vec!["be helpful"]);
    assert_eq!(after.phase, VariablePhase::Idle);
    assert_eq!(lm.call_count(), 1);
}

#[tokio::test]
async fn failed_generation_still_commits_rewards() {
    let store = seeded_store("qa", 1).await;
    let lm = Arc::new(
        ScriptedLanguageModel::new("meta").with_error(LmError::Http("503".to_string())),
    );
    let optimizer = OproOptimizer::new(lm);
    build_stored(&optimizer, store.as_ref()).await.unwrap();

    let err = optimize_stored(&optimizer, store.as_ref(), "qa", 0.4)
        .await
        .unwrap_err();
    assert!(matches!(err, OptimizationError::Generation(_)));

    let variable = store.get("qa").await.unwrap().unwrap();
    assert_eq!(variable.predictions[0].reward, Some(0.4));
    assert_eq!(variable.instructions_candidates.len(), 1);
    assert_eq!(
        variable.instructions.unwrap().instructions,
        vec!["be helpful"]
    );
}

#[tokio::test]
async fn noop_optimize_leaves_version_unchanged() {
    let store = seeded_store("qa", 0).await;
    let lm = Arc::new(ScriptedLanguageModel::new("meta"));
    let optimizer = OproOptimizer::new(lm.clone());
    build_stored(&optimizer, store.as_ref()).await.unwrap();
    let before = store.get("qa").await.unwrap().unwrap();

    let report = optimize_stored(&optimizer, store.as_ref(), "qa", 0.5)
        .await
        .unwrap();
    assert!(report.is_noop());
    assert_eq!(store.get("qa").await.unwrap().unwrap(), before);
    assert_eq!(lm.call_count(), 0);
}

#[tokio::test]
async fn noop_optimize_commits_return_to_idle() {
    let store = seeded_store("qa", 0).await;
    let lm = Arc::new(ScriptedLanguageModel::new("meta"));
    let optimizer = OproOptimizer::new(lm.clone());
    build_stored(&optimizer, store.as_ref()).await.unwrap();
    finalize_stored(&optimizer, store.as_ref(), "qa")
        .await
        .unwrap();
    assert_eq!(
        store.get("qa").await.unwrap().unwrap().phase,
        VariablePhase::Finalized
    );

    let report = optimize_stored(&optimizer, store.as_ref(), "qa", 0.5)
        .await
        .unwrap();
    assert!(report.is_noop());
    assert_eq!(
        store.get("qa").await.unwrap().unwrap().phase,
        VariablePhase::Idle
    );
    assert_eq!(lm.call_count(), 0);
}

#[tokio::test]
async fn invalid_reward_and_unknown_key_are_rejected() {
    let store = seeded_store("qa", 1).await;
    let optimizer = OproOptimizer::new(Arc::new(ScriptedLanguageModel::new("meta")));
    build_stored(&optimizer, store.as_ref()).await.unwrap();
    let before = store.get("qa").await.unwrap().unwrap();

    assert!(matches!(
        optimize_stored(&optimizer, store.as_ref(), "qa", f64::NAN).await,
        Err(OptimizationError::InvalidReward(_))
    ));
    assert_eq!(store.get("qa").await.unwrap().unwrap(), before);
    assert!(matches!(
        optimize_stored(&optimizer, store.as_ref(), "missing", 0.5).await,
        Err(OptimizationError::Store(StoreError::NotFound(_)))
    ));
}

#[tokio::test]
async fn concurrent_optimize_on_one_key_is_serialized() {
    let store = seeded_store("qa", 1).await;
    let lm = Arc::new(SlowLanguageModel {
        inner: ScriptedLanguageModel::new("meta").with_fallback(new_instructions()),
        delay: Duration::from_millis(20),
    });
    let optimizer = OproOptimizer::new(lm.clone());
    build_stored(&optimizer, store.as_ref()).await.unwrap();

    let (first, second) = tokio::join!(
        optimize_stored(&optimizer, store.as_ref(), "qa", 0.6),
        optimize_stored(&optimizer, store.as_ref(), "qa", 0.9),
    );
    let reports = [first.unwrap(), second.unwrap()];

    // The second call sees the rewards committed by the first.
    assert_eq!(reports.iter().filter(|r| r.regenerated).count(), 1);
    assert_eq!(reports.iter().filter(|r| r.is_noop()).count(), 1);
    assert_eq!(lm.inner.call_count(), 1);
    let variable = store.get("qa").await.unwrap().unwrap();
    assert_eq!(variable.instructions_candidates.len(), 1);
}

#[tokio::test]
async fn writes_during_optimize_land_after_commit() {
    let store = seeded_store("qa", 1).await;
    let lm = Arc::new(SlowLanguageModel {
        inner: ScriptedLanguageModel::new("meta").with_fallback(new_instructions()),
        delay: Duration::from_millis(100),
    });
    let optimizer = OproOptimizer::new(lm);
    build_stored(&optimizer, store.as_ref()).await.unwrap();

    let (report, appended) = tokio::join!(
        optimize_stored(&optimizer, store.as_ref(), "qa", 0.5),
        async {
            tokio::time::sleep(Duration::from_millis(20)).await;
            store.append_prediction("qa", prediction()).await
        },
    );
    assert!(report.unwrap().regenerated);
    assert_eq!(appended.unwrap(), 1);

    let variable = store.get("qa").await.unwrap().unwrap();
    assert_eq!(variable.predictions.len(), 2);
    assert_eq!(variable.predictions[0].reward, Some(0.5));
    assert_eq!(variable.predictions[1].reward, None);
    assert_eq!(
        variable.instructions.unwrap().instructions,
        vec!["answer in one word"]
    );
}

#[tokio::test]
async fn cancelled_optimize_leaves_store_untouched() {
    let store = seeded_store("qa", 1).await;
    let optimizer = OproOptimizer::new(Arc::new(PendingLanguageModel));
    build_stored(&optimizer, store.as_ref()).await.unwrap();
    let before = store.get("qa").await.unwrap().unwrap();

    let outcome = tokio::time::timeout(
        Duration::from_millis(20),
        optimize_stored(&optimizer, store.as_ref(), "qa", 0.7),
    )
    .await;
    assert!(outcome.is_err());
    assert_eq!(store.get("qa").await.unwrap().unwrap(), before);

    // The per-key lock was released with the dropped future.
    let guard = tokio::time::timeout(Duration::from_millis(100), store.lock("qa")).await;
    assert!(guard.is_ok());
}

#[tokio::test]
async fn bound_generator_trains_through_store() {
    let store: Arc<dyn VariableStore> = Arc::new(InMemoryVariableStore::new());
    let answer_schema = Schema::new([Field::required("answer", FieldType::String)]).unwrap();
    let query_schema = Schema::new([Field::required("query", FieldType::String)]).unwrap();

    let task_lm = Arc::new(
        ScriptedLanguageModel::new("task").with_fallback(json!({"answer": "Paris"})),
    );
    let generator = Generator::new("qa", answer_schema, task_lm.clone())
        .with_instructions(["be helpful"])
        .bind(store.clone())
        .await
        .unwrap();
    assert_eq!(generator.trainable_variables(), vec!["qa".to_string()]);

    let input =
        StructuralValue::construct(query_schema, json!({"query": "capital of France?"})).unwrap();
    generator
        .call(input.clone(), CallContext::training())
        .await
        .unwrap();
    generator
        .call(input.clone(), CallContext::inference())
        .await
        .unwrap();
    let variable = store.get("qa").await.unwrap().unwrap();
    assert_eq!(variable.predictions.len(), 1);
    assert_eq!(variable.predictions[0].outputs["answer"], json!("Paris"));

    let meta_lm = Arc::new(ScriptedLanguageModel::new("meta").with_response(new_instructions()));
    let optimizer = OproOptimizer::new(meta_lm);
    build_stored(&optimizer, store.as_ref()).await.unwrap();
    optimize_stored(&optimizer, store.as_ref(), "qa", 1.0)
        .await
        .unwrap();

    generator
        .call(input, CallContext::inference())
        .await
        .unwrap();
    let last = task_lm.requests().pop().unwrap();
    assert_eq!(last.instructions, vec!["answer in one word"]);
}

#[tokio::test]
async fn finalize_clears_candidates_and_marks_variable() {
    let store = seeded_store("qa", 1).await;
    let lm = Arc::new(ScriptedLanguageModel::new("meta").with_response(new_instructions()));
    let optimizer = OproOptimizer::new(lm);
    build_stored(&optimizer, store.as_ref()).await.unwrap();
    optimize_stored(&optimizer, store.as_ref(), "qa", 0.5)
        .await
        .unwrap();

    finalize_stored(&optimizer, store.as_ref(), "qa")
        .await
        .unwrap();
    let variable = store.get("qa").await.unwrap().unwrap();
    assert!(variable.instructions_candidates.is_empty());
    assert_eq!(variable.predictions.len(), 1);
    assert_eq!(variable.phase, VariablePhase::Finalized);
}

#[tokio::test]
async fn finalize_after_several_passes_keeps_instructions() {
    let store = seeded_store("qa", 0).await;
    let lm = Arc::new(ScriptedLanguageModel::new("meta").with_fallback(new_instructions()));
    let optimizer = OproOptimizer::new(lm.clone());
    build_stored(&optimizer, store.as_ref()).await.unwrap();
    for reward in [0.2, 0.6, 0.9] {
        store.append_prediction("qa", prediction()).await.unwrap();
        optimize_stored(&optimizer, store.as_ref(), "qa", reward)
            .await
            .unwrap();
    }
    assert_eq!(lm.call_count(), 3);
    let before = store.get("qa").await.unwrap().unwrap();
    assert_eq!(before.instructions_candidates.len(), 3);

    finalize_stored(&optimizer, store.as_ref(), "qa")
        .await
        .unwrap();
    let variable = store.get("qa").await.unwrap().unwrap();
    assert!(variable.instructions_candidates.is_empty());
    assert_eq!(variable.instructions, before.instructions);
    assert!(variable.instructions.is_some());
    assert_eq!(variable.predictions.len(), 3);
    assert_eq!(variable.phase, VariablePhase::Finalized);
}
