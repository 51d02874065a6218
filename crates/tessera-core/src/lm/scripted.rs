use std::collections::VecDeque;
use std::sync::Mutex;

use async_trait::async_trait;
use serde_json::{json, Value};

use super::{GenerationRequest, LanguageModel, LmError};
use crate::value::StructuralValue;

/// Language model replaying queued outputs, for tests and examples.
///
/// Every request is recorded. Queued JSON outputs are validated against the
/// request's output schema; once the queue is empty the fallback output is
/// used, or an error returned when there is none.
pub struct ScriptedLanguageModel {
    model: String,
    responses: Mutex<VecDeque<Result<Value, LmError>>>,
    fallback: Option<Value>,
    requests: Mutex<Vec<GenerationRequest>>,
}

impl ScriptedLanguageModel {
    pub fn new(model: impl Into<String>) -> Self {
        Self {
            model: model.into(),
            responses: Mutex::new(VecDeque::new()),
            fallback: None,
            requests: Mutex::new(Vec::new()),
        }
    }

    pub fn with_response(self, output: Value) -> Self {
        self.push(Ok(output));
        self
    }

    pub fn with_error(self, error: LmError) -> Self {
        self.push(Err(error));
        self
    }

    /// Output returned whenever the queue is empty.
    pub fn with_fallback(mut self, output: Value) -> Self {
        self.fallback = Some(output);
        self
    }

    pub fn push(&self, response: Result<Value, LmError>) {
        if let Ok(mut queue) = self.responses.lock() {
            queue.push_back(response);
        }
    }

    pub fn requests(&self) -> Vec<GenerationRequest> {
        self.requests
            .lock()
            .map(|r| r.clone())
            .unwrap_or_default()
    }

    pub fn call_count(&self) -> usize {
        self.requests.lock().map(|r| r.len()).unwrap_or_default()
    }
}

#[async_trait]
impl LanguageModel for ScriptedLanguageModel {
    fn model_name(&self) -> &str {
        &self.model
    }

    async fn generate(&self, request: GenerationRequest) -> Result<StructuralValue, LmError> {
        let output_schema = request.output_schema.clone();
        self.requests
            .lock()
            .map_err(|e| LmError::Response(e.to_string()))?
            .push(request);
        let next = self
            .responses
            .lock()
            .map_err(|e| LmError::Response(e.to_string()))?
            .pop_front();
        let output = match next {
            Some(response) => response?,
            None => self
                .fallback
                .clone()
                .ok_or_else(|| LmError::Response("no scripted response left".to_string()))?,
        };
        StructuralValue::construct(output_schema, output)
            .map_err(|e| LmError::Malformed(e.to_string()))
    }

    fn get_config(&self) -> Value {
        json!({ "kind": "scripted", "model": self.model })
    }
}
