//! Shared stage contract
//!
//! Every stage is pulled with `move_next` and exposes the resulting page
//! through `current`. A stage owns at most one inner stage and transforms
//! the inner page's documents, charge, and state on the way out.

use std::collections::BTreeMap;
use std::future::Future;
use std::pin::Pin;

use serde_json::{Map, Value};

use crate::config::ExecutionEnvironment;
use crate::errors::{PipelineError, PipelineResult};
use crate::pagination::Cancellation;

/// Boxed future returned by `move_next`
pub type StageFuture<'a> = Pin<Box<dyn Future<Output = bool> + Send + 'a>>;

/// A pull-based pipeline stage
pub trait PipelineStage: Send {
    /// Pull the next page. False means the stage is exhausted.
    fn move_next<'a>(&'a mut self, cancellation: &'a Cancellation) -> StageFuture<'a>;

    /// The page (or failure) produced by the last `move_next`
    fn current(&self) -> PipelineResult<&QueryPage>;

    /// Move the current page out
    fn take_current(&mut self) -> Option<PipelineResult<QueryPage>>;
}

/// Owned stage trait object
pub type BoxedStage = Box<dyn PipelineStage>;

/// Builds an inner stage from its slice of the continuation token
pub type CreateStage = Box<dyn FnOnce(Option<Value>) -> PipelineResult<BoxedStage> + Send>;

/// One page of query results
#[derive(Debug, Clone, Default, PartialEq)]
pub struct QueryPage {
    pub documents: Vec<Value>,
    pub request_charge: f64,
    pub activity_id: String,
    pub additional_headers: BTreeMap<String, String>,
    /// State to resume after this page; `None` when nothing remains
    pub state: Option<Value>,
    /// Set when this pipeline shape cannot be resumed
    pub disallow_continuation_reason: Option<String>,
}

impl QueryPage {
    /// Serialized continuation token.
    ///
    /// Fails with `UnsupportedOperation` when the pipeline cannot produce one.
    pub fn continuation_token(&self) -> PipelineResult<Option<String>> {
        if let Some(reason) = &self.disallow_continuation_reason {
            return Err(PipelineError::UnsupportedOperation(reason.clone()));
        }
        Ok(self.state.as_ref().map(Value::to_string))
    }

    /// Same metadata, different documents and state
    pub(crate) fn replace(self, documents: Vec<Value>, state: Option<Value>) -> QueryPage {
        QueryPage {
            documents,
            state,
            ..self
        }
    }
}

/// Holder for a stage's current result
#[derive(Debug, Default)]
pub(crate) struct CurrentPage(Option<PipelineResult<QueryPage>>);

impl CurrentPage {
    pub fn get(&self) -> PipelineResult<&QueryPage> {
        match &self.0 {
            Some(Ok(page)) => Ok(page),
            Some(Err(err)) => Err(err.clone()),
            None => Err(PipelineError::UnsupportedOperation(
                "no current page; move_next has not produced one".to_string(),
            )),
        }
    }

    pub fn set(&mut self, result: PipelineResult<QueryPage>) {
        self.0 = Some(result);
    }

    pub fn clear(&mut self) {
        self.0 = None;
    }

    pub fn take(&mut self) -> Option<PipelineResult<QueryPage>> {
        self.0.take()
    }
}

/// Pull one page from `inner`; `None` when it is exhausted
pub(crate) async fn pull(
    inner: &mut BoxedStage,
    cancellation: &Cancellation,
) -> Option<PipelineResult<QueryPage>> {
    if !inner.move_next(cancellation).await {
        return None;
    }
    inner.take_current()
}

/// Stage with nothing to return; stands in for a drained source on resume
#[derive(Debug, Default)]
pub struct EmptyStage;

impl PipelineStage for EmptyStage {
    fn move_next<'a>(&'a mut self, _cancellation: &'a Cancellation) -> StageFuture<'a> {
        Box::pin(async { false })
    }

    fn current(&self) -> PipelineResult<&QueryPage> {
        Err(PipelineError::UnsupportedOperation(
            "an empty stage has no pages".to_string(),
        ))
    }

    fn take_current(&mut self) -> Option<PipelineResult<QueryPage>> {
        None
    }
}

/// Object form of a stage continuation token.
///
/// Tokens arrive either structured or as serialized text.
pub(crate) fn token_object(token: &Value) -> PipelineResult<Map<String, Value>> {
    let parsed;
    let value = match token {
        Value::String(text) => {
            parsed = serde_json::from_str::<Value>(text)
                .map_err(|e| PipelineError::malformed(text.as_str(), format!("not valid JSON: {}", e)))?;
            &parsed
        }
        other => other,
    };
    match value {
        Value::Object(map) => Ok(map.clone()),
        _ => Err(PipelineError::malformed(
            token_text(token),
            "expected a JSON object",
        )),
    }
}

/// Text of a token for error messages
pub(crate) fn token_text(token: &Value) -> String {
    match token {
        Value::String(text) => text.clone(),
        other => other.to_string(),
    }
}

/// Embed an inner stage's state in an outer token.
///
/// Client pipelines carry the inner token as text; compute pipelines keep
/// it structured.
pub(crate) fn wrap_source_state(environment: ExecutionEnvironment, state: &Value) -> Value {
    match environment {
        ExecutionEnvironment::Client => Value::String(state.to_string()),
        ExecutionEnvironment::Compute => state.clone(),
    }
}

/// Read a non-negative count field from a token object
pub(crate) fn token_count(
    object: &Map<String, Value>,
    key: &str,
    token: &Value,
) -> PipelineResult<usize> {
    object
        .get(key)
        .and_then(Value::as_u64)
        .map(|count| count as usize)
        .ok_or_else(|| {
            PipelineError::malformed(
                token_text(token),
                format!("missing or invalid \"{}\"", key),
            )
        })
}

/// Read a required field from a token object
pub(crate) fn token_field(
    object: &Map<String, Value>,
    key: &str,
    token: &Value,
) -> PipelineResult<Value> {
    object.get(key).cloned().ok_or_else(|| {
        PipelineError::malformed(token_text(token), format!("missing \"{}\"", key))
    })
}
