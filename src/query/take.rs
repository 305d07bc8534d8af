//! TOP and LIMIT
//!
//! Forwards at most `count` documents across all pages. The token records
//! how many are still allowed: `{"limit"|"top": n, "sourceToken": ...}`.

use serde_json::{json, Value};

use super::stage::{
    pull, token_count, token_field, token_object, token_text, wrap_source_state, BoxedStage,
    CreateStage, CurrentPage, PipelineStage, QueryPage, StageFuture,
};
use crate::config::ExecutionEnvironment;
use crate::errors::{PipelineError, PipelineResult};
use crate::pagination::Cancellation;

const SOURCE_TOKEN_KEY: &str = "sourceToken";

/// Which clause the stage implements; only the token key differs
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TakeKind {
    Limit,
    Top,
}

impl TakeKind {
    pub fn token_key(&self) -> &'static str {
        match self {
            TakeKind::Limit => "limit",
            TakeKind::Top => "top",
        }
    }
}

pub struct TakeStage {
    inner: BoxedStage,
    kind: TakeKind,
    environment: ExecutionEnvironment,
    remaining: usize,
    current: CurrentPage,
}

impl TakeStage {
    /// Create a fresh stage or resume one.
    ///
    /// A stored count above `count` means the query changed since the token
    /// was issued and is rejected as malformed.
    pub fn create(
        environment: ExecutionEnvironment,
        kind: TakeKind,
        count: usize,
        continuation: Option<Value>,
        create_source: CreateStage,
    ) -> PipelineResult<BoxedStage> {
        let (remaining, source_token) = match continuation {
            None => (count, None),
            Some(token) => {
                let object = token_object(&token)?;
                let remaining = token_count(&object, kind.token_key(), &token)?;
                if remaining > count {
                    return Err(PipelineError::malformed(
                        token_text(&token),
                        format!(
                            "stored {} count {} exceeds the query's {}",
                            kind.token_key(),
                            remaining,
                            count
                        ),
                    ));
                }
                let source = token_field(&object, SOURCE_TOKEN_KEY, &token)?;
                (remaining, Some(source))
            }
        };

        Ok(Box::new(TakeStage {
            inner: create_source(source_token)?,
            kind,
            environment,
            remaining,
            current: CurrentPage::default(),
        }))
    }

    fn token(&self, source_state: &Value) -> Value {
        json!({
            self.kind.token_key(): self.remaining,
            SOURCE_TOKEN_KEY: wrap_source_state(self.environment, source_state),
        })
    }
}

impl PipelineStage for TakeStage {
    fn move_next<'a>(&'a mut self, cancellation: &'a Cancellation) -> StageFuture<'a> {
        Box::pin(async move {
            if let Err(err) = cancellation.check() {
                self.current.set(Err(err));
                return true;
            }
            if self.remaining == 0 {
                self.current.clear();
                return false;
            }

            let mut page = match pull(&mut self.inner, cancellation).await {
                None => {
                    self.current.clear();
                    return false;
                }
                Some(Err(err)) => {
                    self.current.set(Err(err));
                    return true;
                }
                Some(Ok(page)) => page,
            };

            let mut documents = std::mem::take(&mut page.documents);
            let take = self.remaining.min(documents.len());
            documents.truncate(take);
            self.remaining -= take;

            let state = match &page.state {
                Some(source_state) if self.remaining > 0 => Some(self.token(source_state)),
                _ => None,
            };
            self.current.set(Ok(page.replace(documents, state)));
            true
        })
    }

    fn current(&self) -> PipelineResult<&QueryPage> {
        self.current.get()
    }

    fn take_current(&mut self) -> Option<PipelineResult<QueryPage>> {
        self.current.take()
    }
}
