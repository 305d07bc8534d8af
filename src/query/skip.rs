//! OFFSET

use serde_json::{json, Value};

use super::stage::{
    pull, token_count, token_field, token_object, token_text, wrap_source_state, BoxedStage,
    CreateStage, CurrentPage, PipelineStage, QueryPage, StageFuture,
};
use crate::config::ExecutionEnvironment;
use crate::errors::{PipelineError, PipelineResult};
use crate::pagination::Cancellation;

const OFFSET_KEY: &str = "offset";
const SOURCE_TOKEN_KEY: &str = "sourceToken";

/// Drops the first `count` documents, then forwards everything
pub struct SkipStage {
    inner: BoxedStage,
    environment: ExecutionEnvironment,
    remaining: usize,
    current: CurrentPage,
}

impl SkipStage {
    pub fn create(
        environment: ExecutionEnvironment,
        count: usize,
        continuation: Option<Value>,
        create_source: CreateStage,
    ) -> PipelineResult<BoxedStage> {
        let (remaining, source_token) = match continuation {
            None => (count, None),
            Some(token) => {
                let object = token_object(&token)?;
                let remaining = token_count(&object, OFFSET_KEY, &token)?;
                if remaining > count {
                    return Err(PipelineError::malformed(
                        token_text(&token),
                        format!("stored offset {} exceeds the query's {}", remaining, count),
                    ));
                }
                (remaining, Some(token_field(&object, SOURCE_TOKEN_KEY, &token)?))
            }
        };

        Ok(Box::new(SkipStage {
            inner: create_source(source_token)?,
            environment,
            remaining,
            current: CurrentPage::default(),
        }))
    }
}

impl PipelineStage for SkipStage {
    fn move_next<'a>(&'a mut self, cancellation: &'a Cancellation) -> StageFuture<'a> {
        Box::pin(async move {
            if let Err(err) = cancellation.check() {
                self.current.set(Err(err));
                return true;
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
            let skip = self.remaining.min(documents.len());
            documents.drain(..skip);
            self.remaining -= skip;

            let state = page.state.as_ref().map(|source_state| {
                json!({
                    OFFSET_KEY: self.remaining,
                    SOURCE_TOKEN_KEY: wrap_source_state(self.environment, source_state),
                })
            });
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
