//! Leaf stage: raw partition pages from the cross-partition enumerator

use std::sync::Arc;

use serde_json::Value;

use super::stage::{CurrentPage, PipelineStage, QueryPage, StageFuture};
use crate::config::PipelineConfig;
use crate::continuation::ContinuationCodec;
use crate::errors::PipelineResult;
use crate::observability::PipelineMetrics;
use crate::pagination::{Cancellation, CrossPartitionEnumerator, FeedRangeFetcher};
use crate::range::{CrossFeedRangeState, FeedRange, ReadState};

/// Exposes enumerator pages as query pages; state is the array-shape token
pub struct SourceStage {
    enumerator: CrossPartitionEnumerator,
    current: CurrentPage,
}

impl SourceStage {
    /// Start over `range` or resume from a token in any supported shape
    pub fn new(
        fetcher: Arc<dyn FeedRangeFetcher>,
        range: FeedRange,
        continuation: Option<&Value>,
        config: &PipelineConfig,
        metrics: Arc<PipelineMetrics>,
    ) -> PipelineResult<Self> {
        let state = match continuation {
            Some(token) => ContinuationCodec::with_max_token_bytes(config.max_continuation_token_bytes)
                .from_value(token)?,
            None => CrossFeedRangeState::single(range, ReadState::Beginning),
        };
        Ok(Self {
            enumerator: CrossPartitionEnumerator::new(fetcher, state, config, metrics),
            current: CurrentPage::default(),
        })
    }
}

impl PipelineStage for SourceStage {
    fn move_next<'a>(&'a mut self, cancellation: &'a Cancellation) -> StageFuture<'a> {
        Box::pin(async move {
            if !self.enumerator.move_next(cancellation).await {
                self.current.clear();
                return false;
            }
            match self.enumerator.take_current() {
                Some(result) => {
                    self.current.set(result.map(|page| QueryPage {
                        documents: page.page.elements,
                        request_charge: page.page.request_charge,
                        activity_id: page.page.activity_id,
                        additional_headers: page.page.additional_headers,
                        state: page.state.as_ref().map(ContinuationCodec::to_value),
                        disallow_continuation_reason: None,
                    }));
                    true
                }
                None => {
                    self.current.clear();
                    false
                }
            }
        })
    }

    fn current(&self) -> PipelineResult<&QueryPage> {
        self.current.get()
    }

    fn take_current(&mut self) -> Option<PipelineResult<QueryPage>> {
        self.current.take()
    }
}
