//! Read feed: every document of a container (or a slice of it), page by page

use std::collections::BTreeMap;
use std::sync::Arc;

use futures_util::stream::{self, Stream};
use serde_json::Value;
use uuid::Uuid;

use super::cancellation::Cancellation;
use super::enumerator::CrossPartitionEnumerator;
use super::fetcher::FeedRangeFetcher;
use crate::config::PipelineConfig;
use crate::continuation::ContinuationCodec;
use crate::errors::PipelineResult;
use crate::observability::PipelineMetrics;
use crate::range::{CrossFeedRangeState, FeedRange, ReadState};

/// One page of a read feed
#[derive(Debug, Clone, PartialEq)]
pub struct ReadFeedPage {
    pub documents: Vec<Value>,
    pub request_charge: f64,
    pub activity_id: String,
    pub additional_headers: BTreeMap<String, String>,
    /// Token to resume after this page; `None` once the feed is drained
    pub continuation: Option<String>,
}

/// Read feed over a set of ranges with a resumable token
pub struct ReadFeedIterator {
    enumerator: CrossPartitionEnumerator,
    correlated_activity_id: Uuid,
}

impl ReadFeedIterator {
    /// Start over `range`, or resume from `continuation` if given
    pub fn new(
        fetcher: Arc<dyn FeedRangeFetcher>,
        range: FeedRange,
        continuation: Option<&str>,
        config: &PipelineConfig,
        metrics: Arc<PipelineMetrics>,
    ) -> PipelineResult<Self> {
        config.validate()?;
        let state = match continuation {
            Some(token) => ContinuationCodec::with_max_token_bytes(config.max_continuation_token_bytes)
                .parse(token)
                .map_err(|err| {
                    metrics.increment_tokens_rejected();
                    err
                })?,
            None => CrossFeedRangeState::single(range, ReadState::Beginning),
        };
        Ok(Self {
            enumerator: CrossPartitionEnumerator::new(fetcher, state, config, metrics),
            correlated_activity_id: Uuid::new_v4(),
        })
    }

    /// Id shared by every page of this feed
    pub fn correlated_activity_id(&self) -> Uuid {
        self.correlated_activity_id
    }

    pub fn metrics(&self) -> &Arc<PipelineMetrics> {
        self.enumerator.metrics()
    }

    /// Next page, or `None` when the feed is drained or failed terminally
    pub async fn next_page(&mut self, cancellation: &Cancellation) -> Option<PipelineResult<ReadFeedPage>> {
        if !self.enumerator.move_next(cancellation).await {
            return None;
        }
        let current = self.enumerator.take_current()?;
        Some(current.map(|page| ReadFeedPage {
            documents: page.page.elements,
            request_charge: page.page.request_charge,
            activity_id: page.page.activity_id,
            additional_headers: page.page.additional_headers,
            continuation: page.state.as_ref().map(ContinuationCodec::serialize),
        }))
    }

    /// Pages as a stream
    pub fn into_stream(
        self,
        cancellation: Cancellation,
    ) -> impl Stream<Item = PipelineResult<ReadFeedPage>> {
        stream::unfold((self, cancellation), |(mut feed, cancellation)| async move {
            let page = feed.next_page(&cancellation).await?;
            Some((page, (feed, cancellation)))
        })
    }
}
