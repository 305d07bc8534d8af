//! Query iterator: drives the outermost stage and renders responses

use std::collections::BTreeMap;
use std::sync::Arc;

use futures_util::stream::{self, Stream};
use serde_json::Value;
use uuid::Uuid;

use super::plan::{create_pipeline, QueryPlan};
use super::stage::BoxedStage;
use crate::config::PipelineConfig;
use crate::errors::{PipelineError, PipelineResult};
use crate::observability::{log_event, Event, PipelineMetrics};
use crate::pagination::{Cancellation, FeedRangeFetcher};
use crate::range::FeedRange;

/// One page of query results as handed to the caller
#[derive(Debug, Clone, PartialEq)]
pub struct QueryResponse {
    pub documents: Vec<Value>,
    pub request_charge: f64,
    pub activity_id: String,
    pub additional_headers: BTreeMap<String, String>,
    /// Token to resume after this page; `None` when the query is complete
    /// or cannot be resumed
    pub continuation: Option<String>,
    pub disallow_continuation_reason: Option<String>,
}

impl QueryResponse {
    /// Like `continuation`, but an error when the pipeline cannot resume
    pub fn continuation_token(&self) -> PipelineResult<Option<&str>> {
        match &self.disallow_continuation_reason {
            Some(reason) => Err(PipelineError::UnsupportedOperation(reason.clone())),
            None => Ok(self.continuation.as_deref()),
        }
    }
}

pub struct QueryIterator {
    stage: BoxedStage,
    correlated_activity_id: Uuid,
    metrics: Arc<PipelineMetrics>,
}

impl QueryIterator {
    /// Build the pipeline for `plan`, resuming from `continuation` if given
    pub fn new(
        fetcher: Arc<dyn FeedRangeFetcher>,
        range: FeedRange,
        plan: &QueryPlan,
        continuation: Option<&str>,
        config: &PipelineConfig,
        metrics: Arc<PipelineMetrics>,
    ) -> PipelineResult<Self> {
        let stage = create_pipeline(
            plan,
            fetcher,
            range,
            continuation,
            config,
            Arc::clone(&metrics),
        )
        .map_err(|err| {
            if matches!(err, PipelineError::MalformedContinuationToken { .. }) {
                metrics.increment_tokens_rejected();
            }
            err
        })?;

        let correlated_activity_id = Uuid::new_v4();
        log_event(
            Event::QueryPipelineCreated,
            &[
                ("correlated_activity_id", &correlated_activity_id.to_string()),
                ("environment", &format!("{:?}", config.execution_environment)),
                ("resumed", if continuation.is_some() { "true" } else { "false" }),
                ("stages", &plan.stage_names().join(",")),
            ],
        );

        Ok(Self {
            stage,
            correlated_activity_id,
            metrics,
        })
    }

    /// Id shared by every page of this query
    pub fn correlated_activity_id(&self) -> Uuid {
        self.correlated_activity_id
    }

    pub fn metrics(&self) -> &Arc<PipelineMetrics> {
        &self.metrics
    }

    /// Next page, or `None` once the query is complete
    pub async fn next_page(
        &mut self,
        cancellation: &Cancellation,
    ) -> Option<PipelineResult<QueryResponse>> {
        if !self.stage.move_next(cancellation).await {
            return None;
        }
        let page = self.stage.take_current()?;
        Some(page.map(|page| {
            let continuation = match &page.disallow_continuation_reason {
                Some(_) => None,
                None => page.state.as_ref().map(Value::to_string),
            };
            QueryResponse {
                documents: page.documents,
                request_charge: page.request_charge,
                activity_id: page.activity_id,
                additional_headers: page.additional_headers,
                continuation,
                disallow_continuation_reason: page.disallow_continuation_reason,
            }
        }))
    }

    /// Pages as a stream
    pub fn into_stream(
        self,
        cancellation: Cancellation,
    ) -> impl Stream<Item = PipelineResult<QueryResponse>> {
        stream::unfold((self, cancellation), |(mut query, cancellation)| async move {
            let page = query.next_page(&cancellation).await?;
            Some((page, (query, cancellation)))
        })
    }
}
