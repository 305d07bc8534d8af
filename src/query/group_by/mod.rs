//! GROUP BY
//!
//! Two variants share the grouping table:
//! - [`ClientGroupByStage`] drains the whole source in its first pull, then
//!   emits buckets. It never produces a continuation token.
//! - [`ComputeGroupByStage`] folds one source page per pull and persists the
//!   partially built table in its token, so it can resume anywhere.

pub mod aggregators;
pub mod grouping_table;

use serde_json::{json, Value};

pub use aggregators::{AggregateKind, AggregatorLayout, SingleGroupAggregator};
pub use grouping_table::{GroupingTable, TablePhase};

use super::stage::{
    pull, token_field, token_object, token_text, BoxedStage, CreateStage, CurrentPage,
    EmptyStage, PipelineStage, QueryPage, StageFuture,
};
use crate::errors::{PipelineError, PipelineResult};
use crate::observability::{log_event, Event, ObservationScope};
use crate::pagination::Cancellation;

const GROUPING_TABLE_TOKEN_KEY: &str = "GroupingTableContinuationToken";
const SOURCE_TOKEN_KEY: &str = "SourceContinuationToken";
/// Source token once every source row is in the table
pub const DONE_SENTINEL: &str = "DONE";

const CLIENT_GROUP_BY_REASON: &str =
    "GROUP BY assembled on the client does not support continuation tokens";

fn seal(table: &mut GroupingTable) {
    table.seal();
    let groups = table.len().to_string();
    log_event(Event::GroupingTableSealed, &[("groups", &groups)]);
    if table.is_done() {
        log_event(Event::GroupingTableDrained, &[]);
    }
}

/// Emit up to `max_elements` buckets; logs once the table empties
fn drain(table: &mut GroupingTable, max_elements: usize) -> Vec<Value> {
    let was_done = table.is_done();
    let rows = table.drain(max_elements);
    if !was_done && table.is_done() {
        log_event(Event::GroupingTableDrained, &[]);
    }
    rows
}

pub struct ClientGroupByStage {
    inner: BoxedStage,
    table: GroupingTable,
    page_size: usize,
    /// Charge and metadata accumulated while draining the source
    pending: Option<QueryPage>,
    current: CurrentPage,
}

impl ClientGroupByStage {
    /// `table` is the empty table the stage folds into
    pub fn create(
        table: GroupingTable,
        page_size: usize,
        continuation: Option<Value>,
        create_source: CreateStage,
    ) -> PipelineResult<BoxedStage> {
        if continuation.is_some() {
            return Err(PipelineError::UnsupportedOperation(
                CLIENT_GROUP_BY_REASON.to_string(),
            ));
        }
        Ok(Box::new(ClientGroupByStage {
            inner: create_source(None)?,
            table,
            page_size,
            pending: Some(QueryPage::default()),
            current: CurrentPage::default(),
        }))
    }

    /// Pull every source page into the table.
    ///
    /// Rows already folded stay folded if a pull fails; calling again
    /// continues from the source's own position.
    async fn absorb(&mut self, cancellation: &Cancellation) -> PipelineResult<()> {
        let scope = ObservationScope::new("GROUP_BY_DRAIN");
        let mut pages = 0usize;
        loop {
            match pull(&mut self.inner, cancellation).await {
                None => break,
                Some(Err(err)) => {
                    scope.fail(&err.to_string());
                    return Err(err);
                }
                Some(Ok(page)) => {
                    pages += 1;
                    if let Err(reason) = self.table.add_rows(&page.documents) {
                        let err = PipelineError::InvalidArgument(reason);
                        scope.fail(&err.to_string());
                        return Err(err);
                    }
                    if let Some(pending) = self.pending.as_mut() {
                        pending.request_charge += page.request_charge;
                        pending.activity_id = page.activity_id;
                        pending.additional_headers.extend(page.additional_headers);
                    }
                }
            }
        }
        seal(&mut self.table);
        scope.complete_with_fields(&[
            ("groups", &self.table.len().to_string()),
            ("pages", &pages.to_string()),
        ]);
        Ok(())
    }
}

impl PipelineStage for ClientGroupByStage {
    fn move_next<'a>(&'a mut self, cancellation: &'a Cancellation) -> StageFuture<'a> {
        Box::pin(async move {
            if let Err(err) = cancellation.check() {
                self.current.set(Err(err));
                return true;
            }
            if self.table.phase() == TablePhase::Absorbing {
                if let Err(err) = self.absorb(cancellation).await {
                    self.current.set(Err(err));
                    return true;
                }
            }

            // The first emitted page carries the whole source charge
            let emitted_any = self.pending.is_none();
            if self.table.is_done() && emitted_any {
                self.current.clear();
                return false;
            }

            let documents = drain(&mut self.table, self.page_size);
            let mut page = self.pending.take().unwrap_or_default();
            page.documents = documents;
            page.state = None;
            page.disallow_continuation_reason = Some(CLIENT_GROUP_BY_REASON.to_string());
            self.current.set(Ok(page));
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

pub struct ComputeGroupByStage {
    inner: BoxedStage,
    table: GroupingTable,
    page_size: usize,
    current: CurrentPage,
}

impl ComputeGroupByStage {
    /// Create a fresh stage or resume one.
    ///
    /// A `"DONE"` source token resumes straight into draining without
    /// recreating the source.
    pub fn create(
        table: GroupingTable,
        page_size: usize,
        continuation: Option<Value>,
        create_source: CreateStage,
    ) -> PipelineResult<BoxedStage> {
        let (table, inner) = match continuation {
            None => (table, create_source(None)?),
            Some(token) => {
                let object = token_object(&token)?;
                let table_token = token_field(&object, GROUPING_TABLE_TOKEN_KEY, &token)?;
                let mut table = table
                    .restore(&table_token)
                    .map_err(|reason| PipelineError::malformed(token_text(&token), reason))?;
                let source_token = token_field(&object, SOURCE_TOKEN_KEY, &token)?;
                let inner: BoxedStage = if source_token.as_str() == Some(DONE_SENTINEL) {
                    seal(&mut table);
                    Box::new(EmptyStage)
                } else {
                    create_source(Some(source_token))?
                };
                (table, inner)
            }
        };

        Ok(Box::new(ComputeGroupByStage {
            inner,
            table,
            page_size,
            current: CurrentPage::default(),
        }))
    }

    fn token(&self, source_token: Value) -> Value {
        json!({
            GROUPING_TABLE_TOKEN_KEY: self.table.to_token(),
            SOURCE_TOKEN_KEY: source_token,
        })
    }

    /// Drain a page of buckets into `page`
    fn emit(&mut self, page: QueryPage) -> QueryPage {
        let documents = drain(&mut self.table, self.page_size);
        let state = if self.table.is_done() {
            None
        } else {
            Some(self.token(Value::String(DONE_SENTINEL.to_string())))
        };
        page.replace(documents, state)
    }
}

impl PipelineStage for ComputeGroupByStage {
    fn move_next<'a>(&'a mut self, cancellation: &'a Cancellation) -> StageFuture<'a> {
        Box::pin(async move {
            if let Err(err) = cancellation.check() {
                self.current.set(Err(err));
                return true;
            }

            match self.table.phase() {
                TablePhase::Drained => {
                    self.current.clear();
                    false
                }
                TablePhase::Draining => {
                    let page = self.emit(QueryPage::default());
                    self.current.set(Ok(page));
                    true
                }
                TablePhase::Absorbing => match pull(&mut self.inner, cancellation).await {
                    Some(Err(err)) => {
                        self.current.set(Err(err));
                        true
                    }
                    Some(Ok(mut page)) => {
                        if let Err(reason) = self.table.add_rows(&page.documents) {
                            self.current.set(Err(PipelineError::InvalidArgument(reason)));
                            return true;
                        }
                        match page.state.take() {
                            Some(source_state) => {
                                let state = self.token(source_state);
                                self.current.set(Ok(page.replace(Vec::new(), Some(state))));
                            }
                            None => {
                                seal(&mut self.table);
                                let page = self.emit(page);
                                self.current.set(Ok(page));
                            }
                        }
                        true
                    }
                    None => {
                        seal(&mut self.table);
                        if self.table.is_done() {
                            self.current.clear();
                            return false;
                        }
                        let page = self.emit(QueryPage::default());
                        self.current.set(Ok(page));
                        true
                    }
                },
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

#[cfg(test)]
mod tests {
    use super::*;
    use crate::query::testing::{document_pages, drain as drain_stage, scripted};

    fn table() -> GroupingTable {
        GroupingTable::new(AggregatorLayout::SelectList(vec![
            ("team".to_string(), None),
            ("total".to_string(), Some(AggregateKind::Sum)),
        ]))
    }

    fn row(team: &str, n: i64) -> Value {
        json!({
            "groupByItems": [{"item": team}],
            "payload": {"team": team, "total": {"item": n}},
        })
    }

    fn source_pages() -> Vec<Vec<Value>> {
        vec![
            vec![row("A", 1), row("B", 5)],
            vec![row("A", 2)],
            vec![row("C", 7), row("B", 1)],
        ]
    }

    fn all_documents(pages: &[QueryPage]) -> Vec<Value> {
        let mut documents: Vec<Value> = pages.iter().flat_map(|p| p.documents.clone()).collect();
        documents.sort_by_key(|d| d["team"].as_str().unwrap_or_default().to_string());
        documents
    }

    fn expected() -> Vec<Value> {
        vec![
            json!({"team": "A", "total": 3}),
            json!({"team": "B", "total": 6}),
            json!({"team": "C", "total": 7}),
        ]
    }

    #[tokio::test]
    async fn test_client_drains_source_then_pages_buckets() {
        let (source, _) = scripted(document_pages(source_pages()));
        let mut stage = ClientGroupByStage::create(table(), 2, None, source).unwrap();

        let pages = drain_stage(&mut stage).await.unwrap();
        assert_eq!(pages.len(), 2);
        assert_eq!(pages[0].documents.len(), 2);
        assert_eq!(pages[0].request_charge, 3.0);
        assert_eq!(pages[1].request_charge, 0.0);
        assert_eq!(all_documents(&pages), expected());
        for page in &pages {
            assert!(page.state.is_none());
            assert!(matches!(
                page.continuation_token(),
                Err(PipelineError::UnsupportedOperation(_))
            ));
        }
    }

    #[tokio::test]
    async fn test_client_empty_source_yields_one_empty_page() {
        let (source, _) = scripted(document_pages(vec![vec![]]));
        let mut stage = ClientGroupByStage::create(table(), 10, None, source).unwrap();

        let pages = drain_stage(&mut stage).await.unwrap();
        assert_eq!(pages.len(), 1);
        assert!(pages[0].documents.is_empty());
        assert_eq!(pages[0].request_charge, 1.0);
    }

    #[tokio::test]
    async fn test_aggregate_without_group_by_reports_zero_count() {
        let count = || {
            GroupingTable::single_group(AggregatorLayout::SelectValue(Some(AggregateKind::Count)))
        };

        let (source, _) = scripted(document_pages(vec![vec![], vec![]]));
        let mut stage = ClientGroupByStage::create(count(), 10, None, source).unwrap();
        let pages = drain_stage(&mut stage).await.unwrap();
        assert_eq!(pages.len(), 1);
        assert_eq!(pages[0].documents, vec![json!(0)]);

        let (source, _) = scripted(document_pages(vec![
            vec![json!({"payload": {"item": 4}})],
            vec![json!({"payload": {"item": 3}})],
        ]));
        let mut stage = ComputeGroupByStage::create(count(), 10, None, source).unwrap();
        let pages = drain_stage(&mut stage).await.unwrap();
        let documents: Vec<Value> = pages.into_iter().flat_map(|p| p.documents).collect();
        assert_eq!(documents, vec![json!(7)]);
    }

    #[test]
    fn test_client_rejects_continuation() {
        let (source, _) = scripted(document_pages(vec![]));
        let result = ClientGroupByStage::create(table(), 10, Some(json!({})), source);
        assert!(matches!(result, Err(PipelineError::UnsupportedOperation(_))));
    }

    #[tokio::test]
    async fn test_client_failure_keeps_folded_rows() {
        let mut pages = document_pages(vec![vec![row("A", 1)]]);
        pages[0].as_mut().unwrap().state = Some(json!({"page": 1}));
        pages.push(Err(PipelineError::retriable_fetch_failed(429, "throttled")));
        pages.extend(document_pages(vec![vec![row("A", 4)]]));
        let (source, _) = scripted(pages);
        let mut stage = ClientGroupByStage::create(table(), 10, None, source).unwrap();
        let cancellation = Cancellation::new();

        assert!(stage.move_next(&cancellation).await);
        assert!(stage.current().unwrap_err().is_retriable());

        assert!(stage.move_next(&cancellation).await);
        assert_eq!(
            stage.current().unwrap().documents,
            vec![json!({"team": "A", "total": 5})]
        );
        assert!(!stage.move_next(&cancellation).await);
    }

    #[tokio::test]
    async fn test_compute_emits_token_per_source_page() {
        let (source, _) = scripted(document_pages(source_pages()));
        let mut stage = ComputeGroupByStage::create(table(), 2, None, source).unwrap();

        let pages = drain_stage(&mut stage).await.unwrap();
        // two absorbing pages, then the last source page drains two buckets,
        // then one more bucket
        assert_eq!(pages.len(), 4);
        assert!(pages[0].documents.is_empty());
        assert!(pages[1].documents.is_empty());
        assert_eq!(pages[2].documents.len(), 2);
        assert_eq!(pages[3].documents.len(), 1);
        assert_eq!(all_documents(&pages), expected());

        let first = pages[0].state.clone().unwrap();
        assert_eq!(first[SOURCE_TOKEN_KEY], json!({"page": 1}));
        assert_eq!(first[GROUPING_TABLE_TOKEN_KEY].as_object().unwrap().len(), 2);
        assert_eq!(pages[2].state.clone().unwrap()[SOURCE_TOKEN_KEY], json!("DONE"));
        assert!(pages[3].state.is_none());
    }

    #[tokio::test]
    async fn test_compute_resume_mid_absorb() {
        let (source, _) = scripted(document_pages(source_pages()));
        let mut stage = ComputeGroupByStage::create(table(), 10, None, source).unwrap();
        let cancellation = Cancellation::new();
        assert!(stage.move_next(&cancellation).await);
        let token = stage.current().unwrap().state.clone().unwrap();

        let remaining = source_pages().split_off(1);
        let (source, seen) = scripted(document_pages(remaining));
        let mut resumed = ComputeGroupByStage::create(table(), 10, Some(token), source).unwrap();
        assert_eq!(seen.lock().unwrap().clone().unwrap(), Some(json!({"page": 1})));

        let pages = drain_stage(&mut resumed).await.unwrap();
        assert_eq!(all_documents(&pages), expected());
    }

    #[tokio::test]
    async fn test_compute_resume_done_skips_source() {
        let (source, _) = scripted(document_pages(source_pages()));
        let mut stage = ComputeGroupByStage::create(table(), 1, None, source).unwrap();
        let mut pages = drain_stage(&mut stage).await.unwrap();
        let first_drained = pages.iter().position(|p| !p.documents.is_empty()).unwrap();
        let token = pages[first_drained].state.clone().unwrap();
        let head: Vec<QueryPage> = pages.drain(..=first_drained).collect();

        let create_source: CreateStage = Box::new(|_: Option<Value>| -> PipelineResult<BoxedStage> {
            panic!("a DONE token must not recreate the source")
        });
        let mut resumed = ComputeGroupByStage::create(table(), 1, Some(token), create_source).unwrap();
        let mut rest = drain_stage(&mut resumed).await.unwrap();
        rest.extend(head);
        assert_eq!(all_documents(&rest), expected());
    }

    #[test]
    fn test_compute_bad_table_token_is_malformed() {
        let (source, _) = scripted(document_pages(vec![]));
        let token = json!({
            "GroupingTableContinuationToken": {"not-a-hash": {}},
            "SourceContinuationToken": "DONE",
        });
        let result = ComputeGroupByStage::create(table(), 10, Some(token), source);
        assert!(matches!(
            result,
            Err(PipelineError::MalformedContinuationToken { .. })
        ));

        let (source, _) = scripted(document_pages(vec![]));
        let token = json!({"SourceContinuationToken": "DONE"});
        let result = ComputeGroupByStage::create(table(), 10, Some(token), source);
        assert!(matches!(
            result,
            Err(PipelineError::MalformedContinuationToken { .. })
        ));
    }
}
