//! ORDER BY
//!
//! Every range returns its rows already sorted, rewritten as
//! `{"orderByItems": [{"item": v}, ...], "payload": <document>}`. The stage
//! keeps one cursor per range and repeatedly takes the smallest head, so a
//! row is only emitted while every live range has a buffered row to compare
//! it against. Ties between ranges go to the range with the lower key.
//!
//! The token lists one entry per unfinished range:
//!
//! ```text
//! [{"range":{"min":"","max":"7F80"},"state":{"type":"continuation","value":"7"},
//!   "orderByItems":[{"item":4}],"returned":["9C0E..."]},
//!  {"range":{"min":"7F80","max":"FF"},"state":{"type":"beginning"}}]
//! ```
//!
//! `state` is where the page holding the range's next row starts.
//! `orderByItems` and `returned` say which rows from there on were returned
//! already: everything sorting before the key, and the rows equal to it
//! whose structural hashes are listed. A resumed range refetches from
//! `state` and drops them. Hashes rather than a count let the children of
//! a split range each drop only the tied rows they hold.

use std::cmp::Ordering;
use std::collections::VecDeque;
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use serde_json::Value;

use super::group_by::aggregators::compare_primitives;
use super::hash::{format_hash, parse_hash, structural_hash};
use super::stage::{token_text, CurrentPage, PipelineStage, QueryPage, StageFuture};
use crate::config::PipelineConfig;
use crate::continuation::wire::{RangeWire, StateWire};
use crate::errors::{
    PipelineError, PipelineResult, STATUS_GONE, SUB_STATUS_PARTITION_KEY_RANGE_GONE,
};
use crate::observability::{log_event, Event, PipelineMetrics};
use crate::pagination::topology::{resolve, Topology};
use crate::pagination::{Cancellation, FeedRangeFetcher, Page};
use crate::range::{CrossFeedRangeState, FeedRange, FeedRangeState, ReadState};

const ORDER_BY_ITEMS_KEY: &str = "orderByItems";
const PAYLOAD_KEY: &str = "payload";
const ITEM_KEY: &str = "item";

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum SortOrder {
    #[default]
    Ascending,
    Descending,
}

/// Compare two `orderByItems` lists under `orders`.
///
/// Within one item, undefined sorts first, then null, booleans, numbers,
/// strings, arrays and objects.
pub fn compare_sort_keys(a: &[Value], b: &[Value], orders: &[SortOrder]) -> Ordering {
    for (position, order) in orders.iter().enumerate() {
        let left = a.get(position).and_then(|wrapper| wrapper.get(ITEM_KEY));
        let right = b.get(position).and_then(|wrapper| wrapper.get(ITEM_KEY));
        let ordering = match (left, right) {
            (None, None) => Ordering::Equal,
            (None, Some(_)) => Ordering::Less,
            (Some(_), None) => Ordering::Greater,
            (Some(left), Some(right)) => compare_primitives(left, right),
        };
        let ordering = match order {
            SortOrder::Ascending => ordering,
            SortOrder::Descending => ordering.reverse(),
        };
        if ordering != Ordering::Equal {
            return ordering;
        }
    }
    Ordering::Equal
}

fn sort_items(row: &Value) -> &[Value] {
    row.get(ORDER_BY_ITEMS_KEY)
        .and_then(Value::as_array)
        .map(Vec::as_slice)
        .unwrap_or(&[])
}

/// Rows of a range's stream that were already returned
#[derive(Debug, Clone, PartialEq)]
struct SortPosition {
    items: Vec<Value>,
    /// Hashes of returned rows equal to `items` not yet skipped again
    returned: Vec<u128>,
}

impl SortPosition {
    fn starting_at(row: &Value) -> Self {
        Self {
            items: sort_items(row).to_vec(),
            returned: vec![structural_hash(Some(row))],
        }
    }

    /// Whether `row` was returned before; consumes its hash if so
    fn skip(&mut self, row: &Value, orders: &[SortOrder]) -> bool {
        match compare_sort_keys(sort_items(row), &self.items, orders) {
            Ordering::Less => true,
            Ordering::Equal => {
                let hash = structural_hash(Some(row));
                match self.returned.iter().position(|seen| *seen == hash) {
                    Some(found) => {
                        self.returned.swap_remove(found);
                        true
                    }
                    None => false,
                }
            }
            Ordering::Greater => false,
        }
    }
}

#[derive(Debug)]
struct Cursor {
    range: FeedRange,
    /// Start of the page in `buffer`, or of the next fetch while unloaded
    start: ReadState,
    buffer: VecDeque<Value>,
    /// State after the buffered page; `None` after the last page
    after: Option<ReadState>,
    loaded: bool,
    exhausted: bool,
    /// Already returned rows of the stream at `start`
    position: Option<SortPosition>,
    topology_retries: u32,
}

impl Cursor {
    fn new(range: FeedRange, start: ReadState, position: Option<SortPosition>) -> Self {
        Self {
            range,
            start,
            buffer: VecDeque::new(),
            after: None,
            loaded: false,
            exhausted: false,
            position,
            topology_retries: 0,
        }
    }

    /// Buffer a fetched page, dropping rows returned before a resume.
    ///
    /// Returns how many rows were dropped.
    fn accept(&mut self, page: Page, orders: &[SortOrder]) -> usize {
        self.topology_retries = 0;
        let mut rows: VecDeque<Value> = page.elements.into();
        // Skipping works on a copy: the position must still describe the
        // stream from `start` while rows of this page are buffered.
        let mut remaining = self.position.clone();
        let mut dropped = 0;
        if let Some(position) = remaining.as_mut() {
            while rows.front().is_some_and(|row| position.skip(row, orders)) {
                rows.pop_front();
                dropped += 1;
            }
        }

        if !rows.is_empty() {
            self.buffer = rows;
            self.after = page.state;
            self.loaded = true;
            return dropped;
        }
        match page.state {
            Some(next) => {
                self.start = next;
                self.position = remaining;
            }
            None => self.exhausted = true,
        }
        dropped
    }

    /// Take the head row; the cursor unloads once its page is used up
    fn pop(&mut self, orders: &[SortOrder]) -> Option<Value> {
        let row = self.buffer.pop_front()?;
        match self.position.as_mut() {
            Some(position)
                if compare_sort_keys(sort_items(&row), &position.items, orders)
                    == Ordering::Equal =>
            {
                position.returned.push(structural_hash(Some(&row)));
            }
            _ => self.position = Some(SortPosition::starting_at(&row)),
        }

        if self.buffer.is_empty() {
            self.loaded = false;
            match self.after.take() {
                Some(next) => {
                    self.start = next;
                    self.position = None;
                }
                None => self.exhausted = true,
            }
        }
        Some(row)
    }

    fn to_wire(&self) -> OrderByRangeWire {
        OrderByRangeWire {
            range: RangeWire::from(&self.range),
            state: StateWire::from(&self.start),
            order_by_items: self.position.as_ref().map(|position| position.items.clone()),
            returned: self.position.as_ref().map_or_else(Vec::new, |position| {
                position.returned.iter().copied().map(format_hash).collect()
            }),
        }
    }
}

#[derive(Debug, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
struct OrderByRangeWire {
    range: RangeWire,
    state: StateWire,
    #[serde(
        rename = "orderByItems",
        default,
        skip_serializing_if = "Option::is_none"
    )]
    order_by_items: Option<Vec<Value>>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    returned: Vec<String>,
}

/// Leaf stage merging sorted per-range streams
pub struct OrderByStage {
    fetcher: Arc<dyn FeedRangeFetcher>,
    orders: Vec<SortOrder>,
    /// Live cursors in key order
    cursors: Vec<Cursor>,
    page_size: usize,
    max_topology_retries: u32,
    metrics: Arc<PipelineMetrics>,
    /// Charge and metadata of fetches not yet reported in a page
    pending: QueryPage,
    fetched_since_emit: bool,
    current: CurrentPage,
}

impl OrderByStage {
    /// Start over `range` or resume from an ORDER BY token
    pub fn new(
        fetcher: Arc<dyn FeedRangeFetcher>,
        range: FeedRange,
        orders: Vec<SortOrder>,
        continuation: Option<&Value>,
        config: &PipelineConfig,
        metrics: Arc<PipelineMetrics>,
    ) -> PipelineResult<Self> {
        if orders.is_empty() {
            return Err(PipelineError::InvalidArgument(
                "ORDER BY needs at least one sort order".to_string(),
            ));
        }
        let cursors = match continuation {
            None => vec![Cursor::new(range, ReadState::Beginning, None)],
            Some(token) => parse_token(token, orders.len())?,
        };
        log_event(
            Event::EnumeratorStart,
            &[("ranges", &cursors.len().to_string())],
        );
        Ok(Self {
            fetcher,
            orders,
            cursors,
            page_size: config.max_item_count.max(1),
            max_topology_retries: config.max_topology_retries,
            metrics,
            pending: QueryPage::default(),
            fetched_since_emit: false,
            current: CurrentPage::default(),
        })
    }

    /// Load a page into every live cursor that has none
    async fn fill(&mut self, cancellation: &Cancellation) -> PipelineResult<()> {
        let mut index = 0;
        while index < self.cursors.len() {
            let cursor = &self.cursors[index];
            if cursor.loaded {
                index += 1;
                continue;
            }

            let range_state = FeedRangeState::new(cursor.range.clone(), cursor.start.clone());
            let fetcher = Arc::clone(&self.fetcher);
            let result = tokio::select! {
                biased;
                _ = cancellation.cancelled() => Err(PipelineError::Cancelled),
                result = fetcher.fetch_page(&range_state, self.page_size, cancellation) => result,
            };

            match result {
                Ok(page) => self.accept(index, page),
                Err(err) if err.is_split_or_merge() => self.reconcile(index, cancellation).await?,
                Err(err) => {
                    if err == PipelineError::Cancelled {
                        log_event(Event::PullCancelled, &[]);
                    } else {
                        self.metrics.increment_fetch_failures();
                        log_event(
                            Event::FetchFailed,
                            &[
                                ("code", err.code().as_str()),
                                ("message", &err.to_string()),
                                ("range", &range_state.range.to_string()),
                            ],
                        );
                    }
                    return Err(err);
                }
            }
        }
        Ok(())
    }

    fn accept(&mut self, index: usize, page: Page) {
        self.metrics
            .record_page(page.elements.len(), page.request_charge);
        log_event(
            Event::PageFetched,
            &[
                ("activity_id", &page.activity_id),
                ("elements", &page.elements.len().to_string()),
                ("range", &self.cursors[index].range.to_string()),
            ],
        );
        self.fetched_since_emit = true;
        self.pending.request_charge += page.request_charge;
        self.pending.activity_id = page.activity_id.clone();
        self.pending
            .additional_headers
            .extend(page.additional_headers.clone());

        let dropped = self.cursors[index].accept(page, &self.orders);
        if dropped > 0 {
            log_event(
                Event::OrderByRowsSkipped,
                &[
                    ("range", &self.cursors[index].range.to_string()),
                    ("rows", &dropped.to_string()),
                ],
            );
        }
        if self.cursors[index].exhausted {
            self.retire(index);
        }
    }

    fn retire(&mut self, index: usize) {
        let cursor = self.cursors.remove(index);
        self.metrics.increment_ranges_exhausted();
        log_event(Event::RangeExhausted, &[("range", &cursor.range.to_string())]);
    }

    /// Replace the cursor at `index` with the ranges now serving it.
    ///
    /// On error nothing has been changed.
    async fn reconcile(&mut self, index: usize, cancellation: &Cancellation) -> PipelineResult<()> {
        let range = self.cursors[index].range.clone();
        let retries = self.cursors[index].topology_retries + 1;
        log_event(
            Event::TopologyChanged,
            &[("attempt", &retries.to_string()), ("range", &range.to_string())],
        );
        if retries > self.max_topology_retries {
            log_event(Event::TopologyRetriesExhausted, &[("range", &range.to_string())]);
            return Err(PipelineError::FetchFailed {
                status_code: STATUS_GONE,
                sub_status_code: SUB_STATUS_PARTITION_KEY_RANGE_GONE,
                message: format!(
                    "range {} still reported split or merged after {} attempts",
                    range, self.max_topology_retries
                ),
                activity_id: None,
                retriable: false,
            });
        }

        let fetcher = Arc::clone(&self.fetcher);
        match resolve(fetcher.as_ref(), &range, cancellation).await? {
            Topology::Relocated(partition) => {
                self.metrics.increment_relocations();
                log_event(
                    Event::PartitionKeyRelocated,
                    &[("partition", &partition.to_string()), ("range", &range.to_string())],
                );
                self.cursors[index].topology_retries = retries;
            }
            // A sorted sub-range cannot be folded into a sibling; keep
            // reading it against the merged partition.
            Topology::Merged(parent) => {
                self.metrics.increment_merges();
                log_event(
                    Event::MergeDetected,
                    &[("partition", &parent.to_string()), ("range", &range.to_string())],
                );
                self.cursors[index].topology_retries = retries;
            }
            Topology::Split(children) => {
                self.metrics.increment_splits();
                log_event(
                    Event::SplitDetected,
                    &[("children", &children.len().to_string()), ("range", &range.to_string())],
                );
                let parent = self.cursors.remove(index);
                let replacements = children.into_iter().map(|child| Cursor {
                    topology_retries: retries,
                    ..Cursor::new(child, parent.start.clone(), parent.position.clone())
                });
                self.cursors.splice(index..index, replacements);
            }
        }
        Ok(())
    }

    /// Index of the cursor holding the smallest head row
    fn head(&self) -> Option<usize> {
        let mut best: Option<(usize, &[Value])> = None;
        for (index, cursor) in self.cursors.iter().enumerate() {
            let Some(row) = cursor.buffer.front() else {
                continue;
            };
            let items = sort_items(row);
            let smaller = match best {
                Some((_, best_items)) => {
                    compare_sort_keys(items, best_items, &self.orders) == Ordering::Less
                }
                None => true,
            };
            if smaller {
                best = Some((index, items));
            }
        }
        best.map(|(index, _)| index)
    }

    /// Emit rows in sort order until the page is full or a cursor needs a fetch
    fn merge(&mut self) -> Vec<Value> {
        let mut documents = Vec::new();
        while documents.len() < self.page_size {
            let Some(index) = self.head() else {
                break;
            };
            let Some(row) = self.cursors[index].pop(&self.orders) else {
                break;
            };
            if let Some(payload) = row.get(PAYLOAD_KEY) {
                documents.push(payload.clone());
            }
            if self.cursors[index].exhausted {
                self.retire(index);
            } else if !self.cursors[index].loaded {
                break;
            }
        }
        documents
    }

    fn token(&self) -> Option<Value> {
        if self.cursors.is_empty() {
            return None;
        }
        let wires: Vec<OrderByRangeWire> = self.cursors.iter().map(Cursor::to_wire).collect();
        Some(serde_json::to_value(wires).unwrap_or(Value::Null))
    }
}

impl PipelineStage for OrderByStage {
    fn move_next<'a>(&'a mut self, cancellation: &'a Cancellation) -> StageFuture<'a> {
        Box::pin(async move {
            if let Err(err) = cancellation.check() {
                log_event(Event::PullCancelled, &[]);
                self.current.set(Err(err));
                return true;
            }
            if let Err(err) = self.fill(cancellation).await {
                self.current.set(Err(err));
                return true;
            }
            if self.cursors.is_empty() && !self.fetched_since_emit {
                self.current.clear();
                return false;
            }

            let documents = self.merge();
            let state = self.token();
            if state.is_none() {
                log_event(Event::EnumeratorDone, &[]);
            }
            let page = std::mem::take(&mut self.pending).replace(documents, state);
            self.fetched_since_emit = false;
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

/// Cursors from a token, in key order
fn parse_token(token: &Value, sort_columns: usize) -> PipelineResult<Vec<Cursor>> {
    let malformed = |reason: String| {
        let err = PipelineError::malformed(token_text(token), reason);
        log_event(Event::ContinuationRejected, &[("error", &err.to_string())]);
        err
    };

    let parsed;
    let value = match token {
        Value::String(text) => {
            parsed = serde_json::from_str::<Value>(text)
                .map_err(|e| malformed(format!("not valid JSON: {}", e)))?;
            &parsed
        }
        other => other,
    };
    let wires: Vec<OrderByRangeWire> = serde_json::from_value(value.clone())
        .map_err(|e| malformed(format!("invalid ORDER BY range: {}", e)))?;

    let mut cursors = Vec::with_capacity(wires.len());
    for wire in wires {
        let range = wire.range.into_range().map_err(&malformed)?;
        let start = wire.state.into_state().map_err(&malformed)?;
        let returned = wire
            .returned
            .iter()
            .map(|text| {
                parse_hash(text).ok_or_else(|| malformed(format!("bad row hash {:?}", text)))
            })
            .collect::<PipelineResult<Vec<u128>>>()?;
        let position = match wire.order_by_items {
            Some(items) if items.len() != sort_columns => {
                return Err(malformed(format!(
                    "{} sort items for {} ORDER BY columns",
                    items.len(),
                    sort_columns
                )))
            }
            Some(items) => Some(SortPosition { items, returned }),
            None if !returned.is_empty() => {
                return Err(malformed("returned rows without orderByItems".to_string()))
            }
            None => None,
        };
        cursors.push(Cursor::new(range, start, position));
    }

    let ranges = cursors
        .iter()
        .map(|cursor| FeedRangeState::beginning(cursor.range.clone()))
        .collect();
    CrossFeedRangeState::new(ranges).map_err(|e| malformed(e.to_string()))?;

    cursors.sort_by_key(|cursor| cursor.range.bounds().0);
    Ok(cursors)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pagination::FetchFuture;
    use serde_json::json;
    use std::sync::Mutex;

    fn row(key: Value) -> Value {
        json!({"orderByItems": [{"item": key}], "payload": {"k": key}})
    }

    /// Two fixed partitions of pre-sorted rows; the cursor is a row offset
    struct SortedPartitions {
        partitions: Vec<(FeedRange, Vec<Value>)>,
        fetches: Mutex<Vec<FeedRange>>,
    }

    impl SortedPartitions {
        fn new(left: Vec<Value>, right: Vec<Value>) -> Self {
            let (low, high) = FeedRange::Full.split().unwrap();
            Self {
                partitions: vec![(low, left), (high, right)],
                fetches: Mutex::new(Vec::new()),
            }
        }
    }

    impl FeedRangeFetcher for SortedPartitions {
        fn fetch_page<'a>(
            &'a self,
            range_state: &'a FeedRangeState,
            page_size_hint: usize,
            _cancellation: &'a Cancellation,
        ) -> FetchFuture<'a, Page> {
            Box::pin(async move {
                let Some((range, rows)) = self
                    .partitions
                    .iter()
                    .find(|(range, _)| *range == range_state.range)
                else {
                    return Err(PipelineError::SplitOrMergeInProgress {
                        range: range_state.range.to_string(),
                    });
                };
                self.fetches.lock().unwrap().push(range.clone());
                let offset = match &range_state.state {
                    ReadState::Beginning => 0,
                    ReadState::Continuation(value) => value.as_u64().unwrap() as usize,
                };
                let end = (offset + page_size_hint).min(rows.len());
                let state = (end < rows.len()).then(|| ReadState::continuation(json!(end)));
                Ok(Page::new(rows[offset..end].to_vec(), state).with_request_charge(1.0))
            })
        }

        fn child_ranges<'a>(
            &'a self,
            range: &'a FeedRange,
            _cancellation: &'a Cancellation,
        ) -> FetchFuture<'a, Vec<FeedRange>> {
            Box::pin(async move {
                Ok(self
                    .partitions
                    .iter()
                    .filter(|(partition, _)| partition.overlaps(range))
                    .map(|(partition, _)| partition.clone())
                    .collect())
            })
        }
    }

    fn stage(
        fetcher: &Arc<SortedPartitions>,
        orders: Vec<SortOrder>,
        token: Option<&Value>,
        page_size: usize,
    ) -> PipelineResult<OrderByStage> {
        OrderByStage::new(
            Arc::clone(fetcher) as Arc<dyn FeedRangeFetcher>,
            FeedRange::Full,
            orders,
            token,
            &PipelineConfig::with_max_item_count(page_size),
            Arc::new(PipelineMetrics::new()),
        )
    }

    fn keys(pages: &[QueryPage]) -> Vec<Value> {
        pages
            .iter()
            .flat_map(|page| page.documents.iter().map(|d| d["k"].clone()))
            .collect()
    }

    async fn drain(stage: &mut OrderByStage) -> Vec<QueryPage> {
        let cancellation = Cancellation::new();
        let mut pages = Vec::new();
        while stage.move_next(&cancellation).await {
            pages.push(stage.take_current().unwrap().unwrap());
        }
        pages
    }

    #[test]
    fn test_sort_key_type_order() {
        let ascending = [SortOrder::Ascending];
        let ordered = [
            json!([{}]),
            json!([{"item": null}]),
            json!([{"item": false}]),
            json!([{"item": 3}]),
            json!([{"item": "a"}]),
        ];
        for pair in ordered.windows(2) {
            let (a, b) = (pair[0].as_array().unwrap(), pair[1].as_array().unwrap());
            assert_eq!(compare_sort_keys(a, b, &ascending), Ordering::Less);
            assert_eq!(compare_sort_keys(a, b, &[SortOrder::Descending]), Ordering::Greater);
        }
    }

    #[test]
    fn test_sort_key_second_column_breaks_ties() {
        let a = [json!({"item": 1}), json!({"item": "b"})];
        let b = [json!({"item": 1}), json!({"item": "a"})];
        let orders = [SortOrder::Ascending, SortOrder::Descending];
        assert_eq!(compare_sort_keys(&a, &b, &orders), Ordering::Less);
        assert_eq!(compare_sort_keys(&a, &a, &orders), Ordering::Equal);
    }

    #[tokio::test]
    async fn test_merges_partitions_in_order() {
        let fetcher = Arc::new(SortedPartitions::new(
            [1, 4, 5, 9].into_iter().map(|k| row(json!(k))).collect(),
            [2, 3, 6, 7, 8].into_iter().map(|k| row(json!(k))).collect(),
        ));
        let mut stage = stage(&fetcher, vec![SortOrder::Ascending], None, 3).unwrap();

        let pages = drain(&mut stage).await;
        assert_eq!(keys(&pages), (1..=9).map(|k| json!(k)).collect::<Vec<_>>());
        assert!(pages.last().unwrap().state.is_none());
        assert!(pages[..pages.len() - 1].iter().all(|p| p.state.is_some()));
        let charge: f64 = pages.iter().map(|p| p.request_charge).sum();
        assert_eq!(charge, fetcher.fetches.lock().unwrap().len() as f64);
    }

    #[tokio::test]
    async fn test_resume_skips_returned_rows_with_ties() {
        let fetcher = Arc::new(SortedPartitions::new(
            [3, 5, 5, 6].into_iter().map(|k| row(json!(k))).collect(),
            [1, 2, 5, 5, 5, 7].into_iter().map(|k| row(json!(k))).collect(),
        ));
        let everything =
            keys(&drain(&mut stage(&fetcher, vec![SortOrder::Ascending], None, 10).unwrap()).await);
        assert_eq!(everything.len(), 10);

        // a fresh stage per page, resumed from the previous page's token
        for page_size in 1..=4 {
            let cancellation = Cancellation::new();
            let mut token: Option<Value> = None;
            let mut all = Vec::new();
            loop {
                let mut next =
                    stage(&fetcher, vec![SortOrder::Ascending], token.as_ref(), page_size).unwrap();
                assert!(next.move_next(&cancellation).await);
                let page = next.take_current().unwrap().unwrap();
                all.extend(keys(&[page.clone()]));
                match page.state {
                    Some(state) => token = Some(state),
                    None => break,
                }
            }
            assert_eq!(all, everything, "page size {}", page_size);
        }
    }

    #[tokio::test]
    async fn test_split_range_skips_only_rows_it_returned() {
        let tagged = |key: i64, tag: &str| {
            json!({"orderByItems": [{"item": key}], "payload": {"k": key, "tag": tag}})
        };
        let fetcher = Arc::new(SortedPartitions::new(
            vec![tagged(5, "l1"), tagged(5, "l2"), tagged(6, "l3")],
            vec![tagged(5, "r1"), tagged(7, "r2")],
        ));
        // the whole range had already returned l1 and r1 before it split
        let token = json!([{
            "range": {"min": "", "max": "FF"},
            "state": {"type": "beginning"},
            "orderByItems": [{"item": 5}],
            "returned": [
                format_hash(structural_hash(Some(&tagged(5, "l1")))),
                format_hash(structural_hash(Some(&tagged(5, "r1")))),
            ],
        }]);

        let mut resumed = stage(&fetcher, vec![SortOrder::Ascending], Some(&token), 10).unwrap();
        let pages = drain(&mut resumed).await;

        let tags: Vec<Value> = pages
            .iter()
            .flat_map(|page| page.documents.iter().map(|d| d["tag"].clone()))
            .collect();
        assert_eq!(tags, vec![json!("l2"), json!("l3"), json!("r2")]);
        assert_eq!(resumed.metrics.snapshot().splits, 1);
    }

    #[tokio::test]
    async fn test_descending_token_shape() {
        let fetcher = Arc::new(SortedPartitions::new(
            [9, 3].into_iter().map(|k| row(json!(k))).collect(),
            [8, 7, 1].into_iter().map(|k| row(json!(k))).collect(),
        ));
        let mut stage = stage(&fetcher, vec![SortOrder::Descending], None, 2).unwrap();
        let cancellation = Cancellation::new();

        assert!(stage.move_next(&cancellation).await);
        let page = stage.take_current().unwrap().unwrap();
        assert_eq!(keys(&[page.clone()]), vec![json!(9), json!(8)]);

        let token = page.state.unwrap();
        let entries = token.as_array().unwrap();
        assert_eq!(entries.len(), 2);
        assert_eq!(entries[0]["orderByItems"], json!([{"item": 9}]));
        assert_eq!(
            entries[0]["returned"],
            json!([format_hash(structural_hash(Some(&row(json!(9)))))])
        );
        assert_eq!(entries[0]["state"], json!({"type": "beginning"}));
        assert_eq!(entries[1]["orderByItems"], json!([{"item": 8}]));
    }

    #[tokio::test]
    async fn test_failed_fetch_keeps_cursors() {
        struct Failing;
        impl FeedRangeFetcher for Failing {
            fn fetch_page<'a>(
                &'a self,
                _range_state: &'a FeedRangeState,
                _page_size_hint: usize,
                _cancellation: &'a Cancellation,
            ) -> FetchFuture<'a, Page> {
                Box::pin(async { Err(PipelineError::retriable_fetch_failed(429, "throttled")) })
            }

            fn child_ranges<'a>(
                &'a self,
                _range: &'a FeedRange,
                _cancellation: &'a Cancellation,
            ) -> FetchFuture<'a, Vec<FeedRange>> {
                Box::pin(async { Ok(vec![FeedRange::Full]) })
            }
        }

        let mut stage = OrderByStage::new(
            Arc::new(Failing),
            FeedRange::Full,
            vec![SortOrder::Ascending],
            None,
            &PipelineConfig::default(),
            Arc::new(PipelineMetrics::new()),
        )
        .unwrap();
        assert!(stage.move_next(&Cancellation::new()).await);
        assert!(stage.current().unwrap_err().is_retriable());
        assert_eq!(stage.cursors.len(), 1);
        assert_eq!(stage.cursors[0].start, ReadState::Beginning);
    }

    #[test]
    fn test_malformed_tokens() {
        let fetcher = Arc::new(SortedPartitions::new(vec![], vec![]));
        for token in [
            json!([]),
            json!({"orderBy": []}),
            json!([{"range": {"min": "", "max": "FF"}, "state": {"type": "beginning"},
                    "returned": ["0000000000000000000000000000002a"]}]),
            json!([{"range": {"min": "", "max": "FF"}, "state": {"type": "beginning"},
                    "orderByItems": [{"item": 1}, {"item": 2}]}]),
            json!([{"range": {"min": "", "max": "FF"}, "state": {"type": "beginning"},
                    "orderByItems": [{"item": 1}], "returned": ["xyz"]}]),
            json!([{"range": {"min": "", "max": "FF"}, "state": {"type": "beginning"}, "skip": 1}]),
            json!([{"range": {"min": "", "max": "80"}, "state": {"type": "beginning"}},
                   {"range": {"min": "40", "max": "FF"}, "state": {"type": "beginning"}}]),
            json!("[{not json"),
        ] {
            assert!(
                matches!(
                    stage(&fetcher, vec![SortOrder::Ascending], Some(&token), 10),
                    Err(PipelineError::MalformedContinuationToken { .. })
                ),
                "token {} should be rejected",
                token
            );
        }
    }
}
