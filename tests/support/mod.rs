//! Shared test support: an in-memory partitioned container
//!
//! - Documents are routed by the effective key of their partition key
//! - A cursor is the global sequence number of the last document returned,
//!   so cursors stay valid when partitions split or merge
//! - A read spanning more than one partition is answered with a
//!   split/merge signal, exactly like a partition that no longer exists
//! - Failures can be queued and are returned before the next read
//! - A read or a child-range lookup can be made to hang until the caller
//!   gives up on it

#![allow(dead_code)]

use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Mutex;

use crossfeed::errors::PipelineError;
use crossfeed::pagination::{Cancellation, FeedRangeFetcher, FetchFuture, Page};
use crossfeed::range::{format_epk, partition_key_epk, EpkRange, MAX_EPK};
use crossfeed::{FeedRange, FeedRangeState, ReadState};
use serde_json::{json, Value};
use tokio::sync::Notify;

struct Record {
    seq: u64,
    epk: u128,
    document: Value,
}

pub struct InMemoryContainer {
    partitions: Mutex<Vec<FeedRange>>,
    records: Mutex<Vec<Record>>,
    /// Ranges of merged-away partitions; each reports gone once
    gone: Mutex<Vec<FeedRange>>,
    failures: Mutex<VecDeque<PipelineError>>,
    fetched: Mutex<Vec<FeedRange>>,
    /// Reads still to serve before one hangs
    hang_fetch_after: Mutex<Option<usize>>,
    hang_child_lookup: AtomicBool,
    hung: Notify,
    next_seq: AtomicU64,
    activity: AtomicU64,
}

/// Effective range `[start, end)` from raw key-space bounds
pub fn epk_range(start: u128, end: u128) -> FeedRange {
    let range = EpkRange::new(&format_epk(start), &format_epk(end))
        .expect("valid effective key bounds");
    FeedRange::effective(range)
}

impl InMemoryContainer {
    /// Container with `count` equally sized partitions
    pub fn new(count: u128) -> Self {
        let width = MAX_EPK / count;
        let partitions = (0..count)
            .map(|i| {
                let end = if i + 1 == count { MAX_EPK } else { width * (i + 1) };
                epk_range(width * i, end)
            })
            .collect();
        Self {
            partitions: Mutex::new(partitions),
            records: Mutex::new(Vec::new()),
            gone: Mutex::new(Vec::new()),
            failures: Mutex::new(VecDeque::new()),
            fetched: Mutex::new(Vec::new()),
            hang_fetch_after: Mutex::new(None),
            hang_child_lookup: AtomicBool::new(false),
            hung: Notify::new(),
            next_seq: AtomicU64::new(1),
            activity: AtomicU64::new(0),
        }
    }

    /// Store `document` under logical partition key `pk`
    pub fn insert(&self, pk: Value, document: Value) {
        let seq = self.next_seq.fetch_add(1, Ordering::SeqCst);
        self.records.lock().unwrap().push(Record {
            seq,
            epk: partition_key_epk(&pk),
            document,
        });
    }

    /// Insert `{"id": i, "pk": "pk-<i % keys>"}` for i in `0..count`
    pub fn insert_numbered(&self, count: usize, keys: usize) {
        for i in 0..count {
            let pk = json!(format!("pk-{}", i % keys));
            self.insert(pk.clone(), json!({"id": i, "pk": pk}));
        }
    }

    pub fn partitions(&self) -> Vec<FeedRange> {
        self.partitions.lock().unwrap().clone()
    }

    /// Split partition `index` at its midpoint
    pub fn split(&self, index: usize) {
        let mut partitions = self.partitions.lock().unwrap();
        let (left, right) = partitions[index].split().expect("splittable partition");
        partitions[index] = left;
        partitions.insert(index + 1, right);
    }

    /// Merge partition `index` with the one after it
    pub fn merge(&self, index: usize) {
        let mut partitions = self.partitions.lock().unwrap();
        let left = partitions[index].clone();
        let right = partitions[index + 1].clone();
        let merged = left.merge(&right).expect("adjacent partitions");
        partitions[index] = merged;
        partitions.remove(index + 1);
        self.gone.lock().unwrap().extend([left, right]);
    }

    /// Return `err` from the next read instead of data
    pub fn fail_next(&self, err: PipelineError) {
        self.failures.lock().unwrap().push_back(err);
    }

    /// Let `reads` more page reads through, then never answer the next one
    pub fn hang_fetch_after(&self, reads: usize) {
        *self.hang_fetch_after.lock().unwrap() = Some(reads);
    }

    /// Never answer the next child-range lookup
    pub fn hang_next_child_lookup(&self) {
        self.hang_child_lookup.store(true, Ordering::SeqCst);
    }

    /// Cancel `cancellation` once a call is hanging
    pub async fn cancel_when_hung(&self, cancellation: &Cancellation) {
        self.hung.notified().await;
        cancellation.cancel();
    }

    fn should_hang_fetch(&self) -> bool {
        let mut countdown = self.hang_fetch_after.lock().unwrap();
        match *countdown {
            Some(0) => {
                *countdown = None;
                true
            }
            Some(reads) => {
                *countdown = Some(reads - 1);
                false
            }
            None => false,
        }
    }

    async fn hang(&self) {
        self.hung.notify_one();
        std::future::pending::<()>().await;
    }

    /// Every range a page was successfully read from, in order
    pub fn fetched_ranges(&self) -> Vec<FeedRange> {
        self.fetched.lock().unwrap().clone()
    }

    pub fn document_count(&self) -> usize {
        self.records.lock().unwrap().len()
    }

    fn serving_partition(&self, range: &FeedRange) -> Option<FeedRange> {
        self.partitions
            .lock()
            .unwrap()
            .iter()
            .find(|partition| partition.contains(range))
            .cloned()
    }

    fn read(&self, range_state: &FeedRangeState, page_size: usize) -> Result<Page, PipelineError> {
        if let Some(err) = self.failures.lock().unwrap().pop_front() {
            return Err(err);
        }

        let range = &range_state.range;
        {
            let mut gone = self.gone.lock().unwrap();
            if let Some(position) = gone.iter().position(|old| old == range) {
                gone.remove(position);
                return Err(PipelineError::SplitOrMergeInProgress {
                    range: range.to_string(),
                });
            }
        }
        if self.serving_partition(range).is_none() {
            return Err(PipelineError::SplitOrMergeInProgress {
                range: range.to_string(),
            });
        }

        let after = match &range_state.state {
            ReadState::Beginning => 0,
            ReadState::Continuation(token) => token.as_u64().ok_or_else(|| {
                PipelineError::fetch_failed(400, format!("bad cursor {}", token))
            })?,
        };
        let (start, end) = range.bounds();
        let records = self.records.lock().unwrap();
        let matching: Vec<&Record> = records
            .iter()
            .filter(|record| record.seq > after && record.epk >= start && record.epk < end)
            .collect();

        let page: Vec<&Record> = matching.iter().take(page_size).copied().collect();
        let state = if matching.len() > page.len() {
            page.last().map(|record| ReadState::continuation(json!(record.seq)))
        } else {
            None
        };

        self.fetched.lock().unwrap().push(range.clone());
        let activity = self.activity.fetch_add(1, Ordering::SeqCst);
        Ok(Page::new(page.iter().map(|record| record.document.clone()).collect(), state)
            .with_request_charge(1.0)
            .with_activity_id(format!("activity-{}", activity)))
    }
}

impl FeedRangeFetcher for InMemoryContainer {
    fn fetch_page<'a>(
        &'a self,
        range_state: &'a FeedRangeState,
        page_size_hint: usize,
        _cancellation: &'a Cancellation,
    ) -> FetchFuture<'a, Page> {
        Box::pin(async move {
            if self.should_hang_fetch() {
                self.hang().await;
            }
            self.read(range_state, page_size_hint)
        })
    }

    fn child_ranges<'a>(
        &'a self,
        range: &'a FeedRange,
        _cancellation: &'a Cancellation,
    ) -> FetchFuture<'a, Vec<FeedRange>> {
        Box::pin(async move {
            if self.hang_child_lookup.swap(false, Ordering::SeqCst) {
                self.hang().await;
            }
            Ok(self
                .partitions
                .lock()
                .unwrap()
                .iter()
                .filter(|partition| partition.overlaps(range))
                .cloned()
                .collect())
        })
    }
}

/// `id` fields of `documents`, sorted
pub fn sorted_ids(documents: &[Value]) -> Vec<u64> {
    let mut ids: Vec<u64> = documents
        .iter()
        .filter_map(|document| document["id"].as_u64())
        .collect();
    ids.sort_unstable();
    ids
}
