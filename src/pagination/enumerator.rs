//! Cross-partition enumerator
//!
//! Drives one physical fetch per pull over a working set of ranges and
//! exposes a single page stream with a single merged progress state.
//!
//! Ranges live in an arena of slots. Split and merge retire slots and
//! append new ones, so indices held by the fetch queue never alias an
//! entry that has been replaced. The queue is round robin: a range that
//! returned a page goes to the back, which bounds how long any range can
//! wait for its next turn.

use std::collections::VecDeque;
use std::sync::Arc;

use super::cancellation::Cancellation;
use super::fetcher::FeedRangeFetcher;
use super::page::{CrossPartitionPage, Page};
use super::topology::{resolve, Topology};
use crate::config::PipelineConfig;
use crate::errors::{
    PipelineError, PipelineResult, STATUS_GONE, SUB_STATUS_PARTITION_KEY_RANGE_GONE,
};
use crate::observability::{log_event, Event, PipelineMetrics};
use crate::range::{CrossFeedRangeState, FeedRange, FeedRangeState, ReadState};

#[derive(Debug)]
struct RangeSlot {
    range: FeedRange,
    state: ReadState,
    retired: bool,
    /// Consecutive split/merge signals since the last successful page
    topology_retries: u32,
}

/// Pull-based enumerator over many independently progressing ranges.
///
/// Not safe for concurrent `move_next` calls; one logical consumer owns it.
pub struct CrossPartitionEnumerator {
    fetcher: Arc<dyn FeedRangeFetcher>,
    slots: Vec<RangeSlot>,
    queue: VecDeque<usize>,
    page_size_hint: usize,
    max_topology_retries: u32,
    metrics: Arc<PipelineMetrics>,
    current: Option<PipelineResult<CrossPartitionPage>>,
    done: bool,
}

impl CrossPartitionEnumerator {
    pub fn new(
        fetcher: Arc<dyn FeedRangeFetcher>,
        state: CrossFeedRangeState,
        config: &PipelineConfig,
        metrics: Arc<PipelineMetrics>,
    ) -> Self {
        let mut enumerator = Self {
            fetcher,
            slots: Vec::with_capacity(state.len()),
            queue: VecDeque::with_capacity(state.len()),
            page_size_hint: config.max_item_count.max(1),
            max_topology_retries: config.max_topology_retries,
            metrics,
            current: None,
            done: false,
        };
        for entry in state.into_entries() {
            let index = enumerator.push_slot(entry.range, entry.state, 0);
            enumerator.queue.push_back(index);
        }
        log_event(
            Event::EnumeratorStart,
            &[("ranges", &enumerator.queue.len().to_string())],
        );
        enumerator
    }

    /// Change the page size passed to subsequent fetches
    pub fn set_page_size_hint(&mut self, page_size_hint: usize) {
        self.page_size_hint = page_size_hint.max(1);
    }

    pub fn page_size_hint(&self) -> usize {
        self.page_size_hint
    }

    pub fn metrics(&self) -> &Arc<PipelineMetrics> {
        &self.metrics
    }

    /// True once the active set is empty or a terminal error was surfaced
    pub fn is_done(&self) -> bool {
        self.done
    }

    /// Active ranges in fetch order
    pub fn active_states(&self) -> Vec<FeedRangeState> {
        self.queue
            .iter()
            .map(|&index| {
                let slot = &self.slots[index];
                FeedRangeState::new(slot.range.clone(), slot.state.clone())
            })
            .collect()
    }

    /// Progress of all active ranges; `None` when nothing is left to read
    pub fn state(&self) -> Option<CrossFeedRangeState> {
        CrossFeedRangeState::from_disjoint(self.active_states())
    }

    /// Result of the last successful `move_next`.
    ///
    /// A failed pull can be inspected repeatedly; the error is cloned.
    pub fn current(&self) -> PipelineResult<&CrossPartitionPage> {
        match &self.current {
            Some(Ok(page)) => Ok(page),
            Some(Err(err)) => Err(err.clone()),
            None => Err(PipelineError::UnsupportedOperation(
                "no current page; move_next has not produced one".to_string(),
            )),
        }
    }

    /// Move the current result out, leaving nothing current
    pub fn take_current(&mut self) -> Option<PipelineResult<CrossPartitionPage>> {
        self.current.take()
    }

    /// Pull the next page.
    ///
    /// Returns false once every range is exhausted or after a terminal
    /// error has been surfaced. Returns true with an `Err` current for a
    /// failed pull; retriable failures leave the range queued so the next
    /// call retries it.
    pub async fn move_next(&mut self, cancellation: &Cancellation) -> bool {
        if self.done {
            self.current = None;
            return false;
        }
        if let Err(err) = cancellation.check() {
            log_event(Event::PullCancelled, &[]);
            self.current = Some(Err(err));
            return true;
        }

        loop {
            let Some(index) = self.queue.pop_front() else {
                self.done = true;
                self.current = None;
                log_event(Event::EnumeratorDone, &[]);
                return false;
            };

            let range_state = FeedRangeState::new(
                self.slots[index].range.clone(),
                self.slots[index].state.clone(),
            );
            let fetcher = Arc::clone(&self.fetcher);
            let page_size_hint = self.page_size_hint;
            let result = tokio::select! {
                biased;
                _ = cancellation.cancelled() => Err(PipelineError::Cancelled),
                result = fetcher.fetch_page(&range_state, page_size_hint, cancellation) => result,
            };

            match result {
                Ok(page) => {
                    self.accept_page(index, range_state.range, page);
                    return true;
                }
                Err(err) if err.is_split_or_merge() => {
                    if let Err(err) = self.reconcile(index, cancellation).await {
                        self.fail(index, err);
                        return true;
                    }
                }
                Err(err) => {
                    self.fail(index, err);
                    return true;
                }
            }
        }
    }

    fn push_slot(&mut self, range: FeedRange, state: ReadState, topology_retries: u32) -> usize {
        self.slots.push(RangeSlot {
            range,
            state,
            retired: false,
            topology_retries,
        });
        self.slots.len() - 1
    }

    fn accept_page(&mut self, index: usize, range: FeedRange, page: Page) {
        self.metrics
            .record_page(page.elements.len(), page.request_charge);

        let slot = &mut self.slots[index];
        slot.topology_retries = 0;
        match &page.state {
            Some(state) => {
                slot.state = state.clone();
                self.queue.push_back(index);
            }
            None => {
                slot.retired = true;
                self.metrics.increment_ranges_exhausted();
                log_event(Event::RangeExhausted, &[("range", &range.to_string())]);
            }
        }
        log_event(
            Event::PageFetched,
            &[
                ("activity_id", &page.activity_id),
                ("elements", &page.elements.len().to_string()),
                ("range", &range.to_string()),
            ],
        );

        let state = self.state();
        self.current = Some(Ok(CrossPartitionPage { page, range, state }));
    }

    fn fail(&mut self, index: usize, err: PipelineError) {
        self.queue.push_front(index);
        if err == PipelineError::Cancelled {
            log_event(Event::PullCancelled, &[]);
        } else {
            self.metrics.increment_fetch_failures();
            log_event(
                Event::FetchFailed,
                &[
                    ("code", err.code().as_str()),
                    ("message", &err.to_string()),
                    ("range", &self.slots[index].range.to_string()),
                    ("retriable", if err.is_retriable() { "true" } else { "false" }),
                ],
            );
        }
        if !err.is_retriable() {
            self.done = true;
        }
        self.current = Some(Err(err));
    }

    /// Replace the slot at `index` with the ranges now serving it.
    ///
    /// On error nothing has been changed and the caller requeues the slot.
    async fn reconcile(&mut self, index: usize, cancellation: &Cancellation) -> PipelineResult<()> {
        let range = self.slots[index].range.clone();
        let retries = self.slots[index].topology_retries + 1;
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
                self.slots[index].topology_retries = retries;
                self.metrics.increment_relocations();
                log_event(
                    Event::PartitionKeyRelocated,
                    &[("partition", &partition.to_string()), ("range", &range.to_string())],
                );
                self.queue.push_front(index);
                Ok(())
            }
            Topology::Merged(parent) => {
                self.slots[index].topology_retries = retries;
                self.metrics.increment_merges();
                log_event(
                    Event::MergeDetected,
                    &[("partition", &parent.to_string()), ("range", &range.to_string())],
                );
                self.coalesce(index, &parent);
                Ok(())
            }
            Topology::Split(children) => {
                self.metrics.increment_splits();
                log_event(
                    Event::SplitDetected,
                    &[("children", &children.len().to_string()), ("range", &range.to_string())],
                );
                let state = self.slots[index].state.clone();
                self.slots[index].retired = true;
                for child in children.into_iter().rev() {
                    let child_index = self.push_slot(child, state.clone(), retries);
                    self.queue.push_front(child_index);
                }
                Ok(())
            }
        }
    }

    /// The slot's range is now served by the larger `parent` partition.
    ///
    /// Fold it together with an adjacent active sibling in the same parent
    /// when both are at the identical position; otherwise keep reading it
    /// as a sub-range of the parent.
    fn coalesce(&mut self, index: usize, parent: &FeedRange) {
        let range = self.slots[index].range.clone();
        let state = self.slots[index].state.clone();

        let sibling = self.queue.iter().enumerate().find_map(|(position, &other)| {
            let slot = &self.slots[other];
            if slot.retired
                || slot.state != state
                || !parent.contains(&slot.range)
                || !slot.range.is_adjacent(&range)
            {
                return None;
            }
            range
                .merge(&slot.range)
                .ok()
                .map(|merged| (position, other, merged))
        });

        match sibling {
            Some((position, other, merged)) => {
                self.queue.remove(position);
                self.slots[index].retired = true;
                self.slots[other].retired = true;
                log_event(
                    Event::RangesCoalesced,
                    &[
                        ("left", &range.to_string()),
                        ("merged", &merged.to_string()),
                        ("right", &self.slots[other].range.to_string()),
                    ],
                );
                let retries = self.slots[index].topology_retries;
                let merged_index = self.push_slot(merged, state, retries);
                self.queue.push_front(merged_index);
            }
            None => self.queue.push_front(index),
        }
    }
}
