//! Group hash → aggregate state
//!
//! One-way lifecycle: absorbing source rows, then draining buckets, then
//! drained. Drained buckets are removed and never revisited.

use std::collections::BTreeMap;

use serde_json::{Map, Value};

use super::aggregators::{AggregatorLayout, SingleGroupAggregator};
use crate::query::hash::{format_hash, parse_hash, tuple_hash};

const GROUP_BY_ITEMS_KEY: &str = "groupByItems";
const PAYLOAD_KEY: &str = "payload";
const ITEM_KEY: &str = "item";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TablePhase {
    Absorbing,
    Draining,
    Drained,
}

#[derive(Debug, Clone)]
pub struct GroupingTable {
    layout: AggregatorLayout,
    has_select_value: bool,
    /// Aggregates without GROUP BY: one group, present even for no rows
    single_group: bool,
    groups: BTreeMap<u128, SingleGroupAggregator>,
    phase: TablePhase,
}

impl GroupingTable {
    pub fn new(layout: AggregatorLayout) -> Self {
        let has_select_value = matches!(layout, AggregatorLayout::SelectValue(_));
        Self {
            layout,
            has_select_value,
            single_group: false,
            groups: BTreeMap::new(),
            phase: TablePhase::Absorbing,
        }
    }

    /// Table for `SELECT COUNT(1) FROM c` and friends.
    ///
    /// Every row folds into one group. Sealing an empty table still yields
    /// that group, so COUNT reports 0 instead of no row.
    pub fn single_group(layout: AggregatorLayout) -> Self {
        Self {
            single_group: true,
            ..Self::new(layout)
        }
    }

    /// Empty table of the same shape, rehydrated from `to_token` output
    pub fn restore(&self, token: &Value) -> Result<Self, String> {
        let mut table = Self::from_token(self.layout.clone(), token)?;
        table.single_group = self.single_group;
        Ok(table)
    }

    /// Rehydrate from `to_token` output, `{hash: aggregator token}`.
    ///
    /// Returns the reason on failure.
    pub fn from_token(layout: AggregatorLayout, token: &Value) -> Result<Self, String> {
        let buckets = token
            .as_object()
            .ok_or_else(|| "grouping table token must be an object".to_string())?;
        let mut table = GroupingTable::new(layout);
        for (hash, fragment) in buckets {
            let key = parse_hash(hash).ok_or_else(|| format!("invalid group hash {:?}", hash))?;
            let group = SingleGroupAggregator::from_token(&table.layout, fragment)
                .ok_or_else(|| format!("invalid aggregate state for group {}", hash))?;
            table.groups.insert(key, group);
        }
        Ok(table)
    }

    pub fn phase(&self) -> TablePhase {
        self.phase
    }

    pub fn len(&self) -> usize {
        self.groups.len()
    }

    pub fn is_empty(&self) -> bool {
        self.groups.is_empty()
    }

    /// Fold rewritten rows `{"groupByItems": [...], "payload": ...}`.
    ///
    /// SELECT VALUE rows whose payload is undefined are skipped. Rows are
    /// ignored once the table is sealed. Fails when an aggregate overflows.
    pub fn add_rows(&mut self, rows: &[Value]) -> Result<(), String> {
        if self.phase != TablePhase::Absorbing {
            return Ok(());
        }
        let missing = Value::Null;
        for row in rows {
            let payload = match row.get(PAYLOAD_KEY) {
                Some(payload) => payload,
                None if self.has_select_value => continue,
                None => &missing,
            };

            let key = match row.get(GROUP_BY_ITEMS_KEY).and_then(Value::as_array) {
                Some(items) => tuple_hash(items.iter().map(|item| item.get(ITEM_KEY))),
                None => tuple_hash(std::iter::empty()),
            };
            let layout = &self.layout;
            self.groups
                .entry(key)
                .or_insert_with(|| SingleGroupAggregator::new(layout))
                .add_values(payload)?;
        }
        Ok(())
    }

    /// Stop absorbing and start draining
    pub fn seal(&mut self) {
        if self.phase == TablePhase::Absorbing {
            if self.single_group && self.groups.is_empty() {
                self.groups.insert(
                    tuple_hash(std::iter::empty()),
                    SingleGroupAggregator::new(&self.layout),
                );
            }
            self.phase = if self.groups.is_empty() {
                TablePhase::Drained
            } else {
                TablePhase::Draining
            };
        }
    }

    /// Remove and finalize up to `max_elements` groups.
    ///
    /// Groups with an undefined result produce no row.
    pub fn drain(&mut self, max_elements: usize) -> Vec<Value> {
        if self.phase != TablePhase::Draining {
            return Vec::new();
        }
        let mut rows = Vec::new();
        for _ in 0..max_elements {
            let Some((_, group)) = self.groups.pop_first() else {
                break;
            };
            if let Some(row) = group.result() {
                rows.push(row);
            }
        }
        if self.groups.is_empty() {
            self.phase = TablePhase::Drained;
        }
        rows
    }

    pub fn is_done(&self) -> bool {
        self.phase == TablePhase::Drained
    }

    pub fn to_token(&self) -> Value {
        let buckets: Map<String, Value> = self
            .groups
            .iter()
            .map(|(hash, group)| (format_hash(*hash), group.to_token()))
            .collect();
        Value::Object(buckets)
    }
}
