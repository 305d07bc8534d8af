//! Pages returned by the fetch collaborator

use std::collections::BTreeMap;

use serde_json::Value;

use crate::range::{CrossFeedRangeState, FeedRange, ReadState};

/// One physical page from one range
#[derive(Debug, Clone, PartialEq)]
pub struct Page {
    /// Result elements in server order
    pub elements: Vec<Value>,
    /// Cost units consumed by the fetch
    pub request_charge: f64,
    pub activity_id: String,
    pub additional_headers: BTreeMap<String, String>,
    /// Updated cursor; `None` means the range is exhausted
    pub state: Option<ReadState>,
}

impl Page {
    pub fn new(elements: Vec<Value>, state: Option<ReadState>) -> Self {
        Self {
            elements,
            request_charge: 0.0,
            activity_id: String::new(),
            additional_headers: BTreeMap::new(),
            state,
        }
    }

    pub fn with_request_charge(mut self, request_charge: f64) -> Self {
        self.request_charge = request_charge;
        self
    }

    pub fn with_activity_id(mut self, activity_id: impl Into<String>) -> Self {
        self.activity_id = activity_id.into();
        self
    }

    pub fn with_header(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.additional_headers.insert(name.into(), value.into());
        self
    }
}

/// A page exposed by the cross-partition enumerator
#[derive(Debug, Clone, PartialEq)]
pub struct CrossPartitionPage {
    /// The physical page as returned by the fetch
    pub page: Page,
    /// Range the page was read from
    pub range: FeedRange,
    /// Progress of every still-active range after this page; `None` once
    /// every range is exhausted
    pub state: Option<CrossFeedRangeState>,
}
