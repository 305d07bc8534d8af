//! Serde shapes of the continuation token formats

use serde::{Deserialize, Deserializer, Serialize};
use serde_json::Value;

use crate::range::{EpkRange, FeedRange, FeedRangeState, ReadState};

// ==================== current array shape ====================

#[derive(Debug, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub(crate) struct FeedRangeStateWire {
    pub range: RangeWire,
    pub state: StateWire,
}

#[derive(Debug, Serialize, Deserialize)]
#[serde(untagged)]
pub(crate) enum RangeWire {
    Effective(EpkRangeWire),
    PartitionKey(PartitionKeyWire),
}

#[derive(Debug, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub(crate) struct EpkRangeWire {
    pub min: String,
    pub max: String,
    #[serde(
        rename = "minInclusive",
        default = "default_true",
        skip_serializing_if = "is_true"
    )]
    pub min_inclusive: bool,
    #[serde(rename = "maxInclusive", default, skip_serializing_if = "is_false")]
    pub max_inclusive: bool,
}

#[derive(Debug, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub(crate) struct PartitionKeyWire {
    pub pk: Value,
}

/// `{"type":"beginning"}` or `{"type":"continuation","value":<cursor>}`
#[derive(Debug, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub(crate) struct StateWire {
    #[serde(rename = "type")]
    pub kind: StateKind,
    #[serde(
        default,
        deserialize_with = "present",
        skip_serializing_if = "Option::is_none"
    )]
    pub value: Option<Value>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub(crate) enum StateKind {
    Beginning,
    Continuation,
}

/// A present `value` is kept even when it is `null`
fn present<'de, D>(deserializer: D) -> Result<Option<Value>, D::Error>
where
    D: Deserializer<'de>,
{
    Value::deserialize(deserializer).map(Some)
}

fn default_true() -> bool {
    true
}

fn is_true(value: &bool) -> bool {
    *value
}

fn is_false(value: &bool) -> bool {
    !*value
}

impl From<&FeedRange> for RangeWire {
    fn from(range: &FeedRange) -> Self {
        match range {
            FeedRange::PartitionKey(value) => RangeWire::PartitionKey(PartitionKeyWire {
                pk: value.clone(),
            }),
            other => {
                let epk = other.epk_range();
                RangeWire::Effective(EpkRangeWire {
                    min: epk.min_key(),
                    max: epk.max_key(),
                    min_inclusive: epk.is_min_inclusive(),
                    max_inclusive: epk.is_max_inclusive(),
                })
            }
        }
    }
}

impl RangeWire {
    pub fn into_range(self) -> Result<FeedRange, String> {
        match self {
            RangeWire::PartitionKey(wire) => Ok(FeedRange::PartitionKey(wire.pk)),
            RangeWire::Effective(wire) => EpkRange::with_inclusivity(
                &wire.min,
                &wire.max,
                wire.min_inclusive,
                wire.max_inclusive,
            )
            .map(FeedRange::effective)
            .map_err(|e| e.to_string()),
        }
    }
}

impl From<&ReadState> for StateWire {
    fn from(state: &ReadState) -> Self {
        match state {
            ReadState::Beginning => StateWire {
                kind: StateKind::Beginning,
                value: None,
            },
            ReadState::Continuation(value) => StateWire {
                kind: StateKind::Continuation,
                value: Some(value.clone()),
            },
        }
    }
}

impl StateWire {
    pub fn into_state(self) -> Result<ReadState, String> {
        match (self.kind, self.value) {
            (StateKind::Beginning, None) => Ok(ReadState::Beginning),
            (StateKind::Beginning, Some(_)) => {
                Err("a beginning state carries no value".to_string())
            }
            (StateKind::Continuation, Some(value)) => Ok(ReadState::Continuation(value)),
            (StateKind::Continuation, None) => {
                Err("a continuation state needs a value".to_string())
            }
        }
    }
}

impl From<&FeedRangeState> for FeedRangeStateWire {
    fn from(entry: &FeedRangeState) -> Self {
        Self {
            range: RangeWire::from(&entry.range),
            state: StateWire::from(&entry.state),
        }
    }
}

// ==================== legacy shapes ====================

/// `{"Continuation": [...], "Range": {...}}`
#[derive(Debug, Deserialize)]
pub(crate) struct CompositeTokenWire {
    #[serde(rename = "Continuation")]
    pub continuation: Vec<CompositeEntryWire>,
    #[serde(rename = "Range", default)]
    pub range: Option<LegacyRangeWire>,
}

/// `{"PK": <logical key>, "Continuation": [one entry]}`
#[derive(Debug, Deserialize)]
pub(crate) struct PartitionKeyTokenWire {
    #[serde(rename = "PK")]
    pub partition_key: Value,
    #[serde(rename = "Continuation")]
    pub continuation: Vec<CompositeEntryWire>,
}

#[derive(Debug, Deserialize)]
pub(crate) struct CompositeEntryWire {
    /// `null` or absent means the range was not started
    #[serde(default)]
    pub token: Option<Value>,
    pub range: LegacyRangeWire,
}

/// Legacy ranges are always `[min, max)`
#[derive(Debug, Deserialize)]
pub(crate) struct LegacyRangeWire {
    pub min: String,
    pub max: String,
}

impl LegacyRangeWire {
    pub fn to_range(&self) -> Result<FeedRange, String> {
        FeedRange::from_keys(&self.min, &self.max).map_err(|e| e.to_string())
    }
}

impl CompositeEntryWire {
    pub fn read_state(&self) -> ReadState {
        match &self.token {
            None | Some(Value::Null) => ReadState::Beginning,
            Some(token) => ReadState::Continuation(token.clone()),
        }
    }
}
