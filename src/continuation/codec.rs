//! Continuation token codec
//!
//! Output is always the array shape:
//!
//! ```text
//! [{"range":{"min":"","max":"7F80"},"state":{"type":"continuation","value":"42"}},
//!  {"range":{"min":"7F80","max":"FF"},"state":{"type":"beginning"}}]
//! ```
//!
//! Input is accepted in three shapes, tried in a fixed order:
//!
//! 1. the array shape above, recognised by its leading `[` and trailing `]`
//! 2. legacy composite: `{"Continuation":[{"token":..,"range":{"min","max"}}],"Range":{..}}`
//! 3. legacy single partition key: `{"PK":<key>,"Continuation":[exactly one entry]}`
//!
//! Anything else is a [`PipelineError::MalformedContinuationToken`]
//! carrying the offending text.

use serde_json::Value;

use super::wire::{CompositeTokenWire, FeedRangeStateWire, PartitionKeyTokenWire};
use crate::errors::{PipelineError, PipelineResult};
use crate::observability::{log_event, Event};
use crate::range::{CrossFeedRangeState, FeedRange, FeedRangeState};

/// Which input shape a token was parsed from
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TokenShape {
    /// Array of range states
    Current,
    /// Object with a `Continuation` list of ranges
    LegacyComposite,
    /// Composite constrained to one logical partition key
    LegacyPartitionKey,
}

impl TokenShape {
    pub fn as_str(&self) -> &'static str {
        match self {
            TokenShape::Current => "current",
            TokenShape::LegacyComposite => "legacy_composite",
            TokenShape::LegacyPartitionKey => "legacy_partition_key",
        }
    }

    pub fn is_legacy(&self) -> bool {
        !matches!(self, TokenShape::Current)
    }
}

/// Outcome of one parser in the chain
enum Attempt {
    Parsed(CrossFeedRangeState),
    /// Not this shape; try the next parser
    Declined,
    /// This shape, but broken
    Malformed(String),
}

type ShapeParser = fn(&Value) -> Attempt;

const PARSERS: [(TokenShape, ShapeParser); 3] = [
    (TokenShape::Current, parse_current),
    (TokenShape::LegacyComposite, parse_legacy_composite),
    (TokenShape::LegacyPartitionKey, parse_legacy_partition_key),
];

/// Encodes and decodes read-feed continuation tokens
#[derive(Debug, Clone, Copy, Default)]
pub struct ContinuationCodec {
    max_token_bytes: Option<usize>,
}

impl ContinuationCodec {
    pub fn new() -> Self {
        Self::default()
    }

    /// Reject tokens longer than `max_token_bytes` before parsing them
    pub fn with_max_token_bytes(max_token_bytes: Option<usize>) -> Self {
        Self { max_token_bytes }
    }

    /// Serialize into the array shape
    pub fn serialize(state: &CrossFeedRangeState) -> String {
        Self::to_value(state).to_string()
    }

    /// Array-shape element tree
    pub fn to_value(state: &CrossFeedRangeState) -> Value {
        let wires: Vec<FeedRangeStateWire> = state.iter().map(FeedRangeStateWire::from).collect();
        serde_json::to_value(wires).unwrap_or(Value::Null)
    }

    /// Parse a token in any supported shape
    pub fn parse(&self, token: &str) -> PipelineResult<CrossFeedRangeState> {
        self.parse_with_shape(token).map(|(state, _)| state)
    }

    /// Parse a token and report which shape it was in
    pub fn parse_with_shape(&self, token: &str) -> PipelineResult<(CrossFeedRangeState, TokenShape)> {
        if let Some(limit) = self.max_token_bytes {
            if token.len() > limit {
                return Err(reject(
                    token,
                    format!("token is {} bytes, limit is {}", token.len(), limit),
                ));
            }
        }

        let trimmed = token.trim();
        let looks_like_array = trimmed.starts_with('[') && trimmed.ends_with(']');
        let value: Value = serde_json::from_str(trimmed)
            .map_err(|e| reject(token, format!("not valid JSON: {}", e)))?;

        if looks_like_array {
            return match parse_current(&value) {
                Attempt::Parsed(state) => Ok((state, TokenShape::Current)),
                Attempt::Malformed(reason) => Err(reject(token, reason)),
                Attempt::Declined => Err(reject(token, "not an array of range states")),
            };
        }
        Self::run_chain(token, &value)
    }

    /// Parse an already structured token.
    ///
    /// A string value is treated as serialized token text.
    pub fn from_value(&self, value: &Value) -> PipelineResult<CrossFeedRangeState> {
        match value {
            Value::String(text) => self.parse(text),
            other => Self::run_chain(&other.to_string(), other).map(|(state, _)| state),
        }
    }

    fn run_chain(token: &str, value: &Value) -> PipelineResult<(CrossFeedRangeState, TokenShape)> {
        for (shape, parser) in PARSERS {
            match parser(value) {
                Attempt::Parsed(state) => {
                    if shape.is_legacy() {
                        log_event(
                            Event::LegacyTokenNormalized,
                            &[("ranges", &state.len().to_string()), ("shape", shape.as_str())],
                        );
                    }
                    return Ok((state, shape));
                }
                Attempt::Malformed(reason) => return Err(reject(token, reason)),
                Attempt::Declined => continue,
            }
        }
        Err(reject(
            token,
            "expected an array of range states or an object with a \"Continuation\" key",
        ))
    }
}

fn reject(token: &str, reason: impl Into<String>) -> PipelineError {
    let err = PipelineError::malformed(token, reason);
    log_event(Event::ContinuationRejected, &[("error", &err.to_string())]);
    err
}

fn parse_current(value: &Value) -> Attempt {
    if !value.is_array() {
        return Attempt::Declined;
    }
    let wires: Vec<FeedRangeStateWire> = match serde_json::from_value(value.clone()) {
        Ok(wires) => wires,
        Err(e) => return Attempt::Malformed(format!("invalid range state: {}", e)),
    };

    let mut entries = Vec::with_capacity(wires.len());
    for wire in wires {
        let range = match wire.range.into_range() {
            Ok(range) => range,
            Err(reason) => return Attempt::Malformed(reason),
        };
        let state = match wire.state.into_state() {
            Ok(state) => state,
            Err(reason) => return Attempt::Malformed(reason),
        };
        entries.push(FeedRangeState::new(range, state));
    }
    finish(entries)
}

fn parse_legacy_composite(value: &Value) -> Attempt {
    let Some(object) = value.as_object() else {
        return Attempt::Declined;
    };
    if object.contains_key("PK") {
        return Attempt::Declined;
    }
    if !object.contains_key("Continuation") {
        return Attempt::Malformed("missing required \"Continuation\" key".to_string());
    }
    let wire: CompositeTokenWire = match serde_json::from_value(value.clone()) {
        Ok(wire) => wire,
        Err(e) => return Attempt::Malformed(format!("invalid composite token: {}", e)),
    };

    let outer = match wire.range.as_ref().map(|range| range.to_range()).transpose() {
        Ok(outer) => outer,
        Err(reason) => return Attempt::Malformed(reason),
    };

    let mut entries = Vec::with_capacity(wire.continuation.len());
    for entry in &wire.continuation {
        let range = match entry.range.to_range() {
            Ok(range) => range,
            Err(reason) => return Attempt::Malformed(reason),
        };
        if let Some(outer) = &outer {
            if !outer.contains(&range) {
                return Attempt::Malformed(format!(
                    "range {} lies outside the token range {}",
                    range, outer
                ));
            }
        }
        entries.push(FeedRangeState::new(range, entry.read_state()));
    }
    finish(entries)
}

fn parse_legacy_partition_key(value: &Value) -> Attempt {
    let Some(object) = value.as_object() else {
        return Attempt::Declined;
    };
    if !object.contains_key("PK") {
        return Attempt::Declined;
    }
    let wire: PartitionKeyTokenWire = match serde_json::from_value(value.clone()) {
        Ok(wire) => wire,
        Err(e) => return Attempt::Malformed(format!("invalid partition key token: {}", e)),
    };
    if wire.continuation.len() != 1 {
        return Attempt::Malformed(format!(
            "partition key token must have exactly one entry, found {}",
            wire.continuation.len()
        ));
    }

    let entry = &wire.continuation[0];
    let range = FeedRange::PartitionKey(wire.partition_key.clone());
    match entry.range.to_range() {
        Ok(physical) if physical.contains(&range) => {}
        Ok(physical) => {
            return Attempt::Malformed(format!(
                "partition key {} is outside range {}",
                wire.partition_key, physical
            ))
        }
        Err(reason) => return Attempt::Malformed(reason),
    }
    finish(vec![FeedRangeState::new(range, entry.read_state())])
}

fn finish(entries: Vec<FeedRangeState>) -> Attempt {
    match CrossFeedRangeState::new(entries) {
        Ok(state) => Attempt::Parsed(state),
        Err(err) => Attempt::Malformed(err.to_string()),
    }
}
