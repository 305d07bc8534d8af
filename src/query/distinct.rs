//! DISTINCT
//!
//! Ordered DISTINCT sees its input sorted, so only the previous document's
//! hash has to be remembered. Unordered DISTINCT keeps every hash seen.

use std::collections::HashSet;

use serde::{Deserialize, Serialize};
use serde_json::{json, Value};

use super::hash::{format_hash, parse_hash, structural_hash};
use super::stage::{
    pull, token_field, token_object, token_text, wrap_source_state, BoxedStage, CreateStage,
    CurrentPage, PipelineStage, QueryPage, StageFuture,
};
use crate::config::ExecutionEnvironment;
use crate::errors::{PipelineError, PipelineResult};
use crate::pagination::Cancellation;

const SOURCE_TOKEN_KEY: &str = "SourceToken";
const DISTINCT_MAP_TOKEN_KEY: &str = "DistinctMapToken";

const UNORDERED_CLIENT_REASON: &str =
    "unordered DISTINCT assembled on the client does not support continuation tokens";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum DistinctType {
    #[default]
    None,
    Ordered,
    Unordered,
}

/// Hashes already emitted
#[derive(Debug, Clone, PartialEq)]
pub enum DistinctMap {
    Ordered { last: Option<u128> },
    Unordered { seen: HashSet<u128> },
}

impl DistinctMap {
    pub fn new(distinct_type: DistinctType) -> PipelineResult<Self> {
        match distinct_type {
            DistinctType::Ordered => Ok(DistinctMap::Ordered { last: None }),
            DistinctType::Unordered => Ok(DistinctMap::Unordered {
                seen: HashSet::new(),
            }),
            DistinctType::None => Err(PipelineError::InvalidArgument(
                "a DISTINCT stage needs an ordered or unordered distinct type".to_string(),
            )),
        }
    }

    /// Record `document`; true when it has not been seen before
    pub fn add(&mut self, document: &Value) -> bool {
        let hash = structural_hash(Some(document));
        match self {
            DistinctMap::Ordered { last } => {
                if *last == Some(hash) {
                    false
                } else {
                    *last = Some(hash);
                    true
                }
            }
            DistinctMap::Unordered { seen } => seen.insert(hash),
        }
    }

    /// Ordered: last hash or null. Unordered: sorted array of hashes.
    pub fn to_token(&self) -> Value {
        match self {
            DistinctMap::Ordered { last } => match last {
                Some(hash) => Value::String(format_hash(*hash)),
                None => Value::Null,
            },
            DistinctMap::Unordered { seen } => {
                let mut hashes: Vec<&u128> = seen.iter().collect();
                hashes.sort();
                Value::Array(
                    hashes
                        .into_iter()
                        .map(|hash| Value::String(format_hash(*hash)))
                        .collect(),
                )
            }
        }
    }

    pub fn from_token(
        distinct_type: DistinctType,
        map_token: &Value,
        token: &Value,
    ) -> PipelineResult<Self> {
        let bad_hash = || PipelineError::malformed(token_text(token), "invalid distinct hash");
        match (distinct_type, map_token) {
            (DistinctType::Ordered, Value::Null) => Ok(DistinctMap::Ordered { last: None }),
            (DistinctType::Ordered, Value::String(text)) => Ok(DistinctMap::Ordered {
                last: Some(parse_hash(text).ok_or_else(bad_hash)?),
            }),
            (DistinctType::Unordered, Value::Array(items)) => {
                let seen = items
                    .iter()
                    .map(|item| item.as_str().and_then(parse_hash).ok_or_else(bad_hash))
                    .collect::<PipelineResult<HashSet<u128>>>()?;
                Ok(DistinctMap::Unordered { seen })
            }
            (DistinctType::None, _) => Err(PipelineError::InvalidArgument(
                "a DISTINCT stage needs an ordered or unordered distinct type".to_string(),
            )),
            _ => Err(PipelineError::malformed(
                token_text(token),
                format!("distinct map token does not match {:?} DISTINCT", distinct_type),
            )),
        }
    }
}

pub struct DistinctStage {
    inner: BoxedStage,
    environment: ExecutionEnvironment,
    map: DistinctMap,
    disallow_continuation_reason: Option<&'static str>,
    current: CurrentPage,
}

impl DistinctStage {
    /// Create a fresh stage or resume one.
    ///
    /// Client unordered DISTINCT cannot be resumed; asking it to is an
    /// `UnsupportedOperation`.
    pub fn create(
        environment: ExecutionEnvironment,
        distinct_type: DistinctType,
        continuation: Option<Value>,
        create_source: CreateStage,
    ) -> PipelineResult<BoxedStage> {
        let disallow_continuation_reason = match (environment, distinct_type) {
            (ExecutionEnvironment::Client, DistinctType::Unordered) => Some(UNORDERED_CLIENT_REASON),
            _ => None,
        };

        let (map, source_token) = match continuation {
            None => (DistinctMap::new(distinct_type)?, None),
            Some(_) if disallow_continuation_reason.is_some() => {
                return Err(PipelineError::UnsupportedOperation(
                    UNORDERED_CLIENT_REASON.to_string(),
                ))
            }
            Some(token) => {
                let object = token_object(&token)?;
                let map_token = token_field(&object, DISTINCT_MAP_TOKEN_KEY, &token)?;
                let map = DistinctMap::from_token(distinct_type, &map_token, &token)?;
                (map, Some(token_field(&object, SOURCE_TOKEN_KEY, &token)?))
            }
        };

        Ok(Box::new(DistinctStage {
            inner: create_source(source_token)?,
            environment,
            map,
            disallow_continuation_reason,
            current: CurrentPage::default(),
        }))
    }
}

impl PipelineStage for DistinctStage {
    fn move_next<'a>(&'a mut self, cancellation: &'a Cancellation) -> StageFuture<'a> {
        Box::pin(async move {
            if let Err(err) = cancellation.check() {
                self.current.set(Err(err));
                return true;
            }

            let mut page = match pull(&mut self.inner, cancellation).await {
                None => {
                    self.current.clear();
                    return false;
                }
                Some(Err(err)) => {
                    self.current.set(Err(err));
                    return true;
                }
                Some(Ok(page)) => page,
            };

            let documents: Vec<Value> = std::mem::take(&mut page.documents)
                .into_iter()
                .filter(|document| self.map.add(document))
                .collect();

            let state = match (&page.state, self.disallow_continuation_reason) {
                (Some(source_state), None) => Some(json!({
                    SOURCE_TOKEN_KEY: wrap_source_state(self.environment, source_state),
                    DISTINCT_MAP_TOKEN_KEY: self.map.to_token(),
                })),
                _ => None,
            };
            let mut page = page.replace(documents, state);
            if let Some(reason) = self.disallow_continuation_reason {
                page.disallow_continuation_reason = Some(reason.to_string());
            }
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
