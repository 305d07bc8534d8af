//! Continuation tokens
//!
//! A token is the serialized [`CrossFeedRangeState`](crate::range::CrossFeedRangeState)
//! of a read feed, or the source state wrapped in stage envelopes for
//! queries. Legacy token shapes are normalized on input; output is always
//! the current array shape.

mod codec;
pub(crate) mod wire;

pub use codec::{ContinuationCodec, TokenShape};
