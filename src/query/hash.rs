//! Deterministic 128-bit structural hash over JSON values
//!
//! Used as the GROUP BY bucket key and the DISTINCT identity. Numbers hash
//! by their f64 value so `1` and `1.0` collide; object keys are hashed in
//! sorted order so member order never matters.

use serde_json::Value;
use sha2::{Digest, Sha256};

const TAG_UNDEFINED: u8 = 0x00;
const TAG_NULL: u8 = 0x01;
const TAG_FALSE: u8 = 0x02;
const TAG_TRUE: u8 = 0x03;
const TAG_NUMBER: u8 = 0x04;
const TAG_STRING: u8 = 0x05;
const TAG_ARRAY: u8 = 0x06;
const TAG_OBJECT: u8 = 0x07;

/// Hash of a possibly-undefined value
pub fn structural_hash(value: Option<&Value>) -> u128 {
    let mut hasher = Sha256::new();
    feed(&mut hasher, value);
    finish(hasher)
}

/// Hash of an ordered tuple (group-by key list)
pub fn tuple_hash<'a, I>(values: I) -> u128
where
    I: IntoIterator<Item = Option<&'a Value>>,
{
    let mut hasher = Sha256::new();
    hasher.update([TAG_ARRAY]);
    for value in values {
        feed(&mut hasher, value);
    }
    finish(hasher)
}

/// Fixed-width uppercase hex, the form hashes take inside tokens
pub fn format_hash(hash: u128) -> String {
    format!("{:032X}", hash)
}

pub fn parse_hash(text: &str) -> Option<u128> {
    if text.len() != 32 {
        return None;
    }
    u128::from_str_radix(text, 16).ok()
}

fn finish(hasher: Sha256) -> u128 {
    let digest = hasher.finalize();
    let mut bytes = [0u8; 16];
    bytes.copy_from_slice(&digest[..16]);
    u128::from_be_bytes(bytes)
}

fn feed(hasher: &mut Sha256, value: Option<&Value>) {
    let value = match value {
        None => {
            hasher.update([TAG_UNDEFINED]);
            return;
        }
        Some(value) => value,
    };

    match value {
        Value::Null => hasher.update([TAG_NULL]),
        Value::Bool(false) => hasher.update([TAG_FALSE]),
        Value::Bool(true) => hasher.update([TAG_TRUE]),
        Value::Number(number) => {
            hasher.update([TAG_NUMBER]);
            let float = number.as_f64().unwrap_or(f64::NAN);
            // -0.0 and 0.0 are the same group
            let float = if float == 0.0 { 0.0 } else { float };
            hasher.update(float.to_bits().to_be_bytes());
        }
        Value::String(text) => {
            hasher.update([TAG_STRING]);
            hasher.update((text.len() as u64).to_be_bytes());
            hasher.update(text.as_bytes());
        }
        Value::Array(items) => {
            hasher.update([TAG_ARRAY]);
            hasher.update((items.len() as u64).to_be_bytes());
            for item in items {
                feed(hasher, Some(item));
            }
        }
        Value::Object(map) => {
            hasher.update([TAG_OBJECT]);
            hasher.update((map.len() as u64).to_be_bytes());
            let mut keys: Vec<&String> = map.keys().collect();
            keys.sort();
            for key in keys {
                hasher.update((key.len() as u64).to_be_bytes());
                hasher.update(key.as_bytes());
                feed(hasher, map.get(key));
            }
        }
    }
}
