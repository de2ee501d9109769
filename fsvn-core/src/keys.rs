//! Base-36 node keys
//!
//! Node identities are short base-36 strings (`0`-`9`, `a`-`z`). Keys are
//! handed out in order by a [`KeyAllocator`] shared by every transaction of a
//! repository, so two concurrent transactions can never mint the same node id.

use serde::{Deserialize, Serialize};
use std::sync::{Mutex, PoisonError};

use crate::error::{FsError, Result};

fn digit_value(c: u8) -> Option<u32> {
    match c {
        b'0'..=b'9' => Some((c - b'0') as u32),
        b'a'..=b'z' => Some((c - b'a') as u32 + 10),
        _ => None,
    }
}

fn digit_char(v: u32) -> u8 {
    if v < 10 {
        b'0' + v as u8
    } else {
        b'a' + (v - 10) as u8
    }
}

fn is_valid_key(key: &str) -> bool {
    let bytes = key.as_bytes();
    if bytes.is_empty() || (bytes.len() > 1 && bytes[0] == b'0') {
        return false;
    }
    bytes.iter().all(|&c| digit_value(c).is_some())
}

/// Increment a key by one, carrying from the right (`"z"` becomes `"10"`).
///
/// Returns `None` for an empty key, a key with leading zeros, or a key holding
/// characters outside the base-36 alphabet.
pub fn next_key(key: &str) -> Option<String> {
    if !is_valid_key(key) {
        return None;
    }
    let mut digits = key.as_bytes().to_vec();
    let mut carry = true;
    for c in digits.iter_mut().rev() {
        if !carry {
            break;
        }
        let v = digit_value(*c)?;
        if v == 35 {
            *c = b'0';
        } else {
            *c = digit_char(v + 1);
            carry = false;
        }
    }
    if carry {
        digits.insert(0, b'1');
    }
    String::from_utf8(digits).ok()
}

/// Stable identity of a logical node, shared by all its revisions
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct NodeId(String);

impl NodeId {
    /// Identity of the root directory
    pub fn root() -> Self {
        NodeId("0".to_string())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Display for NodeId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Hands out fresh node keys in increasing order
#[derive(Debug)]
pub struct KeyAllocator {
    next: Mutex<String>,
}

impl KeyAllocator {
    /// Start from a persisted "next key"
    pub fn new(next: &str) -> Result<Self> {
        if !is_valid_key(next) || next == NodeId::root().as_str() {
            return Err(FsError::fs_corrupt(format!(
                "invalid node key counter {:?}",
                next
            )));
        }
        Ok(Self {
            next: Mutex::new(next.to_string()),
        })
    }

    pub fn allocate(&self) -> NodeId {
        let mut next = self.next.lock().unwrap_or_else(PoisonError::into_inner);
        let key = next.clone();
        // `next` is always a valid key, so the increment cannot fail
        *next = next_key(&key).unwrap_or_else(|| "1".to_string());
        NodeId(key)
    }

    /// The key the next allocation will return
    pub fn peek(&self) -> String {
        self.next
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }
}
