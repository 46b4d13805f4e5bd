//! Wire entries exchanged between participants and the relay
//!
//! Every state change that crosses the connection is an [`Entry`]. Data
//! entries address one key of one topic; policy entries carry a topic's
//! configuration. Keeping the two as separate variants makes the policy
//! channel exhaustive instead of relying on reserved topic names.

use crate::policy::PolicyOption;
use serde::{Deserialize, Serialize};
use std::fmt;

/// Key used for a participant's last known value after it goes offline.
pub const OFFLINE_KEY: &str = "offline";

/// Opaque, per-topic encoded value
pub type Payload = Vec<u8>;

/// Key of a topic entry, either a string or an integer
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum Key {
    Str(String),
    Int(i64),
}

impl Key {
    pub fn as_str(&self) -> Option<&str> {
        match self {
            Key::Str(s) => Some(s),
            Key::Int(_) => None,
        }
    }

    pub fn as_int(&self) -> Option<i64> {
        match self {
            Key::Int(i) => Some(*i),
            Key::Str(_) => None,
        }
    }
}

impl fmt::Display for Key {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Key::Str(s) => write!(f, "{}", s),
            Key::Int(i) => write!(f, "{}", i),
        }
    }
}

impl From<&str> for Key {
    fn from(value: &str) -> Self {
        Key::Str(value.to_string())
    }
}

impl From<String> for Key {
    fn from(value: String) -> Self {
        Key::Str(value)
    }
}

impl From<i64> for Key {
    fn from(value: i64) -> Self {
        Key::Int(value)
    }
}

impl From<i32> for Key {
    fn from(value: i32) -> Self {
        Key::Int(value as i64)
    }
}

impl From<u32> for Key {
    fn from(value: u32) -> Self {
        Key::Int(value as i64)
    }
}

/// One key of one topic. `value: None` deletes the key.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DataEntry {
    pub topic: String,
    pub key: Key,
    pub value: Option<Payload>,
}

/// A configuration option declared for a topic
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PolicyEntry {
    pub topic: String,
    pub option: PolicyOption,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum Entry {
    Data(DataEntry),
    Policy(PolicyEntry),
}

impl Entry {
    pub fn data(topic: impl Into<String>, key: impl Into<Key>, value: Option<Payload>) -> Self {
        Entry::Data(DataEntry {
            topic: topic.into(),
            key: key.into(),
            value,
        })
    }

    pub fn policy(topic: impl Into<String>, option: PolicyOption) -> Self {
        Entry::Policy(PolicyEntry {
            topic: topic.into(),
            option,
        })
    }

    /// Name of the topic this entry addresses
    pub fn topic(&self) -> &str {
        match self {
            Entry::Data(data) => &data.topic,
            Entry::Policy(policy) => &policy.topic,
        }
    }

    pub fn is_deletion(&self) -> bool {
        matches!(self, Entry::Data(DataEntry { value: None, .. }))
    }
}
