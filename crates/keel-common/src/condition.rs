//! Condition state machine for resource status
//!
//! A [`ConditionList`] holds named boolean facts about a resource, each with a
//! machine-readable reason, a human-readable message and an opaque content hash.
//! Every mutation reports whether anything visible changed, so reconcilers only
//! write status when a condition actually moved.
//!
//! Timestamps follow Kubernetes conventions: `last_update_time` moves whenever
//! status, reason, message or hash change; `last_transition_time` moves only
//! when the boolean status flips (or the condition is first recorded).

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

/// Condition reporting overall readiness of a resource
pub const CONDITION_READY: &str = "Ready";

/// Reason used when a pipeline condition is satisfied
pub const REASON_READY: &str = "Ready";

/// Reason used when a pipeline condition is not satisfied
pub const REASON_NOT_READY: &str = "Not ready";

/// A single named condition
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Condition {
    /// Type of condition (e.g., Ready, SpecValid, DeploymentFound)
    #[serde(rename = "type")]
    pub type_: String,

    /// Whether the condition holds
    pub status: bool,

    /// Machine-readable reason for the condition
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub reason: String,

    /// Human-readable message
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub message: String,

    /// Content hash of whatever the condition was derived from
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub hash: String,

    /// Last time any field of the condition changed
    pub last_update_time: DateTime<Utc>,

    /// Last time the status flipped
    pub last_transition_time: DateTime<Utc>,
}

impl Condition {
    fn new(
        type_: &str,
        status: bool,
        reason: &str,
        message: &str,
        hash: &str,
        now: DateTime<Utc>,
    ) -> Self {
        Self {
            type_: type_.to_string(),
            status,
            reason: reason.to_string(),
            message: message.to_string(),
            hash: hash.to_string(),
            last_update_time: now,
            last_transition_time: now,
        }
    }

    /// Whether the condition is true
    pub fn is_true(&self) -> bool {
        self.status
    }

    fn same_content(&self, status: bool, reason: &str, message: &str, hash: &str) -> bool {
        self.status == status && self.reason == reason && self.message == message && self.hash == hash
    }
}

/// Ordered list of conditions, unique by type
///
/// Order is first-insertion order; updating an existing condition keeps its
/// position.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ConditionList(Vec<Condition>);

impl ConditionList {
    /// Empty list
    pub fn new() -> Self {
        Self::default()
    }

    /// Upsert a condition without a hash
    ///
    /// Returns `true` if the condition was added or any of its fields changed.
    pub fn update(
        &mut self,
        type_: &str,
        status: bool,
        reason: impl AsRef<str>,
        message: impl AsRef<str>,
    ) -> bool {
        self.update_with_hash(type_, status, reason, message, "")
    }

    /// Upsert a condition including its content hash
    ///
    /// A different hash counts as a change even when the status is the same,
    /// which lets callers notice that the object a condition was derived from
    /// changed underneath it.
    pub fn update_with_hash(
        &mut self,
        type_: &str,
        status: bool,
        reason: impl AsRef<str>,
        message: impl AsRef<str>,
        hash: impl AsRef<str>,
    ) -> bool {
        let (reason, message, hash) = (reason.as_ref(), message.as_ref(), hash.as_ref());
        let now = Utc::now();

        match self.0.iter_mut().find(|c| c.type_ == type_) {
            Some(existing) if existing.same_content(status, reason, message, hash) => false,
            Some(existing) => {
                if existing.status != status {
                    existing.last_transition_time = now;
                }
                existing.status = status;
                existing.reason = reason.to_string();
                existing.message = message.to_string();
                existing.hash = hash.to_string();
                existing.last_update_time = now;
                true
            }
            None => {
                self.0
                    .push(Condition::new(type_, status, reason, message, hash, now));
                true
            }
        }
    }

    /// Remove a condition; returns `true` if it was present
    pub fn remove(&mut self, type_: &str) -> bool {
        let before = self.0.len();
        self.0.retain(|c| c.type_ != type_);
        self.0.len() != before
    }

    /// Whether the condition exists and is true
    pub fn is_true(&self, type_: &str) -> bool {
        self.get(type_).is_some_and(Condition::is_true)
    }

    /// Look up a condition by type
    pub fn get(&self, type_: &str) -> Option<&Condition> {
        self.0.iter().find(|c| c.type_ == type_)
    }

    /// Iterate in insertion order
    pub fn iter(&self) -> std::slice::Iter<'_, Condition> {
        self.0.iter()
    }

    /// Number of conditions
    pub fn len(&self) -> usize {
        self.0.len()
    }

    /// Whether there are no conditions
    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

impl<'a> IntoIterator for &'a ConditionList {
    type Item = &'a Condition;
    type IntoIter = std::slice::Iter<'a, Condition>;

    fn into_iter(self) -> Self::IntoIter {
        self.0.iter()
    }
}

/// SHA-256 hex digest of a value's JSON form, for use as a condition hash
///
/// Serialization failures hash to the empty string, which only ever matches
/// a condition recorded without a hash.
pub fn hash_of<T: Serialize + ?Sized>(value: &T) -> String {
    match serde_json::to_vec(value) {
        Ok(bytes) => format!("{:x}", Sha256::digest(&bytes)),
        Err(_) => String::new(),
    }
}
