//! Work items: the unit of reconciliation work
//!
//! A [`WorkItem`] identifies one resource instance and the operation that
//! triggered it. It is both the queue payload and the routing key handlers use
//! to decide whether they own an item.
//!
//! The string form is `"<OPERATION>/<group>/<version>/<kind>/<namespace>/<name>"`.
//! `group` is empty for the core API group and `namespace` is empty for
//! cluster-scoped objects; every other field must be non-empty. No field may
//! contain the `/` delimiter.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Delimiter between the fields of a serialized work item
pub const DELIMITER: char = '/';

/// Errors produced when building or parsing a [`WorkItem`]
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum WorkItemError {
    /// A required field was empty
    #[error("work item field '{field}' must not be empty")]
    EmptyField {
        /// Name of the empty field
        field: &'static str,
    },

    /// A field contained the delimiter
    #[error("work item field '{field}' must not contain '/': {value:?}")]
    Delimiter {
        /// Name of the offending field
        field: &'static str,
        /// The offending value
        value: String,
    },

    /// The serialized form had the wrong number of fields
    #[error("work item key {key:?} has {found} fields, expected 6")]
    FieldCount {
        /// The key that failed to parse
        key: String,
        /// Number of fields found
        found: usize,
    },

    /// The operation field was not a known operation
    #[error("unknown work item operation {0:?}")]
    UnknownOperation(String),
}

/// Operation that triggered a work item
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Operation {
    /// Object appeared
    Add,
    /// Object changed, or state should be re-evaluated
    Update,
    /// Object went away
    Delete,
}

impl Operation {
    /// Wire representation used in the serialized key
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Add => "ADD",
            Self::Update => "UPDATE",
            Self::Delete => "DELETE",
        }
    }
}

impl fmt::Display for Operation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Operation {
    type Err = WorkItemError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "ADD" => Ok(Self::Add),
            "UPDATE" => Ok(Self::Update),
            "DELETE" => Ok(Self::Delete),
            "" => Err(WorkItemError::EmptyField { field: "operation" }),
            other => Err(WorkItemError::UnknownOperation(other.to_string())),
        }
    }
}

/// A normalized, immutable unit of reconciliation work
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct WorkItem {
    operation: Operation,
    group: String,
    version: String,
    kind: String,
    namespace: String,
    name: String,
}

impl WorkItem {
    /// Build a work item, validating every field
    pub fn new(
        operation: Operation,
        group: impl Into<String>,
        version: impl Into<String>,
        kind: impl Into<String>,
        namespace: impl Into<String>,
        name: impl Into<String>,
    ) -> Result<Self, WorkItemError> {
        let item = Self {
            operation,
            group: group.into(),
            version: version.into(),
            kind: kind.into(),
            namespace: namespace.into(),
            name: name.into(),
        };

        check_field("group", &item.group, true)?;
        check_field("version", &item.version, false)?;
        check_field("kind", &item.kind, false)?;
        check_field("namespace", &item.namespace, true)?;
        check_field("name", &item.name, false)?;

        Ok(item)
    }

    /// Parse a work item from its serialized key
    pub fn parse(key: &str) -> Result<Self, WorkItemError> {
        let parts: Vec<&str> = key.split(DELIMITER).collect();
        let [operation, group, version, kind, namespace, name] = parts.as_slice() else {
            return Err(WorkItemError::FieldCount {
                key: key.to_string(),
                found: parts.len(),
            });
        };

        Self::new(
            operation.parse()?,
            *group,
            *version,
            *kind,
            *namespace,
            *name,
        )
    }

    /// Copy of this item with a different operation
    pub fn with_operation(&self, operation: Operation) -> Self {
        Self {
            operation,
            ..self.clone()
        }
    }

    /// Whether this item refers to the given group/version/kind
    pub fn matches_kind(&self, group: &str, version: &str, kind: &str) -> bool {
        self.group == group && self.version == version && self.kind == kind
    }

    /// Triggering operation
    pub fn operation(&self) -> Operation {
        self.operation
    }

    /// API group (empty for the core group)
    pub fn group(&self) -> &str {
        &self.group
    }

    /// API version
    pub fn version(&self) -> &str {
        &self.version
    }

    /// Resource kind
    pub fn kind(&self) -> &str {
        &self.kind
    }

    /// Namespace (empty for cluster-scoped objects)
    pub fn namespace(&self) -> &str {
        &self.namespace
    }

    /// Object name
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Serialized key used as the queue payload
    pub fn key(&self) -> String {
        self.to_string()
    }
}

fn check_field(field: &'static str, value: &str, may_be_empty: bool) -> Result<(), WorkItemError> {
    if value.is_empty() && !may_be_empty {
        return Err(WorkItemError::EmptyField { field });
    }
    if value.contains(DELIMITER) {
        return Err(WorkItemError::Delimiter {
            field,
            value: value.to_string(),
        });
    }
    Ok(())
}

impl fmt::Display for WorkItem {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}{d}{}{d}{}{d}{}{d}{}{d}{}",
            self.operation,
            self.group,
            self.version,
            self.kind,
            self.namespace,
            self.name,
            d = DELIMITER
        )
    }
}

impl FromStr for WorkItem {
    type Err = WorkItemError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::parse(s)
    }
}

impl TryFrom<String> for WorkItem {
    type Error = WorkItemError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        Self::parse(&value)
    }
}

impl From<WorkItem> for String {
    fn from(item: WorkItem) -> Self {
        item.to_string()
    }
}
