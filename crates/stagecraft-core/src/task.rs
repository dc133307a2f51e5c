// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Task document model.
//!
//! A task document is the persisted record of one workflow instance. Its
//! lifecycle is tracked on two axes:
//!
//! - [`TaskStage`]: the coarse, engine-owned stage (CREATED, STARTED, FINISHED,
//!   FAILED, CANCELLED).
//! - a workflow-specific [`SubStage`]: an ordered enum declared with
//!   [`sub_stages!`](crate::sub_stages) that selects the handler to run next.

use std::collections::BTreeMap;
use std::fmt;
use std::hash::Hash;

use chrono::{DateTime, Utc};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};

use crate::callback::ServiceTaskCallback;
use crate::error::CoreError;
use crate::persistence::TaskRecord;

/// Identity of a task document.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct TaskId(String);

impl TaskId {
    /// Wrap an existing identity.
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    /// Generate a fresh random identity.
    pub fn generate() -> Self {
        Self(uuid::Uuid::new_v4().to_string())
    }

    /// Borrow the identity as a string slice.
    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Deterministic identity for a child task, so that re-running the
    /// creating handler finds the child created on the previous attempt.
    pub fn child(&self, suffix: &str) -> Self {
        Self(format!("{}-{}", self.0, suffix))
    }
}

impl fmt::Display for TaskId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for TaskId {
    fn from(value: &str) -> Self {
        Self(value.to_string())
    }
}

impl From<String> for TaskId {
    fn from(value: String) -> Self {
        Self(value)
    }
}

/// Coarse lifecycle stage of a task.
///
/// Stages are ordered; a task never moves back to an earlier stage.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum TaskStage {
    /// Persisted, handler not run yet.
    #[default]
    Created,
    /// Handlers are driving the substages.
    Started,
    /// Completed successfully.
    Finished,
    /// Failed; `failure` is set.
    Failed,
    /// Cancelled by a caller or by deletion.
    Cancelled,
}

impl TaskStage {
    /// Stable string form, also used in the database.
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Created => "CREATED",
            Self::Started => "STARTED",
            Self::Finished => "FINISHED",
            Self::Failed => "FAILED",
            Self::Cancelled => "CANCELLED",
        }
    }

    /// Parse the string form produced by [`TaskStage::as_str`].
    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "CREATED" => Some(Self::Created),
            "STARTED" => Some(Self::Started),
            "FINISHED" => Some(Self::Finished),
            "FAILED" => Some(Self::Failed),
            "CANCELLED" => Some(Self::Cancelled),
            _ => None,
        }
    }

    /// FINISHED, FAILED and CANCELLED are terminal.
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Finished | Self::Failed | Self::Cancelled)
    }
}

impl fmt::Display for TaskStage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Structured failure recorded on a FAILED task.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TaskFailure {
    /// Human-readable failure message.
    pub message: String,
    /// Originating cause, if known.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cause: Option<String>,
    /// Machine-readable code, if the failure came from an engine error.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error_code: Option<String>,
}

impl TaskFailure {
    /// A failure with only a message.
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            cause: None,
            error_code: None,
        }
    }
}

/// Stage plus failure, the engine-owned part of a document.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TaskInfo {
    /// Current stage.
    pub stage: TaskStage,
    /// Set only when the stage is FAILED.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub failure: Option<TaskFailure>,
}

/// Ordered, workflow-specific substage.
///
/// Implemented by the [`sub_stages!`](crate::sub_stages) macro. The derived
/// `Ord` follows declaration order, which is the order substages progress in.
/// Every substage enum has a `CREATED` first value, a `COMPLETED` success
/// value and an `ERROR` value used by FAILED and CANCELLED tasks.
pub trait SubStage:
    Copy
    + Eq
    + Ord
    + Hash
    + fmt::Debug
    + Serialize
    + DeserializeOwned
    + Send
    + Sync
    + 'static
{
    /// Initial substage of every task.
    const CREATED: Self;
    /// Substage of a successfully finished task.
    const COMPLETED: Self;
    /// Substage of a failed or cancelled task.
    const ERROR: Self;
    /// Every substage in declaration order.
    const ALL: &'static [Self];

    /// Stable string form (as serialized).
    fn as_str(&self) -> &'static str;

    /// Parse a substage from its string form.
    fn parse(value: &str) -> Option<Self> {
        Self::ALL.iter().copied().find(|s| s.as_str() == value)
    }

    /// Position in declaration order.
    fn ordinal(&self) -> usize {
        Self::ALL.iter().position(|s| s == self).unwrap_or(0)
    }
}

/// Declare a substage enum and implement [`SubStage`] for it.
///
/// The enum must contain `Created`, `Completed` and `Error` variants. Each
/// variant maps to its serialized string.
///
/// ```
/// stagecraft_core::sub_stages! {
///     /// Substages of a copy task.
///     pub enum CopySubStage {
///         Created => "CREATED",
///         Copying => "COPYING",
///         Completed => "COMPLETED",
///         Error => "ERROR",
///     }
/// }
///
/// use stagecraft_core::task::SubStage;
/// assert!(CopySubStage::Copying > CopySubStage::Created);
/// assert_eq!(CopySubStage::parse("COPYING"), Some(CopySubStage::Copying));
/// ```
#[macro_export]
macro_rules! sub_stages {
    (
        $(#[$meta:meta])*
        $vis:vis enum $name:ident {
            $( $(#[$vmeta:meta])* $variant:ident => $text:literal ),+ $(,)?
        }
    ) => {
        $(#[$meta])*
        #[derive(
            Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash,
            ::serde::Serialize, ::serde::Deserialize,
        )]
        $vis enum $name {
            $( $(#[$vmeta])* #[serde(rename = $text)] $variant, )+
        }

        impl $crate::task::SubStage for $name {
            const CREATED: Self = $name::Created;
            const COMPLETED: Self = $name::Completed;
            const ERROR: Self = $name::Error;
            const ALL: &'static [Self] = &[ $( $name::$variant ),+ ];

            fn as_str(&self) -> &'static str {
                match self {
                    $( $name::$variant => $text, )+
                }
            }
        }

        impl ::std::fmt::Display for $name {
            fn fmt(&self, f: &mut ::std::fmt::Formatter<'_>) -> ::std::fmt::Result {
                f.write_str($crate::task::SubStage::as_str(self))
            }
        }
    };
}

/// Maximum number of callback delivery ids remembered per document.
pub const MAX_ACCEPTED_DELIVERIES: usize = 32;

/// Persisted record of one workflow instance.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TaskDocument<S, F> {
    /// Immutable identity.
    pub id: TaskId,
    /// Kind of the task service owning this document.
    pub kind: String,
    /// Monotonic version, incremented by every accepted transition.
    pub version: i64,
    /// Stage and failure.
    pub task_info: TaskInfo,
    /// Workflow substage.
    pub sub_stage: S,
    /// Whether the creator waits for the first transition.
    #[serde(default)]
    pub direct: bool,
    /// Who to notify on terminal stage.
    #[serde(default)]
    pub callback: ServiceTaskCallback,
    /// Workflow-specific fields.
    pub fields: F,
    /// Free-form properties merged from transitions and callbacks.
    #[serde(default)]
    pub custom_properties: BTreeMap<String, String>,
    /// Recently accepted callback delivery ids (bounded).
    #[serde(default)]
    pub accepted_deliveries: Vec<String>,
    /// When the document was created.
    pub created_at: DateTime<Utc>,
    /// When the last transition was applied.
    pub updated_at: DateTime<Utc>,
}

impl<S: SubStage, F: Serialize + DeserializeOwned> TaskDocument<S, F> {
    /// Current stage.
    pub fn stage(&self) -> TaskStage {
        self.task_info.stage
    }

    /// Whether the document is read-only.
    pub fn is_terminal(&self) -> bool {
        self.task_info.stage.is_terminal()
    }

    /// Failure, if the task failed.
    pub fn failure(&self) -> Option<&TaskFailure> {
        self.task_info.failure.as_ref()
    }

    /// Look up a custom property.
    pub fn custom_property(&self, key: &str) -> Option<&str> {
        self.custom_properties.get(key).map(String::as_str)
    }

    /// `STAGE(SUB_STAGE)` for logs and error messages.
    pub fn position(&self) -> String {
        format!("{}({})", self.task_info.stage, self.sub_stage.as_str())
    }

    /// Encode into a store record.
    pub fn to_record(&self) -> Result<TaskRecord, CoreError> {
        let body = serde_json::to_string(self).map_err(|e| CoreError::CorruptDocument {
            task_id: self.id.to_string(),
            details: format!("failed to encode document: {}", e),
        })?;

        Ok(TaskRecord {
            task_id: self.id.to_string(),
            kind: self.kind.clone(),
            version: self.version,
            stage: self.task_info.stage.as_str().to_string(),
            sub_stage: self.sub_stage.as_str().to_string(),
            body,
            created_at: self.created_at,
            updated_at: self.updated_at,
        })
    }

    /// Decode a store record.
    ///
    /// Fails with [`CoreError::CorruptDocument`] when the body does not decode
    /// (unknown substage, missing fields) or disagrees with the indexed columns.
    pub fn from_record(record: &TaskRecord) -> Result<Self, CoreError> {
        let doc: Self =
            serde_json::from_str(&record.body).map_err(|e| CoreError::CorruptDocument {
                task_id: record.task_id.clone(),
                details: e.to_string(),
            })?;

        if doc.version != record.version || doc.id.as_str() != record.task_id {
            return Err(CoreError::CorruptDocument {
                task_id: record.task_id.clone(),
                details: format!(
                    "body describes {}@{} but row is {}@{}",
                    doc.id, doc.version, record.task_id, record.version
                ),
            });
        }

        Ok(doc)
    }
}

/// Read-only progress view of a task.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TaskStatus {
    /// Task identity.
    pub task_id: TaskId,
    /// Task service kind.
    pub kind: String,
    /// Display name of the task service.
    pub phase: String,
    /// Current stage.
    pub stage: TaskStage,
    /// Current substage, as a string.
    pub sub_stage: String,
    /// 0..=100, derived from the substage position.
    pub progress: u8,
    /// Failure, if any.
    pub failure: Option<TaskFailure>,
    /// Current version.
    pub version: i64,
}

impl TaskStatus {
    /// Build the view for a document.
    ///
    /// Progress is the substage ordinal relative to `COMPLETED`, which is
    /// always the second-to-last substage.
    pub fn from_document<S: SubStage, F: Serialize + DeserializeOwned>(
        doc: &TaskDocument<S, F>,
        phase: &str,
    ) -> Self {
        let steps = S::ALL.len().saturating_sub(2).max(1);
        let progress = (100 * doc.sub_stage.ordinal() / steps).min(100) as u8;

        Self {
            task_id: doc.id.clone(),
            kind: doc.kind.clone(),
            phase: phase.to_string(),
            stage: doc.task_info.stage,
            sub_stage: doc.sub_stage.as_str().to_string(),
            progress,
            failure: doc.task_info.failure.clone(),
            version: doc.version,
        }
    }
}
