// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Pure transition validation and application.
//!
//! [`apply_transition`] decides, for a document and a requested
//! [`Transition`], whether the change is applied, silently ignored or
//! rejected. It performs no I/O; the engine wraps it in a read, apply,
//! compare-and-swap loop.

use std::collections::BTreeMap;
use std::fmt;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::Serialize;
use serde::de::DeserializeOwned;

use crate::error::CoreError;
use crate::task::{MAX_ACCEPTED_DELIVERIES, SubStage, TaskDocument, TaskFailure, TaskStage};

/// Custom property holding the reason a task was cancelled.
pub const CANCELLATION_REASON: &str = "cancellation_reason";

/// Failure message used when a task is failed without a reason.
pub const UNEXPECTED_STATE: &str = "Unexpected State";

/// Pure change to the workflow fields of a document.
pub type Mutator<F> = Arc<dyn Fn(&mut F) + Send + Sync>;

/// A requested stage/substage move plus field changes.
pub struct Transition<S, F> {
    /// Target stage.
    pub stage: TaskStage,
    /// Target substage; `None` keeps the current one (or the stage default).
    pub sub_stage: Option<S>,
    /// Failure to record when moving to FAILED.
    pub failure: Option<TaskFailure>,
    /// Properties merged into the document's custom properties.
    pub custom_properties: BTreeMap<String, String>,
    /// Callback deduplication token.
    pub delivery_id: Option<String>,
    /// Apply only while the task is still in this substage.
    pub guard: Option<S>,
    mutator: Option<Mutator<F>>,
}

impl<S: Clone, F> Clone for Transition<S, F> {
    fn clone(&self) -> Self {
        Self {
            stage: self.stage,
            sub_stage: self.sub_stage.clone(),
            failure: self.failure.clone(),
            custom_properties: self.custom_properties.clone(),
            delivery_id: self.delivery_id.clone(),
            guard: self.guard.clone(),
            mutator: self.mutator.clone(),
        }
    }
}

impl<S: fmt::Debug, F> fmt::Debug for Transition<S, F> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Transition")
            .field("stage", &self.stage)
            .field("sub_stage", &self.sub_stage)
            .field("failure", &self.failure)
            .field("custom_properties", &self.custom_properties)
            .field("delivery_id", &self.delivery_id)
            .field("guard", &self.guard)
            .field("mutator", &self.mutator.as_ref().map(|_| "..."))
            .finish()
    }
}

impl<S: SubStage, F> Transition<S, F> {
    /// Move to `stage` / `sub_stage`.
    pub fn to(stage: TaskStage, sub_stage: Option<S>) -> Self {
        Self {
            stage,
            sub_stage,
            failure: None,
            custom_properties: BTreeMap::new(),
            delivery_id: None,
            guard: None,
            mutator: None,
        }
    }

    /// Move to STARTED(`sub_stage`).
    pub fn proceed(sub_stage: S) -> Self {
        Self::to(TaskStage::Started, Some(sub_stage))
    }

    /// Move to FINISHED(COMPLETED).
    pub fn complete() -> Self {
        Self::to(TaskStage::Finished, Some(S::COMPLETED))
    }

    /// Move to FAILED(ERROR), recording `failure`.
    pub fn fail(failure: TaskFailure) -> Self {
        let mut t = Self::to(TaskStage::Failed, Some(S::ERROR));
        t.failure = Some(failure);
        t
    }

    /// Move to CANCELLED(ERROR), recording the reason as a custom property.
    pub fn cancel(reason: impl Into<String>) -> Self {
        Self::to(TaskStage::Cancelled, Some(S::ERROR)).with_property(CANCELLATION_REASON, reason)
    }

    /// Apply `mutator` to the workflow fields.
    pub fn with_mutator(mut self, mutator: impl Fn(&mut F) + Send + Sync + 'static) -> Self {
        self.mutator = Some(Arc::new(mutator));
        self
    }

    /// Apply an already shared mutator.
    pub fn with_shared_mutator(mut self, mutator: Mutator<F>) -> Self {
        self.mutator = Some(mutator);
        self
    }

    /// Merge one custom property.
    pub fn with_property(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.custom_properties.insert(key.into(), value.into());
        self
    }

    /// Merge several custom properties.
    pub fn with_properties(mut self, properties: BTreeMap<String, String>) -> Self {
        self.custom_properties.extend(properties);
        self
    }

    /// Set the callback deduplication token.
    pub fn with_delivery_id(mut self, delivery_id: impl Into<String>) -> Self {
        self.delivery_id = Some(delivery_id.into());
        self
    }

    /// Apply only if the task is still in `sub_stage` when the transition runs.
    pub fn when_in(mut self, sub_stage: S) -> Self {
        self.guard = Some(sub_stage);
        self
    }

    /// `STAGE(SUB_STAGE)` for logs and errors.
    pub fn position(&self) -> String {
        match &self.sub_stage {
            Some(sub) => format!("{}({})", self.stage, sub.as_str()),
            None => format!("{}(-)", self.stage),
        }
    }
}

/// Why a transition was accepted without changing the document.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IgnoreReason {
    /// The callback delivery id was already accepted.
    DuplicateDelivery,
    /// FAILED to FAILED.
    AlreadyFailed,
    /// The task is terminal and the request is a repeat or targets a failed task.
    AlreadyTerminal,
    /// A late patch for a substage the task already moved past.
    StaleSubStage,
    /// The task left the substage the transition was guarded on.
    SubStageMoved,
}

/// Result of [`apply_transition`].
#[derive(Debug, Clone)]
pub enum TransitionOutcome<S, F> {
    /// The next version of the document.
    Applied(TaskDocument<S, F>),
    /// Nothing to persist.
    Ignored(IgnoreReason),
}

/// Result of a committed transition, as reported to callers.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransitionResult {
    /// Persisted as `version`.
    Applied {
        /// The new document version.
        version: i64,
    },
    /// Accepted but not persisted.
    Ignored(IgnoreReason),
}

impl TransitionResult {
    /// Whether a new version was persisted.
    pub fn is_applied(&self) -> bool {
        matches!(self, Self::Applied { .. })
    }
}

/// Validate `transition` against `current` and build the next version.
///
/// `transient` lists substages whose patches may arrive out of order.
pub fn apply_transition<S, F>(
    current: &TaskDocument<S, F>,
    transition: &Transition<S, F>,
    transient: &[S],
    now: DateTime<Utc>,
) -> Result<TransitionOutcome<S, F>, CoreError>
where
    S: SubStage,
    F: Serialize + DeserializeOwned + Clone,
{
    if let Some(delivery_id) = &transition.delivery_id
        && current.accepted_deliveries.iter().any(|d| d == delivery_id)
    {
        return Ok(TransitionOutcome::Ignored(IgnoreReason::DuplicateDelivery));
    }

    if let Some(guard) = transition.guard
        && current.sub_stage != guard
    {
        return Ok(TransitionOutcome::Ignored(IgnoreReason::SubStageMoved));
    }

    let from = current.stage();
    let to = transition.stage;

    if from == TaskStage::Failed && to == TaskStage::Failed {
        return Ok(TransitionOutcome::Ignored(IgnoreReason::AlreadyFailed));
    }

    if from.is_terminal() {
        if from == TaskStage::Failed || from == to {
            return Ok(TransitionOutcome::Ignored(IgnoreReason::AlreadyTerminal));
        }
        return Err(CoreError::TaskTerminal {
            task_id: current.id.to_string(),
            stage: from,
        });
    }

    if to < from {
        return Err(invalid(current, transition, "stage can not move backwards"));
    }

    let sub_stage = match (to, transition.sub_stage) {
        (TaskStage::Failed | TaskStage::Cancelled, _) => S::ERROR,
        (_, Some(sub)) => sub,
        (TaskStage::Finished, None) => S::COMPLETED,
        (_, None) => current.sub_stage,
    };

    if sub_stage == S::ERROR && !matches!(to, TaskStage::Failed | TaskStage::Cancelled) {
        return Err(invalid(
            current,
            transition,
            "ERROR is reserved for failed and cancelled tasks",
        ));
    }

    if sub_stage < current.sub_stage {
        if from == to && !transient.contains(&sub_stage) {
            return Err(invalid(
                current,
                transition,
                "sub-stage can not move backwards",
            ));
        }
        return Ok(TransitionOutcome::Ignored(IgnoreReason::StaleSubStage));
    }

    let mut next = current.clone();
    next.task_info.stage = to;
    next.task_info.failure = if to == TaskStage::Failed {
        Some(
            transition
                .failure
                .clone()
                .unwrap_or_else(|| TaskFailure::new(UNEXPECTED_STATE)),
        )
    } else {
        None
    };
    next.sub_stage = sub_stage;

    if let Some(mutator) = &transition.mutator {
        mutator(&mut next.fields);
    }

    next.custom_properties
        .extend(transition.custom_properties.clone());

    if let Some(delivery_id) = &transition.delivery_id {
        next.accepted_deliveries.push(delivery_id.clone());
        let overflow = next
            .accepted_deliveries
            .len()
            .saturating_sub(MAX_ACCEPTED_DELIVERIES);
        next.accepted_deliveries.drain(..overflow);
    }

    next.version = current.version + 1;
    next.updated_at = now;

    Ok(TransitionOutcome::Applied(next))
}

fn invalid<S: SubStage, F: Serialize + DeserializeOwned>(
    current: &TaskDocument<S, F>,
    transition: &Transition<S, F>,
    reason: &str,
) -> CoreError {
    CoreError::InvalidTransition {
        task_id: current.id.to_string(),
        from: current.position(),
        to: transition.position(),
        reason: reason.to_string(),
    }
}
