// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Counter fan-in.
//!
//! A counter waits for a known number of children. Each child is created with
//! [`counter_callback`]; every successful completion decrements the counter
//! and the counter finishes when it reaches zero. A failing child fails the
//! counter through the default callback failure route.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tracing::debug;

use stagecraft_core::callback::ServiceTaskCallbackResponse;
use stagecraft_core::error::{CoreError, WorkflowError};
use stagecraft_core::service::{DocumentOf, TaskService};
use stagecraft_core::task::{SubStage, TaskId};
use stagecraft_core::transition::Transition;
use stagecraft_core::{ServiceTaskCallback, TaskContext, sub_stages};

sub_stages! {
    /// Substages of a counter.
    pub enum CounterSubStage {
        Created => "CREATED",
        Counting => "COUNTING",
        Completed => "COMPLETED",
        Error => "ERROR",
    }
}

/// Fields of a counter.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct CounterFields {
    /// Successful child completions still expected.
    pub completions_remaining: u32,
}

/// Callback a child uses to report to `counter`.
pub fn counter_callback(counter: &TaskId) -> ServiceTaskCallback {
    ServiceTaskCallback::create(counter.clone()).on_success_to(CounterSubStage::Counting.as_str())
}

/// Task service counting child completions.
#[derive(Debug, Default)]
pub struct CounterSubTaskService;

#[async_trait]
impl TaskService for CounterSubTaskService {
    type SubStage = CounterSubStage;
    type Fields = CounterFields;
    const KIND: &'static str = "counter";

    fn display_name(&self) -> &str {
        "Counter"
    }

    fn validate(&self, fields: &CounterFields) -> Result<(), CoreError> {
        if fields.completions_remaining == 0 {
            return Err(CoreError::validation("completions_remaining", "must be positive"));
        }
        Ok(())
    }

    async fn handle(
        &self,
        ctx: &TaskContext<Self>,
        state: &DocumentOf<Self>,
    ) -> Result<(), WorkflowError> {
        match state.sub_stage {
            CounterSubStage::Created => {
                // A child may already have moved the counter to COUNTING.
                ctx.transition(
                    Transition::proceed(CounterSubStage::Counting).when_in(CounterSubStage::Created),
                )
                .await?;
            }
            CounterSubStage::Counting => {
                debug!(
                    task_id = %state.id,
                    remaining = state.fields.completions_remaining,
                    "Counter updated"
                );
                if state.fields.completions_remaining == 0 {
                    ctx.transition(Transition::complete().when_in(CounterSubStage::Counting))
                        .await?;
                }
            }
            CounterSubStage::Completed | CounterSubStage::Error => {}
        }
        Ok(())
    }

    fn merge_callback(&self, fields: &mut CounterFields, response: &ServiceTaskCallbackResponse) {
        if response.is_success() {
            fields.completions_remaining = fields.completions_remaining.saturating_sub(1);
        }
    }
}
