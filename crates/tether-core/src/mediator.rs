//! Permission mediation state machine.
//!
//! One mediator per session. A denied tool call is either replayed straight
//! away (its tool is on the session's always-allow list) or parked until the
//! user decides. Parked calls form a FIFO queue; only the head is ever shown
//! to the user, and answering it surfaces the next one.
//!
//! Every transition here is synchronous and side-effect free. The caller turns
//! the returned actions into execution jobs, which keeps event processing from
//! re-entering the mediator.

use std::collections::{BTreeSet, VecDeque};
use tether_proto::PermissionDecision;

use crate::tracker::ToolInvocation;

/// Why a tool call is being executed locally.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Approval {
    /// The user allowed this one call.
    Once,
    /// The user allowed the tool for the rest of the session.
    Always,
    /// The tool was already on the always-allow list.
    Remembered,
}

/// Outcome of reporting a denial to the mediator.
#[derive(Debug, Clone, PartialEq)]
pub enum DenialAction {
    /// Execute now, no prompt.
    Execute(ToolInvocation, Approval),
    /// Became the head of the queue; ask the user about it.
    RequestDecision(ToolInvocation),
    /// Queued behind an outstanding request.
    Queued { position: usize },
}

/// What the user decided about the head of the queue.
#[derive(Debug, Clone, PartialEq)]
pub enum Verdict {
    Approved(Approval),
    Denied,
}

/// Result of applying a user decision.
#[derive(Debug, Clone, PartialEq)]
pub struct Resolution {
    /// The call the decision applied to.
    pub decided: ToolInvocation,
    pub verdict: Verdict,
    /// Queued calls released by an allow-always, in queue order.
    pub auto_approved: Vec<ToolInvocation>,
    /// New head of the queue, to be surfaced as the next request.
    pub next_request: Option<ToolInvocation>,
}

/// Observable mediator state.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MediatorState {
    Idle,
    AwaitingDecision { tool_use_id: String, queued: usize },
}

#[derive(Debug, Default)]
pub struct PermissionMediator {
    always_allow: BTreeSet<String>,
    awaiting: VecDeque<ToolInvocation>,
}

impl PermissionMediator {
    pub fn new() -> Self {
        Self::default()
    }

    /// Applies a denial reported by the agent.
    pub fn on_denial(&mut self, invocation: ToolInvocation) -> DenialAction {
        if self.always_allow.contains(&invocation.name) {
            return DenialAction::Execute(invocation, Approval::Remembered);
        }

        self.awaiting.push_back(invocation);
        if self.awaiting.len() == 1 {
            DenialAction::RequestDecision(self.awaiting[0].clone())
        } else {
            DenialAction::Queued {
                position: self.awaiting.len() - 1,
            }
        }
    }

    /// Applies the user's decision to the head of the queue.
    ///
    /// Returns `None` when nothing is awaiting a decision.
    pub fn respond(&mut self, decision: PermissionDecision) -> Option<Resolution> {
        let decided = self.awaiting.pop_front()?;

        let verdict = match decision {
            PermissionDecision::AllowOnce => Verdict::Approved(Approval::Once),
            PermissionDecision::AllowAlways => {
                self.always_allow.insert(decided.name.clone());
                Verdict::Approved(Approval::Always)
            }
            PermissionDecision::Deny => Verdict::Denied,
        };

        let auto_approved = if decision == PermissionDecision::AllowAlways {
            let (released, kept): (VecDeque<_>, VecDeque<_>) = self
                .awaiting
                .drain(..)
                .partition(|inv| inv.name == decided.name);
            self.awaiting = kept;
            released.into_iter().collect()
        } else {
            Vec::new()
        };

        Some(Resolution {
            decided,
            verdict,
            auto_approved,
            next_request: self.awaiting.front().cloned(),
        })
    }

    pub fn state(&self) -> MediatorState {
        match self.awaiting.front() {
            None => MediatorState::Idle,
            Some(head) => MediatorState::AwaitingDecision {
                tool_use_id: head.id.clone(),
                queued: self.awaiting.len() - 1,
            },
        }
    }

    pub fn is_always_allowed(&self, tool_name: &str) -> bool {
        self.always_allow.contains(tool_name)
    }

    /// Always-allowed tool names, sorted.
    pub fn always_allowed(&self) -> Vec<String> {
        self.always_allow.iter().cloned().collect()
    }

    /// Tool names awaiting a decision, head first.
    pub fn awaiting_tools(&self) -> Vec<String> {
        self.awaiting.iter().map(|inv| inv.name.clone()).collect()
    }
}
