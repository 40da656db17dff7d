//! Correlation of tool invocations with their results.
//!
//! Every `tool_use` block the agent emits is remembered by id until some
//! `tool_result` references it. Results that are permission denials come back
//! out as the invocation they denied; everything else just clears the entry.

use serde::Serialize;
use serde_json::Value;
use std::collections::HashMap;

use crate::claude_stream::{AssistantBlock, ProtocolEvent, UserBlock};
use crate::denial::DenialDetector;

/// A single tool call emitted by the agent.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ToolInvocation {
    /// Correlation id assigned by the agent.
    pub id: String,
    pub name: String,
    /// Tool-specific input parameters.
    pub input: Value,
}

/// Pending tool invocations for one session, keyed by correlation id.
#[derive(Debug, Default)]
pub struct ToolUseTracker {
    pending: HashMap<String, ToolInvocation>,
}

impl ToolUseTracker {
    pub fn new() -> Self {
        Self::default()
    }

    /// Records every complete `tool_use` block of an assistant event.
    ///
    /// Blocks without an id or a name are skipped. A repeated id replaces the
    /// stale entry. Returns how many invocations were recorded.
    pub fn observe_assistant(&mut self, event: &ProtocolEvent) -> usize {
        let mut recorded = 0;
        for block in event.assistant_blocks() {
            let AssistantBlock::ToolUse {
                id: Some(id),
                name: Some(name),
                input,
            } = block
            else {
                continue;
            };
            tracing::debug!(tool_use_id = %id, tool = %name, "Tracking tool invocation");
            self.pending
                .insert(id.clone(), ToolInvocation { id, name, input });
            recorded += 1;
        }
        recorded
    }

    /// Resolves every `tool_result` block of a user event.
    ///
    /// Any referenced invocation leaves the pending map. The ones whose result
    /// the detector classifies as a permission denial are returned, in block
    /// order. A denial for an id that was never seen is ignored.
    pub fn resolve_results(
        &mut self,
        event: &ProtocolEvent,
        detector: &dyn DenialDetector,
    ) -> Vec<ToolInvocation> {
        let mut denied = Vec::new();
        for block in event.user_blocks() {
            let UserBlock::ToolResult {
                tool_use_id: Some(id),
                is_error,
                ..
            } = &block
            else {
                continue;
            };

            let Some(invocation) = self.pending.remove(id) else {
                continue;
            };

            let is_denial = *is_error == Some(true)
                && block.text().is_some_and(|text| detector.is_denial(&text));
            if is_denial {
                tracing::debug!(tool_use_id = %id, tool = %invocation.name, "Tool call denied by agent");
                denied.push(invocation);
            }
        }
        denied
    }

    pub fn get(&self, id: &str) -> Option<&ToolInvocation> {
        self.pending.get(id)
    }

    pub fn contains(&self, id: &str) -> bool {
        self.pending.contains_key(id)
    }

    pub fn len(&self) -> usize {
        self.pending.len()
    }

    pub fn is_empty(&self) -> bool {
        self.pending.is_empty()
    }

    /// Pending ids, sorted for stable output.
    pub fn pending_ids(&self) -> Vec<String> {
        let mut ids: Vec<String> = self.pending.keys().cloned().collect();
        ids.sort();
        ids
    }
}
