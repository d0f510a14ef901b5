//! FIFO of tool calls with single-flight execution accounting.

use crate::context::types::ToolCall;
use std::collections::VecDeque;
use tracing::warn;

#[derive(Debug, Default)]
pub struct ToolCallQueue {
    calls: VecDeque<ToolCall>,
    executing: bool,
    pending: usize,
}

impl ToolCallQueue {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&mut self, call: ToolCall) {
        self.calls.push_back(call);
    }

    /// Next call to run, unless one is already executing
    pub fn next_ready(&mut self) -> Option<ToolCall> {
        if self.executing {
            return None;
        }
        self.calls.pop_front()
    }

    /// Mark a dequeued call as in flight
    pub fn begin(&mut self) {
        self.pending += 1;
        self.executing = true;
    }

    /// Mark the in-flight call as done. Returns false (and changes nothing)
    /// when nothing was pending.
    pub fn finish(&mut self) -> bool {
        if self.pending == 0 {
            warn!(target: "orchestrator", "Tool completion without a pending call");
            return false;
        }
        self.pending -= 1;
        self.executing = self.pending > 0;
        true
    }

    pub fn is_executing(&self) -> bool {
        self.executing
    }

    pub fn pending(&self) -> usize {
        self.pending
    }

    pub fn len(&self) -> usize {
        self.calls.len()
    }

    pub fn is_empty(&self) -> bool {
        self.calls.is_empty()
    }

    /// Nothing queued and nothing in flight
    pub fn is_drained(&self) -> bool {
        self.calls.is_empty() && self.pending == 0
    }

    /// Remove every queued call; in-flight accounting is untouched
    pub fn drain_queued(&mut self) -> Vec<ToolCall> {
        self.calls.drain(..).collect()
    }
}
