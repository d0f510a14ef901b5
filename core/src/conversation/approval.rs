//! Which tool calls need the user's confirmation before they run.

use serde::{Deserialize, Serialize};
use std::collections::HashSet;

/// Tools that execute arbitrary code on the user's machine
pub const DEFAULT_APPROVAL_TOOLS: &[&str] = &["execute_code", "run_command", "shell"];

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ApprovalMode {
    /// Flagged tools wait for `approve` / `reject`
    #[default]
    Interactive,
    /// Everything runs without asking
    AutoApprove,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ApprovalPolicy {
    pub mode: ApprovalMode,
    pub tools: HashSet<String>,
}

impl Default for ApprovalPolicy {
    fn default() -> Self {
        Self {
            mode: ApprovalMode::Interactive,
            tools: DEFAULT_APPROVAL_TOOLS.iter().map(|s| s.to_string()).collect(),
        }
    }
}

impl ApprovalPolicy {
    pub fn auto_approve() -> Self {
        Self {
            mode: ApprovalMode::AutoApprove,
            ..Self::default()
        }
    }

    pub fn requires_approval(&self, tool_name: &str) -> bool {
        self.mode == ApprovalMode::Interactive && self.tools.contains(tool_name)
    }
}
