//! Smart truncation of oversized tool results.
//!
//! Keeps the head and the tail of a result (40% / 60% of the budget) and cuts
//! at structural boundaries so that partial JSON or log output stays readable.

use tracing::debug;

/// Approximate characters per token used to turn a token ceiling into a byte ceiling
pub const CHARS_PER_TOKEN: usize = 4;
/// Window (in bytes) searched for a structural boundary around each cut point
pub const SNAP_WINDOW: usize = 200;
/// Bytes reserved for the truncation marker
const MARKER_RESERVE: usize = 64;

const HEAD_SHARE: f64 = 0.4;

/// Name fragments that mark tools producing bulk listings, search hits or docs
const BULK_TOOL_HINTS: &[&str] = &["list", "search", "find", "grep", "glob", "doc", "query"];

/// Token ceilings applied to tool output
#[derive(Debug, Clone, Copy)]
pub struct TruncationLimits {
    pub default_max_tokens: usize,
    pub bulk_max_tokens: usize,
}

impl Default for TruncationLimits {
    fn default() -> Self {
        Self {
            default_max_tokens: 8_000,
            bulk_max_tokens: 20_000,
        }
    }
}

impl TruncationLimits {
    /// Token ceiling for a given tool
    pub fn max_tokens_for(&self, tool_name: &str) -> usize {
        let lower = tool_name.to_ascii_lowercase();
        if BULK_TOOL_HINTS.iter().any(|hint| lower.contains(hint)) {
            self.bulk_max_tokens
        } else {
            self.default_max_tokens
        }
    }

    /// Byte ceiling for a given tool
    pub fn max_chars_for(&self, tool_name: &str) -> usize {
        self.max_tokens_for(tool_name) * CHARS_PER_TOKEN
    }
}

/// True if the content carries an inline image payload that must not be cut
pub fn contains_image_payload(content: &str) -> bool {
    content.contains("data:image/")
        || content.contains("\"type\":\"image\"")
        || content.contains("\"type\": \"image\"")
}

/// Truncate `content` to the tool's ceiling, keeping head and tail.
///
/// The output never exceeds the ceiling, so applying this twice is a no-op.
pub fn truncate_tool_result(content: &str, tool_name: &str, limits: &TruncationLimits) -> String {
    if contains_image_payload(content) {
        return content.to_string();
    }

    let max_chars = limits.max_chars_for(tool_name);
    if content.len() <= max_chars {
        return content.to_string();
    }

    let out = truncate_middle(content, max_chars);
    debug!(
        target: "context_window",
        tool = %tool_name,
        original = content.len(),
        truncated = out.len(),
        "Truncated tool result"
    );
    out
}

/// Cut `content` to at most `max_chars` bytes, keeping head and tail around a marker.
///
/// A ceiling too small for the marker keeps only the head.
pub fn truncate_middle(content: &str, max_chars: usize) -> String {
    if content.len() <= max_chars {
        return content.to_string();
    }
    if max_chars <= MARKER_RESERVE {
        return content[..floor_char_boundary(content, max_chars)].to_string();
    }

    let budget = max_chars - MARKER_RESERVE;
    let head_target = (budget as f64 * HEAD_SHARE) as usize;
    let tail_target = budget - head_target;

    let head_end = snap_backward(content, head_target);
    let tail_start = snap_forward(content, content.len() - tail_target);
    let removed = content[head_end..tail_start].chars().count();

    let mut out = String::with_capacity(max_chars);
    out.push_str(&content[..head_end]);
    out.push_str(&format!("\n\n[... truncated {} characters ...]\n\n", removed));
    out.push_str(&content[tail_start..]);
    out
}

fn is_boundary_byte(b: u8) -> bool {
    matches!(b, b'\n' | b',' | b'}' | b']' | b'{' | b'[')
}

/// Move a head cut point backward to just after a boundary, never past `target`
fn snap_backward(content: &str, target: usize) -> usize {
    let bytes = content.as_bytes();
    let target = floor_char_boundary(content, target.min(content.len()));
    let floor = target.saturating_sub(SNAP_WINDOW);
    let mut i = target;
    while i > floor {
        if is_boundary_byte(bytes[i - 1]) {
            return i;
        }
        i -= 1;
    }
    target
}

/// Move a tail cut point forward to a boundary, never before `target`
fn snap_forward(content: &str, target: usize) -> usize {
    let bytes = content.as_bytes();
    let target = ceil_char_boundary(content, target);
    let ceiling = (target + SNAP_WINDOW).min(content.len());
    let mut i = target;
    while i < ceiling {
        if bytes[i] == b'\n' {
            return i + 1;
        }
        if is_boundary_byte(bytes[i]) {
            return i;
        }
        i += 1;
    }
    target
}

fn floor_char_boundary(s: &str, mut i: usize) -> usize {
    while i > 0 && !s.is_char_boundary(i) {
        i -= 1;
    }
    i
}

fn ceil_char_boundary(s: &str, mut i: usize) -> usize {
    while i < s.len() && !s.is_char_boundary(i) {
        i += 1;
    }
    i
}
