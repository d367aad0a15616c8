// ABOUTME: Parses markdown checklists in PLAN.md into progress steps and
// ABOUTME: rewrites individual checkbox glyphs without touching other text.

use std::sync::LazyLock;

use regex::Regex;

use super::types::{ProgressMarkers, ProgressSummary, ProgressUpdate, StepState};
use crate::error::TaskError;

// Top-level only: no leading whitespace before the dash.
static CHECKLIST_LINE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"^- \[([ xX~!])\](?:\s+(.*))?$").expect("checklist pattern is valid")
});

static BOLD_TITLE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"^\*\*(.+?)\*\*").expect("title pattern is valid")
});

/// Byte offset of the glyph inside a matched line (`- [` is three bytes).
const GLYPH_OFFSET: usize = 3;

/// One top-level checklist line.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChecklistItem {
    /// 1-based position among checklist lines.
    pub step: usize,
    /// 0-based line number within the plan.
    pub line: usize,
    pub state: StepState,
    /// Text inside the leading `**...**`, if present.
    pub title: Option<String>,
    pub text: String,
}

/// Extract top-level checklist items. Indented and malformed lines are skipped.
pub fn parse_checklist(content: &str) -> Vec<ChecklistItem> {
    let mut items = Vec::new();
    for (line_no, raw) in content.lines().enumerate() {
        let line = raw.trim_end_matches('\r');
        let Some(caps) = CHECKLIST_LINE.captures(line) else {
            continue;
        };
        let Some(state) = caps
            .get(1)
            .and_then(|m| m.as_str().chars().next())
            .and_then(StepState::from_glyph)
        else {
            continue;
        };
        let text = caps.get(2).map_or("", |m| m.as_str()).trim_end().to_string();
        let title = BOLD_TITLE
            .captures(&text)
            .and_then(|c| c.get(1))
            .map(|m| m.as_str().trim().to_string())
            .filter(|t| !t.is_empty());

        items.push(ChecklistItem {
            step: items.len() + 1,
            line: line_no,
            state,
            title,
            text,
        });
    }
    items
}

/// Count checklist steps by state. Every top-level item counts, bold or not.
pub fn analyze_plan_progress(content: &str) -> ProgressSummary {
    let mut summary = ProgressSummary::default();
    for item in parse_checklist(content) {
        match item.state {
            StepState::Complete => summary.completed += 1,
            StepState::InProgress => summary.in_progress += 1,
            StepState::Pending => summary.pending += 1,
            StepState::Blocked => summary.blocked += 1,
        }
    }
    summary
}

/// Titles of bold-emphasized steps. Items without a `**Title**` are left out.
pub fn extract_progress_markers(content: &str) -> ProgressMarkers {
    let mut markers = ProgressMarkers::default();
    for item in parse_checklist(content) {
        let Some(title) = item.title else { continue };
        if item.state == StepState::Complete {
            markers.completed.push(title);
        } else {
            markers.pending.push(title);
        }
    }
    markers
}

/// Rewrite the glyph of each updated step, leaving every other byte as is.
///
/// Fails without changing anything if any step is out of range.
pub fn apply_updates(content: &str, updates: &[ProgressUpdate]) -> Result<String, TaskError> {
    let items = parse_checklist(content);
    for (index, update) in updates.iter().enumerate() {
        if update.step == 0 || update.step > items.len() {
            return Err(TaskError::invalid(
                format!("updates[{index}].step"),
                format!(
                    "step {} is out of range; plan has {} steps",
                    update.step,
                    items.len()
                ),
            ));
        }
    }

    let mut lines: Vec<String> = content.split_inclusive('\n').map(str::to_string).collect();
    for update in updates {
        let item = &items[update.step - 1];
        let line = &mut lines[item.line];
        let glyph = update.status.glyph().to_string();
        line.replace_range(GLYPH_OFFSET..GLYPH_OFFSET + 1, &glyph);
    }
    Ok(lines.concat())
}
