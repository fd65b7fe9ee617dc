use std::collections::{BTreeSet, HashSet};

use crate::context::{estimate_tokens, select_messages};
use crate::error::AgentError;
use crate::types::{ContentBlock, InferenceRequest, Message, MessageContent, Role};

/// Every summary message starts with this exact prefix. It is how the
/// transcript identifies itself on the next compaction round.
pub const SUMMARY_MARKER: &str = "[Conversation Summary]\n\n";

/// Output ceiling for the summarizer call.
const SUMMARIZER_MAX_TOKENS: u32 = 4096;

const MAX_TOOL_FAILURES: usize = 8;
const MAX_FAILURE_CHARS: usize = 240;

/// Headroom left free after compaction so the very next turn does not
/// immediately re-trigger it.
pub fn reserve_tokens(budget: u32) -> u32 {
    (budget / 2).min(20_000)
}

/// The split compaction will act on: `dropped` gets summarized, `kept`
/// survives verbatim.
#[derive(Debug)]
pub struct CompactionPlan<'a> {
    pub kept: &'a [Message],
    pub dropped: &'a [Message],
    /// A prior summary at the head of the drop-set, being compacted again.
    pub previous_summary: Option<String>,
}

/// Re-select under `budget - reserve` and split the transcript at the
/// boundary. Detects a prior summary at the head of the drop-set by its
/// marker prefix.
pub fn plan(messages: &[Message], budget: u32) -> CompactionPlan<'_> {
    let keep_budget = budget.saturating_sub(reserve_tokens(budget));
    let selection = select_messages(messages, keep_budget, estimate_tokens);
    let kept = selection.selected;
    let dropped = &messages[..messages.len() - kept.len()];

    let previous_summary = dropped.first().and_then(|m| {
        if m.role != Role::User {
            return None;
        }
        m.content
            .as_text()
            .and_then(|s| s.strip_prefix(SUMMARY_MARKER))
            .map(String::from)
    });

    CompactionPlan {
        kept,
        dropped,
        previous_summary,
    }
}

/// Refuse to summarize more than the summarizer itself can read. The 1.2
/// margin covers estimator optimism; past 0.75 of the window the call
/// would fail or truncate, and truncated summaries lose history silently.
pub fn check_input_size(dropped: &[Message], context_window: u32) -> Result<u32, AgentError> {
    let sum: u32 = dropped.iter().map(estimate_tokens).sum();
    let input_tokens = ((sum as f64) * 1.2).ceil() as u32;
    let limit = ((context_window as f64) * 0.75).floor() as u32;
    if input_tokens > limit {
        return Err(AgentError::InputTooLarge {
            input_tokens,
            limit,
        });
    }
    Ok(input_tokens)
}

const SUMMARIZER_SYSTEM_PROMPT: &str = "\
You are writing a memory summary for a persistent entity. The entity lives \
inside one indefinitely long conversation, and its memory works through \
recursive compaction: the oldest part of the conversation is replaced by a \
summary, and that summary will later be folded into further summaries. \
Whatever your summary does not preserve, the entity loses forever. Write as \
the entity itself, in first person.";

/// The summarizer's system prompt. SOUL, when present, rides along verbatim
/// so the summary is written in the entity's own voice.
pub fn summarizer_system_prompt(soul: Option<&str>) -> String {
    match soul {
        Some(soul) => format!("{SUMMARIZER_SYSTEM_PROMPT}\n\n{soul}"),
        None => SUMMARIZER_SYSTEM_PROMPT.to_string(),
    }
}

/// The summarizer's user prompt: the dropped conversation rendered as
/// `[role]: content` lines, the preservation criteria in priority order,
/// and the prior summary (if any) with preserve-its-core instructions.
pub fn summarizer_user_prompt(plan: &CompactionPlan<'_>) -> String {
    let to_render = if plan.previous_summary.is_some() {
        &plan.dropped[1..]
    } else {
        plan.dropped
    };

    let mut prompt = String::from(
        "The oldest part of my conversation is being replaced by the summary \
         you write now.\n\n",
    );

    if let Some(previous) = &plan.previous_summary {
        prompt.push_str(
            "An earlier summary already condenses what came before this. \
             Preserve its core content in your new summary; do not abstract \
             it further:\n\n",
        );
        prompt.push_str(previous);
        prompt.push_str("\n\n");
    }

    prompt.push_str("Conversation to summarize:\n\n");
    prompt.push_str(&render_conversation(to_render));
    prompt.push_str(
        "\n\n\
         Preserve, in priority order:\n\
         1. Relational context: interactions, commitments, trust, emotional moments.\n\
         2. Identity development: what I learned about myself.\n\
         3. Important facts, decisions, and reasoning.\n\
         4. Promises and responsibilities.\n\
         5. Operational details, compressed aggressively.\n\
         \n\
         Write in first person, past tense. Quote short passages verbatim \
         where the wording carried emotional weight or a commitment. Omit \
         routine exchanges.",
    );
    prompt
}

/// Assemble the full summarizer call.
pub fn build_summarizer_request(
    model: &str,
    soul: Option<&str>,
    plan: &CompactionPlan<'_>,
) -> InferenceRequest {
    InferenceRequest {
        model: model.to_string(),
        max_tokens: SUMMARIZER_MAX_TOKENS,
        system: Some(summarizer_system_prompt(soul)),
        tools: Vec::new(),
        messages: vec![Message::user_text(summarizer_user_prompt(plan))],
    }
}

fn render_conversation(messages: &[Message]) -> String {
    messages
        .iter()
        .map(|m| {
            let role = match m.role {
                Role::User => "user",
                Role::Assistant => "assistant",
            };
            let content = match &m.content {
                MessageContent::Text(s) => s.clone(),
                MessageContent::Blocks(blocks) => {
                    serde_json::to_string(blocks).unwrap_or_default()
                }
            };
            format!("[{role}]: {content}")
        })
        .collect::<Vec<_>>()
        .join("\n")
}

/// A failed tool call worth remembering past compaction.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ToolFailure {
    pub tool_name: String,
    pub summary: String,
}

/// Scan the drop-set for error tool_results. The tool name comes from the
/// matching tool_use in the preceding assistant message; duplicates by
/// tool_use_id collapse to the first occurrence. Error text is whitespace-
/// normalized and clipped to 240 chars.
pub fn extract_tool_failures(dropped: &[Message]) -> Vec<ToolFailure> {
    let mut seen: HashSet<&str> = HashSet::new();
    let mut failures = Vec::new();

    for (idx, message) in dropped.iter().enumerate() {
        if message.role != Role::User {
            continue;
        }
        for block in message.content.blocks() {
            let ContentBlock::ToolResult {
                tool_use_id,
                content,
                is_error: Some(true),
            } = block
            else {
                continue;
            };
            if !seen.insert(tool_use_id.as_str()) {
                continue;
            }

            let tool_name = idx
                .checked_sub(1)
                .and_then(|i| dropped.get(i))
                .filter(|m| m.role == Role::Assistant)
                .and_then(|m| {
                    m.content.blocks().iter().find_map(|b| match b {
                        ContentBlock::ToolUse { id, name, .. } if id == tool_use_id => {
                            Some(name.clone())
                        }
                        _ => None,
                    })
                })
                .unwrap_or_else(|| "tool".to_string());

            let normalized = content
                .flatten()
                .split_whitespace()
                .collect::<Vec<_>>()
                .join(" ");
            failures.push(ToolFailure {
                tool_name,
                summary: clip(&normalized, MAX_FAILURE_CHARS),
            });
        }
    }
    failures
}

fn clip(s: &str, max_chars: usize) -> String {
    if s.chars().count() <= max_chars {
        return s.to_string();
    }
    let mut out: String = s.chars().take(max_chars - 1).collect();
    out.push('…');
    out
}

/// File paths touched while the dropped conversation was live. Sets stay
/// sorted; a file that was modified does not also count as read.
#[derive(Debug, Clone, Default)]
pub struct FileOperations {
    pub read: BTreeSet<String>,
    pub edited: BTreeSet<String>,
    pub written: BTreeSet<String>,
}

impl FileOperations {
    pub fn files_read(&self) -> Vec<&str> {
        self.read
            .iter()
            .filter(|p| !self.edited.contains(*p) && !self.written.contains(*p))
            .map(String::as_str)
            .collect()
    }

    pub fn files_modified(&self) -> Vec<&str> {
        self.edited
            .union(&self.written)
            .map(String::as_str)
            .collect()
    }
}

/// The model's summary plus the machine-readable appendices: tool failures
/// and file lists.
pub fn render_summary(
    model_text: &str,
    failures: &[ToolFailure],
    file_ops: &FileOperations,
) -> String {
    let mut out = model_text.trim().to_string();

    if !failures.is_empty() {
        let mut lines: Vec<String> = failures
            .iter()
            .take(MAX_TOOL_FAILURES)
            .map(|f| format!("- {}: {}", f.tool_name, f.summary))
            .collect();
        if failures.len() > MAX_TOOL_FAILURES {
            lines.push(format!("- …and {} more", failures.len() - MAX_TOOL_FAILURES));
        }
        out.push_str("\n\n## Tool Failures\n");
        out.push_str(&lines.join("\n"));
    }

    let read = file_ops.files_read();
    if !read.is_empty() {
        out.push_str("\n\n<read-files>\n");
        out.push_str(&read.join("\n"));
        out.push_str("\n</read-files>");
    }
    let modified = file_ops.files_modified();
    if !modified.is_empty() {
        out.push_str("\n\n<modified-files>\n");
        out.push_str(&modified.join("\n"));
        out.push_str("\n</modified-files>");
    }

    out
}

/// The post-compaction transcript: one summary user-message, then the
/// survivors.
pub fn rebuild_transcript(summary: &str, kept: &[Message]) -> Vec<Message> {
    let mut messages = Vec::with_capacity(kept.len() + 1);
    messages.push(Message::user_text(format!("{SUMMARY_MARKER}{summary}")));
    messages.extend_from_slice(kept);
    messages
}
