use crate::types::{ContentBlock, Message, MessageContent};

/// The dropped prefix, reported when not everything fit.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Overflow {
    pub dropped_count: usize,
    pub estimated_dropped_tokens: u32,
}

/// A contiguous tail of the transcript that fits the budget.
#[derive(Debug)]
pub struct Selection<'a> {
    pub selected: &'a [Message],
    pub overflow: Option<Overflow>,
}

/// Select the longest contiguous suffix whose estimated tokens fit within
/// `budget`. Never skips a large message to reach an older small one;
/// conversation coherence outweighs density. A single message over the
/// budget yields an empty selection; forcing it in is the caller's call.
pub fn select_messages<'a>(
    messages: &'a [Message],
    budget: u32,
    estimate: impl Fn(&Message) -> u32,
) -> Selection<'a> {
    let mut used: u32 = 0;
    let mut start = messages.len();

    for (idx, message) in messages.iter().enumerate().rev() {
        let tokens = estimate(message);
        if used.saturating_add(tokens) > budget {
            break;
        }
        used += tokens;
        start = idx;
    }

    let overflow = if start == 0 {
        None
    } else {
        let dropped = &messages[..start];
        Some(Overflow {
            dropped_count: dropped.len(),
            estimated_dropped_tokens: dropped.iter().map(&estimate).sum(),
        })
    };

    Selection {
        selected: &messages[start..],
        overflow,
    }
}

/// ceil(chars / 4). Pessimistic enough for budgeting when paired with the
/// compaction input margin.
pub fn estimate_str_tokens(s: &str) -> u32 {
    (s.chars().count() as u32).div_ceil(4)
}

/// Token estimate for one message: ceil(chars / 4) over its textualization.
/// Text blocks contribute their text, tool inputs their JSON encoding,
/// tool results their flattened content.
pub fn estimate_tokens(message: &Message) -> u32 {
    let mut text = String::new();
    match &message.content {
        MessageContent::Text(s) => text.push_str(s),
        MessageContent::Blocks(blocks) => {
            for block in blocks {
                match block {
                    ContentBlock::Text { text: t } => text.push_str(t),
                    ContentBlock::ToolUse { input, .. } => {
                        text.push_str(&input.to_string());
                    }
                    ContentBlock::ToolResult { content, .. } => {
                        text.push_str(&content.flatten());
                    }
                }
            }
        }
    }
    estimate_str_tokens(&text)
}
