//! Token estimation and the `truncate_oldest` strategy (spec §4.6 step 3).

use arena_domain::tool::{Message, Role};

/// No real tokenizer is bundled; this approximation (characters divided by
/// a constant) is documented as an estimate everywhere it is used. It is
/// exact enough to test the `projected_tokens <= budget` invariant without
/// pulling in a tokenizer dependency.
const CHARS_PER_TOKEN: f64 = 4.0;

pub fn estimate_tokens(text: &str) -> u32 {
    ((text.chars().count() as f64) / CHARS_PER_TOKEN).ceil() as u32
}

pub fn estimate_message_tokens(msg: &Message) -> u32 {
    estimate_tokens(&msg.content.extract_all_text())
}

pub fn projected_tokens(messages: &[Message]) -> u32 {
    messages.iter().map(estimate_message_tokens).sum()
}

/// Split a message log into (protected head+tail, droppable middle),
/// preserving original order within each group.
///
/// Protected: every `Role::System` message, plus the last `min_recent`
/// non-system messages. Everything else is a drop candidate.
fn partition_protected(messages: &[Message], min_recent: usize) -> (Vec<usize>, Vec<usize>) {
    let non_system_indices: Vec<usize> = messages
        .iter()
        .enumerate()
        .filter(|(_, m)| m.role != Role::System)
        .map(|(i, _)| i)
        .collect();

    let protected_tail_start = non_system_indices.len().saturating_sub(min_recent);
    let protected_tail: std::collections::HashSet<usize> =
        non_system_indices[protected_tail_start..].iter().copied().collect();

    let mut protected = Vec::new();
    let mut droppable = Vec::new();
    for (i, msg) in messages.iter().enumerate() {
        if msg.role == Role::System || protected_tail.contains(&i) {
            protected.push(i);
        } else {
            droppable.push(i);
        }
    }
    (protected, droppable)
}

/// Drop the oldest non-protected messages until the projected token count
/// fits `token_budget`, or until nothing more can be dropped. System
/// messages and the last `min_recent` messages are never dropped, so the
/// `<= budget` invariant can fail to hold if the protected set alone
/// already exceeds the budget — that is a config problem the caller
/// surfaces, not something truncation can fix.
pub fn truncate_oldest(messages: &[Message], token_budget: u32, min_recent: usize) -> Vec<Message> {
    let (protected, droppable) = partition_protected(messages, min_recent);

    let mut dropped: std::collections::HashSet<usize> = std::collections::HashSet::new();
    let kept_tokens = |dropped: &std::collections::HashSet<usize>| -> u32 {
        messages
            .iter()
            .enumerate()
            .filter(|(i, _)| !dropped.contains(i))
            .map(|(_, m)| estimate_message_tokens(m))
            .sum()
    };

    // droppable is already in ascending (oldest-first) index order.
    for &idx in &droppable {
        if kept_tokens(&dropped) <= token_budget {
            break;
        }
        dropped.insert(idx);
    }
    let _ = protected;

    messages
        .iter()
        .enumerate()
        .filter(|(i, _)| !dropped.contains(i))
        .map(|(_, m)| m.clone())
        .collect()
}
