//! Context window planning for chat completions.
//!
//! Decides which messages to forward and how many completion tokens to allow
//! so that a request fits the target model's context window. Token counts
//! are estimated as `ceil(len(content) / 4) + 4` per message; the estimate is
//! deliberately rough, exact tokenization is the engine's job.

use serde_json::Value;

/// Completion budget applied when the request does not set `max_tokens`.
pub const DEFAULT_COMPLETION_TOKENS: u32 = 1024;
/// Tokens held back from the window to absorb estimation error.
pub const SAFETY_BUFFER: u32 = 50;
/// Smallest completion budget worth forwarding; below this the request is
/// rejected as a context overflow.
pub const MIN_COMPLETION_TOKENS: u32 = 64;
/// At most this many trailing non-system messages survive truncation.
pub const MAX_TAIL_MESSAGES: usize = 10;

#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum ContextError {
    #[error("messages must not be empty")]
    Empty,

    #[error("message {index} content must be a string")]
    BadContent { index: usize },

    #[error("input of ~{input_tokens} tokens cannot fit a {window}-token context window")]
    Overflow { input_tokens: u64, window: u32 },
}

/// Outcome of planning: the messages to forward (original order), the capped
/// completion budget, and whether anything was cut down.
#[derive(Debug)]
pub struct ContextPlan {
    pub messages: Vec<Value>,
    pub max_tokens: u32,
    pub truncated: bool,
}

fn role(message: &Value) -> &str {
    message["role"].as_str().unwrap_or("")
}

/// Estimated token cost of one message: content length over four, plus role
/// overhead.
fn estimate(message: &Value, index: usize) -> Result<u64, ContextError> {
    let content = message["content"]
        .as_str()
        .ok_or(ContextError::BadContent { index })?;
    Ok((content.len() as u64).div_ceil(4) + 4)
}

/// Plan a request against a model's context window `W = window`.
///
/// The fast path forwards everything unchanged with `max_tokens` capped at
/// `min(requested, W/2)`. The truncation path pins `messages[0]` when it is
/// a system message, keeps a bounded tail of recent non-system messages,
/// drops oldest-first until the budget fits (adjacent user/assistant pairs
/// go together), and finally shrinks the completion budget before giving up.
pub fn plan(
    messages: &[Value],
    requested_max_tokens: Option<u32>,
    window: u32,
) -> Result<ContextPlan, ContextError> {
    if messages.is_empty() {
        return Err(ContextError::Empty);
    }

    let costs = messages
        .iter()
        .enumerate()
        .map(|(i, m)| estimate(m, i))
        .collect::<Result<Vec<_>, _>>()?;
    let input_tokens: u64 = costs.iter().sum();

    let budget = window as u64;
    let mut max_tokens = requested_max_tokens
        .unwrap_or(DEFAULT_COMPLETION_TOKENS)
        .min(window / 2);

    if input_tokens + max_tokens as u64 + SAFETY_BUFFER as u64 <= budget {
        return Ok(ContextPlan {
            messages: messages.to_vec(),
            max_tokens,
            truncated: false,
        });
    }

    // Truncation path. Pin the leading system message, keep a recent tail.
    let pinned = (role(&messages[0]) == "system").then_some(0usize);

    let tail_len = MAX_TAIL_MESSAGES.min(messages.len() - 1).max(1);
    let mut kept: Vec<usize> = messages
        .iter()
        .enumerate()
        .filter(|(i, m)| Some(*i) != pinned && role(m) != "system")
        .map(|(i, _)| i)
        .rev()
        .take(tail_len)
        .collect();
    kept.reverse();
    if let Some(p) = pinned {
        kept.insert(0, p);
    }

    let kept_cost =
        |kept: &[usize]| -> u64 { kept.iter().map(|&i| costs[i]).sum::<u64>() };

    // Drop oldest non-pinned messages until the budget fits or only the
    // minimal set remains. Adjacent user/assistant exchanges drop together.
    while kept_cost(&kept) + max_tokens as u64 + SAFETY_BUFFER as u64 > budget && kept.len() > 2 {
        let oldest = if pinned.is_some() { 1 } else { 0 };
        let pair = kept.len() > 3
            && kept[oldest + 1] == kept[oldest] + 1
            && role(&messages[kept[oldest]]) == "user"
            && role(&messages[kept[oldest] + 1]) == "assistant";

        kept.remove(oldest);
        if pair {
            kept.remove(oldest);
        }
    }

    let remaining = kept_cost(&kept);
    if remaining + max_tokens as u64 + SAFETY_BUFFER as u64 > budget {
        let available = budget as i64 - remaining as i64 - SAFETY_BUFFER as i64;
        if available < MIN_COMPLETION_TOKENS as i64 {
            return Err(ContextError::Overflow {
                input_tokens: remaining,
                window,
            });
        }
        max_tokens = available as u32;
    }

    Ok(ContextPlan {
        messages: kept.iter().map(|&i| messages[i].clone()).collect(),
        max_tokens,
        truncated: true,
    })
}
