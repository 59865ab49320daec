//! Context compression: fit conversation history into a token budget via
//! truncation or summarization, adaptively chosen by how hard the squeeze
//! is. Tokens are estimated, not counted; the estimate is provider-tunable.

use std::future::Future;
use std::pin::Pin;
use std::sync::Mutex;

use serde::Serialize;
use tracing::warn;

use shared_types::{ChatMessage, Role};

use crate::llm::LlmError;

const TOKENS_PER_WORD: f64 = 1.3;
const DEFAULT_KEEP_RECENT: usize = 10;
const SUMMARY_MARKER: &str = "[Previous conversation summary]";
const STATS_HISTORY_CAPACITY: usize = 100;

/// Optional LLM-backed summarizer; absent or failing summarizers degrade to
/// an extractive local summary so compression never fails closed.
pub trait Summarizer: Send + Sync {
    fn summarize<'a>(
        &'a self,
        text: &'a str,
    ) -> Pin<Box<dyn Future<Output = Result<String, LlmError>> + Send + 'a>>;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CompressionStrategy {
    None,
    Truncate,
    Summarize,
    Adaptive,
}

#[derive(Debug, Clone, Serialize, PartialEq)]
#[serde(rename_all = "snake_case")]
pub struct CompressionStats {
    pub original_tokens: usize,
    pub compressed_tokens: usize,
    pub strategy_used: &'static str,
    pub messages_kept: usize,
    pub messages_removed: usize,
    pub compression_ratio: f64,
}

pub struct ContextCondenser {
    provider: String,
    keep_recent: usize,
    stats_history: Mutex<Vec<CompressionStats>>,
}

impl ContextCondenser {
    pub fn new(provider: impl Into<String>) -> Self {
        Self {
            provider: provider.into(),
            keep_recent: DEFAULT_KEEP_RECENT,
            stats_history: Mutex::new(Vec::new()),
        }
    }

    pub fn with_keep_recent(mut self, keep_recent: usize) -> Self {
        self.keep_recent = keep_recent.max(1);
        self
    }

    pub fn provider(&self) -> &str {
        &self.provider
    }

    /// Context budget for the configured provider.
    pub fn token_limit(&self) -> usize {
        match self.provider.as_str() {
            "gemini" => 30_000,
            "vllm" => 8_000,
            _ => 4_000,
        }
    }

    /// words × 1.3; cheap and close enough for budgeting.
    pub fn estimate_tokens(&self, text: &str) -> usize {
        let words = text.split_whitespace().count();
        (words as f64 * TOKENS_PER_WORD).round() as usize
    }

    fn message_tokens(&self, messages: &[ChatMessage]) -> usize {
        messages
            .iter()
            .map(|m| self.estimate_tokens(&m.content))
            .sum()
    }

    /// Aggressive squeezes summarize; moderate ones just truncate.
    fn select_strategy(&self, original: usize, target: usize) -> CompressionStrategy {
        if original == 0 {
            return CompressionStrategy::None;
        }
        let ratio = target as f64 / original as f64;
        if ratio >= 0.5 {
            CompressionStrategy::Truncate
        } else {
            CompressionStrategy::Summarize
        }
    }

    /// Compress `messages` to `target_tokens`. Returns the new message list
    /// and the statistics for this call.
    pub async fn condense(
        &self,
        messages: &[ChatMessage],
        target_tokens: usize,
        strategy: CompressionStrategy,
        summarizer: Option<&dyn Summarizer>,
    ) -> (Vec<ChatMessage>, CompressionStats) {
        let original_tokens = self.message_tokens(messages);

        if messages.is_empty() || original_tokens <= target_tokens {
            let stats = self.record(CompressionStats {
                original_tokens,
                compressed_tokens: original_tokens,
                strategy_used: "none",
                messages_kept: messages.len(),
                messages_removed: 0,
                compression_ratio: 1.0,
            });
            return (messages.to_vec(), stats);
        }

        let effective = match strategy {
            CompressionStrategy::Adaptive => self.select_strategy(original_tokens, target_tokens),
            other => other,
        };

        match effective {
            CompressionStrategy::Summarize => {
                self.summarize(messages, target_tokens, original_tokens, summarizer)
                    .await
            }
            _ => self.truncate(messages, target_tokens, original_tokens),
        }
    }

    /// Drop oldest messages until the tail fits; the newest message is
    /// always kept.
    fn truncate(
        &self,
        messages: &[ChatMessage],
        target_tokens: usize,
        original_tokens: usize,
    ) -> (Vec<ChatMessage>, CompressionStats) {
        let mut kept: Vec<ChatMessage> = Vec::new();
        let mut budget = 0usize;

        for message in messages.iter().rev() {
            let cost = self.estimate_tokens(&message.content);
            if !kept.is_empty() && budget + cost > target_tokens {
                break;
            }
            budget += cost;
            kept.push(message.clone());
            if budget >= target_tokens {
                break;
            }
        }
        kept.reverse();

        let compressed_tokens = self.message_tokens(&kept);
        let stats = self.record(CompressionStats {
            original_tokens,
            compressed_tokens,
            strategy_used: "truncate",
            messages_kept: kept.len(),
            messages_removed: messages.len() - kept.len(),
            compression_ratio: ratio(compressed_tokens, original_tokens),
        });
        (kept, stats)
    }

    /// Keep the recent tail verbatim and fold everything older into one
    /// system message. Falls back to truncation when the tail alone
    /// overruns the budget.
    async fn summarize(
        &self,
        messages: &[ChatMessage],
        target_tokens: usize,
        original_tokens: usize,
        summarizer: Option<&dyn Summarizer>,
    ) -> (Vec<ChatMessage>, CompressionStats) {
        let split = messages.len().saturating_sub(self.keep_recent);
        let (old, recent) = messages.split_at(split);

        if old.is_empty() || self.message_tokens(recent) > target_tokens {
            return self.truncate(messages, target_tokens, original_tokens);
        }

        let summary_body = match summarizer {
            Some(s) => {
                let transcript = old
                    .iter()
                    .map(|m| format!("{}: {}", m.role, m.content))
                    .collect::<Vec<_>>()
                    .join("\n");
                match s.summarize(&transcript).await {
                    Ok(summary) => summary,
                    Err(e) => {
                        warn!(error = %e, "summarizer failed, using extractive summary");
                        extractive_summary(old)
                    }
                }
            }
            None => extractive_summary(old),
        };

        let summary_message = ChatMessage {
            role: Role::System,
            content: format!("{SUMMARY_MARKER} {summary_body}"),
            timestamp: old.last().map(|m| m.timestamp).unwrap_or(0.0),
        };

        let mut compressed = Vec::with_capacity(recent.len() + 1);
        compressed.push(summary_message);
        compressed.extend_from_slice(recent);

        let compressed_tokens = self.message_tokens(&compressed);
        if compressed_tokens > target_tokens {
            return self.truncate(messages, target_tokens, original_tokens);
        }

        let stats = self.record(CompressionStats {
            original_tokens,
            compressed_tokens,
            strategy_used: "summarize",
            messages_kept: recent.len(),
            messages_removed: old.len(),
            compression_ratio: ratio(compressed_tokens, original_tokens),
        });
        (compressed, stats)
    }

    fn record(&self, stats: CompressionStats) -> CompressionStats {
        let mut history = self
            .stats_history
            .lock()
            .expect("condenser stats lock poisoned");
        if history.len() == STATS_HISTORY_CAPACITY {
            history.remove(0);
        }
        history.push(stats.clone());
        stats
    }

    pub fn stats_history(&self) -> Vec<CompressionStats> {
        self.stats_history
            .lock()
            .expect("condenser stats lock poisoned")
            .clone()
    }

    pub fn clear_stats_history(&self) {
        self.stats_history
            .lock()
            .expect("condenser stats lock poisoned")
            .clear();
    }
}

fn ratio(compressed: usize, original: usize) -> f64 {
    if original == 0 {
        1.0
    } else {
        compressed as f64 / original as f64
    }
}

/// Offline summary: the first clause of each dropped message, capped.
fn extractive_summary(messages: &[ChatMessage]) -> String {
    messages
        .iter()
        .map(|m| {
            let first: &str = m
                .content
                .split(['.', '\n'])
                .next()
                .unwrap_or("")
                .trim();
            let clause = if first.chars().count() > 80 {
                let cut = first.char_indices().nth(80).map(|(i, _)| i).unwrap_or(first.len());
                &first[..cut]
            } else {
                first
            };
            format!("{}: {}", m.role, clause)
        })
        .collect::<Vec<_>>()
        .join("; ")
}
