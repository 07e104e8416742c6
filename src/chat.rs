//! Retrieval orchestrator: one question in, one answer out.
//!
//! A [`ChatSession`] runs each exchange through a fixed sequence of states:
//!
//! ```text
//! AwaitingInput → RetrievingContext → Generating → Persisting → Reporting → AwaitingInput
//!        │
//!        └── exit phrase ──▶ Ended (terminal)
//! ```
//!
//! The context handed to the model is, in order: the persona (if any), the
//! top document chunks, the top recalled turns (as `previous chat:` user
//! messages), and the live question.

use std::sync::Arc;

use thiserror::Error;

use crate::config::Config;
use crate::cost::CostAccountant;
use crate::error::{Error, GenerationError};
use crate::index::VectorIndex;
use crate::llm::ChatModel;
use crate::memory::ConversationMemory;
use crate::models::{ChatMessage, ConversationTurn, CostEstimate, Metadata, Role};

/// Prefix marking a recalled turn in the model context.
pub const RECALL_PREFIX: &str = "previous chat: ";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExchangeState {
    AwaitingInput,
    RetrievingContext,
    Generating,
    Persisting,
    Reporting,
    Ended,
}

/// A completed exchange.
#[derive(Debug, Clone)]
pub struct Exchange {
    pub answer: String,
    pub cost: CostEstimate,
    /// Ids allocated to the user and assistant turns.
    pub turn_ids: Vec<i64>,
    /// Messages sent to the model.
    pub context: Vec<ChatMessage>,
}

#[derive(Debug, Clone)]
pub enum Outcome {
    /// Blank input; nothing happened.
    Ignored,
    /// The session is over.
    Ended,
    Answered(Exchange),
}

/// Failure of one exchange, by stage.
#[derive(Debug, Error)]
pub enum ExchangeError {
    #[error("context retrieval failed: {0}")]
    Retrieval(#[source] Error),

    #[error("generation failed: {0}")]
    Generation(#[from] GenerationError),

    /// The answer was generated but not saved to memory.
    #[error("failed to save exchange to memory: {source}")]
    Persistence {
        answer: String,
        cost: CostEstimate,
        #[source]
        source: Error,
    },
}

/// Tunables for a session, normally taken from [`Config`].
#[derive(Debug, Clone)]
pub struct SessionSettings {
    pub persona: Option<String>,
    pub temperature: f32,
    pub max_tokens: u32,
    pub cost_per_1000_tokens: f64,
    pub document_k: usize,
    pub memory_k: usize,
    pub max_context_chars: usize,
    pub exit_phrases: Vec<String>,
}

impl Default for SessionSettings {
    fn default() -> Self {
        Self {
            persona: None,
            temperature: 0.7,
            max_tokens: 512,
            cost_per_1000_tokens: 0.0,
            document_k: 2,
            memory_k: 2,
            max_context_chars: 12_000,
            exit_phrases: vec!["exit".to_string(), "quit".to_string()],
        }
    }
}

impl SessionSettings {
    pub fn from_config(config: &Config) -> Self {
        Self {
            persona: config.openai.chat_persona.clone(),
            temperature: config.openai.temperature,
            max_tokens: config.openai.max_tokens,
            cost_per_1000_tokens: config.openai.chat_cost_per_1000_tokens,
            document_k: config.retrieval.document_k,
            memory_k: config.retrieval.memory_k,
            max_context_chars: config.retrieval.max_context_chars,
            exit_phrases: config.session.exit_phrases.clone(),
        }
    }
}

pub struct ChatSession {
    corpus: VectorIndex,
    memory: ConversationMemory,
    model: Arc<dyn ChatModel>,
    accountant: CostAccountant,
    settings: SessionSettings,
    state: ExchangeState,
}

impl ChatSession {
    pub fn new(
        corpus: VectorIndex,
        memory: ConversationMemory,
        model: Arc<dyn ChatModel>,
        accountant: CostAccountant,
        settings: SessionSettings,
    ) -> Self {
        Self {
            corpus,
            memory,
            model,
            accountant,
            settings,
            state: ExchangeState::AwaitingInput,
        }
    }

    pub fn state(&self) -> ExchangeState {
        self.state
    }

    pub fn is_ended(&self) -> bool {
        self.state == ExchangeState::Ended
    }

    pub fn memory(&self) -> &ConversationMemory {
        &self.memory
    }

    fn transition(&mut self, next: ExchangeState) {
        tracing::debug!(from = ?self.state, to = ?next, "exchange state");
        self.state = next;
    }

    fn is_exit_phrase(&self, query: &str) -> bool {
        let normalized = query.trim().to_lowercase();
        self.settings
            .exit_phrases
            .iter()
            .any(|p| p.trim().to_lowercase() == normalized)
    }

    /// Run one exchange.
    pub async fn handle(&mut self, query: &str) -> Result<Outcome, ExchangeError> {
        if self.is_ended() {
            return Ok(Outcome::Ended);
        }
        if query.trim().is_empty() {
            return Ok(Outcome::Ignored);
        }
        if self.is_exit_phrase(query) {
            self.transition(ExchangeState::Ended);
            return Ok(Outcome::Ended);
        }

        let result = self.run_exchange(query).await;
        if !self.is_ended() {
            self.transition(ExchangeState::AwaitingInput);
        }
        result.map(Outcome::Answered)
    }

    async fn run_exchange(&mut self, query: &str) -> Result<Exchange, ExchangeError> {
        self.transition(ExchangeState::RetrievingContext);
        let context = self.build_context(query).await.map_err(ExchangeError::Retrieval)?;

        self.transition(ExchangeState::Generating);
        let answer = self
            .model
            .generate(&context, self.settings.temperature, self.settings.max_tokens)
            .await?;

        self.transition(ExchangeState::Persisting);
        let cost = self.estimate(query, &answer);
        let turn_ids = match self.persist(query, &answer).await {
            Ok(ids) => ids,
            Err(source) => {
                tracing::warn!(error = %source, "exchange not saved to memory");
                return Err(ExchangeError::Persistence {
                    answer,
                    cost,
                    source,
                });
            }
        };

        self.transition(ExchangeState::Reporting);
        tracing::info!(
            conversation = self.memory.conversation(),
            turns = ?turn_ids,
            tokens = cost.token_count,
            "exchange complete"
        );
        Ok(Exchange {
            answer,
            cost,
            turn_ids,
            context,
        })
    }

    fn estimate(&self, query: &str, answer: &str) -> CostEstimate {
        self.accountant.estimate(
            query,
            answer,
            self.model.model_name(),
            self.settings.cost_per_1000_tokens,
        )
    }

    /// Save a user question and its answer to memory.
    ///
    /// Used by [`handle`](Self::handle), and by callers retrying after
    /// [`ExchangeError::Persistence`].
    pub async fn persist(&self, query: &str, answer: &str) -> Result<Vec<i64>, Error> {
        self.memory
            .append(&[
                ConversationTurn::new(Role::User, query),
                ConversationTurn::new(Role::Assistant, answer),
            ])
            .await
    }

    /// Assemble the messages for `query`.
    pub async fn build_context(&self, query: &str) -> Result<Vec<ChatMessage>, Error> {
        let chunks: Vec<String> = self
            .corpus
            .query(query, self.settings.document_k, &Metadata::new())
            .await?
            .into_iter()
            .map(|n| n.entry.text)
            .collect();
        let recalled: Vec<String> = self
            .memory
            .recall(query, self.settings.memory_k)
            .await?
            .into_iter()
            .map(|t| format!("{}{}", RECALL_PREFIX, t.content))
            .collect();

        let (chunks, recalled) = fit_budget(chunks, recalled, self.settings.max_context_chars);

        let mut context = Vec::with_capacity(chunks.len() + recalled.len() + 2);
        if let Some(persona) = self.settings.persona.as_deref().filter(|p| !p.trim().is_empty()) {
            context.push(ChatMessage::new(Role::System, persona));
        }
        context.extend(chunks.into_iter().map(|c| ChatMessage::new(Role::System, c)));
        context.extend(recalled.into_iter().map(|r| ChatMessage::new(Role::User, r)));
        context.push(ChatMessage::new(Role::User, query));
        Ok(context)
    }
}

/// Keep the best-ranked items whose combined length fits in `budget` characters.
///
/// Items are admitted by rank, alternating between the two lists; the first
/// item that does not fit ends admission, so everything ranked lower is dropped.
fn fit_budget(
    chunks: Vec<String>,
    recalled: Vec<String>,
    budget: usize,
) -> (Vec<String>, Vec<String>) {
    let mut used = 0usize;
    let mut keep_chunks = 0;
    let mut keep_recalled = 0;
    let ranks = chunks.len().max(recalled.len());

    'admit: for rank in 0..ranks {
        for (list, kept) in [(&chunks, &mut keep_chunks), (&recalled, &mut keep_recalled)] {
            if let Some(item) = list.get(rank) {
                let len = item.chars().count();
                if used + len > budget {
                    break 'admit;
                }
                used += len;
                *kept += 1;
            }
        }
    }

    let dropped = chunks.len() + recalled.len() - keep_chunks - keep_recalled;
    if dropped > 0 {
        tracing::debug!(dropped, budget, "context items dropped to fit budget");
    }
    (
        chunks.into_iter().take(keep_chunks).collect(),
        recalled.into_iter().take(keep_recalled).collect(),
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    fn strings(items: &[&str]) -> Vec<String> {
        items.iter().map(|s| s.to_string()).collect()
    }

    #[test]
    fn fit_budget_keeps_everything_when_it_fits() {
        let (c, r) = fit_budget(strings(&["aaaa", "bbbb"]), strings(&["cc"]), 100);
        assert_eq!(c.len(), 2);
        assert_eq!(r.len(), 1);
    }

    #[test]
    fn fit_budget_drops_lowest_ranked_first() {
        // Admission order: a(4) c(2) b(4) d(2); budget 8 admits a, c, and stops at b.
        let (c, r) = fit_budget(strings(&["aaaa", "bbbb"]), strings(&["cc", "dd"]), 8);
        assert_eq!(c, strings(&["aaaa"]));
        assert_eq!(r, strings(&["cc"]));
    }

    #[test]
    fn fit_budget_zero_drops_all() {
        let (c, r) = fit_budget(strings(&["a"]), strings(&["b"]), 0);
        assert!(c.is_empty() && r.is_empty());
    }
}
