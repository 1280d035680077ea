//! Summarizer — compresses oversize conversations into extraction records.
//!
//! A periodic sweep finds tickets whose unsummarized token total exceeds
//! the threshold, compresses the oldest contiguous range with the Fast
//! tier, and folds durable findings into the project knowledge record.
//! Summarization is strictly additive: raw messages are never deleted,
//! only flagged, so the extraction prefix plus the raw suffix always
//! reconstructs the causal history.

use std::sync::Arc;

use drover_core::types::{estimate_tokens, render_transcript, Ticket};
use drover_intelligence::classify::{extract_range, ExtractionFields};
use drover_intelligence::llm::{LlmConfig, LlmProvider};
use drover_store::{NewExtraction, Store};
use tracing::{info, warn};

#[derive(Debug, thiserror::Error)]
pub enum SummarizeError {
    #[error("store error: {0}")]
    Store(#[from] drover_store::StoreError),
    #[error("llm error: {0}")]
    Llm(#[from] drover_intelligence::llm::LlmError),
}

pub type Result<T> = std::result::Result<T, SummarizeError>;

/// Outcome of one sweep.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SummarizeReport {
    pub candidates: usize,
    pub extractions_created: usize,
    pub tokens_compressed: i64,
}

pub struct Summarizer {
    provider: Arc<dyn LlmProvider>,
    llm_config: LlmConfig,
    threshold: i64,
}

impl Summarizer {
    pub fn new(provider: Arc<dyn LlmProvider>, llm_config: LlmConfig, threshold: i64) -> Self {
        Self {
            provider,
            llm_config,
            threshold,
        }
    }

    /// One periodic sweep over every candidate ticket. Per-ticket failures
    /// are logged and skipped; one bad conversation never stalls the rest.
    pub async fn sweep(&self, store: &Store) -> Result<SummarizeReport> {
        let candidates = store.summarize_candidates(self.threshold).await?;
        let mut report = SummarizeReport {
            candidates: candidates.len(),
            ..Default::default()
        };

        for ticket in &candidates {
            match self.summarize_ticket(store, ticket).await {
                Ok(Some(compressed)) => {
                    report.extractions_created += 1;
                    report.tokens_compressed += compressed;
                }
                Ok(None) => {}
                Err(e) => {
                    warn!(ticket_id = ticket.id, error = %e, "summarization failed, skipping");
                }
            }
        }
        Ok(report)
    }

    /// Compress one ticket's oldest unsummarized range. Returns the token
    /// count removed from the unsummarized total, or `None` when there is
    /// nothing to do.
    pub async fn summarize_ticket(&self, store: &Store, ticket: &Ticket) -> Result<Option<i64>> {
        let messages = store.unsummarized_messages(ticket.id).await?;
        if messages.len() < 2 {
            return Ok(None);
        }
        let total: i64 = messages.iter().map(|m| m.token_count).sum();
        if total <= self.threshold {
            return Ok(None);
        }

        // Oldest contiguous range whose removal brings the rest under the
        // threshold; the newest message always stays raw.
        let mut cut_tokens = 0i64;
        let mut end_idx = 0usize;
        for (i, message) in messages.iter().enumerate() {
            cut_tokens += message.token_count;
            end_idx = i;
            if total - cut_tokens < self.threshold {
                break;
            }
        }
        let end_idx = end_idx.min(messages.len() - 2);
        let range = &messages[..=end_idx];
        let cut_tokens: i64 = range.iter().map(|m| m.token_count).sum();

        let transcript = render_transcript(range);
        let fields = extract_range(self.provider.as_ref(), &self.llm_config, &transcript).await?;

        let from = range[0].id;
        let to = range[end_idx].id;
        let tokens_after = rendered_size(&fields);
        store
            .insert_extraction(NewExtraction {
                ticket_id: ticket.id,
                from_msg_id: from,
                to_msg_id: to,
                decisions: fields.decisions.clone(),
                problems_solved: fields.problems_solved.clone(),
                files_modified: fields.files_modified.clone(),
                tests_status: fields.tests_status.clone(),
                error_patterns: fields.error_patterns.clone(),
                important_notes: fields.important_notes.clone(),
                tokens_before: cut_tokens,
                tokens_after,
            })
            .await?;
        store.mark_summarized(ticket.id, from, to).await?;

        let knowledge = knowledge_addition(&fields);
        if !knowledge.is_empty() {
            store.fold_into_knowledge(ticket.project_id, &knowledge).await?;
        }

        info!(
            ticket_id = ticket.id,
            from, to, cut_tokens, tokens_after, "conversation range compressed"
        );
        Ok(Some(cut_tokens))
    }
}

/// Token size of the compressed form.
fn rendered_size(fields: &ExtractionFields) -> i64 {
    let text = [
        fields.decisions.as_str(),
        fields.problems_solved.as_str(),
        fields.tests_status.as_str(),
        fields.error_patterns.as_str(),
        fields.important_notes.as_str(),
    ]
    .join("\n");
    estimate_tokens(&text) + estimate_tokens(&fields.files_modified.join(","))
}

/// The durable lines folded into `project_knowledge`.
fn knowledge_addition(fields: &ExtractionFields) -> String {
    let mut lines = Vec::new();
    for value in [
        &fields.important_notes,
        &fields.problems_solved,
        &fields.decisions,
    ] {
        if !value.trim().is_empty() {
            lines.push(value.trim().to_string());
        }
    }
    lines.join("\n")
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
