//! Cheap-model classifiers: post-turn review, stuck detection, and
//! conversation extraction.
//!
//! Prompts pin the model to a machine-readable reply; parsing stays
//! tolerant of prose padding and markdown fences because small models
//! decorate their answers anyway.

use serde::{Deserialize, Serialize};

use crate::llm::{LlmConfig, LlmError, LlmMessage, LlmProvider};

// ---------------------------------------------------------------------------
// Review classification
// ---------------------------------------------------------------------------

/// What the assistant's final turn amounts to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ReviewVerdict {
    /// The requested work is finished; the ticket can auto-close.
    Completed,
    /// The assistant is asking the human something.
    Question,
    /// The assistant reported a problem it could not solve.
    Error,
}

const REVIEW_SYSTEM: &str = "You judge whether an AI coding agent finished its task. \
Reply with exactly one word: COMPLETED if the work is done, QUESTION if the agent is \
asking the user something, or ERROR if the agent reported a problem it could not solve.";

/// Ask the classifier what the assistant's last turn means.
pub async fn classify_review(
    provider: &dyn LlmProvider,
    config: &LlmConfig,
    last_user_turn: &str,
    assistant_reply: &str,
) -> Result<ReviewVerdict, LlmError> {
    let prompt = format!(
        "User request:\n{last_user_turn}\n\nAgent's final reply:\n{assistant_reply}"
    );
    let messages = vec![LlmMessage::system(REVIEW_SYSTEM), LlmMessage::user(prompt)];
    let response = provider.complete(&messages, config).await?;
    parse_review_verdict(&response.content)
        .ok_or_else(|| LlmError::Parse(format!("unrecognized verdict: {}", response.content)))
}

/// Pull a verdict keyword out of the reply, tolerating surrounding prose.
pub fn parse_review_verdict(text: &str) -> Option<ReviewVerdict> {
    let upper = text.to_uppercase();
    // Scan in answer order so "NOT COMPLETED, ERROR" resolves to the
    // keyword the model actually led with.
    let hits = [
        (upper.find("COMPLETED"), ReviewVerdict::Completed),
        (upper.find("QUESTION"), ReviewVerdict::Question),
        (upper.find("ERROR"), ReviewVerdict::Error),
    ];
    hits.into_iter()
        .filter_map(|(pos, verdict)| pos.map(|p| (p, verdict)))
        .min_by_key(|(p, _)| *p)
        .map(|(_, verdict)| verdict)
}

// ---------------------------------------------------------------------------
// Stuck classification
// ---------------------------------------------------------------------------

/// Watchdog verdict over a conversation tail.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StuckVerdict {
    pub stuck: bool,
    #[serde(default)]
    pub reason: String,
}

const STUCK_SYSTEM: &str = "You monitor an AI coding agent's conversation for stuck \
patterns: the same failing command repeated, circular edits that undo each other, or \
no observable progress across many turns. Reply with JSON only: \
{\"stuck\": true|false, \"reason\": \"<short explanation>\"}.";

/// Ask whether the trailing conversation shows a stuck agent.
pub async fn classify_stuck(
    provider: &dyn LlmProvider,
    config: &LlmConfig,
    transcript: &str,
) -> Result<StuckVerdict, LlmError> {
    let messages = vec![
        LlmMessage::system(STUCK_SYSTEM),
        LlmMessage::user(format!("Recent conversation:\n{transcript}")),
    ];
    let response = provider.complete(&messages, config).await?;
    parse_json_reply(&response.content)
        .ok_or_else(|| LlmError::Parse(format!("unparseable stuck verdict: {}", response.content)))
}

// ---------------------------------------------------------------------------
// Extraction
// ---------------------------------------------------------------------------

/// The structured summary the summarizer asks for, one field per column of
/// the extraction record.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExtractionFields {
    #[serde(default)]
    pub decisions: String,
    #[serde(default)]
    pub problems_solved: String,
    #[serde(default)]
    pub files_modified: Vec<String>,
    #[serde(default)]
    pub tests_status: String,
    #[serde(default)]
    pub error_patterns: String,
    #[serde(default)]
    pub important_notes: String,
}

const EXTRACTION_SYSTEM: &str = "You compress an AI coding agent's conversation into a \
structured record. Reply with JSON only, using exactly these keys: \
{\"decisions\": \"...\", \"problems_solved\": \"...\", \"files_modified\": [\"...\"], \
\"tests_status\": \"...\", \"error_patterns\": \"...\", \"important_notes\": \"...\"}. \
Keep every field short and factual; use empty values when nothing applies.";

/// Compress a message range into extraction fields.
pub async fn extract_range(
    provider: &dyn LlmProvider,
    config: &LlmConfig,
    transcript: &str,
) -> Result<ExtractionFields, LlmError> {
    let messages = vec![
        LlmMessage::system(EXTRACTION_SYSTEM),
        LlmMessage::user(format!("Conversation to compress:\n{transcript}")),
    ];
    let response = provider.complete(&messages, config).await?;
    parse_json_reply(&response.content)
        .ok_or_else(|| LlmError::Parse(format!("unparseable extraction: {}", response.content)))
}

// ---------------------------------------------------------------------------
// Query summaries (inbound `?` replies)
// ---------------------------------------------------------------------------

const QUERY_SYSTEM: &str = "You answer a short status question about an AI coding \
agent's ticket, given its recent conversation. Answer in at most three sentences.";

pub async fn answer_query(
    provider: &dyn LlmProvider,
    config: &LlmConfig,
    question: &str,
    transcript: &str,
) -> Result<String, LlmError> {
    let messages = vec![
        LlmMessage::system(QUERY_SYSTEM),
        LlmMessage::user(format!(
            "Question: {question}\n\nRecent conversation:\n{transcript}"
        )),
    ];
    let response = provider.complete(&messages, config).await?;
    Ok(response.content.trim().to_string())
}

// ---------------------------------------------------------------------------
// Helpers
// ---------------------------------------------------------------------------

/// Parse a JSON object out of a model reply, tolerating markdown fences
/// and leading prose.
fn parse_json_reply<T: serde::de::DeserializeOwned>(text: &str) -> Option<T> {
    let trimmed = text.trim();
    if let Ok(parsed) = serde_json::from_str(trimmed) {
        return Some(parsed);
    }
    // Strip ```json fences.
    let unfenced = trimmed
        .trim_start_matches("```json")
        .trim_start_matches("```")
        .trim_end_matches("```")
        .trim();
    if let Ok(parsed) = serde_json::from_str(unfenced) {
        return Some(parsed);
    }
    // Last resort: the outermost brace span.
    let start = trimmed.find('{')?;
    let end = trimmed.rfind('}')?;
    serde_json::from_str(&trimmed[start..=end]).ok()
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use crate::llm::MockProvider;

    #[test]
    fn verdict_parses_bare_keywords() {
        assert_eq!(parse_review_verdict("COMPLETED"), Some(ReviewVerdict::Completed));
        assert_eq!(parse_review_verdict("question"), Some(ReviewVerdict::Question));
        assert_eq!(parse_review_verdict(" ERROR\n"), Some(ReviewVerdict::Error));
        assert_eq!(parse_review_verdict("maybe?"), None);
    }

    #[test]
    fn verdict_takes_the_leading_keyword() {
        assert_eq!(
            parse_review_verdict("QUESTION — the agent asked whether an error matters"),
            Some(ReviewVerdict::Question)
        );
        assert_eq!(
            parse_review_verdict("The verdict is: ERROR (task not completed)"),
            Some(ReviewVerdict::Error)
        );
    }

    #[tokio::test]
    async fn review_classification_round_trip() {
        let mock = MockProvider::new();
        mock.push_response("COMPLETED");
        let verdict = classify_review(
            &mock,
            &LlmConfig::default(),
            "add a healthcheck endpoint",
            "Done — /healthz returns 200 and tests pass.",
        )
        .await
        .unwrap();
        assert_eq!(verdict, ReviewVerdict::Completed);

        let calls = mock.calls();
        assert!(calls[0][1].content.contains("healthcheck"));
    }

    #[tokio::test]
    async fn review_classification_rejects_garbage() {
        let mock = MockProvider::new();
        mock.push_response("the agent did... things");
        let err = classify_review(&mock, &LlmConfig::default(), "u", "a")
            .await
            .unwrap_err();
        assert!(matches!(err, LlmError::Parse(_)));
    }

    #[tokio::test]
    async fn stuck_verdict_parses_fenced_json() {
        let mock = MockProvider::new();
        mock.push_response(
            "```json\n{\"stuck\": true, \"reason\": \"same npm test failure 12 times\"}\n```",
        );
        let verdict = classify_stuck(&mock, &LlmConfig::default(), "...")
            .await
            .unwrap();
        assert!(verdict.stuck);
        assert!(verdict.reason.contains("npm test"));
    }

    #[tokio::test]
    async fn extraction_tolerates_prose_padding() {
        let mock = MockProvider::new();
        mock.push_response(
            "Here is the summary:\n{\"decisions\": \"switched to sqlite\", \
             \"problems_solved\": \"\", \"files_modified\": [\"src/db.rs\"], \
             \"tests_status\": \"green\", \"error_patterns\": \"\", \
             \"important_notes\": \"WAL required\"}",
        );
        let fields = extract_range(&mock, &LlmConfig::default(), "...")
            .await
            .unwrap();
        assert_eq!(fields.decisions, "switched to sqlite");
        assert_eq!(fields.files_modified, vec!["src/db.rs".to_string()]);
        assert_eq!(fields.important_notes, "WAL required");
    }

    #[tokio::test]
    async fn extraction_missing_fields_default() {
        let mock = MockProvider::new();
        mock.push_response("{\"decisions\": \"x\"}");
        let fields = extract_range(&mock, &LlmConfig::default(), "...")
            .await
            .unwrap();
        assert_eq!(fields.decisions, "x");
        assert!(fields.files_modified.is_empty());
        assert!(fields.tests_status.is_empty());
    }

    #[tokio::test]
    async fn query_answer_is_trimmed() {
        let mock = MockProvider::new();
        mock.push_response("  Waiting on a migration review.\n");
        let answer = answer_query(&mock, &LlmConfig::default(), "status?", "...")
            .await
            .unwrap();
        assert_eq!(answer, "Waiting on a migration review.");
    }
}
