//! Outbound chat-channel notifications and inbound reply routing.
//!
//! Outbound: `awaiting_input`, `failed`, and watchdog `stuck` events are
//! posted through a [`NotificationSink`] with a `{TICKET_NUMBER}` reference
//! string the channel can thread on. Inbound: replies referencing a ticket
//! either query its status (`?` prefix, answered synchronously, no state
//! change) or land as a user message that reopens the ticket.

use std::sync::Arc;

use async_trait::async_trait;
use drover_core::config::NotifyConfig;
use drover_core::types::{
    render_transcript, AwaitingReason, MessageRole, Ticket, TicketStatus,
};
use drover_intelligence::classify::answer_query;
use drover_intelligence::llm::{LlmConfig, LlmProvider};
use drover_store::{MessageMeta, Store};
use tracing::{debug, info, warn};

// ---------------------------------------------------------------------------
// Errors
// ---------------------------------------------------------------------------

#[derive(Debug, thiserror::Error)]
pub enum NotifyError {
    #[error("sink error: {0}")]
    Sink(String),
    #[error("store error: {0}")]
    Store(#[from] drover_store::StoreError),
    #[error("llm error: {0}")]
    Llm(#[from] drover_intelligence::llm::LlmError),
}

pub type Result<T> = std::result::Result<T, NotifyError>;

// ---------------------------------------------------------------------------
// Sinks
// ---------------------------------------------------------------------------

/// Outbound adapter for one chat channel.
#[async_trait]
pub trait NotificationSink: Send + Sync {
    async fn send(&self, text: &str) -> Result<()>;
}

/// Posts `{"text": ...}` to a webhook URL.
pub struct WebhookSink {
    client: reqwest::Client,
    url: String,
}

impl WebhookSink {
    pub fn new(url: impl Into<String>) -> Self {
        Self {
            client: reqwest::Client::new(),
            url: url.into(),
        }
    }
}

#[async_trait]
impl NotificationSink for WebhookSink {
    async fn send(&self, text: &str) -> Result<()> {
        let resp = self
            .client
            .post(&self.url)
            .json(&serde_json::json!({ "text": text }))
            .send()
            .await
            .map_err(|e| NotifyError::Sink(e.to_string()))?;
        if !resp.status().is_success() {
            return Err(NotifyError::Sink(format!(
                "webhook returned {}",
                resp.status()
            )));
        }
        Ok(())
    }
}

/// Sink for installations without a webhook; notifications land in the log.
pub struct NullSink;

#[async_trait]
impl NotificationSink for NullSink {
    async fn send(&self, text: &str) -> Result<()> {
        debug!(text, "notification (no sink configured)");
        Ok(())
    }
}

/// Records every message; for tests.
#[derive(Default)]
pub struct CollectorSink {
    sent: std::sync::Mutex<Vec<String>>,
}

impl CollectorSink {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn sent(&self) -> Vec<String> {
        self.sent.lock().expect("collector lock poisoned").clone()
    }
}

#[async_trait]
impl NotificationSink for CollectorSink {
    async fn send(&self, text: &str) -> Result<()> {
        self.sent
            .lock()
            .expect("collector lock poisoned")
            .push(text.to_string());
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// Notifier
// ---------------------------------------------------------------------------

/// Publishes ticket lifecycle notifications, honoring per-event toggles.
pub struct Notifier {
    sink: Arc<dyn NotificationSink>,
    config: NotifyConfig,
}

impl Notifier {
    pub fn new(sink: Arc<dyn NotificationSink>, config: NotifyConfig) -> Self {
        Self { sink, config }
    }

    /// Build a notifier from config: webhook when configured, log-only
    /// otherwise.
    pub fn from_config(config: NotifyConfig) -> Self {
        let sink: Arc<dyn NotificationSink> = match &config.webhook_url {
            Some(url) => Arc::new(WebhookSink::new(url.clone())),
            None => Arc::new(NullSink),
        };
        Self::new(sink, config)
    }

    pub async fn ticket_awaiting(&self, ticket: &Ticket, reason: Option<AwaitingReason>) {
        if !self.config.on_awaiting {
            return;
        }
        let reason = reason
            .map(|r| format!(" ({})", serde_json::to_string(&r).unwrap_or_default().trim_matches('"')))
            .unwrap_or_default();
        let text = format!(
            "{} \"{}\" is awaiting input{reason}",
            ticket.ticket_number, ticket.title
        );
        self.deliver(&text).await;
    }

    pub async fn ticket_failed(&self, ticket: &Ticket) {
        if !self.config.on_failed {
            return;
        }
        let text = format!(
            "{} \"{}\" failed (attempt {}/{})",
            ticket.ticket_number,
            ticket.title,
            ticket.retry_count,
            ticket.max_retries
        );
        self.deliver(&text).await;
    }

    pub async fn ticket_stuck(&self, ticket: &Ticket, reason: &str) {
        if !self.config.on_stuck {
            return;
        }
        let text = format!(
            "{} \"{}\" looks stuck: {reason}",
            ticket.ticket_number, ticket.title
        );
        self.deliver(&text).await;
    }

    async fn deliver(&self, text: &str) {
        if let Err(e) = self.sink.send(text).await {
            warn!(error = %e, "notification delivery failed");
        }
    }
}

// ---------------------------------------------------------------------------
// Inbound replies
// ---------------------------------------------------------------------------

/// A parsed inbound chat reply.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum InboundReply {
    /// `TICKET-0001 ? how is it going` — status query, no state change.
    Query {
        ticket_number: String,
        question: String,
    },
    /// `TICKET-0001 please also add tests` — a user message for the ticket.
    Message {
        ticket_number: String,
        content: String,
    },
}

/// What routing an inbound reply did.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum InboundOutcome {
    /// Synchronous answer for a `?` query.
    QueryAnswer {
        ticket_number: String,
        answer: String,
    },
    /// The reply became a user message. `reopened` means the ticket moved
    /// back to open; `live` means a runner is active and the content should
    /// be injected into its stdin.
    UserMessage {
        ticket_id: i64,
        message_id: i64,
        content: String,
        reopened: bool,
        live: bool,
    },
    /// No ticket reference, or the reference matched nothing.
    Ignored { reason: String },
}

/// Extract the ticket reference and body from an inbound reply.
pub fn parse_inbound(text: &str) -> Option<InboundReply> {
    // `{TICKET_NUMBER}` reference strings look like SHOP-0042.
    static PATTERN: &str = r"\b([A-Z][A-Z0-9]*-\d+)\b";
    let re = regex::Regex::new(PATTERN).expect("valid ticket regex");
    let capture = re.captures(text)?;
    let ticket_number = capture.get(1)?.as_str().to_string();

    let after = &text[capture.get(1)?.end()..];
    let body = after.trim_start_matches([':', ' ', '\t']).trim();
    if let Some(question) = body.strip_prefix('?') {
        Some(InboundReply::Query {
            ticket_number,
            question: question.trim().to_string(),
        })
    } else if body.is_empty() {
        None
    } else {
        Some(InboundReply::Message {
            ticket_number,
            content: body.to_string(),
        })
    }
}

/// Route an inbound reply: answer queries synchronously, otherwise append
/// the user message and reopen the ticket (cancelling any pending review).
pub async fn route_reply(
    store: &Store,
    provider: &dyn LlmProvider,
    llm_config: &LlmConfig,
    text: &str,
) -> Result<InboundOutcome> {
    let Some(reply) = parse_inbound(text) else {
        return Ok(InboundOutcome::Ignored {
            reason: "no ticket reference".into(),
        });
    };

    let number = match &reply {
        InboundReply::Query { ticket_number, .. } => ticket_number,
        InboundReply::Message { ticket_number, .. } => ticket_number,
    };
    let Some(ticket) = store.get_ticket_by_number(number).await? else {
        return Ok(InboundOutcome::Ignored {
            reason: format!("unknown ticket {number}"),
        });
    };

    match reply {
        InboundReply::Query { question, .. } => {
            let recent = store.recent_messages(ticket.id, 10).await?;
            let answer =
                answer_query(provider, llm_config, &question, &render_transcript(&recent))
                    .await?;
            Ok(InboundOutcome::QueryAnswer {
                ticket_number: ticket.ticket_number,
                answer,
            })
        }
        InboundReply::Message { content, .. } => {
            let message_id = store
                .append_message(ticket.id, MessageRole::User, &content, MessageMeta::default())
                .await?;

            let live = ticket.status == TicketStatus::InProgress;
            let mut reopened = false;
            if ticket.status == TicketStatus::AwaitingInput {
                store.cancel_review(ticket.id).await?;
                store
                    .transition_ticket(ticket.id, TicketStatus::Open, None)
                    .await?;
                reopened = true;
            } else if ticket.status == TicketStatus::Failed
                || ticket.status == TicketStatus::Stuck
            {
                store
                    .transition_ticket(ticket.id, TicketStatus::Open, None)
                    .await?;
                reopened = true;
            }

            info!(
                ticket_id = ticket.id,
                message_id, reopened, live, "inbound reply routed"
            );
            Ok(InboundOutcome::UserMessage {
                ticket_id: ticket.id,
                message_id,
                content,
                reopened,
                live,
            })
        }
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;
    use drover_core::clock::ManualClock;
    use drover_core::types::{NewProject, NewTicket};
    use drover_intelligence::llm::MockProvider;

    async fn mk_store() -> Store {
        let clock = ManualClock::new(Utc::now());
        Store::new_in_memory(Arc::new(clock)).await.unwrap()
    }

    async fn seed_ticket(store: &Store) -> Ticket {
        let project = store
            .create_project(NewProject::new("SHOP", "Shop"))
            .await
            .unwrap();
        store
            .create_ticket(NewTicket::new(project.id, "fix login"))
            .await
            .unwrap()
    }

    #[test]
    fn parse_query_and_message() {
        assert_eq!(
            parse_inbound("SHOP-0001 ? how is it going"),
            Some(InboundReply::Query {
                ticket_number: "SHOP-0001".into(),
                question: "how is it going".into(),
            })
        );
        assert_eq!(
            parse_inbound("re SHOP-0001: please also add tests"),
            Some(InboundReply::Message {
                ticket_number: "SHOP-0001".into(),
                content: "please also add tests".into(),
            })
        );
        assert_eq!(parse_inbound("no reference here"), None);
        assert_eq!(parse_inbound("SHOP-0001"), None);
    }

    #[tokio::test]
    async fn toggles_suppress_notifications() {
        let sink = Arc::new(CollectorSink::new());
        let config = NotifyConfig {
            on_failed: false,
            ..NotifyConfig::default()
        };
        let notifier = Notifier::new(sink.clone(), config);

        let store = mk_store().await;
        let ticket = seed_ticket(&store).await;

        notifier.ticket_failed(&ticket).await;
        assert!(sink.sent().is_empty());

        notifier
            .ticket_awaiting(&ticket, Some(AwaitingReason::Completed))
            .await;
        let sent = sink.sent();
        assert_eq!(sent.len(), 1);
        assert!(sent[0].contains("SHOP-0001"), "reference string: {}", sent[0]);
        assert!(sent[0].contains("completed"));
    }

    #[tokio::test]
    async fn stuck_notification_carries_reason() {
        let sink = Arc::new(CollectorSink::new());
        let notifier = Notifier::new(sink.clone(), NotifyConfig::default());
        let store = mk_store().await;
        let ticket = seed_ticket(&store).await;

        notifier
            .ticket_stuck(&ticket, "same failing test 12 times")
            .await;
        assert!(sink.sent()[0].contains("same failing test"));
    }

    #[tokio::test]
    async fn query_reply_answers_without_state_change() {
        let store = mk_store().await;
        let ticket = seed_ticket(&store).await;
        store
            .append_message(
                ticket.id,
                MessageRole::Assistant,
                "working on the login form",
                MessageMeta::default(),
            )
            .await
            .unwrap();

        let mock = MockProvider::new();
        mock.push_response("Still working on the login form.");

        let outcome = route_reply(
            &store,
            &mock,
            &LlmConfig::default(),
            "SHOP-0001 ? what's happening",
        )
        .await
        .unwrap();

        assert_eq!(
            outcome,
            InboundOutcome::QueryAnswer {
                ticket_number: "SHOP-0001".into(),
                answer: "Still working on the login form.".into(),
            }
        );
        // Query transcript reached the model; ticket state untouched.
        assert!(mock.calls()[0][1].content.contains("login form"));
        let t = store.get_ticket(ticket.id).await.unwrap().unwrap();
        assert_eq!(t.status, TicketStatus::Open);
        assert_eq!(store.message_count(ticket.id).await.unwrap(), 1);
    }

    #[tokio::test]
    async fn message_reply_reopens_awaiting_ticket() {
        let store = mk_store().await;
        let ticket = seed_ticket(&store).await;
        store.claim_ticket(ticket.id).await.unwrap();
        store
            .transition_ticket(
                ticket.id,
                TicketStatus::AwaitingInput,
                Some(AwaitingReason::Completed),
            )
            .await
            .unwrap();
        store
            .schedule_review(ticket.id, Utc::now() + chrono::Duration::minutes(5))
            .await
            .unwrap();

        let mock = MockProvider::new();
        let outcome = route_reply(
            &store,
            &mock,
            &LlmConfig::default(),
            "SHOP-0001 also update the docs",
        )
        .await
        .unwrap();

        match outcome {
            InboundOutcome::UserMessage {
                reopened, live, ..
            } => {
                assert!(reopened);
                assert!(!live);
            }
            other => panic!("unexpected outcome: {other:?}"),
        }

        let t = store.get_ticket(ticket.id).await.unwrap().unwrap();
        assert_eq!(t.status, TicketStatus::Open);
        assert!(t.review_scheduled_at.is_none());
        assert_eq!(mock.call_count(), 0);
    }

    #[tokio::test]
    async fn message_reply_to_live_ticket_flags_injection() {
        let store = mk_store().await;
        let ticket = seed_ticket(&store).await;
        store.claim_ticket(ticket.id).await.unwrap();

        let mock = MockProvider::new();
        let outcome = route_reply(
            &store,
            &mock,
            &LlmConfig::default(),
            "SHOP-0001 prefer the simpler approach",
        )
        .await
        .unwrap();

        match outcome {
            InboundOutcome::UserMessage { live, reopened, .. } => {
                assert!(live);
                assert!(!reopened);
            }
            other => panic!("unexpected outcome: {other:?}"),
        }
        let t = store.get_ticket(ticket.id).await.unwrap().unwrap();
        assert_eq!(t.status, TicketStatus::InProgress);
    }

    #[tokio::test]
    async fn unknown_reference_is_ignored() {
        let store = mk_store().await;
        let mock = MockProvider::new();
        let outcome = route_reply(&store, &mock, &LlmConfig::default(), "GHOST-9999 hello")
            .await
            .unwrap();
        assert!(matches!(outcome, InboundOutcome::Ignored { .. }));
    }
}
