//! Reviewer — the delayed auto-close decision.
//!
//! A ticket that reaches `awaiting_input` at an ordinary end of turn gets
//! a review scheduled a few minutes out. When it comes due: a user reply
//! in the meantime cancels it; strict tickets are labeled completed but
//! left for the human; relaxed tickets are classified by the Fast tier and
//! auto-closed on COMPLETED. Classifier failures retry on the same delay
//! up to a ceiling, then give up conservatively (no auto-close).

use std::sync::Arc;

use chrono::Duration;
use drover_bridge::event_bus::EventBus;
use drover_bridge::protocol::{BusEvent, Topic};
use drover_core::clock::Clock;
use drover_core::types::{AwaitingReason, MessageRole, Ticket, TicketStatus};
use drover_intelligence::classify::{classify_review, ReviewVerdict};
use drover_intelligence::llm::{LlmConfig, LlmProvider};
use drover_store::Store;
use tracing::{info, warn};

#[derive(Debug, thiserror::Error)]
pub enum ReviewError {
    #[error("store error: {0}")]
    Store(#[from] drover_store::StoreError),
}

pub type Result<T> = std::result::Result<T, ReviewError>;

/// Outcome of one sweep.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ReviewReport {
    pub due: usize,
    pub auto_closed: usize,
    pub kept_waiting: usize,
    pub cancelled: usize,
    pub retried: usize,
    pub deadline_closed: usize,
}

pub struct Reviewer {
    provider: Arc<dyn LlmProvider>,
    llm_config: LlmConfig,
    clock: Arc<dyn Clock>,
    retry_delay: Duration,
    max_attempts: u32,
    /// Auto-close horizon for chronically awaiting tickets; `None`
    /// disables the deadline sweep.
    deadline: Option<Duration>,
}

impl Reviewer {
    pub fn new(
        provider: Arc<dyn LlmProvider>,
        llm_config: LlmConfig,
        clock: Arc<dyn Clock>,
        retry_delay_minutes: u64,
        max_attempts: u32,
        deadline_days: Option<u64>,
    ) -> Self {
        Self {
            provider,
            llm_config,
            clock,
            retry_delay: Duration::minutes(retry_delay_minutes as i64),
            max_attempts,
            deadline: deadline_days.map(|d| Duration::days(d as i64)),
        }
    }

    /// Process every due review, then the deadline sweep.
    pub async fn sweep(&self, store: &Store, bus: &EventBus) -> Result<ReviewReport> {
        let due = store.due_reviews().await?;
        let mut report = ReviewReport {
            due: due.len(),
            ..Default::default()
        };

        for ticket in due {
            self.review_one(store, bus, &ticket, &mut report).await?;
        }

        if let Some(deadline) = self.deadline {
            let cutoff = self.clock.now() - deadline;
            for ticket in store.stale_awaiting(cutoff).await? {
                info!(
                    ticket_id = ticket.id,
                    ticket_number = %ticket.ticket_number,
                    "closing chronically awaiting ticket past the deadline"
                );
                store.cancel_review(ticket.id).await?;
                store
                    .transition_ticket(ticket.id, TicketStatus::Done, Some(AwaitingReason::AutoReviewed))
                    .await?;
                self.publish_status(bus, &ticket, TicketStatus::Done, Some(AwaitingReason::AutoReviewed));
                report.deadline_closed += 1;
            }
        }

        Ok(report)
    }

    async fn review_one(
        &self,
        store: &Store,
        bus: &EventBus,
        ticket: &Ticket,
        report: &mut ReviewReport,
    ) -> Result<()> {
        // The ticket may have moved on since scheduling.
        if ticket.status != TicketStatus::AwaitingInput {
            store.cancel_review(ticket.id).await?;
            report.cancelled += 1;
            return Ok(());
        }

        // User intervened: the review is moot.
        let last = store.last_message(ticket.id).await?;
        let Some(last) = last else {
            store.cancel_review(ticket.id).await?;
            report.cancelled += 1;
            return Ok(());
        };
        if last.role != MessageRole::Assistant {
            store.cancel_review(ticket.id).await?;
            report.cancelled += 1;
            return Ok(());
        }

        // Strict tickets are never auto-closed; label and hand to the human.
        if !ticket.deps_include_awaiting {
            store
                .set_awaiting_reason(ticket.id, Some(AwaitingReason::Completed))
                .await?;
            store.cancel_review(ticket.id).await?;
            report.kept_waiting += 1;
            return Ok(());
        }

        let last_user = store
            .messages(ticket.id)
            .await?
            .into_iter()
            .rev()
            .find(|m| m.role == MessageRole::User)
            .map(|m| m.content)
            .unwrap_or_else(|| ticket.description.clone());

        match classify_review(self.provider.as_ref(), &self.llm_config, &last_user, &last.content)
            .await
        {
            Ok(ReviewVerdict::Completed) => {
                store.cancel_review(ticket.id).await?;
                store
                    .transition_ticket(ticket.id, TicketStatus::Done, Some(AwaitingReason::AutoReviewed))
                    .await?;
                if ticket.result_summary.is_none() {
                    store.set_result_summary(ticket.id, &last.content).await?;
                }
                self.publish_status(bus, ticket, TicketStatus::Done, Some(AwaitingReason::AutoReviewed));
                info!(ticket_id = ticket.id, "auto-closed after review");
                report.auto_closed += 1;
            }
            Ok(ReviewVerdict::Question) => {
                store
                    .set_awaiting_reason(ticket.id, Some(AwaitingReason::Question))
                    .await?;
                store.cancel_review(ticket.id).await?;
                report.kept_waiting += 1;
            }
            Ok(ReviewVerdict::Error) => {
                store
                    .set_awaiting_reason(ticket.id, Some(AwaitingReason::Error))
                    .await?;
                store.cancel_review(ticket.id).await?;
                report.kept_waiting += 1;
            }
            Err(e) => {
                let attempts = store.bump_review_attempts(ticket.id).await?;
                if attempts >= self.max_attempts {
                    warn!(
                        ticket_id = ticket.id,
                        attempts,
                        error = %e,
                        "review classifier kept failing, giving up without auto-close"
                    );
                    store
                        .set_awaiting_reason(ticket.id, Some(AwaitingReason::Completed))
                        .await?;
                    store.cancel_review(ticket.id).await?;
                    report.kept_waiting += 1;
                } else {
                    warn!(ticket_id = ticket.id, attempts, error = %e, "review classifier failed, retrying");
                    store
                        .schedule_review(ticket.id, self.clock.now() + self.retry_delay)
                        .await?;
                    report.retried += 1;
                }
            }
        }
        Ok(())
    }

    fn publish_status(
        &self,
        bus: &EventBus,
        ticket: &Ticket,
        status: TicketStatus,
        reason: Option<AwaitingReason>,
    ) {
        bus.publish(
            Topic::Ticket(ticket.id),
            BusEvent::TicketStatus {
                ticket_id: ticket.id,
                ticket_number: ticket.ticket_number.clone(),
                status,
                reason,
            },
        );
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
    use drover_intelligence::llm::{LlmError, MockProvider};
    use drover_store::MessageMeta;

    struct Fixture {
        store: Store,
        clock: ManualClock,
        bus: EventBus,
        mock: Arc<MockProvider>,
    }

    async fn fixture() -> Fixture {
        let clock = ManualClock::new(Utc::now());
        let store = Store::new_in_memory(Arc::new(clock.clone())).await.unwrap();
        Fixture {
            store,
            clock,
            bus: EventBus::new(),
            mock: Arc::new(MockProvider::new()),
        }
    }

    impl Fixture {
        fn reviewer(&self) -> Reviewer {
            Reviewer::new(
                self.mock.clone(),
                LlmConfig::default(),
                Arc::new(self.clock.clone()),
                5,
                3,
                Some(7),
            )
        }

        /// A ticket awaiting input with a final assistant message and a due
        /// review.
        async fn awaiting_ticket(&self, relaxed: bool) -> Ticket {
            let project = self
                .store
                .create_project(NewProject::new("SHOP", "Shop"))
                .await
                .unwrap();
            let mut new = NewTicket::new(project.id, "fix login");
            new.deps_include_awaiting = relaxed;
            let ticket = self.store.create_ticket(new).await.unwrap();

            self.store
                .append_message(ticket.id, MessageRole::User, "fix the login bug", MessageMeta::default())
                .await
                .unwrap();
            self.store.claim_ticket(ticket.id).await.unwrap();
            self.store
                .append_message(ticket.id, MessageRole::Assistant, "Task completed.", MessageMeta::default())
                .await
                .unwrap();
            self.store
                .transition_ticket(ticket.id, TicketStatus::AwaitingInput, None)
                .await
                .unwrap();
            self.store
                .schedule_review(ticket.id, self.clock.now() + Duration::minutes(5))
                .await
                .unwrap();
            self.clock.advance(Duration::minutes(6));
            ticket
        }
    }

    #[tokio::test]
    async fn relaxed_ticket_auto_closes_on_completed() {
        let f = fixture().await;
        let ticket = f.awaiting_ticket(true).await;
        f.mock.push_response("COMPLETED");

        let rx = f.bus.subscribe_ticket(ticket.id);
        let report = f.reviewer().sweep(&f.store, &f.bus).await.unwrap();
        assert_eq!(report.auto_closed, 1);

        let t = f.store.get_ticket(ticket.id).await.unwrap().unwrap();
        assert_eq!(t.status, TicketStatus::Done);
        assert_eq!(t.awaiting_reason, Some(AwaitingReason::AutoReviewed));
        assert_eq!(t.result_summary.as_deref(), Some("Task completed."));
        assert!(t.review_scheduled_at.is_none());

        let event = rx.try_recv().unwrap();
        assert!(matches!(
            event.event,
            BusEvent::TicketStatus {
                status: TicketStatus::Done,
                ..
            }
        ));
    }

    #[tokio::test]
    async fn strict_ticket_is_labeled_but_never_closed() {
        let f = fixture().await;
        let ticket = f.awaiting_ticket(false).await;

        let report = f.reviewer().sweep(&f.store, &f.bus).await.unwrap();
        assert_eq!(report.kept_waiting, 1);
        assert_eq!(f.mock.call_count(), 0);

        let t = f.store.get_ticket(ticket.id).await.unwrap().unwrap();
        assert_eq!(t.status, TicketStatus::AwaitingInput);
        assert_eq!(t.awaiting_reason, Some(AwaitingReason::Completed));
        assert!(t.review_scheduled_at.is_none());
    }

    #[tokio::test]
    async fn question_and_error_keep_waiting_with_reason() {
        let f = fixture().await;
        let ticket = f.awaiting_ticket(true).await;
        f.mock.push_response("QUESTION");

        f.reviewer().sweep(&f.store, &f.bus).await.unwrap();
        let t = f.store.get_ticket(ticket.id).await.unwrap().unwrap();
        assert_eq!(t.status, TicketStatus::AwaitingInput);
        assert_eq!(t.awaiting_reason, Some(AwaitingReason::Question));
    }

    #[tokio::test]
    async fn user_reply_cancels_the_review() {
        let f = fixture().await;
        let ticket = f.awaiting_ticket(true).await;
        f.store
            .append_message(ticket.id, MessageRole::User, "wait, also do X", MessageMeta::default())
            .await
            .unwrap();

        let report = f.reviewer().sweep(&f.store, &f.bus).await.unwrap();
        assert_eq!(report.cancelled, 1);
        assert_eq!(f.mock.call_count(), 0);

        let t = f.store.get_ticket(ticket.id).await.unwrap().unwrap();
        assert_eq!(t.status, TicketStatus::AwaitingInput);
        assert!(t.review_scheduled_at.is_none());
    }

    #[tokio::test]
    async fn classifier_failure_retries_then_gives_up() {
        let f = fixture().await;
        let ticket = f.awaiting_ticket(true).await;
        let reviewer = f.reviewer();

        // Two failures re-schedule; the third (max_attempts = 3) gives up.
        for expected_retries in [1, 2] {
            f.mock.push_error(LlmError::Timeout);
            let report = reviewer.sweep(&f.store, &f.bus).await.unwrap();
            assert_eq!(report.retried, 1, "attempt {expected_retries}");
            f.clock.advance(Duration::minutes(6));
        }

        f.mock.push_error(LlmError::Timeout);
        let report = reviewer.sweep(&f.store, &f.bus).await.unwrap();
        assert_eq!(report.kept_waiting, 1);

        let t = f.store.get_ticket(ticket.id).await.unwrap().unwrap();
        assert_eq!(t.status, TicketStatus::AwaitingInput);
        assert_eq!(t.awaiting_reason, Some(AwaitingReason::Completed));
        assert!(t.review_scheduled_at.is_none());
    }

    #[tokio::test]
    async fn deadline_sweep_closes_chronic_waiters() {
        let f = fixture().await;
        let ticket = f.awaiting_ticket(false).await;
        // Clear the pending review so only the deadline path fires.
        f.store.cancel_review(ticket.id).await.unwrap();

        f.clock.advance(Duration::days(8));
        let report = f.reviewer().sweep(&f.store, &f.bus).await.unwrap();
        assert_eq!(report.deadline_closed, 1);

        let t = f.store.get_ticket(ticket.id).await.unwrap().unwrap();
        assert_eq!(t.status, TicketStatus::Done);
    }

    #[tokio::test]
    async fn moved_on_tickets_just_lose_their_review() {
        let f = fixture().await;
        let ticket = f.awaiting_ticket(true).await;
        // The human closed it between scheduling and the sweep.
        f.store
            .transition_ticket(ticket.id, TicketStatus::Done, None)
            .await
            .unwrap();

        let report = f.reviewer().sweep(&f.store, &f.bus).await.unwrap();
        assert_eq!(report.cancelled, 1);
        assert_eq!(f.mock.call_count(), 0);
    }
}
