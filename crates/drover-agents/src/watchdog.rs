//! Watchdog — semantic stuck detection over long-running sessions.
//!
//! Periodically inspects in-progress tickets with enough history, feeds
//! the conversation tail to the Fast tier, and on a stuck verdict kills
//! the runner, marks the ticket, appends an explanatory system message,
//! and raises an alert. The runner's own no-output ceiling catches silent
//! hangs; this loop catches the louder failure mode of an agent busily
//! going nowhere.

use std::sync::Arc;

use drover_bridge::event_bus::EventBus;
use drover_bridge::notify::Notifier;
use drover_bridge::protocol::{BusEvent, Topic};
use drover_core::types::{render_transcript, MessageRole, SessionStatus, Ticket, TicketStatus};
use drover_harness::shutdown::StopReason;
use drover_intelligence::classify::classify_stuck;
use drover_intelligence::llm::{LlmConfig, LlmProvider};
use drover_store::{MessageMeta, Store};
use tracing::{info, warn};

use crate::runner::RunnerRegistry;

#[derive(Debug, thiserror::Error)]
pub enum WatchdogError {
    #[error("store error: {0}")]
    Store(#[from] drover_store::StoreError),
}

pub type Result<T> = std::result::Result<T, WatchdogError>;

/// Outcome of one sweep.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct WatchdogReport {
    pub inspected: usize,
    pub stuck_ticket_ids: Vec<i64>,
}

pub struct Watchdog {
    provider: Arc<dyn LlmProvider>,
    llm_config: LlmConfig,
    /// Tickets with fewer messages are never inspected.
    min_messages: usize,
    /// How many trailing messages the classifier sees.
    window: usize,
}

impl Watchdog {
    pub fn new(
        provider: Arc<dyn LlmProvider>,
        llm_config: LlmConfig,
        min_messages: usize,
        window: usize,
    ) -> Self {
        Self {
            provider,
            llm_config,
            min_messages,
            window,
        }
    }

    /// Inspect every in-progress ticket with enough history.
    pub async fn sweep(
        &self,
        store: &Store,
        bus: &EventBus,
        notifier: &Notifier,
        runners: &RunnerRegistry,
    ) -> Result<WatchdogReport> {
        let mut report = WatchdogReport::default();

        for ticket in store.tickets_in_progress().await? {
            if store.message_count(ticket.id).await? < self.min_messages {
                continue;
            }
            report.inspected += 1;

            let tail = store.recent_messages(ticket.id, self.window).await?;
            let transcript = render_transcript(&tail);
            let verdict = match classify_stuck(self.provider.as_ref(), &self.llm_config, &transcript)
                .await
            {
                Ok(verdict) => verdict,
                Err(e) => {
                    warn!(ticket_id = ticket.id, error = %e, "stuck classification failed");
                    continue;
                }
            };
            if !verdict.stuck {
                continue;
            }

            info!(
                ticket_id = ticket.id,
                ticket_number = %ticket.ticket_number,
                reason = %verdict.reason,
                "watchdog classified ticket as stuck"
            );
            self.cut_down(store, bus, notifier, runners, &ticket, &verdict.reason)
                .await?;
            report.stuck_ticket_ids.push(ticket.id);
        }
        Ok(report)
    }

    /// Kill the session and mark the ticket stuck.
    ///
    /// With a live runner, the stop token does the work: the runner exits
    /// with a watchdog verdict and its worker finalizes the session and
    /// the ticket. Without one (daemon restart left a stale row), the
    /// transition happens here directly.
    async fn cut_down(
        &self,
        store: &Store,
        bus: &EventBus,
        notifier: &Notifier,
        runners: &RunnerRegistry,
        ticket: &Ticket,
        reason: &str,
    ) -> Result<()> {
        let had_live_runner = runners.stop(ticket.id, StopReason::Watchdog);
        if !had_live_runner {
            if let Some(session) = store.running_session(ticket.id).await? {
                store.finish_session(session.id, SessionStatus::Stuck).await?;
            }
            store
                .transition_ticket(ticket.id, TicketStatus::Stuck, None)
                .await?;
        }

        store
            .append_message(
                ticket.id,
                MessageRole::System,
                &format!("Execution stopped by the watchdog: {reason}"),
                MessageMeta::default(),
            )
            .await?;

        bus.publish(
            Topic::Console,
            BusEvent::WatchdogAlert {
                ticket_id: ticket.id,
                ticket_number: ticket.ticket_number.clone(),
                reason: reason.to_string(),
            },
        );
        notifier.ticket_stuck(ticket, reason).await;
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
