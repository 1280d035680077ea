//! TicketScheduler — the main control loop.
//!
//! Each tick reaps finished workers, probes projects in a rotating order,
//! and dispatches the best eligible ticket per idle project while a global
//! slot is free. A worker owns one ticket end to end: prompt assembly,
//! the agent session, and the terminal transition. Worker errors are
//! contained; nothing a worker does can take the scheduler down.

use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use chrono::Duration;
use drover_agents::context_builder::ContextBuilder;
use drover_agents::runner::{
    AgentLaunch, AgentRunner, AgentSpawner, LiveRunner, RunReport, RunVerdict, RunnerRegistry,
    RunnerSettings,
};
use drover_agents::summarizer::Summarizer;
use drover_bridge::event_bus::EventBus;
use drover_bridge::notify::Notifier;
use drover_bridge::protocol::{BusEvent, Topic};
use drover_core::clock::Clock;
use drover_core::config::{ProvidersConfig, SchedulerConfig};
use drover_core::types::{
    AwaitingReason, MessageRole, Project, SessionStatus, Ticket, TicketStatus,
};
use drover_harness::shutdown::{StopReason, StopToken};
use drover_store::{MessageMeta, Store};
use tracing::{debug, error, info, warn};

#[derive(Debug, thiserror::Error)]
pub enum SchedulerError {
    #[error("store error: {0}")]
    Store(#[from] drover_store::StoreError),
}

pub type Result<T> = std::result::Result<T, SchedulerError>;

/// What one tick did.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TickReport {
    pub dispatched: usize,
    pub active_workers: usize,
}

/// Everything a worker needs, passed explicitly — no process globals.
pub struct SchedulerCtx {
    pub store: Arc<Store>,
    pub bus: EventBus,
    pub notifier: Arc<Notifier>,
    pub runners: RunnerRegistry,
    pub spawner: Arc<dyn AgentSpawner>,
    pub settings: RunnerSettings,
    pub builder: Arc<ContextBuilder>,
    pub summarizer: Arc<Summarizer>,
    pub clock: Arc<dyn Clock>,
    pub config: SchedulerConfig,
    pub providers: ProvidersConfig,
    pub review_delay: Duration,
    pub summarize_threshold: i64,
}

pub struct TicketScheduler {
    ctx: Arc<SchedulerCtx>,
    /// One worker per project, keyed by project id.
    workers: Mutex<HashMap<i64, tokio::task::JoinHandle<()>>>,
    /// Drives the rotating probe order.
    tick_counter: AtomicUsize,
}

impl TicketScheduler {
    pub fn new(ctx: Arc<SchedulerCtx>) -> Self {
        Self {
            ctx,
            workers: Mutex::new(HashMap::new()),
            tick_counter: AtomicUsize::new(0),
        }
    }

    /// One scheduling pass. All selection decisions serialize here; the
    /// caller runs ticks strictly one at a time.
    pub async fn tick(&self) -> Result<TickReport> {
        // Release the slots of finished workers before selecting.
        {
            let mut workers = self.workers.lock().expect("workers lock poisoned");
            workers.retain(|_, handle| !handle.is_finished());
        }

        let projects = self.ctx.store.list_active_projects().await?;
        if projects.is_empty() {
            return Ok(TickReport::default());
        }

        // Rotate the probe order so a project with a deep forced queue
        // cannot starve the others at the global cap.
        let offset = self.tick_counter.fetch_add(1, Ordering::Relaxed) % projects.len();
        let mut dispatched = 0;

        for project in projects.iter().cycle().skip(offset).take(projects.len()) {
            {
                let workers = self.workers.lock().expect("workers lock poisoned");
                if workers.contains_key(&project.id) {
                    continue;
                }
                if workers.len() >= self.ctx.config.max_parallel_projects {
                    break;
                }
            }

            let Some(ticket) = self.ctx.store.select_next_ticket(project.id).await? else {
                continue;
            };
            let session_id = match self.ctx.store.claim_ticket(ticket.id).await {
                Ok(session_id) => session_id,
                Err(e) => {
                    // Someone else moved the ticket between selection and
                    // claim; the next tick re-selects.
                    debug!(ticket_id = ticket.id, error = %e, "claim lost");
                    continue;
                }
            };

            info!(
                ticket_id = ticket.id,
                ticket_number = %ticket.ticket_number,
                project = %project.code,
                session_id,
                "dispatching ticket"
            );
            let ctx = Arc::clone(&self.ctx);
            let project = project.clone();
            let project_id = project.id;
            let handle = tokio::spawn(async move {
                run_worker(ctx, project, ticket, session_id).await;
            });
            self.workers
                .lock()
                .expect("workers lock poisoned")
                .insert(project_id, handle);
            dispatched += 1;
        }

        let active_workers = self.workers.lock().expect("workers lock poisoned").len();
        Ok(TickReport {
            dispatched,
            active_workers,
        })
    }

    /// Wait for every in-flight worker to finish (shutdown, tests).
    pub async fn drain(&self) {
        let handles: Vec<_> = {
            let mut workers = self.workers.lock().expect("workers lock poisoned");
            workers.drain().map(|(_, handle)| handle).collect()
        };
        for handle in handles {
            if let Err(e) = handle.await {
                error!(error = %e, "worker task panicked");
            }
        }
    }

    pub fn active_workers(&self) -> usize {
        self.workers.lock().expect("workers lock poisoned").len()
    }
}

// ---------------------------------------------------------------------------
// Worker
// ---------------------------------------------------------------------------

/// Top-level worker wrapper: errors are logged, never propagated into the
/// scheduler loop.
async fn run_worker(ctx: Arc<SchedulerCtx>, project: Project, ticket: Ticket, session_id: i64) {
    if let Err(e) = run_worker_inner(&ctx, &project, &ticket, session_id).await {
        error!(
            ticket_id = ticket.id,
            session_id,
            error = %e,
            "worker failed while finalizing ticket"
        );
    }
}

async fn run_worker_inner(
    ctx: &SchedulerCtx,
    project: &Project,
    ticket: &Ticket,
    session_id: i64,
) -> Result<()> {
    let store = ctx.store.as_ref();

    // Compress an oversize conversation before assembling the envelope.
    match store.unsummarized_token_total(ticket.id).await {
        Ok(total) if total > ctx.summarize_threshold => {
            if let Err(e) = ctx.summarizer.summarize_ticket(store, ticket).await {
                warn!(ticket_id = ticket.id, error = %e, "pre-dispatch summarization failed");
            }
        }
        Ok(_) => {}
        Err(e) => warn!(ticket_id = ticket.id, error = %e, "token total unavailable"),
    }

    let Some(working_dir) = project.working_dir().map(std::path::PathBuf::from) else {
        let report = RunReport {
            verdict: RunVerdict::SpawnFailed {
                detail: format!("project {} has no working directory", project.code),
            },
            input_tokens: 0,
            output_tokens: 0,
            api_calls: 0,
            exit_code: None,
        };
        return handle_outcome(ctx, ticket, session_id, report).await;
    };

    let envelope = match ctx
        .builder
        .build(store, &ctx.bus, project, ticket, None)
        .await
    {
        Ok(envelope) => envelope,
        Err(e) => {
            let report = RunReport {
                verdict: RunVerdict::SpawnFailed {
                    detail: format!("context assembly failed: {e}"),
                },
                input_tokens: 0,
                output_tokens: 0,
                api_calls: 0,
                exit_code: None,
            };
            return handle_outcome(ctx, ticket, session_id, report).await;
        }
    };

    let launch = AgentLaunch {
        ticket_id: ticket.id,
        prompt: envelope.render(),
        working_dir,
        mode: ticket.effective_execution_mode(project),
        model: ctx
            .providers
            .model_for(ticket.effective_model_tier(project))
            .to_string(),
    };

    let stop = StopToken::new();
    let (inject_tx, inject_rx) = flume::unbounded();
    ctx.runners.register(
        ticket.id,
        LiveRunner {
            stop: stop.clone(),
            inject: inject_tx,
            session_id,
        },
    );
    publish_status(ctx, ticket, TicketStatus::InProgress, None);

    let runner = AgentRunner::new(Arc::clone(&ctx.spawner), ctx.settings.clone());
    let report = runner
        .run(&launch, inject_rx, stop, store, session_id, &ctx.bus)
        .await;
    ctx.runners.remove(ticket.id);

    handle_outcome(ctx, ticket, session_id, report).await
}

// ---------------------------------------------------------------------------
// Outcome handling
// ---------------------------------------------------------------------------

async fn handle_outcome(
    ctx: &SchedulerCtx,
    ticket: &Ticket,
    session_id: i64,
    report: RunReport,
) -> Result<()> {
    let store = ctx.store.as_ref();

    match report.verdict {
        RunVerdict::TurnComplete => {
            store.finish_session(session_id, SessionStatus::Completed).await?;
            store
                .transition_ticket(ticket.id, TicketStatus::AwaitingInput, None)
                .await?;
            store
                .schedule_review(ticket.id, ctx.clock.now() + ctx.review_delay)
                .await?;
            publish_status(ctx, ticket, TicketStatus::AwaitingInput, None);
            ctx.notifier.ticket_awaiting(ticket, None).await;
        }
        RunVerdict::Permission { tool, .. } => {
            store.finish_session(session_id, SessionStatus::Completed).await?;
            store
                .transition_ticket(
                    ticket.id,
                    TicketStatus::AwaitingInput,
                    Some(AwaitingReason::Permission),
                )
                .await?;
            publish_status(
                ctx,
                ticket,
                TicketStatus::AwaitingInput,
                Some(AwaitingReason::Permission),
            );
            info!(ticket_id = ticket.id, tool = %tool, "awaiting permission approval");
            ctx.notifier
                .ticket_awaiting(ticket, Some(AwaitingReason::Permission))
                .await;
        }
        RunVerdict::AgentError { ref detail } | RunVerdict::SpawnFailed { ref detail } => {
            store.finish_session(session_id, SessionStatus::Failed).await?;
            // The conversation always explains the outcome.
            store
                .append_message(
                    ticket.id,
                    MessageRole::System,
                    &format!("Agent session failed: {detail}"),
                    MessageMeta::default(),
                )
                .await?;
            store
                .transition_ticket(ticket.id, TicketStatus::Failed, None)
                .await?;
            publish_status(ctx, ticket, TicketStatus::Failed, None);

            let retry_count = store.bump_retry(ticket.id).await?;
            if retry_count < ticket.max_retries {
                let cooldown = Duration::minutes(ctx.config.retry_cooldown_minutes as i64);
                store
                    .set_retry_after(ticket.id, Some(ctx.clock.now() + cooldown))
                    .await?;
                store
                    .transition_ticket(ticket.id, TicketStatus::Open, None)
                    .await?;
                publish_status(ctx, ticket, TicketStatus::Open, None);
                info!(
                    ticket_id = ticket.id,
                    retry_count, "ticket will retry after cooldown"
                );
            } else {
                warn!(ticket_id = ticket.id, retry_count, "retries exhausted");
            }
            if let Some(fresh) = store.get_ticket(ticket.id).await? {
                ctx.notifier.ticket_failed(&fresh).await;
            }
        }
        RunVerdict::RateLimited => {
            store.finish_session(session_id, SessionStatus::Failed).await?;
            let cooldown = Duration::minutes(ctx.config.rate_limit_cooldown_minutes as i64);
            store
                .set_retry_after(ticket.id, Some(ctx.clock.now() + cooldown))
                .await?;
            // Upstream pressure is not the ticket's fault: back off without
            // consuming a retry.
            store
                .transition_ticket(ticket.id, TicketStatus::Failed, None)
                .await?;
            store
                .transition_ticket(ticket.id, TicketStatus::Open, None)
                .await?;
            publish_status(ctx, ticket, TicketStatus::Open, None);
            info!(
                ticket_id = ticket.id,
                cooldown_minutes = ctx.config.rate_limit_cooldown_minutes,
                "rate limited, cooling down"
            );
        }
        RunVerdict::Stopped {
            reason: StopReason::Watchdog,
        } => {
            store.finish_session(session_id, SessionStatus::Stuck).await?;
            store
                .transition_ticket(ticket.id, TicketStatus::Stuck, None)
                .await?;
            publish_status(ctx, ticket, TicketStatus::Stuck, None);
        }
        RunVerdict::Stopped { reason } => {
            store.finish_session(session_id, SessionStatus::Stopped).await?;
            store.cancel_review(ticket.id).await?;
            store
                .transition_ticket(
                    ticket.id,
                    TicketStatus::AwaitingInput,
                    Some(AwaitingReason::Stopped),
                )
                .await?;
            publish_status(
                ctx,
                ticket,
                TicketStatus::AwaitingInput,
                Some(AwaitingReason::Stopped),
            );
            info!(ticket_id = ticket.id, ?reason, "session stopped");
            ctx.notifier
                .ticket_awaiting(ticket, Some(AwaitingReason::Stopped))
                .await;
        }
        RunVerdict::StuckTimeout => {
            store.finish_session(session_id, SessionStatus::Stuck).await?;
            store
                .append_message(
                    ticket.id,
                    MessageRole::System,
                    "Execution stopped: no agent output within the stuck ceiling.",
                    MessageMeta::default(),
                )
                .await?;
            store
                .transition_ticket(
                    ticket.id,
                    TicketStatus::AwaitingInput,
                    Some(AwaitingReason::Stuck),
                )
                .await?;
            publish_status(
                ctx,
                ticket,
                TicketStatus::AwaitingInput,
                Some(AwaitingReason::Stuck),
            );
            ctx.notifier
                .ticket_stuck(ticket, "no output within the stuck ceiling")
                .await;
        }
    }
    Ok(())
}

fn publish_status(
    ctx: &SchedulerCtx,
    ticket: &Ticket,
    status: TicketStatus,
    reason: Option<AwaitingReason>,
) {
    ctx.bus.publish(
        Topic::Ticket(ticket.id),
        BusEvent::TicketStatus {
            ticket_id: ticket.id,
            ticket_number: ticket.ticket_number.clone(),
            status,
            reason,
        },
    );
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
