//! AgentRunner — spawns the external agent CLI as a piped child process,
//! streams and interprets its stdout events, relays injected user messages
//! to its stdin, and enforces the stuck ceiling and the kill switch.
//!
//! The spawner is a trait seam: production uses [`ProcessSpawner`]
//! (tokio::process), tests use [`ScriptSpawner`] with canned stdout lines.

use std::path::PathBuf;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use drover_bridge::event_bus::EventBus;
use drover_bridge::protocol::{BusEvent, Topic};
use drover_core::config::AgentConfig;
use drover_core::types::{ExecutionMode, MessageRole};
use drover_harness::shutdown::{StopReason, StopToken};
use drover_store::{MessageMeta, Store};
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::time::Instant;
use tracing::{debug, error, info, warn};

use crate::events::{parse_line, AgentEvent, ParsedLine};
use crate::permission;

// ---------------------------------------------------------------------------
// Settings and launch description
// ---------------------------------------------------------------------------

#[derive(Debug, Clone)]
pub struct RunnerSettings {
    pub binary: String,
    pub skip_permissions_flag: String,
    pub extra_args: Vec<String>,
    pub pass_env: Vec<String>,
    pub stuck_timeout: Duration,
    pub kill_grace: Duration,
}

impl RunnerSettings {
    pub fn from_config(config: &AgentConfig) -> Self {
        Self {
            binary: config.binary.clone(),
            skip_permissions_flag: config.skip_permissions_flag.clone(),
            extra_args: config.extra_args.clone(),
            pass_env: config.pass_env.clone(),
            stuck_timeout: Duration::from_secs(config.stuck_timeout_minutes * 60),
            kill_grace: Duration::from_secs(config.kill_grace_secs),
        }
    }
}

/// Everything one invocation needs.
#[derive(Debug, Clone)]
pub struct AgentLaunch {
    pub ticket_id: i64,
    pub prompt: String,
    pub working_dir: PathBuf,
    pub mode: ExecutionMode,
    pub model: String,
}

// ---------------------------------------------------------------------------
// Verdicts
// ---------------------------------------------------------------------------

/// How a session ended.
#[derive(Debug, Clone, PartialEq)]
pub enum RunVerdict {
    /// The agent finished its turn cleanly.
    TurnComplete,
    /// The agent asked for a permission it does not have.
    Permission {
        tool: String,
        input: serde_json::Value,
    },
    /// The agent exited with an error that is not a rate limit.
    AgentError { detail: String },
    /// Upstream 429/overload; cool down without burning a retry.
    RateLimited,
    /// The kill switch fired.
    Stopped { reason: StopReason },
    /// No stdout activity for the hard per-session ceiling.
    StuckTimeout,
    /// The child process could not be started.
    SpawnFailed { detail: String },
}

/// Terminal session outcome plus aggregates.
#[derive(Debug, Clone, PartialEq)]
pub struct RunReport {
    pub verdict: RunVerdict,
    pub input_tokens: i64,
    pub output_tokens: i64,
    pub api_calls: i64,
    pub exit_code: Option<i32>,
}

impl RunReport {
    fn spawn_failed(detail: impl Into<String>) -> Self {
        Self {
            verdict: RunVerdict::SpawnFailed {
                detail: detail.into(),
            },
            input_tokens: 0,
            output_tokens: 0,
            api_calls: 0,
            exit_code: None,
        }
    }
}

/// Upstream backoff signals in agent error output.
pub fn is_rate_limit_signal(text: &str) -> bool {
    static PATTERN: &str = r"(?i)rate.?limit|\b429\b|overloaded|quota exceeded|too many requests";
    regex::Regex::new(PATTERN)
        .expect("valid rate limit regex")
        .is_match(text)
}

// ---------------------------------------------------------------------------
// Spawner seam
// ---------------------------------------------------------------------------

/// Handle to a spawned child's lifecycle, independent of transport.
#[async_trait]
pub trait ChildHandle: Send + Sync {
    /// Ask the child to terminate (SIGTERM).
    fn signal_term(&self);
    /// Non-catchable kill.
    async fn force_kill(&self);
    /// Reap the child; returns the exit code when known.
    async fn wait_exit(&self) -> Option<i32>;
}

/// A spawned agent: stdout lines in, stdin lines out, lifecycle handle.
pub struct AgentChild {
    pub lines: flume::Receiver<String>,
    stdin_tx: flume::Sender<String>,
    pub handle: Arc<dyn ChildHandle>,
}

impl AgentChild {
    pub fn new(
        lines: flume::Receiver<String>,
        stdin_tx: flume::Sender<String>,
        handle: Arc<dyn ChildHandle>,
    ) -> Self {
        Self {
            lines,
            stdin_tx,
            handle,
        }
    }

    /// Queue a line for the child's stdin.
    pub fn send_line(&self, line: &str) -> std::result::Result<(), String> {
        self.stdin_tx
            .send(line.to_string())
            .map_err(|e| format!("stdin closed: {e}"))
    }
}

/// Abstraction over child spawning so tests can script sessions.
pub trait AgentSpawner: Send + Sync {
    fn spawn(
        &self,
        settings: &RunnerSettings,
        launch: &AgentLaunch,
    ) -> std::result::Result<AgentChild, String>;
}

// ---------------------------------------------------------------------------
// ProcessSpawner — the real thing
// ---------------------------------------------------------------------------

/// Spawns the agent binary with piped stdio under the daemon's account.
pub struct ProcessSpawner;

enum ChildState {
    Running(tokio::process::Child),
    Done(Option<i32>),
}

struct ProcessHandle {
    pid: Option<u32>,
    state: tokio::sync::Mutex<ChildState>,
}

#[async_trait]
impl ChildHandle for ProcessHandle {
    fn signal_term(&self) {
        #[cfg(unix)]
        if let Some(pid) = self.pid {
            unsafe {
                libc::kill(pid as i32, libc::SIGTERM);
            }
        }
    }

    async fn force_kill(&self) {
        let mut state = self.state.lock().await;
        if let ChildState::Running(child) = &mut *state {
            if let Err(e) = child.start_kill() {
                warn!(error = %e, "force kill failed");
            }
        }
    }

    async fn wait_exit(&self) -> Option<i32> {
        let mut state = self.state.lock().await;
        match &mut *state {
            ChildState::Running(child) => {
                let code = child.wait().await.ok().and_then(|status| status.code());
                *state = ChildState::Done(code);
                code
            }
            ChildState::Done(code) => *code,
        }
    }
}

impl AgentSpawner for ProcessSpawner {
    fn spawn(
        &self,
        settings: &RunnerSettings,
        launch: &AgentLaunch,
    ) -> std::result::Result<AgentChild, String> {
        let mut args = settings.extra_args.clone();
        args.push("--model".into());
        args.push(launch.model.clone());
        match launch.mode {
            ExecutionMode::Autonomous => args.push(settings.skip_permissions_flag.clone()),
            ExecutionMode::SemiAutonomous => {
                permission::write_hook_config(&launch.working_dir, launch.ticket_id)
                    .map_err(|e| format!("hook config: {e}"))?;
            }
            ExecutionMode::Supervised => {}
        }

        let mut cmd = tokio::process::Command::new(&settings.binary);
        cmd.args(&args)
            .current_dir(&launch.working_dir)
            .stdin(std::process::Stdio::piped())
            .stdout(std::process::Stdio::piped())
            .env_clear();

        // Minimal environment: shell basics, the agent's auth material, and
        // the ticket coordinates. The core's own secrets never cross over.
        for key in ["PATH", "HOME", "LANG", "TERM"] {
            if let Ok(value) = std::env::var(key) {
                cmd.env(key, value);
            }
        }
        for key in &settings.pass_env {
            if let Ok(value) = std::env::var(key) {
                cmd.env(key, value);
            }
        }
        cmd.env("DROVER_TICKET_ID", launch.ticket_id.to_string());
        cmd.env("DROVER_PROJECT_PATH", &launch.working_dir);

        let mut child = cmd.spawn().map_err(|e| format!("spawn failed: {e}"))?;
        let pid = child.id();

        let stdout = child
            .stdout
            .take()
            .ok_or_else(|| "child stdout not piped".to_string())?;
        let mut stdin = child
            .stdin
            .take()
            .ok_or_else(|| "child stdin not piped".to_string())?;

        let (line_tx, line_rx) = flume::bounded::<String>(1024);
        tokio::spawn(async move {
            let mut lines = BufReader::new(stdout).lines();
            while let Ok(Some(line)) = lines.next_line().await {
                if line_tx.send_async(line).await.is_err() {
                    break;
                }
            }
            // tx drops here; the runner sees EOF as a disconnect.
        });

        let (stdin_tx, stdin_rx) = flume::bounded::<String>(64);
        tokio::spawn(async move {
            while let Ok(line) = stdin_rx.recv_async().await {
                if stdin.write_all(line.as_bytes()).await.is_err() {
                    break;
                }
                if stdin.write_all(b"\n").await.is_err() {
                    break;
                }
                if stdin.flush().await.is_err() {
                    break;
                }
            }
        });

        let handle = Arc::new(ProcessHandle {
            pid,
            state: tokio::sync::Mutex::new(ChildState::Running(child)),
        });
        Ok(AgentChild::new(line_rx, stdin_tx, handle))
    }
}

// ---------------------------------------------------------------------------
// AgentRunner
// ---------------------------------------------------------------------------

enum LoopOutcome {
    Exited,
    ChildEof,
    Permission {
        tool: String,
        input: serde_json::Value,
    },
    Stopped(StopReason),
    Stuck,
}

pub struct AgentRunner {
    spawner: Arc<dyn AgentSpawner>,
    settings: RunnerSettings,
}

impl AgentRunner {
    pub fn new(spawner: Arc<dyn AgentSpawner>, settings: RunnerSettings) -> Self {
        Self { spawner, settings }
    }

    /// Run one agent session to its terminal outcome.
    ///
    /// `injections` carries user messages that arrive while the session is
    /// live; they are coalesced and written to stdin at the next
    /// assistant-message boundary. The runner only ever appends to the
    /// conversation, so a respawn after failure is safe.
    pub async fn run(
        &self,
        launch: &AgentLaunch,
        injections: flume::Receiver<String>,
        stop: StopToken,
        store: &Store,
        session_id: i64,
        bus: &EventBus,
    ) -> RunReport {
        let child = match self.spawner.spawn(&self.settings, launch) {
            Ok(child) => child,
            Err(detail) => {
                error!(ticket_id = launch.ticket_id, detail = %detail, "agent spawn failed");
                return RunReport::spawn_failed(detail);
            }
        };
        info!(
            ticket_id = launch.ticket_id,
            session_id,
            model = %launch.model,
            mode = ?launch.mode,
            "agent session started"
        );

        if let Err(e) = child.send_line(&launch.prompt) {
            return RunReport::spawn_failed(e);
        }

        let ticket_id = launch.ticket_id;
        let mut report = RunReport {
            verdict: RunVerdict::TurnComplete,
            input_tokens: 0,
            output_tokens: 0,
            api_calls: 0,
            exit_code: None,
        };
        let mut last_error_text = String::new();
        let mut deadline = Instant::now() + self.settings.stuck_timeout;
        let mut stop_wait = Box::pin(stop.stopped());

        let outcome = loop {
            tokio::select! {
                line = child.lines.recv_async() => {
                    let line = match line {
                        Ok(line) => line,
                        Err(_) => break LoopOutcome::ChildEof,
                    };
                    deadline = Instant::now() + self.settings.stuck_timeout;
                    let Some(parsed) = parse_line(&line) else { continue };
                    match parsed {
                        ParsedLine::Event(event) => {
                            match self
                                .handle_event(
                                    event,
                                    ticket_id,
                                    session_id,
                                    store,
                                    bus,
                                    &child,
                                    &injections,
                                    &mut report,
                                    &mut last_error_text,
                                )
                                .await
                            {
                                Some(outcome) => break outcome,
                                None => continue,
                            }
                        }
                        ParsedLine::Unknown { kind, .. } => {
                            debug!(ticket_id, kind = %kind, "ignoring unknown agent event");
                        }
                        ParsedLine::Malformed(raw) => {
                            debug!(ticket_id, raw = %raw, "ignoring non-event agent output");
                        }
                    }
                }
                reason = &mut stop_wait => {
                    break LoopOutcome::Stopped(reason);
                }
                _ = tokio::time::sleep_until(deadline) => {
                    warn!(ticket_id, "no agent output within the stuck ceiling");
                    break LoopOutcome::Stuck;
                }
            }
        };

        match outcome {
            LoopOutcome::Exited | LoopOutcome::ChildEof => {
                let code = match report.exit_code {
                    Some(code) => Some(code),
                    None => self.reap(&child).await,
                };
                report.exit_code = code;
                report.verdict = match code {
                    Some(0) => RunVerdict::TurnComplete,
                    _ => {
                        if is_rate_limit_signal(&last_error_text) {
                            RunVerdict::RateLimited
                        } else {
                            RunVerdict::AgentError {
                                detail: if last_error_text.is_empty() {
                                    format!("agent exited with code {code:?}")
                                } else {
                                    last_error_text.clone()
                                },
                            }
                        }
                    }
                };
            }
            LoopOutcome::Permission { tool, input } => {
                report.exit_code = self.kill_child(&child).await;
                report.verdict = RunVerdict::Permission { tool, input };
            }
            LoopOutcome::Stopped(reason) => {
                report.exit_code = self.kill_child(&child).await;
                report.verdict = RunVerdict::Stopped { reason };
            }
            LoopOutcome::Stuck => {
                report.exit_code = self.kill_child(&child).await;
                report.verdict = RunVerdict::StuckTimeout;
            }
        }

        info!(
            ticket_id,
            session_id,
            verdict = ?report.verdict,
            api_calls = report.api_calls,
            "agent session finished"
        );
        report
    }

    #[allow(clippy::too_many_arguments)]
    async fn handle_event(
        &self,
        event: AgentEvent,
        ticket_id: i64,
        session_id: i64,
        store: &Store,
        bus: &EventBus,
        child: &AgentChild,
        injections: &flume::Receiver<String>,
        report: &mut RunReport,
        last_error_text: &mut String,
    ) -> Option<LoopOutcome> {
        match event {
            AgentEvent::AssistantMessage { content } => {
                self.append(store, bus, ticket_id, MessageRole::Assistant, &content, MessageMeta::default())
                    .await;
                bus.publish(
                    Topic::Ticket(ticket_id),
                    BusEvent::AgentOutput {
                        ticket_id,
                        content: content.clone(),
                    },
                );
                // Assistant-turn boundary: flush any queued user messages,
                // coalesced into one stdin write.
                let pending: Vec<String> = injections.try_iter().collect();
                if !pending.is_empty() {
                    let joined = pending.join("\n\n");
                    if let Err(e) = child.send_line(&joined) {
                        warn!(ticket_id, error = %e, "failed to inject user message");
                    } else {
                        debug!(ticket_id, count = pending.len(), "injected user messages");
                    }
                }
                None
            }
            AgentEvent::ToolUse { name, input } => {
                self.append(
                    store,
                    bus,
                    ticket_id,
                    MessageRole::ToolUse,
                    "",
                    MessageMeta {
                        tool_name: Some(name),
                        tool_input: Some(input),
                        token_count: None,
                    },
                )
                .await;
                None
            }
            AgentEvent::ToolResult { content, is_error } => {
                if is_error {
                    *last_error_text = content.clone();
                }
                self.append(store, bus, ticket_id, MessageRole::ToolResult, &content, MessageMeta::default())
                    .await;
                None
            }
            AgentEvent::Usage {
                input_tokens,
                output_tokens,
                ..
            } => {
                report.input_tokens += input_tokens;
                report.output_tokens += output_tokens;
                report.api_calls += 1;
                if let Err(e) = store.record_usage(session_id, input_tokens, output_tokens).await {
                    warn!(ticket_id, error = %e, "failed to record usage");
                }
                bus.publish(
                    Topic::Ticket(ticket_id),
                    BusEvent::UsageUpdate {
                        ticket_id,
                        input_tokens,
                        output_tokens,
                    },
                );
                None
            }
            AgentEvent::PermissionRequest { tool, input } => {
                let record = serde_json::json!({
                    "permission_request": { "tool": tool, "input": input }
                });
                self.append(
                    store,
                    bus,
                    ticket_id,
                    MessageRole::System,
                    &record.to_string(),
                    MessageMeta::default(),
                )
                .await;
                bus.publish(
                    Topic::Ticket(ticket_id),
                    BusEvent::PermissionRequested {
                        ticket_id,
                        tool: tool.clone(),
                        input: input.clone(),
                    },
                );
                Some(LoopOutcome::Permission { tool, input })
            }
            AgentEvent::Exit { code } => {
                report.exit_code = Some(code);
                Some(LoopOutcome::Exited)
            }
        }
    }

    async fn append(
        &self,
        store: &Store,
        bus: &EventBus,
        ticket_id: i64,
        role: MessageRole,
        content: &str,
        meta: MessageMeta,
    ) {
        match store.append_message(ticket_id, role, content, meta).await {
            Ok(message_id) => {
                bus.publish(
                    Topic::Ticket(ticket_id),
                    BusEvent::MessageAppended {
                        ticket_id,
                        message_id,
                        role,
                    },
                );
            }
            Err(e) => {
                error!(ticket_id, error = %e, "failed to append message");
            }
        }
    }

    /// Termination ladder: SIGTERM, then a non-catchable kill after the
    /// grace window.
    async fn kill_child(&self, child: &AgentChild) -> Option<i32> {
        child.handle.signal_term();
        match tokio::time::timeout(self.settings.kill_grace, child.handle.wait_exit()).await {
            Ok(code) => code,
            Err(_) => {
                warn!("child ignored SIGTERM, escalating");
                child.handle.force_kill().await;
                tokio::time::timeout(self.settings.kill_grace, child.handle.wait_exit())
                    .await
                    .ok()
                    .flatten()
            }
        }
    }

    async fn reap(&self, child: &AgentChild) -> Option<i32> {
        tokio::time::timeout(self.settings.kill_grace, child.handle.wait_exit())
            .await
            .ok()
            .flatten()
    }
}

// ---------------------------------------------------------------------------
// RunnerRegistry — live sessions by ticket
// ---------------------------------------------------------------------------

/// Handles to one live session: its kill switch and its stdin injection
/// channel.
#[derive(Clone)]
pub struct LiveRunner {
    pub stop: StopToken,
    pub inject: flume::Sender<String>,
    pub session_id: i64,
}

/// Shared map of live runners keyed by ticket id.
///
/// The scheduler registers a worker before its session starts and removes
/// it after; the watchdog, the inbound notification handler, and the
/// daemon's shutdown path reach runners through here.
#[derive(Clone, Default)]
pub struct RunnerRegistry {
    inner: Arc<dashmap::DashMap<i64, LiveRunner>>,
}

impl RunnerRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&self, ticket_id: i64, runner: LiveRunner) {
        self.inner.insert(ticket_id, runner);
    }

    pub fn remove(&self, ticket_id: i64) {
        self.inner.remove(&ticket_id);
    }

    pub fn is_live(&self, ticket_id: i64) -> bool {
        self.inner.contains_key(&ticket_id)
    }

    pub fn live_count(&self) -> usize {
        self.inner.len()
    }

    /// Trigger the kill switch for a ticket's session. Returns `false`
    /// when no runner is live.
    pub fn stop(&self, ticket_id: i64, reason: StopReason) -> bool {
        match self.inner.get(&ticket_id) {
            Some(entry) => {
                entry.stop.stop(reason);
                true
            }
            None => false,
        }
    }

    /// Queue a user message for injection into a live session. Returns
    /// `false` when no runner is live (callers reopen the ticket instead).
    pub fn inject(&self, ticket_id: i64, content: &str) -> bool {
        match self.inner.get(&ticket_id) {
            Some(entry) => entry.inject.send(content.to_string()).is_ok(),
            None => false,
        }
    }

    /// Stop every live session (daemon shutdown).
    pub fn stop_all(&self, reason: StopReason) {
        for entry in self.inner.iter() {
            entry.stop.stop(reason);
        }
    }
}

// ---------------------------------------------------------------------------
// ScriptSpawner — scripted sessions for tests
// ---------------------------------------------------------------------------

/// Test spawner that replays a fixed stdout script and records stdin.
///
/// With `hang_after_script` the child stays alive after the script (no
/// EOF), which is how stuck-ceiling and kill-switch paths are exercised.
pub struct ScriptSpawner {
    script: Vec<String>,
    exit_code: Option<i32>,
    hang_after_script: bool,
    fail_spawn: Option<String>,
    sent: Arc<Mutex<Vec<String>>>,
}

impl ScriptSpawner {
    pub fn new(script: Vec<String>, exit_code: Option<i32>) -> Self {
        Self {
            script,
            exit_code,
            hang_after_script: false,
            fail_spawn: None,
            sent: Arc::new(Mutex::new(Vec::new())),
        }
    }

    pub fn hanging(script: Vec<String>) -> Self {
        Self {
            script,
            exit_code: Some(-1),
            hang_after_script: true,
            fail_spawn: None,
            sent: Arc::new(Mutex::new(Vec::new())),
        }
    }

    pub fn failing(detail: impl Into<String>) -> Self {
        Self {
            script: Vec::new(),
            exit_code: None,
            hang_after_script: false,
            fail_spawn: Some(detail.into()),
            sent: Arc::new(Mutex::new(Vec::new())),
        }
    }

    /// Lines written to the child's stdin so far.
    pub fn stdin_lines(&self) -> Vec<String> {
        self.sent.lock().expect("sent lock poisoned").clone()
    }
}

struct ScriptHandle {
    tx_slot: Mutex<Option<flume::Sender<String>>>,
    exit_code: Option<i32>,
}

#[async_trait]
impl ChildHandle for ScriptHandle {
    fn signal_term(&self) {
        // Dropping the sender is the mock's process exit.
        self.tx_slot.lock().expect("tx slot lock poisoned").take();
    }

    async fn force_kill(&self) {
        self.tx_slot.lock().expect("tx slot lock poisoned").take();
    }

    async fn wait_exit(&self) -> Option<i32> {
        self.exit_code
    }
}

impl AgentSpawner for ScriptSpawner {
    fn spawn(
        &self,
        _settings: &RunnerSettings,
        _launch: &AgentLaunch,
    ) -> std::result::Result<AgentChild, String> {
        if let Some(detail) = &self.fail_spawn {
            return Err(detail.clone());
        }

        let (line_tx, line_rx) = flume::bounded::<String>(1024);
        for line in &self.script {
            let _ = line_tx.send(line.clone());
        }
        let tx_slot = if self.hang_after_script {
            // Park the sender in the handle; signal_term drops it.
            Mutex::new(Some(line_tx))
        } else {
            drop(line_tx);
            Mutex::new(None)
        };

        let (stdin_tx, stdin_rx) = flume::unbounded::<String>();
        let sent = Arc::clone(&self.sent);
        tokio::spawn(async move {
            while let Ok(line) = stdin_rx.recv_async().await {
                sent.lock().expect("sent lock poisoned").push(line);
            }
        });

        let handle = Arc::new(ScriptHandle {
            tx_slot,
            exit_code: self.exit_code,
        });
        Ok(AgentChild::new(line_rx, stdin_tx, handle))
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
    use drover_core::types::{NewProject, NewTicket, Ticket};

    fn settings() -> RunnerSettings {
        RunnerSettings {
            binary: "agent".into(),
            skip_permissions_flag: "--skip".into(),
            extra_args: Vec::new(),
            pass_env: Vec::new(),
            stuck_timeout: Duration::from_secs(60),
            kill_grace: Duration::from_millis(100),
        }
    }

    fn launch(ticket_id: i64) -> AgentLaunch {
        AgentLaunch {
            ticket_id,
            prompt: "do the work".into(),
            working_dir: PathBuf::from("/tmp"),
            mode: ExecutionMode::Supervised,
            model: "claude-sonnet-4-5".into(),
        }
    }

    async fn seed() -> (Store, Ticket, i64) {
        let clock = ManualClock::new(Utc::now());
        let store = Store::new_in_memory(Arc::new(clock)).await.unwrap();
        let project = store
            .create_project(NewProject::new("SHOP", "Shop"))
            .await
            .unwrap();
        let ticket = store
            .create_ticket(NewTicket::new(project.id, "fix login"))
            .await
            .unwrap();
        let session_id = store.claim_ticket(ticket.id).await.unwrap();
        (store, ticket, session_id)
    }

    fn line(json: serde_json::Value) -> String {
        json.to_string()
    }

    #[tokio::test]
    async fn clean_turn_appends_messages_and_usage() {
        let (store, ticket, session_id) = seed().await;
        let spawner = Arc::new(ScriptSpawner::new(
            vec![
                line(serde_json::json!({"type":"assistant_message","content":"working on it"})),
                line(serde_json::json!({"type":"tool_use","name":"shell","input":{"command":"npm test"}})),
                line(serde_json::json!({"type":"tool_result","content":"all green"})),
                line(serde_json::json!({"type":"usage","input_tokens":120,"output_tokens":30})),
                line(serde_json::json!({"type":"assistant_message","content":"Task completed."})),
                line(serde_json::json!({"type":"exit","code":0})),
            ],
            Some(0),
        ));
        let bus = EventBus::new();
        let rx = bus.subscribe_ticket(ticket.id);
        let runner = AgentRunner::new(spawner.clone(), settings());
        let (_tx, injections) = flume::unbounded();

        let report = runner
            .run(&launch(ticket.id), injections, StopToken::new(), &store, session_id, &bus)
            .await;

        assert_eq!(report.verdict, RunVerdict::TurnComplete);
        assert_eq!(report.exit_code, Some(0));
        assert_eq!(report.api_calls, 1);
        assert_eq!(report.input_tokens, 120);

        let messages = store.messages(ticket.id).await.unwrap();
        assert_eq!(messages.len(), 4);
        assert_eq!(messages[0].role, MessageRole::Assistant);
        assert_eq!(messages[1].tool_name.as_deref(), Some("shell"));
        assert_eq!(messages[3].content, "Task completed.");

        let session = store.get_session(session_id).await.unwrap().unwrap();
        assert_eq!(session.input_tokens, 120);
        assert_eq!(session.api_calls, 1);

        // Prompt reached stdin; bus saw output events.
        assert_eq!(spawner.stdin_lines(), vec!["do the work".to_string()]);
        assert!(rx.len() >= 4);
    }

    #[tokio::test]
    async fn queued_messages_inject_at_assistant_boundary() {
        let (store, ticket, session_id) = seed().await;
        let spawner = Arc::new(ScriptSpawner::new(
            vec![
                line(serde_json::json!({"type":"assistant_message","content":"first turn"})),
                line(serde_json::json!({"type":"exit","code":0})),
            ],
            Some(0),
        ));
        let bus = EventBus::new();
        let runner = AgentRunner::new(spawner.clone(), settings());

        let (tx, injections) = flume::unbounded();
        tx.send("also add tests".to_string()).unwrap();
        tx.send("and update docs".to_string()).unwrap();

        let report = runner
            .run(&launch(ticket.id), injections, StopToken::new(), &store, session_id, &bus)
            .await;
        assert_eq!(report.verdict, RunVerdict::TurnComplete);

        // Give the mock stdin task a beat to drain.
        tokio::time::sleep(Duration::from_millis(20)).await;
        let sent = spawner.stdin_lines();
        assert_eq!(sent.len(), 2);
        assert_eq!(sent[0], "do the work");
        assert_eq!(sent[1], "also add tests\n\nand update docs");
    }

    #[tokio::test]
    async fn permission_request_ends_the_turn() {
        let (store, ticket, session_id) = seed().await;
        let spawner = Arc::new(ScriptSpawner::hanging(vec![line(serde_json::json!({
            "type": "permission_request",
            "tool": "shell",
            "input": {"command": "rm -rf node_modules"}
        }))]));
        let bus = EventBus::new();
        let runner = AgentRunner::new(spawner, settings());
        let (_tx, injections) = flume::unbounded();

        let report = runner
            .run(&launch(ticket.id), injections, StopToken::new(), &store, session_id, &bus)
            .await;

        match report.verdict {
            RunVerdict::Permission { tool, .. } => assert_eq!(tool, "shell"),
            other => panic!("unexpected verdict: {other:?}"),
        }
        // The pending request was persisted on the conversation.
        let messages = store.messages(ticket.id).await.unwrap();
        assert_eq!(messages.len(), 1);
        assert_eq!(messages[0].role, MessageRole::System);
        assert!(messages[0].content.contains("permission_request"));
    }

    #[tokio::test]
    async fn rate_limit_exit_is_recognized() {
        let (store, ticket, session_id) = seed().await;
        let spawner = Arc::new(ScriptSpawner::new(
            vec![
                line(serde_json::json!({"type":"tool_result","content":"API error 429: rate limit exceeded","is_error":true})),
                line(serde_json::json!({"type":"exit","code":1})),
            ],
            Some(1),
        ));
        let bus = EventBus::new();
        let runner = AgentRunner::new(spawner, settings());
        let (_tx, injections) = flume::unbounded();

        let report = runner
            .run(&launch(ticket.id), injections, StopToken::new(), &store, session_id, &bus)
            .await;
        assert_eq!(report.verdict, RunVerdict::RateLimited);
    }

    #[tokio::test]
    async fn generic_error_exit_is_not_rate_limit() {
        let (store, ticket, session_id) = seed().await;
        let spawner = Arc::new(ScriptSpawner::new(
            vec![
                line(serde_json::json!({"type":"tool_result","content":"compile failed: missing semicolon","is_error":true})),
                line(serde_json::json!({"type":"exit","code":1})),
            ],
            Some(1),
        ));
        let bus = EventBus::new();
        let runner = AgentRunner::new(spawner, settings());
        let (_tx, injections) = flume::unbounded();

        let report = runner
            .run(&launch(ticket.id), injections, StopToken::new(), &store, session_id, &bus)
            .await;
        match report.verdict {
            RunVerdict::AgentError { detail } => assert!(detail.contains("compile failed")),
            other => panic!("unexpected verdict: {other:?}"),
        }
    }

    #[tokio::test]
    async fn stop_token_terminates_within_grace() {
        let (store, ticket, session_id) = seed().await;
        let spawner = Arc::new(ScriptSpawner::hanging(vec![line(
            serde_json::json!({"type":"assistant_message","content":"thinking..."}),
        )]));
        let bus = EventBus::new();
        let runner = AgentRunner::new(spawner, settings());
        let (_tx, injections) = flume::unbounded();
        let stop = StopToken::new();

        let stop_clone = stop.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(30)).await;
            stop_clone.stop(StopReason::UserStop);
        });

        let report = runner
            .run(&launch(ticket.id), injections, stop, &store, session_id, &bus)
            .await;
        assert_eq!(
            report.verdict,
            RunVerdict::Stopped {
                reason: StopReason::UserStop
            }
        );
    }

    #[tokio::test]
    async fn silence_past_the_ceiling_is_stuck() {
        let (store, ticket, session_id) = seed().await;
        let spawner = Arc::new(ScriptSpawner::hanging(vec![]));
        let bus = EventBus::new();
        let mut short = settings();
        short.stuck_timeout = Duration::from_millis(50);
        let runner = AgentRunner::new(spawner, short);
        let (_tx, injections) = flume::unbounded();

        let report = runner
            .run(&launch(ticket.id), injections, StopToken::new(), &store, session_id, &bus)
            .await;
        assert_eq!(report.verdict, RunVerdict::StuckTimeout);
    }

    #[tokio::test]
    async fn spawn_failure_is_its_own_verdict() {
        let (store, ticket, session_id) = seed().await;
        let spawner = Arc::new(ScriptSpawner::failing("no such binary"));
        let bus = EventBus::new();
        let runner = AgentRunner::new(spawner, settings());
        let (_tx, injections) = flume::unbounded();

        let report = runner
            .run(&launch(ticket.id), injections, StopToken::new(), &store, session_id, &bus)
            .await;
        assert_eq!(
            report.verdict,
            RunVerdict::SpawnFailed {
                detail: "no such binary".into()
            }
        );
    }

    #[test]
    fn registry_routes_stop_and_injection() {
        let registry = RunnerRegistry::new();
        let stop = StopToken::new();
        let (tx, rx) = flume::unbounded();
        registry.register(
            7,
            LiveRunner {
                stop: stop.clone(),
                inject: tx,
                session_id: 1,
            },
        );

        assert!(registry.is_live(7));
        assert!(registry.inject(7, "more context"));
        assert_eq!(rx.try_recv().unwrap(), "more context");
        assert!(!registry.inject(8, "nobody home"));

        assert!(registry.stop(7, StopReason::UserStop));
        assert_eq!(stop.reason(), Some(StopReason::UserStop));

        registry.remove(7);
        assert!(!registry.is_live(7));
        assert!(!registry.stop(7, StopReason::UserStop));
    }

    #[test]
    fn rate_limit_patterns() {
        assert!(is_rate_limit_signal("Rate limit reached"));
        assert!(is_rate_limit_signal("HTTP 429 from upstream"));
        assert!(is_rate_limit_signal("model overloaded, retry later"));
        assert!(!is_rate_limit_signal("test failed: expected 4290"));
        assert!(!is_rate_limit_signal("syntax error"));
    }
}
