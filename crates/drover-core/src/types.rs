use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

// ---------------------------------------------------------------------------
// TicketStatus
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TicketStatus {
    Open,
    InProgress,
    AwaitingInput,
    Done,
    Failed,
    Stuck,
    Skipped,
}

impl TicketStatus {
    /// Returns `true` when a transition from `self` to `target` is valid.
    ///
    /// Any non-terminal status may be explicitly skipped; `Done` and
    /// `Skipped` are terminal.
    pub fn can_transition_to(&self, target: &TicketStatus) -> bool {
        if self == target {
            return false;
        }
        if !self.is_terminal() && *target == TicketStatus::Skipped {
            return true;
        }
        matches!(
            (self, target),
            (TicketStatus::Open, TicketStatus::InProgress)
                | (TicketStatus::InProgress, TicketStatus::AwaitingInput)
                | (TicketStatus::InProgress, TicketStatus::Failed)
                | (TicketStatus::InProgress, TicketStatus::Stuck)
                | (TicketStatus::AwaitingInput, TicketStatus::Open)
                | (TicketStatus::AwaitingInput, TicketStatus::Done)
                | (TicketStatus::Failed, TicketStatus::Open)
                | (TicketStatus::Stuck, TicketStatus::Open)
        )
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, TicketStatus::Done | TicketStatus::Skipped)
    }
}

impl std::fmt::Display for TicketStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let label = match self {
            TicketStatus::Open => "open",
            TicketStatus::InProgress => "in_progress",
            TicketStatus::AwaitingInput => "awaiting_input",
            TicketStatus::Done => "done",
            TicketStatus::Failed => "failed",
            TicketStatus::Stuck => "stuck",
            TicketStatus::Skipped => "skipped",
        };
        write!(f, "{label}")
    }
}

// ---------------------------------------------------------------------------
// AwaitingReason
// ---------------------------------------------------------------------------

/// Why a ticket is sitting in `AwaitingInput` (or how it got closed).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AwaitingReason {
    Completed,
    Question,
    Error,
    Stopped,
    Permission,
    DepsReady,
    Stuck,
    AutoReviewed,
}

// ---------------------------------------------------------------------------
// ExecutionMode / ModelTier
// ---------------------------------------------------------------------------

/// Governs how the agent's permission prompts are handled.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ExecutionMode {
    /// Skip-permissions flag passed; the agent never asks.
    Autonomous,
    /// A pre-execution hook consults approved patterns, then asks.
    SemiAutonomous,
    /// Every askable operation is surfaced to the human.
    Supervised,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ModelTier {
    Fast,
    Standard,
    Premium,
}

// ---------------------------------------------------------------------------
// TicketType / TicketPriority
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TicketType {
    Feature,
    Bug,
    Debug,
    Rnd,
    Task,
    Improvement,
    Docs,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TicketPriority {
    Low,
    Medium,
    High,
    Critical,
}

impl TicketPriority {
    /// Numeric rank for ordering; higher = more urgent.
    pub fn rank(&self) -> u8 {
        match self {
            TicketPriority::Low => 0,
            TicketPriority::Medium => 1,
            TicketPriority::High => 2,
            TicketPriority::Critical => 3,
        }
    }
}

// ---------------------------------------------------------------------------
// Project
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Project {
    pub id: i64,
    /// Stable uppercase short tag, unique; prefixes every ticket number.
    pub code: String,
    pub name: String,
    /// Filesystem root the agent operates in (preferred over `app_path`).
    pub web_path: Option<String>,
    pub app_path: Option<String>,
    pub default_execution_mode: ExecutionMode,
    pub model_tier: ModelTier,
    pub git_enabled: bool,
    pub archived: bool,
    /// Accumulated decisions, gotchas, and conventions folded in by the
    /// summarizer.
    pub project_knowledge: String,
    /// Structure summary fed into prompts while unexpired.
    pub project_map: Option<String>,
    pub map_generated_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
}

impl Project {
    /// The directory the agent runs in, when one is configured.
    pub fn working_dir(&self) -> Option<&str> {
        self.web_path.as_deref().or(self.app_path.as_deref())
    }
}

/// Fields for creating a project; the store assigns id and timestamps.
#[derive(Debug, Clone)]
pub struct NewProject {
    pub code: String,
    pub name: String,
    pub web_path: Option<String>,
    pub app_path: Option<String>,
    pub default_execution_mode: ExecutionMode,
    pub model_tier: ModelTier,
    pub git_enabled: bool,
}

impl NewProject {
    pub fn new(code: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            code: code.into(),
            name: name.into(),
            web_path: None,
            app_path: None,
            default_execution_mode: ExecutionMode::Supervised,
            model_tier: ModelTier::Standard,
            git_enabled: false,
        }
    }
}

/// Render a per-project ticket number, e.g. `SHOP-0042`.
pub fn format_ticket_number(code: &str, seq: i64) -> String {
    format!("{code}-{seq:04}")
}

// ---------------------------------------------------------------------------
// Ticket
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Ticket {
    pub id: i64,
    pub project_id: i64,
    pub ticket_number: String,
    pub title: String,
    pub description: String,
    pub ticket_type: TicketType,
    pub priority: TicketPriority,
    /// Explicit queue position; `None` sorts after every integer.
    pub sequence_order: Option<i64>,
    pub parent_ticket_id: Option<i64>,
    /// Skip-the-queue flag; preempts every non-forced sibling.
    pub is_forced: bool,
    /// Inherits the project default when `None`.
    pub execution_mode: Option<ExecutionMode>,
    /// Relaxed dependency satisfaction: `awaiting_input` counts as done.
    pub deps_include_awaiting: bool,
    pub model_tier: Option<ModelTier>,
    pub max_retries: u32,
    pub retry_count: u32,
    /// Cooldown gate; the scheduler will not select the ticket before this.
    pub retry_after: Option<DateTime<Utc>>,
    pub review_scheduled_at: Option<DateTime<Utc>>,
    pub review_attempts: u32,
    pub awaiting_reason: Option<AwaitingReason>,
    pub status: TicketStatus,
    pub result_summary: Option<String>,
    pub total_tokens: i64,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Ticket {
    /// The mode this ticket actually runs under.
    pub fn effective_execution_mode(&self, project: &Project) -> ExecutionMode {
        self.execution_mode
            .unwrap_or(project.default_execution_mode)
    }

    /// The model tier this ticket actually runs under.
    pub fn effective_model_tier(&self, project: &Project) -> ModelTier {
        self.model_tier.unwrap_or(project.model_tier)
    }
}

/// Fields for creating a ticket; the store allocates the ticket number.
#[derive(Debug, Clone)]
pub struct NewTicket {
    pub project_id: i64,
    pub title: String,
    pub description: String,
    pub ticket_type: TicketType,
    pub priority: TicketPriority,
    pub sequence_order: Option<i64>,
    pub parent_ticket_id: Option<i64>,
    pub is_forced: bool,
    pub execution_mode: Option<ExecutionMode>,
    pub deps_include_awaiting: bool,
    pub model_tier: Option<ModelTier>,
    pub max_retries: u32,
}

impl NewTicket {
    pub fn new(project_id: i64, title: impl Into<String>) -> Self {
        Self {
            project_id,
            title: title.into(),
            description: String::new(),
            ticket_type: TicketType::Task,
            priority: TicketPriority::Medium,
            sequence_order: None,
            parent_ticket_id: None,
            is_forced: false,
            execution_mode: None,
            deps_include_awaiting: false,
            model_tier: None,
            max_retries: 3,
        }
    }
}

// ---------------------------------------------------------------------------
// Message
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MessageRole {
    User,
    Assistant,
    System,
    ToolUse,
    ToolResult,
}

impl std::fmt::Display for MessageRole {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let label = match self {
            MessageRole::User => "user",
            MessageRole::Assistant => "assistant",
            MessageRole::System => "system",
            MessageRole::ToolUse => "tool_use",
            MessageRole::ToolResult => "tool_result",
        };
        write!(f, "{label}")
    }
}

/// One time-ordered entry in a ticket's conversation. Ids are monotonic;
/// insertion order is the canonical order.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Message {
    pub id: i64,
    pub ticket_id: i64,
    pub role: MessageRole,
    pub content: String,
    pub tool_name: Option<String>,
    pub tool_input: Option<serde_json::Value>,
    pub token_count: i64,
    pub is_summarized: bool,
    pub created_at: DateTime<Utc>,
}

/// Rough token estimate for content without an exact count (4 chars/token).
pub fn estimate_tokens(text: &str) -> i64 {
    (text.len() / 4) as i64
}

/// Render messages as a plain `role: content` transcript for classifier
/// prompts and query summaries.
pub fn render_transcript(messages: &[Message]) -> String {
    messages
        .iter()
        .map(|m| {
            let body = match m.role {
                MessageRole::ToolUse => {
                    let tool = m.tool_name.as_deref().unwrap_or("tool");
                    match &m.tool_input {
                        Some(input) => format!("{tool} {input}"),
                        None => tool.to_string(),
                    }
                }
                _ => m.content.clone(),
            };
            format!("{}: {}", m.role, body)
        })
        .collect::<Vec<_>>()
        .join("\n")
}

// ---------------------------------------------------------------------------
// Extraction
// ---------------------------------------------------------------------------

/// A structured compression of a contiguous message range, produced by the
/// summarizer so long conversations stay within the prompt budget.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Extraction {
    pub id: i64,
    pub ticket_id: i64,
    pub from_msg_id: i64,
    pub to_msg_id: i64,
    pub decisions: String,
    pub problems_solved: String,
    pub files_modified: Vec<String>,
    pub tests_status: String,
    pub error_patterns: String,
    pub important_notes: String,
    pub tokens_before: i64,
    pub tokens_after: i64,
    pub created_at: DateTime<Utc>,
}

// ---------------------------------------------------------------------------
// ExecutionSession
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SessionStatus {
    Running,
    Completed,
    Failed,
    Stuck,
    Stopped,
    Skipped,
}

/// One invocation of the external agent. A ticket accumulates multiple
/// sessions across retries.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExecutionSession {
    pub id: i64,
    pub ticket_id: i64,
    pub status: SessionStatus,
    pub input_tokens: i64,
    pub output_tokens: i64,
    pub api_calls: i64,
    pub started_at: DateTime<Utc>,
    pub ended_at: Option<DateTime<Utc>>,
}

// ---------------------------------------------------------------------------
// ApprovedPermission
// ---------------------------------------------------------------------------

/// A (ticket, tool, pattern) record the semi-autonomous pre-execution hook
/// consults to auto-allow otherwise-askable operations.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ApprovedPermission {
    pub id: i64,
    pub ticket_id: i64,
    pub tool: String,
    pub pattern: String,
    pub created_at: DateTime<Utc>,
}

// ---------------------------------------------------------------------------
// DaemonStatus
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DaemonState {
    Running,
    Degraded,
    Stopped,
}

/// Singleton liveness record maintained by the heartbeat loop.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DaemonStatus {
    pub state: DaemonState,
    pub current_ticket_id: Option<i64>,
    pub last_heartbeat: DateTime<Utc>,
    pub version: String,
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
