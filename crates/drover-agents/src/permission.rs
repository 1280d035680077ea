//! Semi-autonomous permission filter.
//!
//! The agent invokes a pre-execution hook for every tool call; the hook
//! reads `{"tool": ..., "input": ...}` on stdin and answers
//! `{"decision": "allow" | "deny" | "ask"}` on stdout. Decisions resolve
//! in order: approved patterns for the ticket, then the deny-list, then
//! ask (pass through to the human).

use std::path::{Component, Path, PathBuf};

use drover_core::types::ApprovedPermission;
use drover_store::Store;
use serde::{Deserialize, Serialize};
use tracing::debug;

// ---------------------------------------------------------------------------
// Decision
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Decision {
    Allow,
    Deny,
    Ask,
}

/// The hook's stdin payload.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HookRequest {
    pub tool: String,
    #[serde(default)]
    pub input: serde_json::Value,
}

/// The hook's stdout payload.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HookResponse {
    pub decision: Decision,
}

#[derive(Debug, thiserror::Error)]
pub enum PermissionError {
    #[error("malformed hook request: {0}")]
    BadRequest(String),
    #[error("store error: {0}")]
    Store(#[from] drover_store::StoreError),
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
    #[error("unknown ticket {0}")]
    UnknownTicket(i64),
}

// ---------------------------------------------------------------------------
// Pattern derivation and matching
// ---------------------------------------------------------------------------

/// Derive an "Approve All Similar" pattern from a shell command: the first
/// token plus a wildcard (`npm install x` -> `npm *`).
pub fn derive_pattern(command: &str) -> String {
    match command.split_whitespace().next() {
        Some(first) => format!("{first} *"),
        None => String::new(),
    }
}

/// Match a stored pattern against a candidate string. `cmd *` patterns
/// match on the first token; anything else matches exactly.
pub fn matches_pattern(pattern: &str, candidate: &str) -> bool {
    if let Some(prefix) = pattern.strip_suffix(" *") {
        candidate.split_whitespace().next() == Some(prefix)
    } else {
        candidate.trim() == pattern
    }
}

// ---------------------------------------------------------------------------
// The decision procedure
// ---------------------------------------------------------------------------

const PRIVILEGED_COMMANDS: &[&str] = &[
    "sudo", "su", "chown", "mkfs", "shutdown", "reboot", "systemctl", "passwd", "useradd",
    "userdel",
];

const SYSTEM_PATHS: &[&str] = &["/etc", "/root", "/var", "/usr", "/boot", "/proc", "/sys"];

/// Tools whose path argument mutates the filesystem.
fn is_write_tool(tool: &str) -> bool {
    let lower = tool.to_lowercase();
    ["write", "edit", "delete", "move", "create"]
        .iter()
        .any(|verb| lower.contains(verb))
}

/// Decide a tool invocation for a ticket.
pub fn decide(
    tool: &str,
    input: &serde_json::Value,
    project_root: &Path,
    approved: &[ApprovedPermission],
) -> Decision {
    let candidate = candidate_string(tool, input);

    // 1. Approved patterns for the ticket win outright.
    for perm in approved {
        if perm.tool == tool && matches_pattern(&perm.pattern, &candidate) {
            return Decision::Allow;
        }
    }

    // 2. Deny-list. Paths inside the project root are never denied here,
    // even when the project itself lives under /var or /usr.
    if let Some(command) = input.get("command").and_then(|v| v.as_str()) {
        if is_privileged_command(command) {
            return Decision::Deny;
        }
    }
    if let Some(path) = path_argument(input) {
        let resolved = resolve(project_root, &path);
        if !resolved.starts_with(project_root) {
            if touches_system_path(&resolved) {
                return Decision::Deny;
            }
            if is_write_tool(tool) {
                return Decision::Deny;
            }
        }
    }

    // 3. Everything else goes to the human.
    Decision::Ask
}

fn candidate_string(tool: &str, input: &serde_json::Value) -> String {
    if let Some(command) = input.get("command").and_then(|v| v.as_str()) {
        return command.to_string();
    }
    if let Some(path) = path_argument(input) {
        return path.to_string_lossy().into_owned();
    }
    tool.to_string()
}

fn path_argument(input: &serde_json::Value) -> Option<PathBuf> {
    for key in ["path", "file_path", "target"] {
        if let Some(raw) = input.get(key).and_then(|v| v.as_str()) {
            return Some(PathBuf::from(raw));
        }
    }
    None
}

fn is_privileged_command(command: &str) -> bool {
    let first = command.split_whitespace().next().unwrap_or("");
    if PRIVILEGED_COMMANDS.contains(&first) {
        return true;
    }
    let squeezed = command.split_whitespace().collect::<Vec<_>>().join(" ");
    squeezed.contains("rm -rf /") || squeezed.contains("chmod 777")
}

fn touches_system_path(path: &Path) -> bool {
    SYSTEM_PATHS
        .iter()
        .any(|prefix| path.starts_with(prefix))
}

/// Lexically resolve a path against the project root: relative paths are
/// joined, `..` components are collapsed so traversal cannot hide an
/// escape.
fn resolve(root: &Path, path: &Path) -> PathBuf {
    let joined = if path.is_absolute() {
        path.to_path_buf()
    } else {
        root.join(path)
    };
    let mut out = PathBuf::new();
    for component in joined.components() {
        match component {
            Component::ParentDir => {
                out.pop();
            }
            Component::CurDir => {}
            other => out.push(other),
        }
    }
    out
}

// ---------------------------------------------------------------------------
// Hook plumbing
// ---------------------------------------------------------------------------

/// Write the project-local hook config consulted by the agent in
/// semi-autonomous mode. Lives under `.drover/` in the working tree.
pub fn write_hook_config(project_dir: &Path, ticket_id: i64) -> std::io::Result<()> {
    let dir = project_dir.join(".drover");
    std::fs::create_dir_all(&dir)?;
    let config = serde_json::json!({
        "hooks": {
            "pre_tool_use": {
                "command": format!("drover-daemon permission-hook {ticket_id}"),
            }
        }
    });
    std::fs::write(
        dir.join("hooks.json"),
        serde_json::to_string_pretty(&config).expect("serialize hook config"),
    )
}

/// Resolve a hook request against the store: the ticket's approved
/// patterns plus its project root feed [`decide`].
pub async fn hook_decision(
    store: &Store,
    ticket_id: i64,
    request_json: &str,
) -> Result<HookResponse, PermissionError> {
    let request: HookRequest = serde_json::from_str(request_json)
        .map_err(|e| PermissionError::BadRequest(e.to_string()))?;

    let ticket = store
        .get_ticket(ticket_id)
        .await?
        .ok_or(PermissionError::UnknownTicket(ticket_id))?;
    let project = store
        .get_project(ticket.project_id)
        .await?
        .ok_or(PermissionError::UnknownTicket(ticket_id))?;
    let approved = store.approved_permissions(ticket_id).await?;

    let root = project
        .working_dir()
        .map(PathBuf::from)
        .unwrap_or_else(|| PathBuf::from("/nonexistent"));
    let decision = decide(&request.tool, &request.input, &root, &approved);
    debug!(ticket_id, tool = %request.tool, ?decision, "hook decision");
    Ok(HookResponse { decision })
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
