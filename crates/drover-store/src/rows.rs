//! Row mapping helpers — enum <-> SQLite TEXT and row -> struct conversion.

use chrono::{DateTime, Utc};
use drover_core::types::{
    ExecutionSession, Extraction, Message, Project, Ticket, TicketStatus,
};

pub fn enum_to_sql<T: serde::Serialize>(val: &T) -> String {
    let s = serde_json::to_string(val).expect("serialize enum");
    s.trim_matches('"').to_string()
}

pub fn enum_from_sql<T: serde::de::DeserializeOwned>(raw: &str) -> T {
    let quoted = format!("\"{}\"", raw);
    serde_json::from_str(&quoted).expect("deserialize enum")
}

/// Ticket status with tolerance for the legacy literals external seeders
/// write; 'new' and 'pending' dispatch like 'open'.
pub fn ticket_status_from_sql(raw: &str) -> TicketStatus {
    match raw {
        "new" | "pending" => TicketStatus::Open,
        other => enum_from_sql(other),
    }
}

pub fn parse_datetime(raw: &str) -> DateTime<Utc> {
    DateTime::parse_from_rfc3339(raw)
        .expect("valid rfc3339 date")
        .with_timezone(&Utc)
}

fn parse_datetime_opt(raw: Option<String>) -> Option<DateTime<Utc>> {
    raw.map(|s| parse_datetime(&s))
}

// ---------------------------------------------------------------------------
// Column lists
// ---------------------------------------------------------------------------

pub const TICKET_COLUMNS: &str = "id, project_id, ticket_number, title, description, \
    ticket_type, priority, sequence_order, parent_ticket_id, is_forced, execution_mode, \
    deps_include_awaiting, model_tier, max_retries, retry_count, retry_after, \
    review_scheduled_at, review_attempts, awaiting_reason, status, result_summary, \
    total_tokens, created_at, updated_at";

/// The ticket column list with a table alias prefix, for joined queries.
pub fn ticket_columns_qualified(alias: &str) -> String {
    TICKET_COLUMNS
        .split(", ")
        .map(|c| format!("{alias}.{c}"))
        .collect::<Vec<_>>()
        .join(", ")
}

pub const MESSAGE_COLUMNS: &str =
    "id, ticket_id, role, content, tool_name, tool_input, token_count, is_summarized, created_at";

// ---------------------------------------------------------------------------
// Row mappers
// ---------------------------------------------------------------------------

pub fn row_to_project(row: &rusqlite::Row<'_>) -> rusqlite::Result<Project> {
    let mode_raw: String = row.get(5)?;
    let tier_raw: String = row.get(6)?;
    let map_generated_at: Option<String> = row.get(11)?;
    let created_at: String = row.get(12)?;

    Ok(Project {
        id: row.get(0)?,
        code: row.get(1)?,
        name: row.get(2)?,
        web_path: row.get(3)?,
        app_path: row.get(4)?,
        default_execution_mode: enum_from_sql(&mode_raw),
        model_tier: enum_from_sql(&tier_raw),
        git_enabled: row.get::<_, i64>(7)? != 0,
        archived: row.get::<_, i64>(8)? != 0,
        project_knowledge: row.get(9)?,
        project_map: row.get(10)?,
        map_generated_at: parse_datetime_opt(map_generated_at),
        created_at: parse_datetime(&created_at),
    })
}

pub fn row_to_ticket(row: &rusqlite::Row<'_>) -> rusqlite::Result<Ticket> {
    let ticket_type_raw: String = row.get(5)?;
    let priority_raw: String = row.get(6)?;
    let mode_raw: Option<String> = row.get(10)?;
    let tier_raw: Option<String> = row.get(12)?;
    let retry_after: Option<String> = row.get(15)?;
    let review_at: Option<String> = row.get(16)?;
    let reason_raw: Option<String> = row.get(18)?;
    let status_raw: String = row.get(19)?;
    let created_at: String = row.get(22)?;
    let updated_at: String = row.get(23)?;

    Ok(Ticket {
        id: row.get(0)?,
        project_id: row.get(1)?,
        ticket_number: row.get(2)?,
        title: row.get(3)?,
        description: row.get(4)?,
        ticket_type: enum_from_sql(&ticket_type_raw),
        priority: enum_from_sql(&priority_raw),
        sequence_order: row.get(7)?,
        parent_ticket_id: row.get(8)?,
        is_forced: row.get::<_, i64>(9)? != 0,
        execution_mode: mode_raw.map(|s| enum_from_sql(&s)),
        deps_include_awaiting: row.get::<_, i64>(11)? != 0,
        model_tier: tier_raw.map(|s| enum_from_sql(&s)),
        max_retries: row.get::<_, i64>(13)? as u32,
        retry_count: row.get::<_, i64>(14)? as u32,
        retry_after: parse_datetime_opt(retry_after),
        review_scheduled_at: parse_datetime_opt(review_at),
        review_attempts: row.get::<_, i64>(17)? as u32,
        awaiting_reason: reason_raw.map(|s| enum_from_sql(&s)),
        status: ticket_status_from_sql(&status_raw),
        result_summary: row.get(20)?,
        total_tokens: row.get(21)?,
        created_at: parse_datetime(&created_at),
        updated_at: parse_datetime(&updated_at),
    })
}

pub fn row_to_message(row: &rusqlite::Row<'_>) -> rusqlite::Result<Message> {
    let role_raw: String = row.get(2)?;
    let tool_input_raw: Option<String> = row.get(5)?;
    let created_at: String = row.get(8)?;

    Ok(Message {
        id: row.get(0)?,
        ticket_id: row.get(1)?,
        role: enum_from_sql(&role_raw),
        content: row.get(3)?,
        tool_name: row.get(4)?,
        tool_input: tool_input_raw.map(|s| serde_json::from_str(&s).expect("valid json")),
        token_count: row.get(6)?,
        is_summarized: row.get::<_, i64>(7)? != 0,
        created_at: parse_datetime(&created_at),
    })
}

pub fn row_to_extraction(row: &rusqlite::Row<'_>) -> rusqlite::Result<Extraction> {
    let files_raw: String = row.get(6)?;
    let created_at: String = row.get(12)?;

    Ok(Extraction {
        id: row.get(0)?,
        ticket_id: row.get(1)?,
        from_msg_id: row.get(2)?,
        to_msg_id: row.get(3)?,
        decisions: row.get(4)?,
        problems_solved: row.get(5)?,
        files_modified: serde_json::from_str(&files_raw).expect("valid json"),
        tests_status: row.get(7)?,
        error_patterns: row.get(8)?,
        important_notes: row.get(9)?,
        tokens_before: row.get(10)?,
        tokens_after: row.get(11)?,
        created_at: parse_datetime(&created_at),
    })
}

pub fn row_to_session(row: &rusqlite::Row<'_>) -> rusqlite::Result<ExecutionSession> {
    let status_raw: String = row.get(2)?;
    let started_at: String = row.get(6)?;
    let ended_at: Option<String> = row.get(7)?;

    Ok(ExecutionSession {
        id: row.get(0)?,
        ticket_id: row.get(1)?,
        status: enum_from_sql(&status_raw),
        input_tokens: row.get(3)?,
        output_tokens: row.get(4)?,
        api_calls: row.get(5)?,
        started_at: parse_datetime(&started_at),
        ended_at: parse_datetime_opt(ended_at),
    })
}
