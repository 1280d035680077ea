//! ContextBuilder — materializes the prompt envelope for a ticket.
//!
//! The envelope is a sequence of tagged sections: global rules, project
//! map (while unexpired), project knowledge, parent chain, git hint,
//! conversation (extractions covering the summarized prefix followed by
//! the unsummarized suffix), and the new user turn. Token math is the
//! 4-chars-per-token estimate used everywhere else.

use std::path::Path;
use std::sync::Arc;

use chrono::Duration;
use drover_bridge::event_bus::EventBus;
use drover_bridge::protocol::{BusEvent, Topic};
use drover_core::clock::Clock;
use drover_core::types::{estimate_tokens, render_transcript, Extraction, Project, Ticket};
use drover_store::{Store, StoreError};
use tracing::{debug, warn};

// ---------------------------------------------------------------------------
// PromptEnvelope
// ---------------------------------------------------------------------------

#[derive(Debug, Clone)]
pub struct Section {
    pub name: &'static str,
    pub text: String,
}

/// The assembled prompt, bounded in tokens.
#[derive(Debug, Clone)]
pub struct PromptEnvelope {
    pub sections: Vec<Section>,
}

impl PromptEnvelope {
    pub fn render(&self) -> String {
        self.sections
            .iter()
            .map(|s| format!("<{0}>\n{1}\n</{0}>", s.name, s.text.trim_end()))
            .collect::<Vec<_>>()
            .join("\n\n")
    }

    pub fn token_estimate(&self) -> i64 {
        estimate_tokens(&self.render())
    }

    pub fn section(&self, name: &str) -> Option<&Section> {
        self.sections.iter().find(|s| s.name == name)
    }
}

/// Render one extraction as a conversation block.
pub fn render_extraction(extraction: &Extraction) -> String {
    let mut lines = vec![format!(
        "[compressed history, messages {}..{}]",
        extraction.from_msg_id, extraction.to_msg_id
    )];
    fn push(lines: &mut Vec<String>, label: &str, value: &str) {
        if !value.trim().is_empty() {
            lines.push(format!("{label}: {}", value.trim()));
        }
    }
    push(&mut lines, "decisions", &extraction.decisions);
    push(&mut lines, "problems solved", &extraction.problems_solved);
    if !extraction.files_modified.is_empty() {
        lines.push(format!("files: {}", extraction.files_modified.join(", ")));
    }
    push(&mut lines, "tests", &extraction.tests_status);
    push(&mut lines, "recurring errors", &extraction.error_patterns);
    push(&mut lines, "notes", &extraction.important_notes);
    lines.join("\n")
}

// ---------------------------------------------------------------------------
// ContextBuilder
// ---------------------------------------------------------------------------

pub struct ContextBuilder {
    global_rules: Option<String>,
    map_ttl: Duration,
    token_target: i64,
    clock: Arc<dyn Clock>,
}

impl ContextBuilder {
    pub fn new(
        global_rules_path: Option<&str>,
        map_ttl_hours: u64,
        token_target: i64,
        clock: Arc<dyn Clock>,
    ) -> Self {
        let global_rules = global_rules_path.and_then(|path| {
            match std::fs::read_to_string(path) {
                Ok(text) => Some(text),
                Err(e) => {
                    warn!(path, error = %e, "global rules file unreadable, skipping");
                    None
                }
            }
        });
        Self {
            global_rules,
            map_ttl: Duration::hours(map_ttl_hours as i64),
            token_target,
            clock,
        }
    }

    /// Assemble the envelope for one ticket.
    ///
    /// `new_user_turn` is the message that triggered this dispatch, when
    /// there is one; the conversation already contains it as a row, so it
    /// is only highlighted, never duplicated.
    pub async fn build(
        &self,
        store: &Store,
        bus: &EventBus,
        project: &Project,
        ticket: &Ticket,
        new_user_turn: Option<&str>,
    ) -> Result<PromptEnvelope, StoreError> {
        let mut sections = Vec::new();

        if let Some(rules) = &self.global_rules {
            sections.push(Section {
                name: "global-rules",
                text: rules.clone(),
            });
        }

        match (&project.project_map, project.map_generated_at) {
            (Some(map), Some(generated_at))
                if self.clock.now() - generated_at <= self.map_ttl =>
            {
                sections.push(Section {
                    name: "project-map",
                    text: map.clone(),
                });
            }
            (Some(_), _) | (None, _) => {
                debug!(project_id = project.id, "project map missing or expired");
                bus.publish(
                    Topic::Console,
                    BusEvent::MapRegenerationRequested {
                        project_id: project.id,
                    },
                );
            }
        }

        if !project.project_knowledge.trim().is_empty() {
            sections.push(Section {
                name: "project-knowledge",
                text: project.project_knowledge.clone(),
            });
        }

        let parent_chain = self.parent_chain(store, ticket).await?;
        if !parent_chain.is_empty() {
            sections.push(Section {
                name: "parent-tickets",
                text: parent_chain.join("\n\n"),
            });
        }

        if project.git_enabled {
            if let Some(dir) = project.working_dir() {
                match recent_commits(Path::new(dir), 10) {
                    Ok(commits) if !commits.is_empty() => {
                        sections.push(Section {
                            name: "recent-commits",
                            text: commits.join("\n"),
                        });
                    }
                    Ok(_) => {}
                    Err(e) => {
                        debug!(project_id = project.id, error = %e, "git hint unavailable");
                    }
                }
            }
        }

        let conversation = self.conversation(store, ticket).await?;
        if !conversation.is_empty() {
            sections.push(Section {
                name: "conversation",
                text: conversation,
            });
        }

        sections.push(Section {
            name: "ticket",
            text: format!(
                "{} [{}] {}\n{}",
                ticket.ticket_number,
                serde_json::to_string(&ticket.ticket_type)
                    .unwrap_or_default()
                    .trim_matches('"'),
                ticket.title,
                ticket.description
            ),
        });

        if let Some(turn) = new_user_turn {
            sections.push(Section {
                name: "user-turn",
                text: turn.to_string(),
            });
        }

        let mut envelope = PromptEnvelope { sections };
        self.enforce_budget(&mut envelope);
        Ok(envelope)
    }

    /// Up to two ancestors, nearest first: description plus result summary.
    async fn parent_chain(
        &self,
        store: &Store,
        ticket: &Ticket,
    ) -> Result<Vec<String>, StoreError> {
        let mut chain = Vec::new();
        let mut current = ticket.parent_ticket_id;
        while let Some(parent_id) = current {
            if chain.len() == 2 {
                break;
            }
            let Some(parent) = store.get_ticket(parent_id).await? else {
                break;
            };
            let mut block = format!("{}: {}", parent.ticket_number, parent.title);
            if !parent.description.trim().is_empty() {
                block.push('\n');
                block.push_str(parent.description.trim());
            }
            if let Some(summary) = &parent.result_summary {
                block.push_str("\nresult: ");
                block.push_str(summary.trim());
            }
            chain.push(block);
            current = parent.parent_ticket_id;
        }
        Ok(chain)
    }

    /// Extractions over the summarized prefix, then the raw suffix, in
    /// chronological order.
    async fn conversation(&self, store: &Store, ticket: &Ticket) -> Result<String, StoreError> {
        let mut blocks = Vec::new();
        for extraction in store.extractions(ticket.id).await? {
            blocks.push(render_extraction(&extraction));
        }
        let suffix = store.unsummarized_messages(ticket.id).await?;
        if !suffix.is_empty() {
            blocks.push(render_transcript(&suffix));
        }
        Ok(blocks.join("\n\n"))
    }

    /// Trim the conversation section oldest-first until the envelope fits
    /// the target. Other sections are small and always kept.
    fn enforce_budget(&self, envelope: &mut PromptEnvelope) {
        let over = envelope.token_estimate() - self.token_target;
        if over <= 0 {
            return;
        }
        let Some(conversation) = envelope
            .sections
            .iter_mut()
            .find(|s| s.name == "conversation")
        else {
            return;
        };
        let excess_chars = (over * 4) as usize;
        if excess_chars >= conversation.text.len() {
            conversation.text = "[earlier context trimmed]".to_string();
            return;
        }
        // Cut at a line boundary past the excess so we never split a turn
        // (or a multi-byte character).
        let mut floor = excess_chars;
        while !conversation.text.is_char_boundary(floor) {
            floor += 1;
        }
        let cut = conversation.text[floor..]
            .find('\n')
            .map(|pos| floor + pos + 1)
            .unwrap_or(floor);
        conversation.text = format!("[earlier context trimmed]\n{}", &conversation.text[cut..]);
    }
}

/// `git log --oneline` via the git binary; read-only, best effort.
pub fn recent_commits(repo_dir: &Path, n: usize) -> Result<Vec<String>, String> {
    let output = std::process::Command::new("git")
        .current_dir(repo_dir)
        .args(["log", "--oneline", "-n", &n.to_string()])
        .output()
        .map_err(|e| e.to_string())?;
    if !output.status.success() {
        let stderr = String::from_utf8_lossy(&output.stderr);
        return Err(stderr.trim().to_string());
    }
    let stdout = String::from_utf8_lossy(&output.stdout);
    Ok(stdout
        .lines()
        .map(str::trim)
        .filter(|l| !l.is_empty())
        .map(ToOwned::to_owned)
        .collect())
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;
    use drover_core::clock::ManualClock;
    use drover_core::types::{MessageRole, NewProject, NewTicket};
    use drover_store::{MessageMeta, NewExtraction};

    struct Fixture {
        store: Store,
        clock: ManualClock,
        bus: EventBus,
    }

    async fn fixture() -> Fixture {
        let clock = ManualClock::new(Utc::now());
        let store = Store::new_in_memory(Arc::new(clock.clone())).await.unwrap();
        Fixture {
            store,
            clock,
            bus: EventBus::new(),
        }
    }

    fn builder(clock: &ManualClock, token_target: i64) -> ContextBuilder {
        ContextBuilder::new(None, 24, token_target, Arc::new(clock.clone()))
    }

    #[tokio::test]
    async fn envelope_orders_sections_and_renders_tags() {
        let f = fixture().await;
        let project = f
            .store
            .create_project(NewProject::new("SHOP", "Shop"))
            .await
            .unwrap();
        f.store
            .set_project_map(project.id, "src/ -> handlers, db".into())
            .await
            .unwrap();
        f.store
            .fold_into_knowledge(project.id, "uses pnpm")
            .await
            .unwrap();
        let project = f.store.get_project(project.id).await.unwrap().unwrap();

        let ticket = f
            .store
            .create_ticket(NewTicket::new(project.id, "fix login"))
            .await
            .unwrap();
        f.store
            .append_message(ticket.id, MessageRole::User, "please fix it", MessageMeta::default())
            .await
            .unwrap();

        let envelope = builder(&f.clock, 150_000)
            .build(&f.store, &f.bus, &project, &ticket, Some("please fix it"))
            .await
            .unwrap();

        let names: Vec<&str> = envelope.sections.iter().map(|s| s.name).collect();
        assert_eq!(
            names,
            vec!["project-map", "project-knowledge", "conversation", "ticket", "user-turn"]
        );
        let rendered = envelope.render();
        assert!(rendered.contains("<project-map>"));
        assert!(rendered.contains("uses pnpm"));
        assert!(rendered.contains("SHOP-0001"));
        assert!(rendered.contains("user: please fix it"));
    }

    #[tokio::test]
    async fn expired_map_requests_regeneration() {
        let f = fixture().await;
        let project = f
            .store
            .create_project(NewProject::new("SHOP", "Shop"))
            .await
            .unwrap();
        f.store
            .set_project_map(project.id, "old map".into())
            .await
            .unwrap();
        let project = f.store.get_project(project.id).await.unwrap().unwrap();
        let ticket = f
            .store
            .create_ticket(NewTicket::new(project.id, "t"))
            .await
            .unwrap();

        let console = f.bus.subscribe_console();
        f.clock.advance(Duration::hours(25));

        let envelope = builder(&f.clock, 150_000)
            .build(&f.store, &f.bus, &project, &ticket, None)
            .await
            .unwrap();

        assert!(envelope.section("project-map").is_none());
        let event = console.try_recv().unwrap();
        assert!(matches!(
            event.event,
            BusEvent::MapRegenerationRequested { project_id } if project_id == project.id
        ));
    }

    #[tokio::test]
    async fn parent_chain_stops_at_two_ancestors() {
        let f = fixture().await;
        let project = f
            .store
            .create_project(NewProject::new("SHOP", "Shop"))
            .await
            .unwrap();

        let grandparent = f
            .store
            .create_ticket(NewTicket::new(project.id, "epic"))
            .await
            .unwrap();
        f.store
            .set_result_summary(grandparent.id, "split into subtasks")
            .await
            .unwrap();
        let mut new_parent = NewTicket::new(project.id, "schema work");
        new_parent.parent_ticket_id = Some(grandparent.id);
        let parent = f.store.create_ticket(new_parent).await.unwrap();

        let mut new_great = NewTicket::new(project.id, "ancient");
        new_great.parent_ticket_id = None;
        let _unrelated = f.store.create_ticket(new_great).await.unwrap();

        let mut new_child = NewTicket::new(project.id, "add index");
        new_child.parent_ticket_id = Some(parent.id);
        let child = f.store.create_ticket(new_child).await.unwrap();

        let envelope = builder(&f.clock, 150_000)
            .build(&f.store, &f.bus, &project, &child, None)
            .await
            .unwrap();

        let section = envelope.section("parent-tickets").unwrap();
        assert!(section.text.contains("schema work"));
        assert!(section.text.contains("split into subtasks"));
        // Nearest ancestor listed first.
        let parent_pos = section.text.find("schema work").unwrap();
        let grand_pos = section.text.find("epic").unwrap();
        assert!(parent_pos < grand_pos);
    }

    #[tokio::test]
    async fn conversation_interleaves_extractions_before_suffix() {
        let f = fixture().await;
        let project = f
            .store
            .create_project(NewProject::new("SHOP", "Shop"))
            .await
            .unwrap();
        let ticket = f
            .store
            .create_ticket(NewTicket::new(project.id, "t"))
            .await
            .unwrap();

        let first = f
            .store
            .append_message(ticket.id, MessageRole::Assistant, "old work", MessageMeta::default())
            .await
            .unwrap();
        f.store
            .insert_extraction(NewExtraction {
                ticket_id: ticket.id,
                from_msg_id: first,
                to_msg_id: first,
                decisions: "chose sqlite".into(),
                problems_solved: String::new(),
                files_modified: vec![],
                tests_status: String::new(),
                error_patterns: String::new(),
                important_notes: String::new(),
                tokens_before: 100,
                tokens_after: 10,
            })
            .await
            .unwrap();
        f.store.mark_summarized(ticket.id, first, first).await.unwrap();
        f.store
            .append_message(ticket.id, MessageRole::Assistant, "new work", MessageMeta::default())
            .await
            .unwrap();

        let envelope = builder(&f.clock, 150_000)
            .build(&f.store, &f.bus, &project, &ticket, None)
            .await
            .unwrap();

        let conversation = &envelope.section("conversation").unwrap().text;
        let compressed_pos = conversation.find("chose sqlite").unwrap();
        let suffix_pos = conversation.find("new work").unwrap();
        assert!(compressed_pos < suffix_pos);
        assert!(!conversation.contains("old work"));
    }

    #[tokio::test]
    async fn oversize_conversation_is_trimmed_oldest_first() {
        let f = fixture().await;
        let project = f
            .store
            .create_project(NewProject::new("SHOP", "Shop"))
            .await
            .unwrap();
        let ticket = f
            .store
            .create_ticket(NewTicket::new(project.id, "t"))
            .await
            .unwrap();

        for i in 0..50 {
            f.store
                .append_message(
                    ticket.id,
                    MessageRole::Assistant,
                    &format!("turn {i}: {}", "x".repeat(200)),
                    MessageMeta::default(),
                )
                .await
                .unwrap();
        }

        let envelope = builder(&f.clock, 500)
            .build(&f.store, &f.bus, &project, &ticket, None)
            .await
            .unwrap();

        assert!(envelope.token_estimate() <= 600, "should sit near the target");
        let conversation = &envelope.section("conversation").unwrap().text;
        assert!(conversation.starts_with("[earlier context trimmed]"));
        assert!(!conversation.contains("turn 0:"));
        assert!(conversation.contains("turn 49:"));
    }

    #[test]
    fn extraction_rendering_skips_empty_fields() {
        let extraction = Extraction {
            id: 1,
            ticket_id: 1,
            from_msg_id: 3,
            to_msg_id: 9,
            decisions: "kept the old API".into(),
            problems_solved: String::new(),
            files_modified: vec!["a.rs".into(), "b.rs".into()],
            tests_status: "green".into(),
            error_patterns: String::new(),
            important_notes: String::new(),
            tokens_before: 100,
            tokens_after: 10,
            created_at: Utc::now(),
        };
        let rendered = render_extraction(&extraction);
        assert!(rendered.contains("messages 3..9"));
        assert!(rendered.contains("decisions: kept the old API"));
        assert!(rendered.contains("files: a.rs, b.rs"));
        assert!(!rendered.contains("problems solved"));
    }

    #[test]
    fn git_hint_fails_soft_outside_a_repo() {
        let dir = tempfile::tempdir().unwrap();
        assert!(recent_commits(dir.path(), 5).is_err());
    }
}
