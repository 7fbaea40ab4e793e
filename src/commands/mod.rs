//! Command implementations for the `kt` CLI.
//!
//! Each command returns a value implementing [`Output`], which `main` prints
//! as JSON (the default) or in human-readable form with `-H`.

use serde::Serialize;
use std::fmt::Write as _;
use std::path::Path;
use std::process::Command;
use std::time::Duration;

use crate::config::Settings;
use crate::id::generate_id;
use crate::lock::CancelToken;
use crate::ops::{self, BatchError, BatchResult, DepNode, Stats};
use crate::store::Store;
use crate::ticket::{Status, Ticket, TicketType};
use crate::{Error, Result};

/// Attempts at finding an unused id before `create` gives up.
pub const CREATE_ATTEMPTS: usize = 5;

/// Command results that can be serialized to JSON or formatted for humans.
pub trait Output {
    /// Serialize to JSON string.
    fn to_json(&self) -> String;

    /// Format for human-readable output.
    fn to_human(&self) -> String;
}

fn json<T: Serialize + ?Sized>(value: &T) -> String {
    serde_json::to_string(value)
        .unwrap_or_else(|e| serde_json::json!({ "error": e.to_string() }).to_string())
}

/// A single ticket, shown in full.
#[derive(Debug, Serialize)]
#[serde(transparent)]
pub struct TicketView(pub Ticket);

impl Output for TicketView {
    fn to_json(&self) -> String {
        json(&self.0)
    }

    fn to_human(&self) -> String {
        let t = &self.0;
        let mut out = String::new();
        let _ = writeln!(out, "{} {}", t.id, t.title);
        let _ = writeln!(out, "  Status:   {}", t.status);
        let _ = writeln!(out, "  Type:     {}", t.ticket_type);
        let _ = writeln!(out, "  Priority: P{}", t.priority);
        let _ = writeln!(out, "  Created:  {}", t.created.to_rfc3339());
        if let Some(assignee) = &t.assignee {
            let _ = writeln!(out, "  Assignee: {assignee}");
        }
        if let Some(parent) = &t.parent {
            let _ = writeln!(out, "  Parent:   {parent}");
        }
        if let Some(external) = &t.external_ref {
            let _ = writeln!(out, "  External: {external}");
        }
        if !t.deps.is_empty() {
            let _ = writeln!(out, "  Deps:     {}", t.deps.join(", "));
        }
        if !t.links.is_empty() {
            let _ = writeln!(out, "  Links:    {}", t.links.join(", "));
        }
        if !t.tests.is_empty() {
            let passed = if t.tests_passed { "passed" } else { "not passed" };
            let _ = writeln!(out, "  Tests:    {passed}");
        }

        for (heading, text) in [
            ("Description", &t.description),
            ("Design", &t.design),
            ("Acceptance Criteria", &t.acceptance_criteria),
            ("Tests", &t.tests),
            ("Notes", &t.notes),
        ] {
            if !text.is_empty() {
                let _ = write!(out, "\n{heading}:\n{text}\n");
            }
        }
        out.trim_end().to_string()
    }
}

/// Result of `kt show`: the tickets found, and a failure per id that wasn't.
#[derive(Debug)]
pub struct Shown {
    pub tickets: Vec<Ticket>,
    pub errors: Vec<BatchError>,
    /// A single id was asked for; JSON is then an object, not an array
    single: bool,
}

impl Output for Shown {
    fn to_json(&self) -> String {
        match (self.single, self.tickets.as_slice()) {
            (true, [t]) => json(t),
            _ => json(&self.tickets),
        }
    }

    fn to_human(&self) -> String {
        self.tickets
            .iter()
            .map(|t| TicketView(t.clone()).to_human())
            .collect::<Vec<_>>()
            .join("\n\n")
    }
}

/// Result of `kt add-note`.
#[derive(Debug, Serialize)]
#[serde(transparent)]
pub struct NoteAdded(pub Ticket);

impl Output for NoteAdded {
    fn to_json(&self) -> String {
        json(&self.0)
    }

    fn to_human(&self) -> String {
        format!("Note added to {}", self.0.id)
    }
}

/// A list of tickets, one line each in human form.
#[derive(Debug, Serialize)]
#[serde(transparent)]
pub struct TicketList(pub Vec<Ticket>);

impl Output for TicketList {
    fn to_json(&self) -> String {
        json(&self.0)
    }

    fn to_human(&self) -> String {
        if self.0.is_empty() {
            return "No tickets.".to_string();
        }
        self.0
            .iter()
            .map(|t| {
                format!(
                    "{:<10} [{}] P{} {:<8} {}",
                    t.id, t.status, t.priority, t.ticket_type, t.title
                )
            })
            .collect::<Vec<_>>()
            .join("\n")
    }
}

impl Output for BatchResult {
    fn to_json(&self) -> String {
        json(self)
    }

    fn to_human(&self) -> String {
        let mut lines: Vec<String> = self.updated.iter().map(|id| format!("Updated {id}")).collect();
        lines.extend(self.errors.iter().map(|e| format!("Error {}: {}", e.id, e.error)));
        lines.join("\n")
    }
}

/// Result of `kt create`.
#[derive(Debug, Serialize)]
pub struct Created {
    pub id: String,
    pub path: String,
}

impl Output for Created {
    fn to_json(&self) -> String {
        json(self)
    }

    fn to_human(&self) -> String {
        format!("Created {}", self.id)
    }
}

/// Result of commands that change several tickets at once without batch
/// semantics (`link`, `dep add`).
#[derive(Debug, Serialize)]
pub struct Changed {
    pub updated: Vec<String>,
}

impl Changed {
    fn from_tickets(tickets: &[Ticket]) -> Self {
        Self {
            updated: tickets.iter().map(|t| t.id.clone()).collect(),
        }
    }
}

impl Output for Changed {
    fn to_json(&self) -> String {
        json(self)
    }

    fn to_human(&self) -> String {
        format!("Updated {}", self.updated.join(", "))
    }
}

/// Result of `kt rm` and `kt purge`.
#[derive(Debug, Serialize)]
pub struct Deleted {
    pub deleted: Vec<String>,
    /// Set when `purge` ran without `--yes`
    #[serde(skip_serializing_if = "std::ops::Not::not")]
    pub dry_run: bool,
}

impl Output for Deleted {
    fn to_json(&self) -> String {
        json(self)
    }

    fn to_human(&self) -> String {
        match (self.deleted.is_empty(), self.dry_run) {
            (true, _) => "Nothing to delete.".to_string(),
            (false, true) => format!(
                "Would delete {} ticket(s): {}\nRe-run with --yes to delete.",
                self.deleted.len(),
                self.deleted.join(", ")
            ),
            (false, false) => format!(
                "Deleted {} ticket(s): {}",
                self.deleted.len(),
                self.deleted.join(", ")
            ),
        }
    }
}

impl Output for DepNode {
    fn to_json(&self) -> String {
        json(self)
    }

    fn to_human(&self) -> String {
        let mut out = format!("{} [{}] {}", self.id, self.status, self.title);
        render_children(&self.children, "", &mut out);
        out
    }
}

fn render_children(children: &[DepNode], indent: &str, out: &mut String) {
    for (i, child) in children.iter().enumerate() {
        let last = i + 1 == children.len();
        let branch = if last { "└── " } else { "├── " };
        let _ = write!(out, "\n{indent}{branch}{} [{}] {}", child.id, child.status, child.title);
        let next = format!("{indent}{}", if last { "    " } else { "│   " });
        render_children(&child.children, &next, out);
    }
}

impl Output for Stats {
    fn to_json(&self) -> String {
        json(self)
    }

    fn to_human(&self) -> String {
        let mut out = format!(
            "Total: {}\n  open: {}\n  in_progress: {}\n  closed: {}",
            self.total, self.open, self.in_progress, self.closed
        );
        if !self.by_type.is_empty() {
            out.push_str("\nBy type:");
            for (kind, count) in &self.by_type {
                let _ = write!(out, "\n  {kind}: {count}");
            }
        }
        out
    }
}

/// Fields for a new ticket.
#[derive(Debug, Default)]
pub struct NewTicket {
    pub title: String,
    pub description: Option<String>,
    pub ticket_type: Option<TicketType>,
    pub priority: Option<u8>,
    pub assignee: Option<String>,
    pub external_ref: Option<String>,
    pub parent: Option<String>,
    pub deps: Vec<String>,
    pub design: Option<String>,
    pub acceptance: Option<String>,
    pub tests: Option<String>,
}

/// Create a ticket with a fresh id.
pub fn create(settings: &Settings, store: &Store, new: NewTicket) -> Result<Created> {
    if new.title.trim().is_empty() {
        return Err(Error::InvalidInput("title must not be empty".to_string()));
    }

    let parent = new
        .parent
        .as_deref()
        .filter(|p| !p.is_empty())
        .map(|p| store.resolve(p))
        .transpose()?;
    let mut deps = Vec::with_capacity(new.deps.len());
    for dep in &new.deps {
        let id = store.resolve(dep)?.id;
        if !deps.contains(&id) {
            deps.push(id);
        }
    }

    let mut ticket = Ticket::new("", new.title.trim());
    ticket.ticket_type = new.ticket_type.unwrap_or(settings.default_type);
    ticket.priority = new.priority.unwrap_or(settings.default_priority);
    ticket.assignee = non_empty(new.assignee).or_else(|| git_user_name(&settings.project_root));
    ticket.external_ref = non_empty(new.external_ref);
    ticket.parent = parent.map(|p| p.id);
    ticket.deps = deps;
    ticket.description = new.description.unwrap_or_default();
    ticket.design = new.design.unwrap_or_default();
    ticket.acceptance_criteria = new.acceptance.unwrap_or_default();
    ticket.tests = new.tests.unwrap_or_default();

    store.ensure_dir()?;
    for attempt in 1..=CREATE_ATTEMPTS {
        ticket.id = generate_id(&settings.prefix);
        match store.create(&ticket) {
            Ok(()) => {
                return Ok(Created {
                    path: store.path(&ticket.id)?.display().to_string(),
                    id: ticket.id,
                });
            }
            Err(Error::Conflict(_)) => {
                tracing::debug!(id = %ticket.id, attempt, "id collision, retrying");
            }
            Err(e) => return Err(e),
        }
    }
    Err(Error::Conflict(format!(
        "could not find an unused id after {CREATE_ATTEMPTS} attempts"
    )))
}

fn non_empty(value: Option<String>) -> Option<String> {
    value.filter(|v| !v.trim().is_empty())
}

/// `git config user.name` for the project, if git is installed and the name is set.
fn git_user_name(project_root: &Path) -> Option<String> {
    let output = Command::new("git")
        .arg("-C")
        .arg(project_root)
        .args(["config", "user.name"])
        .output()
        .ok()?;
    if !output.status.success() {
        return None;
    }
    let name = String::from_utf8_lossy(&output.stdout).trim().to_string();
    (!name.is_empty()).then_some(name)
}

/// Show tickets. With a single id a lookup failure is the command's error;
/// with several, each failure is collected and the rest are still shown.
pub fn show<S: AsRef<str>>(store: &Store, ids: &[S]) -> Result<Shown> {
    if let [id] = ids {
        return Ok(Shown {
            tickets: vec![store.resolve(id.as_ref())?],
            errors: Vec::new(),
            single: true,
        });
    }

    let mut shown = Shown {
        tickets: Vec::with_capacity(ids.len()),
        errors: Vec::new(),
        single: false,
    };
    for id in ids {
        match store.resolve(id.as_ref()) {
            Ok(t) => shown.tickets.push(t),
            Err(error) => shown.errors.push(BatchError {
                id: id.as_ref().to_string(),
                error,
            }),
        }
    }
    Ok(shown)
}

/// Filters for `kt ls`.
#[derive(Debug, Default)]
pub struct ListFilter {
    pub status: Option<Status>,
    pub ticket_type: Option<TicketType>,
    /// Parent ticket id, partial ids allowed
    pub parent: Option<String>,
}

/// List tickets, newest first, optionally filtered.
pub fn list(store: &Store, filter: &ListFilter) -> Result<TicketList> {
    let parent = match &filter.parent {
        Some(p) => Some(store.resolve(p)?.id),
        None => None,
    };
    let tickets = store
        .list()?
        .into_iter()
        .filter(|t| filter.status.is_none_or(|s| t.status == s))
        .filter(|t| filter.ticket_type.is_none_or(|k| t.ticket_type == k))
        .filter(|t| parent.is_none() || t.parent == parent)
        .collect();
    Ok(TicketList(tickets))
}

/// Append a note to a ticket.
pub fn add_note(store: &Store, id: &str, text: &str) -> Result<NoteAdded> {
    ops::add_note(store, id, text).map(NoteAdded)
}

/// Ready tickets, highest priority first.
pub fn ready(store: &Store) -> Result<TicketList> {
    let mut tickets = ops::ready(&store.list()?);
    tickets.sort_by(|a, b| a.priority.cmp(&b.priority).then(b.created.cmp(&a.created)));
    Ok(TicketList(tickets))
}

pub fn blocked(store: &Store) -> Result<TicketList> {
    Ok(TicketList(ops::blocked(&store.list()?)))
}

/// The most recently created closed tickets.
pub fn closed(store: &Store, limit: usize) -> Result<TicketList> {
    let tickets = store
        .list()?
        .into_iter()
        .filter(|t| t.status == Status::Closed)
        .take(limit)
        .collect();
    Ok(TicketList(tickets))
}

pub fn dep_add(store: &Store, id: &str, dep: &str) -> Result<Changed> {
    let t = ops::add_dep(store, id, dep)?;
    Ok(Changed::from_tickets(&[t]))
}

pub fn dep_rm(store: &Store, id: &str, dep: &str) -> Result<Changed> {
    let t = ops::remove_dep(store, id, dep)?;
    Ok(Changed::from_tickets(&[t]))
}

pub fn link_add(store: &Store, ids: &[String]) -> Result<Changed> {
    Ok(Changed::from_tickets(&ops::link(store, ids)?))
}

pub fn link_rm(store: &Store, a: &str, b: &str) -> Result<Changed> {
    Ok(Changed::from_tickets(&ops::unlink(store, a, b)?))
}

pub fn rm(store: &Store, id: &str) -> Result<Deleted> {
    Ok(Deleted {
        deleted: vec![ops::delete(store, id)?],
        dry_run: false,
    })
}

/// Delete all closed tickets, or only report them unless `yes`.
pub fn purge(store: &Store, yes: bool) -> Result<Deleted> {
    if yes {
        return Ok(Deleted {
            deleted: ops::purge(store)?,
            dry_run: false,
        });
    }
    let all = store.list()?;
    let deleted = ops::purge_candidates(&all);
    ops::check_deletable(&all, &deleted)?;
    Ok(Deleted {
        deleted,
        dry_run: true,
    })
}

/// Block until the ticket is closed. A `timeout` fires the cancel token.
pub fn wait(
    store: &Store,
    id: &str,
    interval: Duration,
    timeout: Option<Duration>,
    cancel: &CancelToken,
) -> Result<TicketView> {
    if let Some(timeout) = timeout {
        let cancel = cancel.clone();
        std::thread::spawn(move || {
            std::thread::sleep(timeout);
            cancel.cancel();
        });
    }
    ops::wait_closed(store, id, interval, cancel).map(TicketView)
}

pub fn stats(store: &Store) -> Result<Stats> {
    Ok(ops::stats(&store.list()?))
}
