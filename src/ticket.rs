//! Ticket model and its markdown codec.
//!
//! A ticket file is a YAML header between `---` lines followed by a markdown
//! body:
//!
//! ```text
//! ---
//! id: kt-a1b2
//! status: open
//! created: 2026-01-09T10:00:00Z
//! type: task
//! priority: 2
//! tests_passed: false
//! ---
//! # Title
//!
//! Description paragraphs.
//!
//! ## Design
//!
//! ...
//! ```
//!
//! Recognized body sections are `Design`, `Acceptance Criteria`, `Tests` and
//! `Notes`. Any other `## ` heading is folded into the description.

use chrono::{DateTime, SubsecRound, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::Path;
use std::str::FromStr;

use crate::{Error, Result};

/// Line that opens and closes the header block.
pub const HEADER_DELIMITER: &str = "---";

/// Default priority for new tickets (0 is highest, 4 lowest).
pub const DEFAULT_PRIORITY: u8 = 2;

/// Ticket status in the workflow.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Status {
    #[default]
    Open,
    InProgress,
    Closed,
}

impl Status {
    pub fn as_str(self) -> &'static str {
        match self {
            Status::Open => "open",
            Status::InProgress => "in_progress",
            Status::Closed => "closed",
        }
    }

    /// Open and in-progress tickets are active; closed is terminal.
    pub fn is_active(self) -> bool {
        !matches!(self, Status::Closed)
    }
}

impl fmt::Display for Status {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Status {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_lowercase().as_str() {
            "open" => Ok(Status::Open),
            "in_progress" | "in-progress" | "inprogress" => Ok(Status::InProgress),
            "closed" => Ok(Status::Closed),
            _ => Err(Error::InvalidInput(format!(
                "invalid status {s:?} (expected open, in_progress or closed)"
            ))),
        }
    }
}

/// Kind of work a ticket tracks.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TicketType {
    Bug,
    Feature,
    #[default]
    Task,
    Epic,
    Chore,
}

impl TicketType {
    pub const ALL: [TicketType; 5] = [
        TicketType::Bug,
        TicketType::Feature,
        TicketType::Task,
        TicketType::Epic,
        TicketType::Chore,
    ];

    pub fn as_str(self) -> &'static str {
        match self {
            TicketType::Bug => "bug",
            TicketType::Feature => "feature",
            TicketType::Task => "task",
            TicketType::Epic => "epic",
            TicketType::Chore => "chore",
        }
    }
}

impl fmt::Display for TicketType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for TicketType {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        let lower = s.to_lowercase();
        TicketType::ALL
            .into_iter()
            .find(|t| t.as_str() == lower)
            .ok_or_else(|| {
                Error::InvalidInput(format!(
                    "invalid type {s:?} (expected bug, feature, task, epic or chore)"
                ))
            })
    }
}

/// A ticket: header fields plus the markdown body sections.
///
/// The serde derive is the JSON shape used for CLI output. The on-disk
/// header has its own private schema with the file's key names.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Ticket {
    /// Unique identifier (e.g., "kt-a1b2"), never changes after creation
    pub id: String,

    pub status: Status,

    /// Ticket IDs this ticket depends on, in insertion order
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub deps: Vec<String>,

    /// Symmetric "related" links
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub links: Vec<String>,

    /// Creation timestamp
    pub created: DateTime<Utc>,

    #[serde(rename = "type")]
    pub ticket_type: TicketType,

    /// Priority level (0-4, lower is higher priority)
    pub priority: u8,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub assignee: Option<String>,

    /// Reference into another tracker (e.g., "gh-123")
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub external_ref: Option<String>,

    /// Parent ticket ID; not checked for existence
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub parent: Option<String>,

    /// Required before closing when `tests` is non-empty
    pub tests_passed: bool,

    pub title: String,

    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub description: String,

    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub design: String,

    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub acceptance_criteria: String,

    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub tests: String,

    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub notes: String,
}

impl Ticket {
    /// Create an open ticket with the given ID and title, created now.
    pub fn new(id: impl Into<String>, title: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            status: Status::Open,
            deps: Vec::new(),
            links: Vec::new(),
            created: Utc::now().trunc_subsecs(0),
            ticket_type: TicketType::default(),
            priority: DEFAULT_PRIORITY,
            assignee: None,
            external_ref: None,
            parent: None,
            tests_passed: false,
            title: title.into(),
            description: String::new(),
            design: String::new(),
            acceptance_criteria: String::new(),
            tests: String::new(),
            notes: String::new(),
        }
    }

    /// Check whether the ticket may move to `closed`.
    pub fn can_close(&self) -> Result<()> {
        if !self.tests.trim().is_empty() && !self.tests_passed {
            return Err(Error::TestsNotPassed {
                id: self.id.clone(),
            });
        }
        Ok(())
    }

    /// Change status, enforcing the tests gate when closing.
    pub fn set_status(&mut self, status: Status) -> Result<()> {
        if status == Status::Closed {
            self.can_close()?;
        }
        self.status = status;
        Ok(())
    }

    /// True when `other` is a dependency or a link of this ticket, or its parent.
    pub fn references(&self, other: &str) -> bool {
        self.parent.as_deref() == Some(other)
            || self.deps.iter().any(|d| d == other)
            || self.links.iter().any(|l| l == other)
    }
}

/// The on-disk header. Field order here is the order written to the file.
#[derive(Debug, Serialize, Deserialize)]
struct Header {
    id: String,

    #[serde(default)]
    status: Status,

    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    deps: Vec<String>,

    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    links: Vec<String>,

    #[serde(default = "unix_epoch")]
    created: DateTime<Utc>,

    #[serde(rename = "type", default)]
    ticket_type: TicketType,

    #[serde(default = "default_priority")]
    priority: u8,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    assignee: Option<String>,

    #[serde(rename = "external-ref", default, skip_serializing_if = "Option::is_none")]
    external_ref: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    parent: Option<String>,

    #[serde(default)]
    tests_passed: bool,
}

fn unix_epoch() -> DateTime<Utc> {
    DateTime::UNIX_EPOCH
}

fn default_priority() -> u8 {
    DEFAULT_PRIORITY
}

impl From<&Ticket> for Header {
    fn from(t: &Ticket) -> Self {
        Self {
            id: t.id.clone(),
            status: t.status,
            deps: t.deps.clone(),
            links: t.links.clone(),
            created: t.created,
            ticket_type: t.ticket_type,
            priority: t.priority,
            assignee: non_empty(t.assignee.clone()),
            external_ref: non_empty(t.external_ref.clone()),
            parent: non_empty(t.parent.clone()),
            tests_passed: t.tests_passed,
        }
    }
}

/// An empty optional field is the same as an absent one.
fn non_empty(value: Option<String>) -> Option<String> {
    value.filter(|v| !v.is_empty())
}

impl Header {
    fn into_ticket(self) -> Ticket {
        Ticket {
            id: self.id,
            status: self.status,
            deps: self.deps,
            links: self.links,
            created: self.created,
            ticket_type: self.ticket_type,
            priority: self.priority,
            assignee: non_empty(self.assignee),
            external_ref: non_empty(self.external_ref),
            parent: non_empty(self.parent),
            tests_passed: self.tests_passed,
            title: String::new(),
            description: String::new(),
            design: String::new(),
            acceptance_criteria: String::new(),
            tests: String::new(),
            notes: String::new(),
        }
    }
}

/// Read and parse a ticket file.
pub fn parse_file(path: &Path) -> Result<Ticket> {
    let data = std::fs::read(path).map_err(|e| Error::io("read", path, e))?;
    parse(&data)
}

/// Parse a ticket from raw file bytes.
pub fn parse(data: &[u8]) -> Result<Ticket> {
    let text = std::str::from_utf8(data)
        .map_err(|e| Error::Format(format!("not valid UTF-8: {e}")))?;
    let (header, body) = split_header(text)?;

    let header: Header = serde_yaml::from_str(header)
        .map_err(|e| Error::Format(format!("parse header: {e}")))?;

    let mut ticket = header.into_ticket();
    parse_body(&mut ticket, body);
    Ok(ticket)
}

/// Serialize a ticket to its file contents. Output is deterministic.
pub fn serialize(ticket: &Ticket) -> Result<String> {
    let header = serde_yaml::to_string(&Header::from(ticket))
        .map_err(|e| Error::Format(format!("serialize header: {e}")))?;

    let mut out = String::with_capacity(header.len() + 256);
    out.push_str(HEADER_DELIMITER);
    out.push('\n');
    out.push_str(&header);
    if !header.ends_with('\n') {
        out.push('\n');
    }
    out.push_str(HEADER_DELIMITER);
    out.push('\n');

    out.push_str("# ");
    out.push_str(&ticket.title);
    out.push('\n');

    if !ticket.description.is_empty() {
        out.push('\n');
        out.push_str(&ticket.description);
        out.push('\n');
    }

    let sections = [
        ("Design", &ticket.design),
        ("Acceptance Criteria", &ticket.acceptance_criteria),
        ("Tests", &ticket.tests),
        ("Notes", &ticket.notes),
    ];
    for (heading, text) in sections {
        if text.is_empty() {
            continue;
        }
        out.push_str("\n## ");
        out.push_str(heading);
        out.push_str("\n\n");
        out.push_str(text);
        out.push('\n');
    }

    Ok(out)
}

/// Split file text into (header, body) around the delimiter lines.
fn split_header(text: &str) -> Result<(&str, &str)> {
    let mut lines = text.split_inclusive('\n');

    let first = lines
        .next()
        .ok_or_else(|| Error::Format("empty file".to_string()))?;
    if first.trim() != HEADER_DELIMITER {
        return Err(Error::Format("missing header delimiter".to_string()));
    }

    let start = first.len();
    let mut offset = start;
    for line in lines {
        if line.trim() == HEADER_DELIMITER {
            return Ok((&text[start..offset], &text[offset + line.len()..]));
        }
        offset += line.len();
    }

    Err(Error::Format("unterminated header".to_string()))
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Section {
    /// Before the title; text here is dropped
    Preamble,
    Title,
    Description,
    Design,
    Acceptance,
    Tests,
    Notes,
}

impl Section {
    fn from_heading(heading: &str) -> Self {
        let heading = heading.to_lowercase();
        if heading.contains("design") {
            Section::Design
        } else if heading.contains("acceptance") {
            Section::Acceptance
        } else if heading.contains("test") {
            Section::Tests
        } else if heading.contains("note") {
            Section::Notes
        } else {
            Section::Description
        }
    }

    fn slot(self, t: &mut Ticket) -> Option<&mut String> {
        match self {
            Section::Preamble => None,
            Section::Title => Some(&mut t.title),
            Section::Description => Some(&mut t.description),
            Section::Design => Some(&mut t.design),
            Section::Acceptance => Some(&mut t.acceptance_criteria),
            Section::Tests => Some(&mut t.tests),
            Section::Notes => Some(&mut t.notes),
        }
    }
}

fn parse_body(ticket: &mut Ticket, body: &str) {
    let mut section = Section::Preamble;
    let mut buf = String::new();

    for line in body.lines() {
        let trimmed = line.trim();

        if section == Section::Preamble {
            if let Some(title) = trimmed.strip_prefix("# ") {
                buf.clear();
                section = Section::Title;
                buf.push_str(title);
                buf.push('\n');
                continue;
            }
        }

        if let Some(heading) = trimmed.strip_prefix("## ") {
            flush(ticket, section, &mut buf);
            section = Section::from_heading(heading);
            continue;
        }

        // A blank line ends the title; what follows is description.
        if section == Section::Title && trimmed.is_empty() {
            flush(ticket, section, &mut buf);
            section = Section::Description;
            continue;
        }

        buf.push_str(line);
        buf.push('\n');
    }

    flush(ticket, section, &mut buf);
}

/// Move buffered text into the section's field. A section seen twice is
/// appended, separated by a blank line.
fn flush(ticket: &mut Ticket, section: Section, buf: &mut String) {
    let content = buf.trim();
    if let Some(slot) = section.slot(ticket) {
        if !content.is_empty() {
            if !slot.is_empty() {
                slot.push_str("\n\n");
            }
            slot.push_str(content);
        }
    }
    buf.clear();
}
