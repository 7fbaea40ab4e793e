//! Ticket operations built on the store.
//!
//! The store guarantees per-ticket atomicity. The rules that span tickets
//! live here: links are kept symmetric, closing respects the tests gate,
//! and a ticket can only be deleted once it is closed and nothing active
//! refers to it.
//!
//! Batch operations never stop at the first bad id; every id gets its own
//! outcome in a [`BatchResult`].

use chrono::{SecondsFormat, Utc};
use serde::{Serialize, Serializer};
use std::collections::{BTreeMap, HashMap, HashSet};
use std::fmt::Display;
use std::thread;
use std::time::Duration;

use crate::lock::CancelToken;
use crate::store::Store;
use crate::ticket::{Status, Ticket};
use crate::{Error, Result};

/// Per-id outcome of a batch operation.
#[derive(Debug, Default, Serialize)]
pub struct BatchResult {
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub updated: Vec<String>,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub errors: Vec<BatchError>,
}

/// One failed id in a batch.
#[derive(Debug, Serialize)]
pub struct BatchError {
    /// The id as given, or the canonical id once resolved
    pub id: String,
    #[serde(serialize_with = "serialize_display")]
    pub error: Error,
}

impl BatchResult {
    pub fn is_ok(&self) -> bool {
        self.errors.is_empty()
    }

    fn fail(&mut self, id: impl Into<String>, error: Error) {
        self.errors.push(BatchError {
            id: id.into(),
            error,
        });
    }
}

fn serialize_display<S: Serializer, T: Display>(value: &T, s: S) -> std::result::Result<S::Ok, S::Error> {
    s.collect_str(value)
}

/// Apply `mutate` to each id under its own exclusive lock, collecting
/// per-id results.
fn for_each_locked<S, F>(store: &Store, ids: &[S], mut mutate: F) -> BatchResult
where
    S: AsRef<str>,
    F: FnMut(&mut Ticket) -> Result<()>,
{
    let mut result = BatchResult::default();
    for id in ids {
        let id = id.as_ref();
        let mut locked = match store.resolve_for_update(id) {
            Ok(locked) => locked,
            Err(e) => {
                result.fail(id, e);
                continue;
            }
        };

        if let Err(e) = mutate(&mut locked.ticket) {
            locked.release();
            result.fail(locked.ticket.id.clone(), e);
            continue;
        }

        match locked.save_and_release() {
            Ok(()) => result.updated.push(locked.ticket.id.clone()),
            Err(e) => result.fail(locked.ticket.id.clone(), e),
        }
    }
    result
}

/// Set the status of each ticket. Closing a ticket whose tests haven't
/// passed fails for that ticket only.
pub fn set_status<S: AsRef<str>>(store: &Store, ids: &[S], status: Status) -> BatchResult {
    for_each_locked(store, ids, |t| t.set_status(status))
}

pub fn start<S: AsRef<str>>(store: &Store, ids: &[S]) -> BatchResult {
    set_status(store, ids, Status::InProgress)
}

pub fn close<S: AsRef<str>>(store: &Store, ids: &[S]) -> BatchResult {
    set_status(store, ids, Status::Closed)
}

pub fn reopen<S: AsRef<str>>(store: &Store, ids: &[S]) -> BatchResult {
    set_status(store, ids, Status::Open)
}

/// Mark each ticket's tests as passed.
pub fn mark_passed<S: AsRef<str>>(store: &Store, ids: &[S]) -> BatchResult {
    for_each_locked(store, ids, |t| {
        t.tests_passed = true;
        Ok(())
    })
}

/// Make `id` depend on `dep`.
pub fn add_dep(store: &Store, id: &str, dep: &str) -> Result<Ticket> {
    let target = store.resolve(id)?.id;
    let dep = store.resolve(dep)?.id;
    if target == dep {
        return Err(Error::InvalidInput(format!("{target} cannot depend on itself")));
    }

    store.update(&target, |t| {
        if t.deps.contains(&dep) {
            return Err(Error::Conflict(format!("{} already depends on {}", t.id, dep)));
        }
        t.deps.push(dep.clone());
        Ok(())
    })
}

/// Remove the dependency of `id` on `dep`. A `dep` that appears verbatim in
/// the ticket's deps is used as is, so a ticket that no longer exists can
/// still be removed when given in full.
pub fn remove_dep(store: &Store, id: &str, dep: &str) -> Result<Ticket> {
    let target = store.resolve(id)?;
    let dep = if target.deps.iter().any(|d| d == dep) {
        dep.to_string()
    } else {
        match store.resolve(dep) {
            Ok(t) => t.id,
            Err(Error::NotFound(_)) => dep.to_string(),
            Err(e) => return Err(e),
        }
    };
    let target = target.id;

    store.update(&target, |t| {
        let before = t.deps.len();
        t.deps.retain(|d| *d != dep);
        if t.deps.len() == before {
            return Err(Error::InvalidInput(format!("{} does not depend on {}", t.id, dep)));
        }
        Ok(())
    })
}

/// Link every given ticket to every other one.
///
/// All ids are resolved first, then the tickets are locked in sorted order,
/// updated, saved, and only then released.
pub fn link<S: AsRef<str>>(store: &Store, ids: &[S]) -> Result<Vec<Ticket>> {
    let mut canonical = Vec::with_capacity(ids.len());
    for id in ids {
        canonical.push(store.resolve(id.as_ref())?.id);
    }
    canonical.sort();
    canonical.dedup();
    if canonical.len() < 2 {
        return Err(Error::InvalidInput("link needs at least two distinct tickets".to_string()));
    }

    let mut locked = store.lock_sorted(&canonical)?;
    for lt in locked.iter_mut() {
        for other in &canonical {
            if *other != lt.ticket.id && !lt.ticket.links.contains(other) {
                lt.ticket.links.push(other.clone());
            }
        }
    }

    for lt in locked.iter_mut() {
        lt.save()?;
    }
    Ok(release_all(locked))
}

/// Remove the link between two tickets, in both directions.
pub fn unlink(store: &Store, a: &str, b: &str) -> Result<Vec<Ticket>> {
    let a = store.resolve(a)?.id;
    let b = store.resolve(b)?.id;
    if a == b {
        return Err(Error::InvalidInput(format!("cannot unlink {a} from itself")));
    }

    let mut locked = store.lock_sorted(&[a.clone(), b.clone()])?;
    for lt in locked.iter_mut() {
        let other = if lt.ticket.id == a { &b } else { &a };
        lt.ticket.links.retain(|l| l != other);
    }

    for lt in locked.iter_mut() {
        lt.save()?;
    }
    Ok(release_all(locked))
}

fn release_all(locked: Vec<crate::store::LockedTicket<'_>>) -> Vec<Ticket> {
    locked
        .into_iter()
        .map(|mut lt| {
            lt.release();
            lt.ticket
        })
        .collect()
}

/// Closed-status lookup used by the dependency queries.
fn closed_set(all: &[Ticket]) -> HashSet<&str> {
    all.iter()
        .filter(|t| t.status == Status::Closed)
        .map(|t| t.id.as_str())
        .collect()
}

/// Active tickets whose dependencies are all closed. A missing dependency
/// counts as unresolved.
pub fn ready(all: &[Ticket]) -> Vec<Ticket> {
    let closed = closed_set(all);
    all.iter()
        .filter(|t| t.status.is_active())
        .filter(|t| t.deps.iter().all(|d| closed.contains(d.as_str())))
        .cloned()
        .collect()
}

/// Active tickets with at least one dependency that isn't closed.
pub fn blocked(all: &[Ticket]) -> Vec<Ticket> {
    let closed = closed_set(all);
    all.iter()
        .filter(|t| t.status.is_active())
        .filter(|t| t.deps.iter().any(|d| !closed.contains(d.as_str())))
        .cloned()
        .collect()
}

/// Node of a dependency tree.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct DepNode {
    pub id: String,
    /// Ticket status, or "unknown" for a dependency that can't be read
    pub status: String,
    pub title: String,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub children: Vec<DepNode>,
}

/// Build the dependency tree under `id`. Unless `full`, a ticket already
/// shown is not expanded a second time.
pub fn dep_tree(store: &Store, id: &str, full: bool) -> Result<DepNode> {
    let root = store.resolve(id)?;
    let mut seen = HashSet::new();
    let mut path = Vec::new();
    build_tree(store, root, full, &mut seen, &mut path)
}

fn build_tree(
    store: &Store,
    t: Ticket,
    full: bool,
    seen: &mut HashSet<String>,
    path: &mut Vec<String>,
) -> Result<DepNode> {
    let mut node = DepNode {
        id: t.id.clone(),
        status: t.status.to_string(),
        title: t.title.clone(),
        children: Vec::new(),
    };

    // A cycle is never expanded, even in full mode.
    if path.contains(&t.id) || (!full && !seen.insert(t.id.clone())) {
        return Ok(node);
    }

    path.push(t.id.clone());
    for dep_id in &t.deps {
        match store.get(dep_id) {
            Ok(dep) => node.children.push(build_tree(store, dep, full, seen, path)?),
            Err(Error::NotFound(_) | Error::Format(_) | Error::InvalidId(_)) => {
                node.children.push(DepNode {
                    id: dep_id.clone(),
                    status: "unknown".to_string(),
                    title: "(not found)".to_string(),
                    children: Vec::new(),
                });
            }
            Err(e) => return Err(e),
        }
    }
    path.pop();

    Ok(node)
}

/// Check that every ticket in `ids` may be deleted: it must be closed and no
/// ticket outside `ids` that is still active may use it as parent,
/// dependency or link.
pub fn check_deletable(all: &[Ticket], ids: &[String]) -> Result<()> {
    let by_id: HashMap<&str, &Ticket> = all.iter().map(|t| (t.id.as_str(), t)).collect();
    let doomed: HashSet<&str> = ids.iter().map(String::as_str).collect();

    for id in ids {
        match by_id.get(id.as_str()) {
            Some(t) if t.status != Status::Closed => {
                return Err(Error::Conflict(format!(
                    "cannot delete {id}: status is {}, not closed",
                    t.status
                )));
            }
            Some(_) => {}
            None => return Err(Error::NotFound(id.clone())),
        }
    }

    for t in all.iter().filter(|t| t.status.is_active()) {
        if doomed.contains(t.id.as_str()) || !doomed.iter().any(|d| t.references(d)) {
            continue;
        }
        if let Some(parent) = t.parent.as_deref().filter(|p| doomed.contains(p)) {
            return Err(Error::Conflict(format!(
                "cannot delete {parent}: ticket {} has it as parent",
                t.id
            )));
        }
        if let Some(dep) = t.deps.iter().find(|d| doomed.contains(d.as_str())) {
            return Err(Error::Conflict(format!(
                "cannot delete {dep}: ticket {} depends on it",
                t.id
            )));
        }
        if let Some(link) = t.links.iter().find(|l| doomed.contains(l.as_str())) {
            return Err(Error::Conflict(format!(
                "cannot delete {link}: ticket {} links to it",
                t.id
            )));
        }
    }

    Ok(())
}

/// Delete one closed, unreferenced ticket. Returns its id.
pub fn delete(store: &Store, id: &str) -> Result<String> {
    let id = store.resolve(id)?.id;
    let all = store.list()?;
    check_deletable(&all, std::slice::from_ref(&id))?;
    remove_if_closed(store, &id)?;
    Ok(id)
}

/// Delete a ticket under its exclusive lock, provided it is still closed.
/// The reference check runs on an earlier snapshot; this catches a reopen
/// that landed after it.
fn remove_if_closed(store: &Store, id: &str) -> Result<()> {
    let mut locked = store.get_for_update(id)?;
    if locked.ticket.status != Status::Closed {
        locked.release();
        return Err(Error::Conflict(format!(
            "cannot delete {id}: status is {}, not closed",
            locked.ticket.status
        )));
    }
    locked.delete()
}

/// Closed tickets that `purge` would delete.
pub fn purge_candidates(all: &[Ticket]) -> Vec<String> {
    all.iter()
        .filter(|t| t.status == Status::Closed)
        .map(|t| t.id.clone())
        .collect()
}

/// Delete every closed ticket, provided no active ticket refers to any of
/// them. Returns the deleted ids.
pub fn purge(store: &Store) -> Result<Vec<String>> {
    let all = store.list()?;
    let ids = purge_candidates(&all);
    check_deletable(&all, &ids)?;

    let mut deleted = Vec::with_capacity(ids.len());
    for id in ids {
        match remove_if_closed(store, &id) {
            Ok(()) => deleted.push(id),
            Err(e @ (Error::Conflict(_) | Error::NotFound(_))) => {
                tracing::warn!(id = %id, error = %e, "not purged");
            }
            Err(e) => return Err(e),
        }
    }
    tracing::info!(count = deleted.len(), "purged closed tickets");
    Ok(deleted)
}

/// Append a timestamped note to a ticket's notes, under its exclusive lock.
pub fn add_note(store: &Store, id: &str, text: &str) -> Result<Ticket> {
    let text = text.trim();
    if text.is_empty() {
        return Err(Error::InvalidInput("note text required".to_string()));
    }
    if text.lines().any(|l| l.trim().starts_with("## ")) {
        return Err(Error::InvalidInput("note must not contain '## ' headings".to_string()));
    }

    let id = store.resolve(id)?.id;
    let stamp = Utc::now().to_rfc3339_opts(SecondsFormat::Secs, true);
    store.update(&id, |t| {
        if !t.notes.is_empty() {
            t.notes.push_str("\n\n");
        }
        t.notes.push_str(&format!("**{stamp}**\n\n{text}"));
        Ok(())
    })
}

/// Poll until the ticket is closed or `cancel` fires.
pub fn wait_closed(store: &Store, id: &str, poll: Duration, cancel: &CancelToken) -> Result<Ticket> {
    let mut t = store.resolve(id)?;
    loop {
        if t.status == Status::Closed {
            return Ok(t);
        }
        if cancel.is_cancelled() {
            return Err(Error::WaitCancelled(t.id));
        }
        thread::sleep(poll);
        t = store.get(&t.id)?;
    }
}

/// Ticket counts by status and type.
#[derive(Debug, Default, PartialEq, Eq, Serialize)]
pub struct Stats {
    pub open: usize,
    pub in_progress: usize,
    pub closed: usize,
    pub total: usize,
    pub by_type: BTreeMap<String, usize>,
}

pub fn stats(all: &[Ticket]) -> Stats {
    let mut stats = Stats::default();
    for t in all {
        match t.status {
            Status::Open => stats.open += 1,
            Status::InProgress => stats.in_progress += 1,
            Status::Closed => stats.closed += 1,
        }
        *stats.by_type.entry(t.ticket_type.to_string()).or_default() += 1;
    }
    stats.total = all.len();
    stats
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_utils::{TestEnv, create_ticket, new_ticket};
    use std::sync::Arc;

    #[test]
    fn test_close_blocked_by_tests_gate() {
        let env = TestEnv::new();
        let store = env.store();
        let mut t = new_ticket("kt-x", "Gated", Status::Open);
        t.tests = "- T1".to_string();
        store.save(&t).unwrap();

        let result = close(&store, &["kt-x"]);
        assert!(!result.is_ok());
        assert!(matches!(result.errors[0].error, Error::TestsNotPassed { .. }));
        assert_eq!(store.get("kt-x").unwrap().status, Status::Open);

        assert!(mark_passed(&store, &["kt-x"]).is_ok());
        let result = close(&store, &["kt-x"]);
        assert_eq!(result.updated, vec!["kt-x"]);

        let text = std::fs::read_to_string(store.path("kt-x").unwrap()).unwrap();
        assert!(text.contains("status: closed"));
    }

    #[test]
    fn test_batch_collects_errors_per_id() {
        let env = TestEnv::new();
        let store = env.store();
        create_ticket(&store, "kt-aaa1", "One", Status::Open);
        create_ticket(&store, "kt-bbb1", "Two", Status::Open);
        create_ticket(&store, "kt-bbb2", "Three", Status::Open);

        let result = start(&store, &["aaa", "zzz", "bbb", "kt-bbb2"]);
        assert_eq!(result.updated, vec!["kt-aaa1", "kt-bbb2"]);
        assert_eq!(result.errors.len(), 2);
        assert_eq!(result.errors[0].id, "zzz");
        assert!(matches!(result.errors[0].error, Error::NotFound(_)));
        assert!(matches!(result.errors[1].error, Error::Ambiguous { .. }));

        let json = serde_json::to_string(&result).unwrap();
        assert!(json.contains("\"error\":\"Ticket \\\"zzz\\\" not found\""));
    }

    #[test]
    fn test_reopen() {
        let env = TestEnv::new();
        let store = env.store();
        create_ticket(&store, "kt-a", "A", Status::Closed);

        assert!(reopen(&store, &["kt-a"]).is_ok());
        assert_eq!(store.get("kt-a").unwrap().status, Status::Open);
    }

    #[test]
    fn test_add_and_remove_dep() {
        let env = TestEnv::new();
        let store = env.store();
        create_ticket(&store, "kt-a111", "A", Status::Open);
        create_ticket(&store, "kt-b222", "B", Status::Open);

        let t = add_dep(&store, "a111", "b222").unwrap();
        assert_eq!(t.deps, vec!["kt-b222"]);
        assert!(matches!(add_dep(&store, "a111", "b222"), Err(Error::Conflict(_))));
        assert!(matches!(add_dep(&store, "a111", "a111"), Err(Error::InvalidInput(_))));

        let t = remove_dep(&store, "a111", "b222").unwrap();
        assert!(t.deps.is_empty());
        assert!(matches!(remove_dep(&store, "a111", "b222"), Err(Error::InvalidInput(_))));
    }

    #[test]
    fn test_remove_dangling_dep() {
        let env = TestEnv::new();
        let store = env.store();
        let mut t = new_ticket("kt-a", "A", Status::Open);
        t.deps = vec!["kt-gone".to_string()];
        store.save(&t).unwrap();

        let t = remove_dep(&store, "kt-a", "kt-gone").unwrap();
        assert!(t.deps.is_empty());
    }

    #[test]
    fn test_remove_dep_prefers_exact_match() {
        let env = TestEnv::new();
        let store = env.store();
        create_ticket(&store, "kt-gone2", "Still here", Status::Open);
        let mut t = new_ticket("kt-a", "A", Status::Open);
        t.deps = vec!["kt-gone".to_string(), "kt-gone2".to_string()];
        store.save(&t).unwrap();

        let t = remove_dep(&store, "kt-a", "kt-gone").unwrap();
        assert_eq!(t.deps, vec!["kt-gone2"]);
    }

    #[test]
    fn test_add_note() {
        let env = TestEnv::new();
        let store = env.store();
        create_ticket(&store, "kt-n", "Noted", Status::Open);

        add_note(&store, "kt-n", "  first  ").unwrap();
        let t = add_note(&store, "n", "second\nline").unwrap();

        let blocks: Vec<&str> = t.notes.split("\n\n").collect();
        assert_eq!(blocks.len(), 4);
        assert!(blocks[0].starts_with("**") && blocks[0].ends_with("Z**"));
        assert_eq!(blocks[1], "first");
        assert_eq!(blocks[3], "second\nline");
        assert_eq!(store.get("kt-n").unwrap().notes, t.notes);

        assert!(matches!(add_note(&store, "kt-n", "   "), Err(Error::InvalidInput(_))));
        assert!(matches!(
            add_note(&store, "kt-n", "text\n## Heading"),
            Err(Error::InvalidInput(_))
        ));
    }

    #[test]
    fn test_concurrent_notes_are_all_kept() {
        let env = TestEnv::new();
        let store = Arc::new(env.store());
        create_ticket(&store, "kt-n", "Busy", Status::Open);

        let handles: Vec<_> = (0..8)
            .map(|i| {
                let store = Arc::clone(&store);
                thread::spawn(move || add_note(&store, "kt-n", &format!("note {i}")).map(|_| ()))
            })
            .collect();
        for h in handles {
            h.join().unwrap().unwrap();
        }

        let notes = store.get("kt-n").unwrap().notes;
        for i in 0..8 {
            assert!(notes.contains(&format!("note {i}")), "missing note {i} in {notes}");
        }
    }

    #[test]
    fn test_link_is_symmetric() {
        let env = TestEnv::new();
        let store = env.store();
        create_ticket(&store, "kt-c", "C", Status::Open);
        create_ticket(&store, "kt-a", "A", Status::Open);
        create_ticket(&store, "kt-b", "B", Status::Open);

        let linked = link(&store, &["kt-c", "kt-a", "kt-b", "kt-a"]).unwrap();
        let ids: Vec<&str> = linked.iter().map(|t| t.id.as_str()).collect();
        assert_eq!(ids, vec!["kt-a", "kt-b", "kt-c"]);

        assert_eq!(store.get("kt-a").unwrap().links, vec!["kt-b", "kt-c"]);
        assert_eq!(store.get("kt-b").unwrap().links, vec!["kt-a", "kt-c"]);
        assert_eq!(store.get("kt-c").unwrap().links, vec!["kt-a", "kt-b"]);

        // Linking again adds nothing.
        link(&store, &["kt-a", "kt-b"]).unwrap();
        assert_eq!(store.get("kt-a").unwrap().links, vec!["kt-b", "kt-c"]);
    }

    #[test]
    fn test_link_needs_two_tickets() {
        let env = TestEnv::new();
        let store = env.store();
        create_ticket(&store, "kt-a", "A", Status::Open);

        assert!(matches!(link(&store, &["kt-a", "kt-a"]), Err(Error::InvalidInput(_))));
        assert!(matches!(link(&store, &["kt-a", "kt-none"]), Err(Error::NotFound(_))));
        assert!(store.get("kt-a").unwrap().links.is_empty());
    }

    #[test]
    fn test_unlink_both_directions() {
        let env = TestEnv::new();
        let store = env.store();
        create_ticket(&store, "kt-a", "A", Status::Open);
        create_ticket(&store, "kt-b", "B", Status::Open);
        create_ticket(&store, "kt-c", "C", Status::Open);
        link(&store, &["kt-a", "kt-b", "kt-c"]).unwrap();

        unlink(&store, "kt-b", "kt-a").unwrap();
        assert_eq!(store.get("kt-a").unwrap().links, vec!["kt-c"]);
        assert_eq!(store.get("kt-b").unwrap().links, vec!["kt-c"]);
        assert_eq!(store.get("kt-c").unwrap().links, vec!["kt-a", "kt-b"]);
    }

    #[test]
    fn test_concurrent_opposite_links_do_not_deadlock() {
        let env = TestEnv::new();
        let store = Arc::new(env.store());
        for id in ["kt-a", "kt-b", "kt-c"] {
            create_ticket(&store, id, id, Status::Open);
        }

        let handles: Vec<_> = (0..6)
            .map(|i| {
                let store = Arc::clone(&store);
                thread::spawn(move || {
                    let ids = if i % 2 == 0 {
                        ["kt-a", "kt-b", "kt-c"]
                    } else {
                        ["kt-c", "kt-b", "kt-a"]
                    };
                    if i % 3 == 2 {
                        unlink(&store, ids[0], ids[2]).map(|_| ())
                    } else {
                        link(&store, &ids).map(|_| ())
                    }
                })
            })
            .collect();
        for h in handles {
            h.join().unwrap().unwrap();
        }

        // Whatever the interleaving, links stay symmetric.
        let all = store.list().unwrap();
        for t in &all {
            for other in &t.links {
                let o = all.iter().find(|x| &x.id == other).unwrap();
                assert!(o.links.contains(&t.id), "{} -> {} not mirrored", t.id, other);
            }
        }
    }

    #[test]
    fn test_ready_and_blocked() {
        let mut done = new_ticket("kt-done", "Done", Status::Closed);
        done.created = "2026-01-01T00:00:00Z".parse().unwrap();
        let free = new_ticket("kt-free", "Free", Status::Open);
        let mut waits_done = new_ticket("kt-w1", "Waits on done", Status::InProgress);
        waits_done.deps = vec!["kt-done".to_string()];
        let mut waits_free = new_ticket("kt-w2", "Waits on free", Status::Open);
        waits_free.deps = vec!["kt-done".to_string(), "kt-free".to_string()];
        let mut waits_missing = new_ticket("kt-w3", "Waits on nothing", Status::Open);
        waits_missing.deps = vec!["kt-missing".to_string()];

        let all = vec![done, free, waits_done, waits_free, waits_missing];
        let ready_ids: Vec<String> = ready(&all).into_iter().map(|t| t.id).collect();
        let blocked_ids: Vec<String> = blocked(&all).into_iter().map(|t| t.id).collect();

        assert_eq!(ready_ids, vec!["kt-free", "kt-w1"]);
        assert_eq!(blocked_ids, vec!["kt-w2", "kt-w3"]);
    }

    #[test]
    fn test_dep_tree() {
        let env = TestEnv::new();
        let store = env.store();
        let mut a = new_ticket("kt-a", "A", Status::Open);
        a.deps = vec!["kt-b".to_string(), "kt-c".to_string(), "kt-gone".to_string()];
        let mut b = new_ticket("kt-b", "B", Status::Open);
        b.deps = vec!["kt-c".to_string()];
        let c = new_ticket("kt-c", "C", Status::Closed);
        for t in [&a, &b, &c] {
            store.save(t).unwrap();
        }

        let tree = dep_tree(&store, "kt-a", false).unwrap();
        assert_eq!(tree.children.len(), 3);
        assert_eq!(tree.children[0].id, "kt-b");
        assert_eq!(tree.children[0].children[0].id, "kt-c");
        assert_eq!(tree.children[0].children[0].status, "closed");
        // Already shown under kt-b
        assert_eq!(tree.children[1].id, "kt-c");
        assert!(tree.children[1].children.is_empty());
        assert_eq!(tree.children[2].status, "unknown");
    }

    #[test]
    fn test_dep_tree_survives_cycles() {
        let env = TestEnv::new();
        let store = env.store();
        let mut a = new_ticket("kt-a", "A", Status::Open);
        a.deps = vec!["kt-b".to_string()];
        let mut b = new_ticket("kt-b", "B", Status::Open);
        b.deps = vec!["kt-a".to_string()];
        store.save(&a).unwrap();
        store.save(&b).unwrap();

        let tree = dep_tree(&store, "kt-a", true).unwrap();
        assert_eq!(tree.children[0].id, "kt-b");
        assert_eq!(tree.children[0].children[0].id, "kt-a");
        assert!(tree.children[0].children[0].children.is_empty());
    }

    #[test]
    fn test_check_deletable() {
        let closed = new_ticket("kt-old", "Old", Status::Closed);
        let open = new_ticket("kt-open", "Open", Status::Open);
        let mut child = new_ticket("kt-child", "Child", Status::Open);
        child.parent = Some("kt-old".to_string());
        let mut closed_ref = new_ticket("kt-closed-ref", "Closed ref", Status::Closed);
        closed_ref.deps = vec!["kt-old".to_string()];

        let all = vec![closed.clone(), open.clone(), closed_ref.clone()];
        assert!(check_deletable(&all, &["kt-old".to_string()]).is_ok());
        assert!(matches!(
            check_deletable(&all, &["kt-open".to_string()]),
            Err(Error::Conflict(_))
        ));
        assert!(matches!(
            check_deletable(&all, &["kt-nope".to_string()]),
            Err(Error::NotFound(_))
        ));

        let all = vec![closed, open, child];
        let err = check_deletable(&all, &["kt-old".to_string()]).unwrap_err();
        assert!(err.to_string().contains("kt-child has it as parent"));
    }

    #[test]
    fn test_delete_refuses_referenced_ticket() {
        let env = TestEnv::new();
        let store = env.store();
        create_ticket(&store, "kt-old", "Old", Status::Closed);
        let mut user = new_ticket("kt-user", "User", Status::Open);
        user.links = vec!["kt-old".to_string()];
        store.save(&user).unwrap();

        assert!(matches!(delete(&store, "old"), Err(Error::Conflict(_))));
        assert!(store.exists("kt-old").unwrap());

        store
            .update("kt-user", |t| t.set_status(Status::Closed))
            .unwrap();
        assert_eq!(delete(&store, "old").unwrap(), "kt-old");
        assert!(!store.exists("kt-old").unwrap());
    }

    #[test]
    fn test_remove_refuses_reopened_ticket() {
        let env = TestEnv::new();
        let store = env.store();
        create_ticket(&store, "kt-back", "Reopened", Status::Closed);
        let all = store.list().unwrap();
        assert!(check_deletable(&all, &["kt-back".to_string()]).is_ok());

        // Reopened after the snapshot was checked
        store.update("kt-back", |t| t.set_status(Status::Open)).unwrap();

        assert!(matches!(remove_if_closed(&store, "kt-back"), Err(Error::Conflict(_))));
        assert!(store.exists("kt-back").unwrap());
    }

    #[test]
    fn test_purge() {
        let env = TestEnv::new();
        let store = env.store();
        create_ticket(&store, "kt-c1", "C1", Status::Closed);
        create_ticket(&store, "kt-c2", "C2", Status::Closed);
        create_ticket(&store, "kt-o1", "O1", Status::Open);

        let mut purged = purge(&store).unwrap();
        purged.sort();
        assert_eq!(purged, vec!["kt-c1", "kt-c2"]);
        let left: Vec<String> = store.list().unwrap().into_iter().map(|t| t.id).collect();
        assert_eq!(left, vec!["kt-o1"]);
    }

    #[test]
    fn test_purge_blocked_by_active_reference() {
        let env = TestEnv::new();
        let store = env.store();
        create_ticket(&store, "kt-c1", "C1", Status::Closed);
        let mut o = new_ticket("kt-o1", "O1", Status::Open);
        o.deps = vec!["kt-c1".to_string()];
        store.save(&o).unwrap();

        assert!(matches!(purge(&store), Err(Error::Conflict(_))));
        assert!(store.exists("kt-c1").unwrap());
    }

    #[test]
    fn test_wait_closed() {
        let env = TestEnv::new();
        let store = Arc::new(env.store());
        create_ticket(&store, "kt-w", "Wait for me", Status::Open);

        let closer = {
            let store = Arc::clone(&store);
            thread::spawn(move || {
                thread::sleep(Duration::from_millis(100));
                assert!(close(&store, &["kt-w"]).is_ok());
            })
        };

        let t = wait_closed(&store, "kt-w", Duration::from_millis(20), &CancelToken::new()).unwrap();
        closer.join().unwrap();
        assert_eq!(t.status, Status::Closed);
    }

    #[test]
    fn test_wait_cancelled() {
        let env = TestEnv::new();
        let store = env.store();
        create_ticket(&store, "kt-w", "Never closed", Status::Open);

        let cancel = CancelToken::new();
        cancel.cancel();
        let err = wait_closed(&store, "kt-w", Duration::from_millis(10), &cancel).unwrap_err();
        assert!(matches!(err, Error::WaitCancelled(_)));
    }

    #[test]
    fn test_stats() {
        let mut bug = new_ticket("kt-1", "Bug", Status::Open);
        bug.ticket_type = crate::ticket::TicketType::Bug;
        let all = vec![
            bug,
            new_ticket("kt-2", "Two", Status::InProgress),
            new_ticket("kt-3", "Three", Status::Closed),
        ];

        let s = stats(&all);
        assert_eq!((s.open, s.in_progress, s.closed, s.total), (1, 1, 1, 3));
        assert_eq!(s.by_type.get("bug"), Some(&1));
        assert_eq!(s.by_type.get("task"), Some(&2));
    }
}
