//! Directory-backed ticket store.
//!
//! Each ticket lives in `<dir>/<id>.md`. Lock files live under
//! `<dir>/.locks/`:
//! - `<id>.lock` - per-ticket lock; shared for reads, exclusive for writes
//! - `store.lock` - store-wide lock; shared while enumerating the directory
//!
//! Writes go to a temp file in the same directory which is then renamed over
//! the ticket file, so readers see either the old or the new content in full.
//!
//! Read-modify-write sequences go through [`LockedTicket`], which keeps the
//! per-ticket exclusive lock from the read until the write.
//!
//! When several tickets must change together, use [`Store::lock_sorted`]:
//! locks are always taken in sorted id order so two such operations cannot
//! deadlock.

use std::fs;
use std::io::{self, Write};
use std::path::{Path, PathBuf};

use crate::lock::{FileLock, LockOptions};
use crate::ticket::{self, Ticket};
use crate::{Error, Result};

/// Default store directory name, relative to the project root.
pub const DEFAULT_DIR: &str = ".ktickets";

const LOCK_DIR: &str = ".locks";
const STORE_LOCK: &str = "store.lock";
const TICKET_EXT: &str = "md";

/// Handle on a store directory.
#[derive(Debug, Clone)]
pub struct Store {
    dir: PathBuf,
    lock_options: LockOptions,
}

impl Store {
    /// Create a store rooted at `dir` with default lock options.
    /// Nothing is created here. The directory appears on the first write,
    /// or on the first lock taken by a read, which creates `<dir>/.locks`.
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self {
            dir: dir.into(),
            lock_options: LockOptions::default(),
        }
    }

    pub fn with_lock_options(mut self, lock_options: LockOptions) -> Self {
        self.lock_options = lock_options;
        self
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    pub fn lock_options(&self) -> &LockOptions {
        &self.lock_options
    }

    /// Create the store directory if it doesn't exist.
    pub fn ensure_dir(&self) -> Result<()> {
        fs::create_dir_all(&self.dir).map_err(|e| Error::io("create store dir", &self.dir, e))
    }

    /// Path of the file for ticket `id`.
    pub fn path(&self, id: &str) -> Result<PathBuf> {
        validate_id(id)?;
        Ok(self.dir.join(format!("{id}.{TICKET_EXT}")))
    }

    fn lock_path(&self, id: &str) -> PathBuf {
        self.dir.join(LOCK_DIR).join(format!("{id}.lock"))
    }

    fn store_lock_path(&self) -> PathBuf {
        self.dir.join(LOCK_DIR).join(STORE_LOCK)
    }

    /// True if a file for `id` exists.
    pub fn exists(&self, id: &str) -> Result<bool> {
        Ok(self.path(id)?.is_file())
    }

    /// All tickets, newest first. Files that fail to parse are skipped.
    pub fn list(&self) -> Result<Vec<Ticket>> {
        let ids = self.scan(|_| true)?;

        let mut tickets = Vec::with_capacity(ids.len());
        for id in ids {
            match self.get(&id) {
                Ok(t) => tickets.push(t),
                Err(e @ (Error::Format(_) | Error::NotFound(_))) => {
                    tracing::warn!(id = %id, error = %e, "skipping unreadable ticket");
                }
                Err(e) => return Err(e),
            }
        }

        tickets.sort_by(|a, b| b.created.cmp(&a.created));
        Ok(tickets)
    }

    /// Read a ticket by exact id.
    pub fn get(&self, id: &str) -> Result<Ticket> {
        let path = self.path(id)?;
        let _lock = FileLock::acquire_shared(&self.lock_path(id), &self.lock_options)?;
        read_ticket(&path, id)
    }

    /// Find a ticket by exact id, or else by a unique id substring.
    pub fn resolve(&self, partial: &str) -> Result<Ticket> {
        match self.get(partial) {
            Ok(t) => return Ok(t),
            Err(Error::NotFound(_) | Error::InvalidId(_)) => {}
            Err(e) => return Err(e),
        }

        if partial.is_empty() {
            return Err(Error::NotFound(partial.to_string()));
        }

        let mut matches = self.scan(|id| id.contains(partial))?;
        match matches.len() {
            0 => Err(Error::NotFound(partial.to_string())),
            // Re-read under the ticket's own lock; the scan held only the store lock.
            1 => self.get(&matches.remove(0)),
            _ => Err(Error::Ambiguous {
                partial: partial.to_string(),
                candidates: matches,
            }),
        }
    }

    /// Write a ticket, replacing any existing file for its id.
    pub fn save(&self, ticket: &Ticket) -> Result<()> {
        let path = self.path(&ticket.id)?;
        self.ensure_dir()?;
        let _lock = FileLock::acquire_exclusive(&self.lock_path(&ticket.id), &self.lock_options)?;
        write_ticket(&path, ticket)
    }

    /// Write a new ticket. Fails with [`Error::Conflict`] if the id is taken.
    pub fn create(&self, ticket: &Ticket) -> Result<()> {
        let path = self.path(&ticket.id)?;
        self.ensure_dir()?;
        let _lock = FileLock::acquire_exclusive(&self.lock_path(&ticket.id), &self.lock_options)?;
        if path.exists() {
            return Err(Error::Conflict(format!("ticket {} already exists", ticket.id)));
        }
        write_ticket(&path, ticket)
    }

    /// Remove a ticket file.
    pub fn delete(&self, id: &str) -> Result<()> {
        let path = self.path(id)?;
        let _lock = FileLock::acquire_exclusive(&self.lock_path(id), &self.lock_options)?;
        remove_ticket(&path, id)
    }

    /// Read a ticket and keep its exclusive lock until the returned handle
    /// is saved or released.
    pub fn get_for_update(&self, id: &str) -> Result<LockedTicket<'_>> {
        let path = self.path(id)?;
        let lock = FileLock::acquire_exclusive(&self.lock_path(id), &self.lock_options)?;
        // On error the lock drops here and is released.
        let ticket = read_ticket(&path, id)?;
        Ok(LockedTicket {
            ticket,
            store: self,
            lock: Some(lock),
        })
    }

    /// Resolve a partial id, then lock and re-read the ticket for update.
    pub fn resolve_for_update(&self, partial: &str) -> Result<LockedTicket<'_>> {
        let id = self.resolve(partial)?.id;
        self.get_for_update(&id)
    }

    /// Apply `mutate` to a ticket under its exclusive lock and save the
    /// result. If `mutate` fails nothing is written.
    pub fn update<F>(&self, id: &str, mutate: F) -> Result<Ticket>
    where
        F: FnOnce(&mut Ticket) -> Result<()>,
    {
        let mut locked = self.get_for_update(id)?;
        if let Err(e) = mutate(&mut locked.ticket) {
            locked.release();
            return Err(e);
        }
        locked.save_and_release()?;
        Ok(locked.ticket)
    }

    /// Lock several tickets for update in sorted id order.
    ///
    /// Ids must already be canonical (see [`Store::resolve`]); duplicates are
    /// collapsed. The returned handles are ordered by id. Any handle not yet
    /// saved is released when dropped, so an early return releases them all.
    pub fn lock_sorted(&self, ids: &[String]) -> Result<Vec<LockedTicket<'_>>> {
        let mut ids = ids.to_vec();
        ids.sort();
        ids.dedup();

        let mut locked = Vec::with_capacity(ids.len());
        for id in &ids {
            locked.push(self.get_for_update(id)?);
        }
        Ok(locked)
    }

    /// Ids of ticket files whose id satisfies `filter`, sorted. Holds the
    /// store-wide shared lock only for the directory read.
    fn scan(&self, filter: impl Fn(&str) -> bool) -> Result<Vec<String>> {
        let _lock = FileLock::acquire_shared(&self.store_lock_path(), &self.lock_options)?;

        let entries = match fs::read_dir(&self.dir) {
            Ok(entries) => entries,
            Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(Error::io("read store dir", &self.dir, e)),
        };

        let mut ids = Vec::new();
        for entry in entries {
            let entry = entry.map_err(|e| Error::io("read store dir", &self.dir, e))?;
            let path = entry.path();
            if path.extension().and_then(|e| e.to_str()) != Some(TICKET_EXT) {
                continue;
            }
            let Some(id) = path.file_stem().and_then(|s| s.to_str()) else {
                continue;
            };
            if validate_id(id).is_err() || !path.is_file() {
                tracing::debug!(path = %path.display(), "ignoring file that can't be a ticket");
                continue;
            }
            if filter(id) {
                ids.push(id.to_string());
            }
        }

        ids.sort();
        Ok(ids)
    }
}

/// A ticket read under its exclusive lock.
///
/// Mutate [`LockedTicket::ticket`], then call [`LockedTicket::save_and_release`]
/// to write it or [`LockedTicket::release`] to discard the changes. Dropping
/// the handle releases the lock without writing.
#[derive(Debug)]
pub struct LockedTicket<'a> {
    pub ticket: Ticket,
    store: &'a Store,
    lock: Option<FileLock>,
}

impl LockedTicket<'_> {
    /// Write the ticket atomically and release the lock. The lock is
    /// released even if the write fails.
    pub fn save_and_release(&mut self) -> Result<()> {
        let result = self.save();
        self.release();
        result
    }

    /// Write the ticket atomically and keep holding the lock.
    ///
    /// Multi-ticket operations save every ticket before releasing any.
    pub fn save(&mut self) -> Result<()> {
        if self.lock.is_none() {
            return Err(Error::AlreadyReleased {
                id: self.ticket.id.clone(),
            });
        }
        let path = self.store.path(&self.ticket.id)?;
        write_ticket(&path, &self.ticket)
    }

    /// Remove the ticket's file while still holding the lock, then release.
    pub fn delete(mut self) -> Result<()> {
        if self.lock.is_none() {
            return Err(Error::AlreadyReleased {
                id: self.ticket.id.clone(),
            });
        }
        let path = self.store.path(&self.ticket.id)?;
        let result = remove_ticket(&path, &self.ticket.id);
        self.release();
        result
    }

    /// Release the lock without writing. Safe to call repeatedly.
    pub fn release(&mut self) {
        if let Some(mut lock) = self.lock.take() {
            lock.release();
        }
    }

    pub fn is_locked(&self) -> bool {
        self.lock.is_some()
    }
}

/// Reject ids that can't name a file directly inside the store directory.
fn validate_id(id: &str) -> Result<()> {
    if id.is_empty()
        || id.starts_with('.')
        || id.contains(['/', '\\'])
        || id.chars().any(char::is_control)
    {
        return Err(Error::InvalidId(id.to_string()));
    }
    Ok(())
}

fn read_ticket(path: &Path, id: &str) -> Result<Ticket> {
    match fs::read(path) {
        Ok(data) => ticket::parse(&data),
        Err(e) if e.kind() == io::ErrorKind::NotFound => Err(Error::NotFound(id.to_string())),
        Err(e) => Err(Error::io("read", path, e)),
    }
}

fn remove_ticket(path: &Path, id: &str) -> Result<()> {
    fs::remove_file(path).map_err(|e| match e.kind() {
        io::ErrorKind::NotFound => Error::NotFound(id.to_string()),
        _ => Error::io("delete", path, e),
    })?;
    tracing::debug!(id, "ticket deleted");
    Ok(())
}

fn write_ticket(path: &Path, t: &Ticket) -> Result<()> {
    let data = ticket::serialize(t)?;
    atomic_write(path, data.as_bytes())?;
    tracing::debug!(id = %t.id, path = %path.display(), "ticket written");
    Ok(())
}

/// Write `data` to `path` through a temp file in the same directory and a
/// rename. A crash before the rename leaves the old file untouched.
pub fn atomic_write(path: &Path, data: &[u8]) -> Result<()> {
    let dir = path
        .parent()
        .ok_or_else(|| Error::InvalidInput(format!("no parent directory: {}", path.display())))?;

    let mut tmp = tempfile::Builder::new()
        .prefix(".kt-")
        .suffix(".tmp")
        .tempfile_in(dir)
        .map_err(|e| Error::io("create temp file", dir, e))?;

    tmp.write_all(data)
        .map_err(|e| Error::io("write temp file", tmp.path(), e))?;
    tmp.as_file()
        .sync_all()
        .map_err(|e| Error::io("sync temp file", tmp.path(), e))?;

    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        fs::set_permissions(tmp.path(), fs::Permissions::from_mode(0o644))
            .map_err(|e| Error::io("chmod temp file", tmp.path(), e))?;
    }

    // On failure the temp file is removed when the returned handle drops.
    tmp.persist(path)
        .map_err(|e| Error::io("rename temp file", path, e.error))?;
    Ok(())
}
