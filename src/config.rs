//! Configuration for a kticket invocation.
//!
//! Values are resolved once into [`Settings`], which builds the [`Store`]
//! handed to every command.
//!
//! ## Precedence
//!
//! CLI flag > environment variable > `config.toml` in the store directory > defaults
//!
//! Flags and environment variables are read by `clap` (see `cli`) and arrive
//! here as [`Overrides`].
//!
//! ## config.toml
//!
//! ```toml
//! lock_timeout_ms = 5000
//! default_priority = 2
//! default_type = "task"
//! prefix = "kt"
//! ```
//!
//! Unknown keys are ignored.

use serde::{Deserialize, Serialize};
use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::id::{extract_prefix, find_git_root, project_name};
use crate::lock::{DEFAULT_TIMEOUT, LockOptions};
use crate::store::{DEFAULT_DIR, Store};
use crate::ticket::{DEFAULT_PRIORITY, TicketType};
use crate::{Error, Result};

/// Environment variable overriding the store directory.
pub const ENV_DIR: &str = "KTICKET_DIR";

/// Environment variable overriding the lock timeout, in milliseconds.
pub const ENV_LOCK_TIMEOUT: &str = "KTICKET_LOCK_TIMEOUT_MS";

/// Environment variable holding the log filter for the `kt` binary.
pub const ENV_LOG: &str = "KT_LOG";

/// Name of the optional config file inside the store directory.
pub const CONFIG_FILE: &str = "config.toml";

/// Contents of `config.toml`. Every key is optional.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct FileConfig {
    pub lock_timeout_ms: Option<u64>,
    pub default_priority: Option<u8>,
    pub default_type: Option<TicketType>,
    pub prefix: Option<String>,
}

impl FileConfig {
    /// Load `config.toml` from the store directory. A missing file is empty config.
    pub fn load(store_dir: &Path) -> Result<Self> {
        let path = store_dir.join(CONFIG_FILE);
        let text = match fs::read_to_string(&path) {
            Ok(text) => text,
            Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(Self::default()),
            Err(e) => return Err(Error::io("read config", &path, e)),
        };
        toml::from_str(&text).map_err(|e| Error::Config {
            path,
            message: e.to_string(),
        })
    }
}

/// Values given on the command line or through the environment.
#[derive(Debug, Clone, Default)]
pub struct Overrides {
    pub dir: Option<PathBuf>,
    pub lock_timeout_ms: Option<u64>,
}

/// Fully resolved settings.
#[derive(Debug, Clone)]
pub struct Settings {
    /// Git root if found, otherwise the working directory
    pub project_root: PathBuf,
    pub store_dir: PathBuf,
    pub lock_timeout: Duration,
    pub default_priority: u8,
    pub default_type: TicketType,
    /// Prefix for new ticket ids
    pub prefix: String,
}

impl Settings {
    /// Resolve settings for a command run from `cwd`.
    pub fn resolve(cwd: &Path, overrides: &Overrides) -> Result<Self> {
        let project_root = find_git_root(cwd).unwrap_or_else(|| cwd.to_path_buf());

        let store_dir = match &overrides.dir {
            Some(dir) if dir.is_absolute() => dir.clone(),
            Some(dir) => cwd.join(dir),
            None => project_root.join(DEFAULT_DIR),
        };

        let file = FileConfig::load(&store_dir)?;

        let default_priority = file.default_priority.unwrap_or(DEFAULT_PRIORITY);
        if default_priority > 4 {
            return Err(Error::Config {
                path: store_dir.join(CONFIG_FILE),
                message: format!("default_priority must be 0-4, got {default_priority}"),
            });
        }

        let lock_timeout = overrides
            .lock_timeout_ms
            .or(file.lock_timeout_ms)
            .map(Duration::from_millis)
            .unwrap_or(DEFAULT_TIMEOUT);

        let prefix = file
            .prefix
            .filter(|p| !p.is_empty())
            .unwrap_or_else(|| extract_prefix(&project_name(cwd)));

        tracing::debug!(
            store_dir = %store_dir.display(),
            lock_timeout_ms = lock_timeout.as_millis() as u64,
            prefix = %prefix,
            "settings resolved"
        );

        Ok(Self {
            project_root,
            store_dir,
            lock_timeout,
            default_priority,
            default_type: file.default_type.unwrap_or_default(),
            prefix,
        })
    }

    pub fn lock_options(&self) -> LockOptions {
        LockOptions::default().with_timeout(self.lock_timeout)
    }

    /// Build the store these settings describe.
    pub fn store(&self) -> Store {
        Store::new(&self.store_dir).with_lock_options(self.lock_options())
    }
}
