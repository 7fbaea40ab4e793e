//! Common test utilities for kticket integration tests.
//!
//! Provides `TestEnv` for isolated test environments that never touch a real
//! `.ktickets` directory.

#![allow(dead_code)]

use assert_cmd::Command;
use std::path::{Path, PathBuf};
pub use tempfile::TempDir;

/// A test environment with an isolated ticket store.
///
/// `repo_dir` acts as the project directory; the store lives at
/// `<repo_dir>/.ktickets` and is passed to every `kt` invocation through
/// `KTICKET_DIR`, making tests parallel-safe.
pub struct TestEnv {
    pub repo_dir: TempDir,
}

impl TestEnv {
    pub fn new() -> Self {
        Self {
            repo_dir: TempDir::new().unwrap(),
        }
    }

    /// Get a Command for the kt binary with the isolated store directory.
    pub fn kt(&self) -> Command {
        let mut cmd = Command::new(env!("CARGO_BIN_EXE_kt"));
        cmd.current_dir(self.repo_dir.path());
        cmd.env("KTICKET_DIR", self.store_dir());
        cmd.env_remove("KTICKET_LOCK_TIMEOUT_MS");
        cmd.env_remove("KT_LOG");
        cmd
    }

    /// Same as [`TestEnv::kt`] but as a plain `std::process::Command`, for
    /// spawning several processes at once.
    pub fn kt_std(&self) -> std::process::Command {
        let mut cmd = std::process::Command::new(env!("CARGO_BIN_EXE_kt"));
        cmd.current_dir(self.repo_dir.path());
        cmd.env("KTICKET_DIR", self.store_dir());
        cmd
    }

    /// Create a ticket through the CLI and return its id.
    pub fn create(&self, title: &str, extra: &[&str]) -> String {
        let output = self
            .kt()
            .arg("create")
            .arg(title)
            .args(["-a", "tester"])
            .args(extra)
            .output()
            .unwrap();
        assert!(output.status.success(), "create failed: {output:?}");
        let json: serde_json::Value = serde_json::from_slice(&output.stdout).unwrap();
        json["id"].as_str().unwrap().to_string()
    }

    /// Run a command expected to print JSON and parse it.
    pub fn json(&self, args: &[&str]) -> serde_json::Value {
        let output = self.kt().args(args).output().unwrap();
        assert!(output.status.success(), "kt {args:?} failed: {output:?}");
        serde_json::from_slice(&output.stdout).unwrap()
    }

    pub fn path(&self) -> &Path {
        self.repo_dir.path()
    }

    pub fn store_dir(&self) -> PathBuf {
        self.repo_dir.path().join(".ktickets")
    }

    /// Raw text of a ticket file.
    pub fn ticket_file(&self, id: &str) -> String {
        std::fs::read_to_string(self.store_dir().join(format!("{id}.md"))).unwrap()
    }
}

impl Default for TestEnv {
    fn default() -> Self {
        Self::new()
    }
}
