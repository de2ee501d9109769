//! Repository hook scripts
//!
//! Supports the standard hooks:
//! - pre-commit: runs before a transaction is published (can reject)
//! - post-commit: runs after a revision is published (notification)
//! - pre-revprop-change: runs before a revision property changes (can reject)
//! - post-revprop-change: runs after a revision property changed (notification)
//!
//! Hook scripts live in `<repo>/hooks/`, receive their data on stdin and must
//! exit 0 to succeed. A rejecting pre-hook's stderr (or stdout) becomes the
//! error message.

use std::io::Write;
use std::path::{Path, PathBuf};
use std::process::{Command, Stdio};

use crate::error::{FsError, Result};
use crate::node::{ChangedPath, Revision};

pub const PRE_COMMIT: &str = "pre-commit";
pub const POST_COMMIT: &str = "post-commit";
pub const PRE_REVPROP_CHANGE: &str = "pre-revprop-change";
pub const POST_REVPROP_CHANGE: &str = "post-revprop-change";

/// What a pre-commit hook is told about the transaction
pub struct PreCommitInfo<'a> {
    pub txn: &'a str,
    pub base_revision: Revision,
    pub author: &'a str,
    pub log: &'a str,
    pub changes: &'a [ChangedPath],
}

/// What revprop hooks are told about the change
pub struct RevpropChange<'a> {
    pub revision: Revision,
    pub author: &'a str,
    pub name: &'a str,
    /// `A`, `M` or `D`
    pub action: char,
    pub value: Option<&'a str>,
}

pub struct HookManager {
    hooks_dir: PathBuf,
}

impl HookManager {
    /// Hooks are expected in `<repo_path>/hooks/`
    pub fn new(repo_path: &Path) -> Self {
        Self {
            hooks_dir: repo_path.join("hooks"),
        }
    }

    pub fn hook_path(&self, name: &str) -> PathBuf {
        self.hooks_dir.join(name)
    }

    pub fn ensure_hooks_dir(&self) -> Result<()> {
        if !self.hooks_dir.exists() {
            std::fs::create_dir_all(&self.hooks_dir)?;
        }
        Ok(())
    }

    /// Run a hook with `stdin_data`; a missing hook succeeds
    fn run_hook(&self, name: &str, stdin_data: &str) -> Result<()> {
        let hook_path = self.hook_path(name);
        if !hook_path.exists() {
            return Ok(());
        }

        let failed = |message: String| FsError::HookFailed {
            hook: name.to_string(),
            message,
        };

        let mut child = Command::new(&hook_path)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .env("FSVN_REPO", self.hooks_dir.parent().unwrap_or(Path::new(".")))
            .spawn()
            .map_err(|e| failed(format!("failed to execute: {}", e)))?;

        if let Some(mut stdin) = child.stdin.take() {
            // A hook may exit without reading its input
            let _ = stdin.write_all(stdin_data.as_bytes());
        }

        let output = child
            .wait_with_output()
            .map_err(|e| failed(format!("failed to wait: {}", e)))?;
        if output.status.success() {
            return Ok(());
        }

        let stderr = String::from_utf8_lossy(&output.stderr);
        let stdout = String::from_utf8_lossy(&output.stdout);
        let message = if !stderr.trim().is_empty() {
            stderr.trim().to_string()
        } else if !stdout.trim().is_empty() {
            stdout.trim().to_string()
        } else {
            format!("exited with code {}", output.status.code().unwrap_or(-1))
        };
        Err(failed(message))
    }

    pub fn run_pre_commit(&self, info: &PreCommitInfo<'_>) -> Result<()> {
        let mut data = String::new();
        data.push_str(&format!("TXN: {}\n", info.txn));
        data.push_str(&format!("BASE: {}\n", info.base_revision));
        data.push_str(&format!("AUTHOR: {}\n", info.author));
        data.push_str(&format!("LOG: {}\n", info.log));
        data.push_str("CHANGES:\n");
        for change in info.changes {
            data.push_str(&format!("{} {}\n", change.action.as_char(), change.path));
        }
        self.run_hook(PRE_COMMIT, &data)
    }

    /// Failures are logged and ignored; the revision is already published
    pub fn run_post_commit(&self, rev: Revision, author: &str, log: &str, date: &str) {
        let data = format!(
            "REVISION: {}\nAUTHOR: {}\nDATE: {}\nLOG: {}\n",
            rev, author, date, log
        );
        if let Err(e) = self.run_hook(POST_COMMIT, &data) {
            tracing::warn!("post-commit hook error (ignored): {}", e);
        }
    }

    pub fn run_pre_revprop_change(&self, change: &RevpropChange<'_>) -> Result<()> {
        let data = format!(
            "REVISION: {}\nAUTHOR: {}\nPROPNAME: {}\nACTION: {}\nVALUE: {}\n",
            change.revision,
            change.author,
            change.name,
            change.action,
            change.value.unwrap_or("")
        );
        self.run_hook(PRE_REVPROP_CHANGE, &data)
    }

    pub fn run_post_revprop_change(&self, change: &RevpropChange<'_>) {
        let data = format!(
            "REVISION: {}\nAUTHOR: {}\nPROPNAME: {}\nACTION: {}\n",
            change.revision, change.author, change.name, change.action
        );
        if let Err(e) = self.run_hook(POST_REVPROP_CHANGE, &data) {
            tracing::warn!("post-revprop-change hook error (ignored): {}", e);
        }
    }
}
