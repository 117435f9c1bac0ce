//! `ovn-nbctl` process runner.
//!
//! Arguments are passed straight to the process (no `/bin/sh -c`), so
//! OVSDB-quoted values never need shell quoting.

use async_trait::async_trait;
use std::process::Stdio;
use std::time::Duration;
use tokio::process::Command;

use crate::error::{OvnError, OvnResult};
use crate::txn::Transaction;

/// Default path to `ovn-nbctl`.
pub const OVN_NBCTL_CMD: &str = "/usr/bin/ovn-nbctl";

/// Default per-invocation timeout.
pub const DEFAULT_COMMAND_TIMEOUT: Duration = Duration::from_secs(8);

/// Access to the northbound database.
#[async_trait]
pub trait NbDatabase: Send + Sync {
    /// Lists `table` as an `ovn-nbctl --format=json` document restricted to `columns`.
    async fn list(&self, table: &str, columns: &[&str]) -> OvnResult<String>;

    /// Executes `txn` atomically.
    async fn transact(&self, txn: &Transaction) -> OvnResult<()>;
}

/// Result of one `ovn-nbctl` invocation.
#[derive(Debug, Clone)]
pub struct ExecResult {
    /// The exit code of the command (0 = success).
    pub exit_code: i32,
    /// The stdout output.
    pub stdout: String,
    /// The stderr output.
    pub stderr: String,
}

impl ExecResult {
    /// Returns true if the command succeeded (exit code 0).
    pub fn success(&self) -> bool {
        self.exit_code == 0
    }

    /// Returns the combined output (stdout + stderr) for error messages.
    pub fn combined_output(&self) -> String {
        match (self.stdout.is_empty(), self.stderr.is_empty()) {
            (_, true) => self.stdout.clone(),
            (true, false) => self.stderr.clone(),
            (false, false) => format!("{}\n{}", self.stdout, self.stderr),
        }
    }
}

/// Runs `ovn-nbctl` against a northbound database.
#[derive(Debug, Clone)]
pub struct NbCtl {
    binary: String,
    db: String,
    timeout: Duration,
}

impl NbCtl {
    /// Creates a runner; an empty `db` uses `ovn-nbctl`'s default socket.
    pub fn new(db: impl Into<String>) -> Self {
        Self {
            binary: OVN_NBCTL_CMD.to_string(),
            db: db.into(),
            timeout: DEFAULT_COMMAND_TIMEOUT,
        }
    }

    pub fn with_binary(mut self, binary: impl Into<String>) -> Self {
        self.binary = binary.into();
        self
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    /// Global options preceding every command.
    pub fn global_args(&self) -> Vec<String> {
        let mut args = Vec::new();
        if !self.db.is_empty() {
            args.push(format!("--db={}", self.db));
        }
        args.push(format!("--timeout={}", self.timeout.as_secs().max(1)));
        args
    }

    fn display(&self, args: &[String]) -> String {
        let mut line = self.binary.clone();
        for arg in args {
            line.push(' ');
            line.push_str(arg);
        }
        line
    }

    /// Executes `ovn-nbctl` with `args` appended to the global options.
    pub async fn exec(&self, args: &[String]) -> OvnResult<ExecResult> {
        let mut full = self.global_args();
        full.extend_from_slice(args);
        let command = self.display(&full);
        tracing::debug!(command = %command, "Executing ovn-nbctl");

        let child = Command::new(&self.binary)
            .args(&full)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .output();

        // Give the server-side --timeout a grace period before killing.
        let deadline = self.timeout + Duration::from_secs(2);
        let output = match tokio::time::timeout(deadline, child).await {
            Ok(result) => result.map_err(|e| OvnError::Exec {
                command: command.clone(),
                source: e,
            })?,
            Err(_) => {
                tracing::warn!(command = %command, "ovn-nbctl timed out");
                return Err(OvnError::Timeout {
                    command,
                    timeout_secs: deadline.as_secs(),
                });
            }
        };

        let result = ExecResult {
            exit_code: output.status.code().unwrap_or(-1),
            stdout: String::from_utf8_lossy(&output.stdout).trim().to_string(),
            stderr: String::from_utf8_lossy(&output.stderr).trim().to_string(),
        };

        if result.success() {
            tracing::trace!(command = %command, "ovn-nbctl succeeded");
        } else {
            tracing::warn!(
                command = %command,
                exit_code = result.exit_code,
                stderr = %result.stderr,
                "ovn-nbctl failed"
            );
        }
        Ok(result)
    }

    /// Executes `ovn-nbctl` and fails on non-zero exit.
    pub async fn exec_or_throw(&self, args: &[String]) -> OvnResult<String> {
        let result = self.exec(args).await?;
        if result.success() {
            Ok(result.stdout)
        } else {
            Err(OvnError::CommandFailed {
                command: self.display(args),
                exit_code: result.exit_code,
                output: result.combined_output(),
            })
        }
    }
}

/// Arguments for a JSON listing of `table`.
pub fn list_args(table: &str, columns: &[&str]) -> Vec<String> {
    vec![
        "--format=json".to_string(),
        format!("--columns={}", columns.join(",")),
        "list".to_string(),
        table.to_string(),
    ]
}

#[async_trait]
impl NbDatabase for NbCtl {
    async fn list(&self, table: &str, columns: &[&str]) -> OvnResult<String> {
        self.exec_or_throw(&list_args(table, columns)).await
    }

    async fn transact(&self, txn: &Transaction) -> OvnResult<()> {
        if txn.is_empty() {
            return Ok(());
        }
        self.exec_or_throw(txn.args()).await.map(|_| ())
    }
}
