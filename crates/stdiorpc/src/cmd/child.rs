use std::process::Stdio;
use std::time::Duration;

use stdiorpc::conn::{Connection, ConnectionConfig, NullHandler};
use tokio::process::{Child, Command};

use crate::exit::{io_error, CliError, CliResult, INTERNAL, USAGE};

/// How long a child gets to exit on its own after its stdin is closed.
const EXIT_GRACE: Duration = Duration::from_secs(2);

/// A spawned peer process with a connection over its stdio.
pub struct ChildPeer {
    child: Child,
    pub conn: Connection,
}

impl ChildPeer {
    /// Spawn `program` with piped stdin/stdout; stderr is inherited so the
    /// peer's own diagnostics stay visible.
    pub fn spawn(program: &[String], config: ConnectionConfig) -> CliResult<Self> {
        let (exe, args) = program
            .split_first()
            .ok_or_else(|| CliError::new(USAGE, "no program given"))?;

        let mut child = Command::new(exe)
            .args(args)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::inherit())
            .kill_on_drop(true)
            .spawn()
            .map_err(|err| io_error(&format!("failed to spawn {exe}"), err))?;

        let stdin = child
            .stdin
            .take()
            .ok_or_else(|| CliError::new(INTERNAL, "child stdin was not captured"))?;
        let stdout = child
            .stdout
            .take()
            .ok_or_else(|| CliError::new(INTERNAL, "child stdout was not captured"))?;

        tracing::debug!(program = %exe, pid = child.id(), "spawned peer");
        let conn = Connection::spawn(stdout, stdin, NullHandler, config);
        Ok(Self { child, conn })
    }

    /// Close the connection and reap the child, killing it if it does not
    /// exit within the grace period once its stdin is closed.
    pub async fn shutdown(self) {
        let Self { mut child, conn } = self;
        conn.close().await;
        // The child's stdin closes once the read loop task, which returns
        // right after publishing Closed, drops its handle too.
        drop(conn);

        match tokio::time::timeout(EXIT_GRACE, child.wait()).await {
            Ok(Ok(status)) => tracing::debug!(%status, "peer exited"),
            Ok(Err(err)) => tracing::warn!(error = %err, "failed to wait for peer"),
            Err(_) => {
                tracing::debug!("peer did not exit after stdin closed, killing it");
                if let Err(err) = child.kill().await {
                    tracing::warn!(error = %err, "failed to kill peer");
                }
            }
        }
    }
}
