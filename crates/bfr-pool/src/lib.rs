//! bfr-pool
//!
//! The execution pool: runs one execution context in a fresh OS process and
//! returns a structured outcome. The pool exists so user code cannot corrupt
//! host state, leak descriptors, or exceed its budget — nothing from the
//! child is trusted beyond the single JSON outcome document it prints.
//!
//! Protocol with the runner program:
//!   - the full `ExecutionContext` is written to the child's stdin as JSON;
//!   - the child resolves code (inline base64 → DB blob → file path), runs
//!     it, appends logs to the Redis stream, and prints one `PoolOutcome`
//!     JSON document on stdout;
//!   - resource metrics are whatever the runner self-reports.
//!
//! On timeout or cancellation the child is interrupted (SIGTERM), given a
//! grace period, then killed. The subprocess is always gone before
//! `execute` returns.

use std::process::Stdio;
use std::sync::Arc;
use std::time::{Duration, Instant};

use anyhow::{anyhow, Context, Result};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::process::{Child, Command};
use tokio::sync::{watch, Semaphore};
use tracing::{debug, warn};

use bfr_schemas::{ExecutionContext, PoolOutcome};

/// Grace period between interrupt and kill.
const TERM_GRACE: Duration = Duration::from_secs(5);

// ---------------------------------------------------------------------------
// PoolError
// ---------------------------------------------------------------------------

/// Why a pool run produced no outcome document.
#[derive(Debug)]
pub enum PoolError {
    /// Wall-clock limit expired; the child was terminated.
    Timeout { seconds: u32 },
    /// The cancel handle fired; the child was terminated.
    Cancelled,
    /// The runner died or spoke garbage.
    Runner(anyhow::Error),
}

impl std::fmt::Display for PoolError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            PoolError::Timeout { seconds } => {
                write!(f, "execution exceeded timeout of {seconds} seconds")
            }
            PoolError::Cancelled => write!(f, "execution cancelled"),
            PoolError::Runner(err) => write!(f, "runner failure: {err}"),
        }
    }
}

impl std::error::Error for PoolError {}

// ---------------------------------------------------------------------------
// CancelHandle
// ---------------------------------------------------------------------------

/// Cooperative cancellation for an in-flight run. The worker flips the
/// sender when it observes the pending record's cancelled bit.
#[derive(Clone)]
pub struct CancelHandle {
    rx: watch::Receiver<bool>,
}

impl CancelHandle {
    pub fn new() -> (watch::Sender<bool>, Self) {
        let (tx, rx) = watch::channel(false);
        (tx, Self { rx })
    }

    /// A handle that never fires (the dropped sender parks `fired`).
    pub fn never() -> Self {
        let (_tx, rx) = watch::channel(false);
        Self { rx }
    }

    async fn fired(&mut self) {
        loop {
            if *self.rx.borrow() {
                return;
            }
            if self.rx.changed().await.is_err() {
                // Sender dropped without firing: never cancel.
                std::future::pending::<()>().await;
            }
        }
    }
}

// ---------------------------------------------------------------------------
// ExecutionPool
// ---------------------------------------------------------------------------

/// Process-wide pool bounding concurrent runner children.
pub struct ExecutionPool {
    runner_cmd: String,
    workspace_dir: String,
    redis_url: String,
    permits: Arc<Semaphore>,
}

impl ExecutionPool {
    pub fn new(
        runner_cmd: &str,
        workspace_dir: &str,
        redis_url: &str,
        max_processes: usize,
    ) -> Self {
        Self {
            runner_cmd: runner_cmd.to_string(),
            workspace_dir: workspace_dir.to_string(),
            redis_url: redis_url.to_string(),
            permits: Arc::new(Semaphore::new(max_processes.max(1))),
        }
    }

    /// Run one context to completion. The returned outcome's `duration_ms`
    /// is always filled (pool wall-clock when the runner omits it).
    pub async fn execute(
        &self,
        context: &ExecutionContext,
        timeout_seconds: u32,
        mut cancel: CancelHandle,
    ) -> Result<PoolOutcome, PoolError> {
        let _permit = self
            .permits
            .acquire()
            .await
            .map_err(|_| PoolError::Runner(anyhow!("execution pool closed")))?;

        let started = Instant::now();
        let mut child = self.spawn(context).map_err(PoolError::Runner)?;

        // Feed the context document, then close stdin so the runner starts.
        let payload = serde_json::to_vec(context)
            .context("serialize execution context")
            .map_err(PoolError::Runner)?;
        if let Some(mut stdin) = child.stdin.take() {
            if let Err(err) = stdin.write_all(&payload).await {
                terminate(&mut child, TERM_GRACE).await;
                return Err(PoolError::Runner(
                    anyhow!(err).context("write context to runner"),
                ));
            }
            drop(stdin);
        }

        // Drain stdout concurrently so a chatty child cannot dead-lock on a
        // full pipe while we wait on its exit.
        let mut stdout = child.stdout.take();
        let stdout_task = tokio::spawn(async move {
            let mut buf = Vec::new();
            if let Some(out) = stdout.as_mut() {
                let _ = out.read_to_end(&mut buf).await;
            }
            buf
        });

        enum Waited {
            Exited(std::io::Result<std::process::ExitStatus>),
            TimedOut,
            Cancelled,
        }

        let timeout = Duration::from_secs(u64::from(timeout_seconds.max(1)));
        let waited = tokio::select! {
            status = child.wait() => Waited::Exited(status),
            _ = tokio::time::sleep(timeout) => Waited::TimedOut,
            _ = cancel.fired() => Waited::Cancelled,
        };

        let exit = match waited {
            Waited::Exited(status) => status,
            Waited::TimedOut => {
                terminate(&mut child, TERM_GRACE).await;
                stdout_task.abort();
                return Err(PoolError::Timeout {
                    seconds: timeout_seconds,
                });
            }
            Waited::Cancelled => {
                terminate(&mut child, TERM_GRACE).await;
                stdout_task.abort();
                return Err(PoolError::Cancelled);
            }
        };

        let status = exit
            .context("wait on runner")
            .map_err(PoolError::Runner)?;
        let stdout = stdout_task
            .await
            .map_err(|err| PoolError::Runner(anyhow!(err).context("stdout drain")))?;

        if !status.success() && stdout.is_empty() {
            return Err(PoolError::Runner(anyhow!(
                "runner exited with {status} and no outcome document"
            )));
        }

        let mut outcome: PoolOutcome = serde_json::from_slice(last_json_line(&stdout))
            .context("parse runner outcome document")
            .map_err(PoolError::Runner)?;

        if outcome.duration_ms <= 0 {
            outcome.duration_ms = started.elapsed().as_millis() as i64;
        }
        debug!(
            execution_id = %context.execution_id,
            status = %outcome.status,
            duration_ms = outcome.duration_ms,
            "runner finished"
        );
        Ok(outcome)
    }

    fn spawn(&self, context: &ExecutionContext) -> Result<Child> {
        let mut parts = self.runner_cmd.split_whitespace();
        let program = parts
            .next()
            .ok_or_else(|| anyhow!("empty runner command"))?;

        let mut cmd = Command::new(program);
        cmd.args(parts)
            .env("BIFROST_EXECUTION_ID", context.execution_id.to_string())
            .env("BIFROST_WORKSPACE_DIR", &self.workspace_dir)
            .env("REDIS_URL", &self.redis_url)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::null())
            .kill_on_drop(true);

        cmd.spawn()
            .with_context(|| format!("spawn runner '{}'", self.runner_cmd))
    }
}

/// Interrupt, wait out the grace period, then kill. The child is reaped
/// before this returns.
async fn terminate(child: &mut Child, grace: Duration) {
    if let Some(pid) = child.id() {
        // SIGTERM via the system kill(1); tokio only exposes SIGKILL.
        let _ = Command::new("kill")
            .arg(pid.to_string())
            .stdout(Stdio::null())
            .stderr(Stdio::null())
            .status()
            .await;
        if tokio::time::timeout(grace, child.wait()).await.is_ok() {
            return;
        }
        warn!(pid, "runner ignored SIGTERM; killing");
    }
    let _ = child.start_kill();
    let _ = child.wait().await;
}

/// The outcome is the last non-empty stdout line; user code may have
/// printed above it.
fn last_json_line(stdout: &[u8]) -> &[u8] {
    stdout
        .split(|&b| b == b'\n')
        .rev()
        .find(|line| !line.iter().all(u8::is_ascii_whitespace))
        .unwrap_or(stdout)
}

#[cfg(test)]
mod tests {
    use super::*;
    use bfr_schemas::{Caller, RoiData};
    use serde_json::json;
    use uuid::Uuid;

    fn make_context() -> ExecutionContext {
        ExecutionContext {
            execution_id: Uuid::new_v4(),
            workflow_id: None,
            name: "echo".to_string(),
            function_name: None,
            workflow_code: None,
            code: None,
            parameters: json!({"x": "hi"}),
            caller: Caller {
                user_id: Uuid::new_v4(),
                email: "user@example.com".to_string(),
                name: "User".to_string(),
            },
            organization: None,
            config: json!({}),
            tags: vec!["workflow".to_string()],
            timeout_seconds: 60,
            transient: false,
            is_platform_admin: false,
            startup: None,
            roi: RoiData::default(),
            file_path: None,
        }
    }

    fn pool_with_runner(cmd: &str) -> ExecutionPool {
        ExecutionPool::new(cmd, "/tmp/bifrost/workspace", "redis://localhost", 2)
    }

    /// A fake runner: a shell script on disk, invoked as `sh <path>`.
    fn script_runner(dir: &tempfile::TempDir, body: &str) -> String {
        let path = dir.path().join("runner.sh");
        std::fs::write(&path, body).unwrap();
        format!("sh {}", path.display())
    }

    #[tokio::test]
    async fn successful_run_returns_outcome() {
        let dir = tempfile::tempdir().unwrap();
        // The "runner" swallows stdin and prints a canned outcome.
        let runner = script_runner(
            &dir,
            r#"cat > /dev/null
echo '{"status":"Success","result":{"echo":"hi"},"duration_ms":8}'
"#,
        );
        let pool = pool_with_runner(&runner);
        let res = pool
            .execute(&make_context(), 10, CancelHandle::never())
            .await
            .expect("runner should succeed");
        assert_eq!(res.status, "Success");
        assert_eq!(res.result, Some(json!({"echo": "hi"})));
        assert_eq!(res.duration_ms, 8);
    }

    #[tokio::test]
    async fn outcome_is_last_stdout_line() {
        let dir = tempfile::tempdir().unwrap();
        let runner = script_runner(
            &dir,
            r#"cat > /dev/null
echo 'user noise'
echo '{"status":"Failed","error_type":"UserError","error_message":"bad input"}'
"#,
        );
        let pool = pool_with_runner(&runner);
        let res = pool
            .execute(&make_context(), 10, CancelHandle::never())
            .await
            .expect("outcome parses");
        assert_eq!(res.status, "Failed");
        assert_eq!(res.error_type.as_deref(), Some("UserError"));
        // Pool fills wall-clock duration when the runner omits it.
        assert!(res.duration_ms >= 0);
    }

    #[tokio::test]
    async fn timeout_terminates_child() {
        let dir = tempfile::tempdir().unwrap();
        let runner = script_runner(&dir, "cat > /dev/null\nsleep 60\n");
        let pool = pool_with_runner(&runner);
        let err = pool
            .execute(&make_context(), 1, CancelHandle::never())
            .await
            .expect_err("must time out");
        assert!(matches!(err, PoolError::Timeout { seconds: 1 }));
    }

    #[tokio::test]
    async fn cancellation_terminates_child() {
        let dir = tempfile::tempdir().unwrap();
        let runner = script_runner(&dir, "cat > /dev/null\nsleep 60\n");
        let pool = pool_with_runner(&runner);
        let (tx, cancel) = CancelHandle::new();
        let ctx = make_context();
        let run = pool.execute(&ctx, 30, cancel);
        tokio::pin!(run);

        // Let the child start, then fire the cancel.
        tokio::select! {
            _ = &mut run => panic!("run finished before cancel"),
            _ = tokio::time::sleep(Duration::from_millis(200)) => {}
        }
        tx.send(true).unwrap();

        let err = run.await.expect_err("must cancel");
        assert!(matches!(err, PoolError::Cancelled));
    }

    #[tokio::test]
    async fn missing_runner_is_a_runner_error() {
        let pool = pool_with_runner("definitely-not-a-real-binary-bfr");
        let err = pool
            .execute(&make_context(), 5, CancelHandle::never())
            .await
            .expect_err("spawn must fail");
        assert!(matches!(err, PoolError::Runner(_)));
    }
}
