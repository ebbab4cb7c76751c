// External process invocation primitive.
//
// Every stage that talks to host tooling (database client, reverse-proxy
// tool, service control) goes through the `CommandRunner` trait so the
// orchestrators can be exercised in tests without invoking real OS tools.
//
// IMPORTANT:
// - Never log secrets (connection descriptors, passwords, env values).
// - All I/O is async.

use anyhow::{Context, Result};
use async_trait::async_trait;
use log::{debug, error, info, warn};
use std::process::Stdio;
use std::time::Instant;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::process::Command;
use tokio::time::{timeout, Duration};
use tokio_retry::strategy::{jitter, ExponentialBackoff};
use tokio_retry::RetryIf;

/// One external tool invocation.
#[derive(Debug, Clone)]
pub struct CommandSpec {
    pub program: String,
    pub args: Vec<String>,
    /// Optional script body written to the child's stdin (e.g. SQL handed to
    /// the database client).
    pub stdin: Option<String>,
    /// Extra environment for the child. Values are never logged.
    pub env: Vec<(String, String)>,
    pub timeout: Duration,
    /// Short label used in log lines and by test fakes.
    pub operation: String,
}

impl CommandSpec {
    pub fn new(program: impl Into<String>, operation: impl Into<String>) -> Self {
        Self {
            program: program.into(),
            args: Vec::new(),
            stdin: None,
            env: Vec::new(),
            timeout: Duration::from_secs(30),
            operation: operation.into(),
        }
    }

    pub fn arg(mut self, arg: impl Into<String>) -> Self {
        self.args.push(arg.into());
        self
    }

    pub fn args<I, S>(mut self, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.args.extend(args.into_iter().map(Into::into));
        self
    }

    pub fn stdin_body(mut self, body: impl Into<String>) -> Self {
        self.stdin = Some(body.into());
        self
    }

    pub fn env(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.env.push((key.into(), value.into()));
        self
    }

    pub fn timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }
}

#[derive(Debug, Clone)]
pub struct CommandOutput {
    pub exit_code: Option<i32>,
    pub stdout: String,
    pub stderr: String,
    pub duration_ms: u128,
}

impl CommandOutput {
    pub fn success(&self) -> bool {
        self.exit_code == Some(0)
    }

    /// Build a diagnosable failure message with the tool's captured output
    /// attached.
    pub fn failure_summary(&self, operation: &str) -> String {
        let detail = if !self.stderr.trim().is_empty() {
            self.stderr.trim()
        } else {
            self.stdout.trim()
        };
        format!(
            "{} failed (exit_code={:?}): {}",
            operation, self.exit_code, detail
        )
    }

    #[cfg(test)]
    pub fn ok_with_stdout(stdout: &str) -> Self {
        Self {
            exit_code: Some(0),
            stdout: stdout.to_string(),
            stderr: String::new(),
            duration_ms: 1,
        }
    }

    #[cfg(test)]
    pub fn failed_with_stderr(exit_code: i32, stderr: &str) -> Self {
        Self {
            exit_code: Some(exit_code),
            stdout: String::new(),
            stderr: stderr.to_string(),
            duration_ms: 1,
        }
    }
}

#[async_trait]
pub trait CommandRunner: Send + Sync {
    /// Run a command to completion, capturing output.
    ///
    /// A non-zero exit code is NOT an `Err`; callers decide what counts as
    /// failure. `Err` means the tool could not be run at all (spawn failure,
    /// timeout, I/O error).
    async fn run(&self, spec: CommandSpec) -> Result<CommandOutput>;
}

fn mask_arg_for_log(arg: &str) -> String {
    // Heuristic masking: treat anything that looks like a secret as sensitive.
    let lower = arg.to_ascii_lowercase();
    if lower.contains("password=")
        || lower.contains("pwd=")
        || lower.contains("secret")
        || lower.contains("token")
        || lower.contains("apikey")
        || lower.contains("api_key")
    {
        return "***".to_string();
    }

    // Connection-descriptor-like values: delegate to the existing masker.
    if arg.contains(';') && lower.contains('=') {
        return crate::utils::logging::mask_connection_string(arg);
    }

    arg.to_string()
}

fn is_transient_exec_error(e: &anyhow::Error) -> bool {
    let msg = e.to_string().to_ascii_lowercase();
    msg.contains("timed out")
        || msg.contains("timeout")
        || msg.contains("temporarily")
        || msg.contains("temporary")
        || msg.contains("busy")
        || msg.contains("in use")
        || msg.contains("used by another process")
        || msg.contains("resource")
        || msg.contains("i/o")
        || msg.contains("io error")
        || msg.contains("connection")
        || msg.contains("network")
}

/// Production runner: `tokio::process` with timeout, kill-on-timeout and
/// retries for transient failures.
#[derive(Debug, Default, Clone, Copy)]
pub struct SystemCommandRunner;

#[async_trait]
impl CommandRunner for SystemCommandRunner {
    async fn run(&self, spec: CommandSpec) -> Result<CommandOutput> {
        let started = Instant::now();
        info!(
            "[PHASE: process] [STEP: cmd] run entered (operation={}, program={}, args_count={}, timeout_ms={})",
            spec.operation,
            spec.program,
            spec.args.len(),
            spec.timeout.as_millis()
        );

        let attempt_spec = spec.clone();
        let attempt = move || {
            let spec = attempt_spec.clone();
            async move { run_once(&spec).await }
        };

        let retry_strategy = ExponentialBackoff::from_millis(200)
            .factor(2)
            .max_delay(Duration::from_secs(2))
            .take(3)
            .map(jitter);

        let operation = spec.operation.clone();
        let program = spec.program.clone();
        let result = RetryIf::spawn(retry_strategy, attempt, |e: &anyhow::Error| {
            let transient = is_transient_exec_error(e);
            if transient {
                warn!(
                    "[PHASE: process] [STEP: cmd] Transient command failure detected; will retry (operation={}, program={}, err={})",
                    operation, program, e
                );
            }
            transient
        })
        .await;

        match &result {
            Ok(out) => {
                info!(
                    "[PHASE: process] [STEP: cmd] run exit (operation={}, program={}, exit_code={:?}, duration_ms={})",
                    spec.operation,
                    spec.program,
                    out.exit_code,
                    started.elapsed().as_millis()
                );
            }
            Err(e) => {
                error!(
                    "[PHASE: process] [STEP: cmd] run error (operation={}, program={}, duration_ms={}, err={:?})",
                    spec.operation,
                    spec.program,
                    started.elapsed().as_millis(),
                    e
                );
            }
        }

        result
    }
}

async fn run_once(spec: &CommandSpec) -> Result<CommandOutput> {
    let started = Instant::now();

    debug!(
        "[PHASE: process] [STEP: cmd] run_once entered (operation={}, program={}, args=[{}], timeout_ms={})",
        spec.operation,
        spec.program,
        spec.args
            .iter()
            .map(|a| mask_arg_for_log(a))
            .collect::<Vec<_>>()
            .join(", "),
        spec.timeout.as_millis()
    );

    let mut cmd = Command::new(&spec.program);
    cmd.args(&spec.args)
        .stdin(if spec.stdin.is_some() {
            Stdio::piped()
        } else {
            Stdio::null()
        })
        .stdout(Stdio::piped())
        .stderr(Stdio::piped());
    for (k, v) in &spec.env {
        cmd.env(k, v);
    }

    let mut child = cmd.spawn().with_context(|| {
        format!(
            "Failed to spawn command '{}' (operation={})",
            spec.program, spec.operation
        )
    })?;

    if let Some(body) = &spec.stdin {
        if let Some(mut stdin) = child.stdin.take() {
            stdin
                .write_all(body.as_bytes())
                .await
                .with_context(|| format!("Failed writing stdin (operation={})", spec.operation))?;
            stdin.flush().await?;
            drop(stdin);
        }
    }

    let mut stdout = child.stdout.take().ok_or_else(|| {
        anyhow::anyhow!("Failed to capture stdout (operation={})", spec.operation)
    })?;
    let mut stderr = child.stderr.take().ok_or_else(|| {
        anyhow::anyhow!("Failed to capture stderr (operation={})", spec.operation)
    })?;

    let stdout_task = tokio::spawn(async move {
        let mut buf = Vec::new();
        stdout.read_to_end(&mut buf).await?;
        Ok::<String, std::io::Error>(String::from_utf8_lossy(&buf).to_string())
    });
    let stderr_task = tokio::spawn(async move {
        let mut buf = Vec::new();
        stderr.read_to_end(&mut buf).await?;
        Ok::<String, std::io::Error>(String::from_utf8_lossy(&buf).to_string())
    });

    let status = match timeout(spec.timeout, child.wait()).await {
        Ok(Ok(s)) => s,
        Ok(Err(e)) => {
            return Err(anyhow::Error::new(e)).with_context(|| {
                format!(
                    "Command wait failed (operation={}, program={})",
                    spec.operation, spec.program
                )
            });
        }
        Err(_) => {
            warn!(
                "[PHASE: process] [STEP: cmd] Timeout reached (operation={}, program={}, timeout_ms={}); attempting to kill process",
                spec.operation,
                spec.program,
                spec.timeout.as_millis()
            );

            if let Err(e) = child.kill().await {
                warn!(
                    "[PHASE: process] [STEP: cmd] Failed to kill timed-out process (operation={}, program={}): {}",
                    spec.operation, spec.program, e
                );
            }

            // Best-effort reap (avoid zombies)
            let _ = timeout(Duration::from_secs(5), child.wait()).await;

            return Err(anyhow::anyhow!(
                "Command timed out after {}ms (operation={}, program={})",
                spec.timeout.as_millis(),
                spec.operation,
                spec.program
            ));
        }
    };

    let stdout_str = stdout_task
        .await
        .context("stdout join failed")?
        .context("stdout read failed")?;
    let stderr_str = stderr_task
        .await
        .context("stderr join failed")?
        .context("stderr read failed")?;

    let out = CommandOutput {
        exit_code: status.code(),
        stdout: stdout_str,
        stderr: stderr_str,
        duration_ms: started.elapsed().as_millis(),
    };

    debug!(
        "[PHASE: process] [STEP: cmd] run_once exit (operation={}, program={}, exit_code={:?}, duration_ms={}, stdout_len={}, stderr_len={})",
        spec.operation,
        spec.program,
        out.exit_code,
        out.duration_ms,
        out.stdout.len(),
        out.stderr.len()
    );

    Ok(out)
}

// ============================================================================
// Scripted fake for tests
// ============================================================================

#[cfg(test)]
pub mod fake {
    use super::{CommandOutput, CommandRunner, CommandSpec};
    use anyhow::Result;
    use async_trait::async_trait;
    use std::collections::{HashMap, VecDeque};
    use std::sync::Mutex;

    #[derive(Debug, Clone)]
    pub struct RecordedCall {
        pub program: String,
        pub args: Vec<String>,
        pub stdin: Option<String>,
        pub operation: String,
    }

    /// Replays canned outputs keyed by operation label; everything not
    /// scripted succeeds with empty output.
    #[derive(Default)]
    pub struct ScriptedRunner {
        responses: Mutex<HashMap<String, VecDeque<CommandOutput>>>,
        errors: Mutex<HashMap<String, String>>,
        calls: Mutex<Vec<RecordedCall>>,
    }

    impl ScriptedRunner {
        pub fn new() -> Self {
            Self::default()
        }

        /// Queue a response for the next invocation of `operation`.
        pub fn respond(&self, operation: &str, output: CommandOutput) {
            self.responses
                .lock()
                .unwrap()
                .entry(operation.to_string())
                .or_default()
                .push_back(output);
        }

        /// Make `operation` return `Err` (tool could not be run at all).
        pub fn error_on(&self, operation: &str, message: &str) {
            self.errors
                .lock()
                .unwrap()
                .insert(operation.to_string(), message.to_string());
        }

        pub fn calls(&self) -> Vec<RecordedCall> {
            self.calls.lock().unwrap().clone()
        }

        pub fn calls_for(&self, operation: &str) -> Vec<RecordedCall> {
            self.calls()
                .into_iter()
                .filter(|c| c.operation == operation)
                .collect()
        }
    }

    #[async_trait]
    impl CommandRunner for ScriptedRunner {
        async fn run(&self, spec: CommandSpec) -> Result<CommandOutput> {
            self.calls.lock().unwrap().push(RecordedCall {
                program: spec.program.clone(),
                args: spec.args.clone(),
                stdin: spec.stdin.clone(),
                operation: spec.operation.clone(),
            });

            if let Some(msg) = self.errors.lock().unwrap().get(&spec.operation) {
                return Err(anyhow::anyhow!("{}", msg.clone()));
            }

            if let Some(queue) = self.responses.lock().unwrap().get_mut(&spec.operation) {
                if let Some(out) = queue.pop_front() {
                    return Ok(out);
                }
            }

            Ok(CommandOutput {
                exit_code: Some(0),
                stdout: String::new(),
                stderr: String::new(),
                duration_ms: 1,
            })
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn mask_arg_for_log_redacts_passwordish_values() {
        assert_eq!(mask_arg_for_log("password=REDACT_ME"), "***");
        assert_eq!(mask_arg_for_log("Pwd=REDACT_ME"), "***");
    }

    #[test]
    fn mask_arg_for_log_masks_connection_descriptors() {
        let masked = mask_arg_for_log("server=db1;user=shopserve;password=REDACT_ME");
        assert!(!masked.contains("REDACT_ME"));
        assert!(masked.contains("server=db1"));
    }

    #[test]
    fn failure_summary_prefers_stderr() {
        let out = CommandOutput {
            exit_code: Some(2),
            stdout: "ignored".to_string(),
            stderr: "fatal: role missing".to_string(),
            duration_ms: 3,
        };
        let summary = out.failure_summary("grant_access");
        assert!(summary.contains("grant_access"));
        assert!(summary.contains("fatal: role missing"));
    }

    #[tokio::test]
    async fn system_runner_captures_output_and_exit_code() {
        let runner = SystemCommandRunner;
        let out = runner
            .run(
                CommandSpec::new("sh", "test_echo")
                    .args(["-c", "echo hello"])
                    .timeout(Duration::from_secs(5)),
            )
            .await
            .expect("command should run");
        assert_eq!(out.exit_code, Some(0));
        assert!(out.stdout.to_ascii_lowercase().contains("hello"));
    }

    #[tokio::test]
    async fn system_runner_pipes_stdin_body() {
        let runner = SystemCommandRunner;
        let out = runner
            .run(
                CommandSpec::new("cat", "test_stdin")
                    .stdin_body("select 1;")
                    .timeout(Duration::from_secs(5)),
            )
            .await
            .expect("command should run");
        assert_eq!(out.stdout, "select 1;");
    }

    #[tokio::test]
    async fn scripted_runner_replays_and_records() {
        use fake::ScriptedRunner;

        let runner = ScriptedRunner::new();
        runner.respond("db_exists", CommandOutput::ok_with_stdout("1\n"));

        let out = runner
            .run(CommandSpec::new("psql", "db_exists").arg("-tA"))
            .await
            .unwrap();
        assert_eq!(out.stdout, "1\n");

        let calls = runner.calls_for("db_exists");
        assert_eq!(calls.len(), 1);
        assert_eq!(calls[0].program, "psql");
    }
}
