//! The runner itself: PATH resolution, spawn, wait, kill.

use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use tokio::process::Command;
use tokio::sync::{Mutex, Notify};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use uuid::Uuid;

use krait_config::{CaptureMode, RunnerConfig};
use krait_core::error::RunnerError;

use crate::outcome::{truncate_output, TaskOutcome, OUTPUT_TRUNCATE_CHARS};

/// One configured external CLI that tasks can be delegated to.
///
/// Runs are serialized through an internal slot; [`TaskRunner::kill`]
/// only signals the active run and is safe to call at any time.
pub struct TaskRunner {
    name: String,
    config: RunnerConfig,
    run_slot: Mutex<()>,
    kill_signal: Notify,
    running: AtomicBool,
}

struct RunningGuard<'a>(&'a AtomicBool);

impl Drop for RunningGuard<'_> {
    fn drop(&mut self) {
        self.0.store(false, Ordering::SeqCst);
    }
}

impl TaskRunner {
    pub fn new(name: impl Into<String>, config: RunnerConfig) -> Self {
        Self {
            name: name.into(),
            config,
            run_slot: Mutex::new(()),
            kill_signal: Notify::new(),
            running: AtomicBool::new(false),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// True only while a child process is alive.
    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }

    /// Kill the active run, if any. Idempotent; a no-op when idle.
    pub fn kill(&self) {
        self.kill_signal.notify_waiters();
    }

    /// Execute `task` in `cwd` under the configured wall-clock budget.
    ///
    /// Spawn failures and timeouts come back as failure outcomes, not
    /// errors; cancellation kills the child and returns
    /// [`RunnerError::Cancelled`].
    pub async fn run(
        &self,
        task: &str,
        cwd: &Path,
        cancel: &CancellationToken,
    ) -> Result<TaskOutcome, RunnerError> {
        let _slot = self.run_slot.lock().await;
        let cwd_str = cwd.display().to_string();

        let Some(program) = resolve_on_path(&self.config.command) else {
            warn!(runner = %self.name, command = %self.config.command, "executable not found");
            return Ok(TaskOutcome::failure(
                &self.name,
                &cwd_str,
                format!("executable '{}' not found on PATH", self.config.command),
            ));
        };

        tokio::fs::create_dir_all(cwd).await?;

        let uid = Uuid::new_v4().simple().to_string();
        let reply_path = matches!(self.config.capture, CaptureMode::ReplyFile)
            .then(|| cwd.join(format!("reply_{uid}.txt")));

        let mut command = Command::new(&program);
        command.args(&self.config.args);
        if let Some(path) = &reply_path {
            command.arg(&self.config.reply_flag).arg(path);
        }
        command
            .arg(task)
            .current_dir(cwd)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);

        debug!(runner = %self.name, program = %program.display(), "spawning task");
        let child = match command.spawn() {
            Ok(child) => child,
            Err(e) => {
                warn!(runner = %self.name, error = %e, "spawn failed");
                return Ok(TaskOutcome::failure(
                    &self.name,
                    &cwd_str,
                    format!("failed to start '{}': {e}", self.config.command),
                ));
            }
        };

        self.running.store(true, Ordering::SeqCst);
        let _flag = RunningGuard(&self.running);

        let timeout = Duration::from_secs(self.config.timeout_secs);
        // The child is moved into the wait future; leaving this block
        // drops it, and kill_on_drop reaps anything still alive.
        let (ok, exit_code, full_output) = {
            let wait = child.wait_with_output();
            tokio::pin!(wait);
            tokio::select! {
                biased;
                _ = cancel.cancelled() => {
                    info!(runner = %self.name, "task cancelled, killing child");
                    return Err(RunnerError::Cancelled);
                }
                _ = self.kill_signal.notified() => {
                    info!(runner = %self.name, "task killed");
                    (false, -1, "[killed]".to_string())
                }
                _ = tokio::time::sleep(timeout) => {
                    warn!(
                        runner = %self.name,
                        timeout_secs = self.config.timeout_secs,
                        "task timed out"
                    );
                    (
                        false,
                        -1,
                        format!("[timed out after {}s]", self.config.timeout_secs),
                    )
                }
                result = &mut wait => {
                    match result {
                        Ok(output) => {
                            let code = i64::from(output.status.code().unwrap_or(-1));
                            let text = self
                                .extract_output(&output, reply_path.as_deref())
                                .await;
                            (output.status.success(), code, text)
                        }
                        Err(e) => return Err(RunnerError::Io(e)),
                    }
                }
            }
        };

        let artifact_path = self.write_artifact(cwd, &uid, &full_output).await;
        info!(runner = %self.name, ok, exit_code, "task finished");
        Ok(TaskOutcome {
            ok,
            runner: self.name.clone(),
            cwd: cwd_str,
            exit_code,
            artifact_path,
            output: truncate_output(&full_output, OUTPUT_TRUNCATE_CHARS),
        })
    }

    /// Reply file when configured and non-empty, then stdout, then stderr.
    async fn extract_output(
        &self,
        output: &std::process::Output,
        reply: Option<&Path>,
    ) -> String {
        if let Some(path) = reply {
            match tokio::fs::read_to_string(path).await {
                Ok(text) if !text.trim().is_empty() => return text.trim().to_string(),
                Ok(_) => {}
                Err(e) => {
                    debug!(runner = %self.name, error = %e, "no reply file, using stdout")
                }
            }
        }
        let stdout = String::from_utf8_lossy(&output.stdout);
        let stdout = stdout.trim();
        if !stdout.is_empty() {
            return stdout.to_string();
        }
        String::from_utf8_lossy(&output.stderr).trim().to_string()
    }

    async fn write_artifact(&self, cwd: &Path, uid: &str, full_output: &str) -> Option<String> {
        let path = cwd.join(format!("output_{uid}.log"));
        match tokio::fs::write(&path, full_output).await {
            Ok(()) => Some(path.display().to_string()),
            Err(e) => {
                warn!(runner = %self.name, error = %e, "failed to write artifact file");
                None
            }
        }
    }
}

/// Resolve a bare command name against `PATH`; explicit paths are
/// checked directly.
fn resolve_on_path(command: &str) -> Option<PathBuf> {
    let candidate = Path::new(command);
    if candidate.components().count() > 1 {
        return is_executable(candidate).then(|| candidate.to_path_buf());
    }
    let path_var = std::env::var_os("PATH")?;
    std::env::split_paths(&path_var)
        .map(|dir| dir.join(command))
        .find(|p| is_executable(p))
}

#[cfg(unix)]
fn is_executable(path: &Path) -> bool {
    use std::os::unix::fs::PermissionsExt;
    path.metadata()
        .map(|m| m.is_file() && m.permissions().mode() & 0o111 != 0)
        .unwrap_or(false)
}

#[cfg(not(unix))]
fn is_executable(path: &Path) -> bool {
    path.is_file()
}
