//! Agent backed by a local command-line program, one child process per session.

use super::{Agent, AgentSignal, SessionRequest, SignalSender};
use crate::config::AgentConfig;
use crate::types::TaskId;
use anyhow::{Context, Result, anyhow};
use async_trait::async_trait;
use parking_lot::Mutex;
use regex_lite::Regex;
use std::collections::HashMap;
use std::process::{ExitStatus, Stdio};
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, AsyncRead, AsyncWriteExt, BufReader};
use tokio::process::Command;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

/// How long output readers may lag behind process exit.
const READER_GRACE: Duration = Duration::from_secs(2);

/// Why the supervisor stopped a session.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum StopReason {
    Pause,
    Cancel,
    Kill,
    RateLimit,
}

struct Session {
    generation: u64,
    stop: mpsc::Sender<StopReason>,
    done: watch::Receiver<bool>,
}

struct Inner {
    config: AgentConfig,
    rate_limit: Regex,
    retry_after: Regex,
    signals: SignalSender,
    sessions: Mutex<HashMap<TaskId, Session>>,
    generation: AtomicU64,
}

#[derive(Clone)]
pub struct CommandAgent {
    inner: Arc<Inner>,
}

impl CommandAgent {
    pub fn new(config: AgentConfig, signals: SignalSender) -> Result<Self> {
        let rate_limit = Regex::new(&config.rate_limit_pattern)
            .with_context(|| format!("Invalid rate_limit_pattern: {}", config.rate_limit_pattern))?;
        let retry_after = Regex::new(r"(?i)retry[ _-]?after[^0-9]{0,4}([0-9]+)")
            .map_err(|e| anyhow!("retry-after pattern: {e}"))?;
        Ok(Self {
            inner: Arc::new(Inner {
                config,
                rate_limit,
                retry_after,
                signals,
                sessions: Mutex::new(HashMap::new()),
                generation: AtomicU64::new(1),
            }),
        })
    }

    /// Whether a child process is currently running for the task.
    pub fn is_running(&self, task_id: TaskId) -> bool {
        self.inner.sessions.lock().contains_key(&task_id)
    }

    fn build_command(&self, request: &SessionRequest) -> Command {
        let config = &self.inner.config;
        let mut cmd = Command::new(&config.program);
        if request.reuse_session {
            cmd.args(&config.resume_args);
        } else {
            cmd.args(&config.args);
        }
        if request.skip_permissions && !config.skip_permissions_flag.is_empty() {
            cmd.arg(&config.skip_permissions_flag);
        }
        cmd.arg(&request.instruction);

        cmd.env("AGENT_RUNNER_TASK_ID", request.task_id.to_string());
        for (key, value) in [
            ("AGENT_RUNNER_BASE_BRANCH", &request.base_branch),
            ("AGENT_RUNNER_CURRENT_BRANCH", &request.current_branch),
            ("AGENT_RUNNER_TICKET_KEY", &request.ticket_key),
        ] {
            if let Some(value) = value {
                cmd.env(key, value);
            }
        }
        if let Some(dir) = &config.working_dir {
            cmd.current_dir(dir);
        }

        cmd.stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);
        cmd
    }

    async fn spawn_session(&self, request: SessionRequest) -> Result<()> {
        let task_id = request.task_id;
        if self.is_running(task_id) {
            return Err(anyhow!("A session is already running for task {task_id}"));
        }

        let mut child = self
            .build_command(&request)
            .spawn()
            .with_context(|| format!("Failed to spawn agent '{}'", self.inner.config.program))?;
        info!(
            task_id,
            pid = child.id(),
            reuse = request.reuse_session,
            "Agent session started"
        );

        if let Some(mut stdin) = child.stdin.take() {
            if let Some(script) = request.script_content.clone() {
                tokio::spawn(async move {
                    if let Err(e) = stdin.write_all(script.as_bytes()).await {
                        warn!(task_id, error = %e, "Failed to write script to agent stdin");
                    }
                });
            }
        }

        let (stop_tx, stop_rx) = mpsc::channel(4);
        let (done_tx, done_rx) = watch::channel(false);
        let generation = self.inner.generation.fetch_add(1, Ordering::Relaxed);

        let mut readers = Vec::new();
        if let Some(stdout) = child.stdout.take() {
            readers.push(self.spawn_reader(task_id, stdout, false, stop_tx.clone()));
        }
        if let Some(stderr) = child.stderr.take() {
            readers.push(self.spawn_reader(task_id, stderr, true, stop_tx.clone()));
        }

        self.inner.sessions.lock().insert(
            task_id,
            Session {
                generation,
                stop: stop_tx,
                done: done_rx,
            },
        );

        let inner = Arc::clone(&self.inner);
        tokio::spawn(async move {
            let mut stop_rx = stop_rx;
            let outcome = tokio::select! {
                biased;
                Some(reason) = stop_rx.recv() => {
                    debug!(task_id, ?reason, "Stopping agent session");
                    if let Err(e) = child.start_kill() {
                        warn!(task_id, error = %e, "Failed to signal agent process");
                    }
                    let _ = child.wait().await;
                    Err(reason)
                }
                status = child.wait() => Ok(status),
            };

            // Let buffered output land before the terminal signal.
            for reader in readers {
                let _ = tokio::time::timeout(READER_GRACE, reader).await;
            }

            {
                let mut sessions = inner.sessions.lock();
                if sessions.get(&task_id).map(|s| s.generation) == Some(generation) {
                    sessions.remove(&task_id);
                }
            }
            let _ = done_tx.send(true);

            let signal = match outcome {
                Ok(Ok(status)) => Some(exit_signal(task_id, status)),
                Ok(Err(e)) => Some(AgentSignal::Exited {
                    task_id,
                    reason: format!("Failed to wait for agent process: {e}"),
                }),
                Err(StopReason::Cancel) => Some(AgentSignal::CancelAcknowledged { task_id }),
                Err(StopReason::Pause | StopReason::Kill | StopReason::RateLimit) => None,
            };
            if let Some(signal) = signal {
                debug!(task_id, ?signal, "Agent session ended");
                let _ = inner.signals.send(signal).await;
            }
        });

        Ok(())
    }

    fn spawn_reader(
        &self,
        task_id: TaskId,
        pipe: impl AsyncRead + Unpin + Send + 'static,
        is_error: bool,
        stop: mpsc::Sender<StopReason>,
    ) -> JoinHandle<()> {
        let inner = Arc::clone(&self.inner);
        tokio::spawn(async move {
            let mut lines = BufReader::new(pipe).lines();
            let mut limited = false;
            while let Ok(Some(line)) = lines.next_line().await {
                let hit_limit = !limited && inner.rate_limit.is_match(&line);
                let retry_after = hit_limit
                    .then(|| parse_retry_after(&inner.retry_after, &line))
                    .flatten();
                if inner
                    .signals
                    .send(AgentSignal::Log {
                        task_id,
                        line,
                        is_error,
                    })
                    .await
                    .is_err()
                {
                    break;
                }
                if hit_limit {
                    limited = true;
                    let _ = inner
                        .signals
                        .send(AgentSignal::RateLimited {
                            task_id,
                            retry_after,
                        })
                        .await;
                    let _ = stop.send(StopReason::RateLimit).await;
                }
            }
        })
    }

    async fn stop(&self, task_id: TaskId, reason: StopReason) -> Result<Option<watch::Receiver<bool>>> {
        let (stop, done) = {
            let sessions = self.inner.sessions.lock();
            match sessions.get(&task_id) {
                Some(session) => (session.stop.clone(), session.done.clone()),
                None => return Ok(None),
            }
        };
        if stop.send(reason).await.is_err() {
            return Ok(None);
        }
        Ok(Some(done))
    }
}

fn exit_signal(task_id: TaskId, status: ExitStatus) -> AgentSignal {
    match status.code() {
        Some(0) => AgentSignal::Completed { task_id },
        Some(code) => AgentSignal::Failed {
            task_id,
            reason: format!("Agent exited with status {code}"),
        },
        None => AgentSignal::Exited {
            task_id,
            reason: "Agent process terminated by signal".to_string(),
        },
    }
}

fn parse_retry_after(pattern: &Regex, line: &str) -> Option<Duration> {
    let seconds = pattern.captures(line)?.get(1)?.as_str().parse().ok()?;
    Some(Duration::from_secs(seconds))
}

async fn wait_done(mut done: watch::Receiver<bool>) {
    let _ = done.wait_for(|finished| *finished).await;
}

#[async_trait]
impl Agent for CommandAgent {
    async fn connect(&self) -> Result<()> {
        self.inner
            .signals
            .send(AgentSignal::Connected)
            .await
            .map_err(|_| anyhow!("Signal channel closed"))
    }

    async fn start(&self, request: SessionRequest) -> Result<()> {
        self.spawn_session(request).await
    }

    async fn pause(&self, task_id: TaskId) -> Result<()> {
        match self.stop(task_id, StopReason::Pause).await? {
            Some(done) => {
                wait_done(done).await;
                Ok(())
            }
            None => Err(anyhow!("No running session for task {task_id}")),
        }
    }

    async fn resume(&self, request: SessionRequest) -> Result<()> {
        self.spawn_session(request).await
    }

    async fn cancel(&self, task_id: TaskId) -> Result<()> {
        if self.stop(task_id, StopReason::Cancel).await?.is_none() {
            // Nothing running (paused or waiting out a limit): stopping is immediate.
            let signals = self.inner.signals.clone();
            tokio::spawn(async move {
                let _ = signals.send(AgentSignal::CancelAcknowledged { task_id }).await;
            });
        }
        Ok(())
    }

    async fn kill(&self, task_id: TaskId) -> Result<()> {
        if let Some(done) = self.stop(task_id, StopReason::Kill).await? {
            wait_done(done).await;
        }
        Ok(())
    }

    async fn discard_session(&self, task_id: TaskId) -> Result<()> {
        debug!(task_id, "Discarding agent session context");
        Ok(())
    }
}

#[cfg(all(test, unix))]
mod tests {
    use super::*;
    use crate::agent::signal_channel;

    fn sh(script: &str) -> AgentConfig {
        AgentConfig {
            program: "sh".into(),
            args: vec!["-c".into(), script.into()],
            resume_args: vec!["-c".into(), "echo resumed".into()],
            skip_permissions_flag: String::new(),
            working_dir: None,
            rate_limit_pattern: "RATE LIMIT".into(),
        }
    }

    fn request(task_id: TaskId) -> SessionRequest {
        SessionRequest {
            task_id,
            instruction: "ignored".into(),
            script_content: None,
            base_branch: None,
            current_branch: None,
            ticket_key: None,
            skip_permissions: false,
            reuse_session: false,
        }
    }

    async fn next(rx: &mut crate::agent::SignalReceiver) -> AgentSignal {
        tokio::time::timeout(Duration::from_secs(5), rx.recv())
            .await
            .expect("signal timeout")
            .expect("channel closed")
    }

    #[tokio::test]
    async fn test_output_then_completion() {
        let (tx, mut rx) = signal_channel(16);
        let agent = CommandAgent::new(sh("echo hello; echo oops >&2"), tx).unwrap();

        agent.start(request(1)).await.unwrap();

        let mut lines = Vec::new();
        loop {
            match next(&mut rx).await {
                AgentSignal::Log { line, is_error, .. } => lines.push((line, is_error)),
                AgentSignal::Completed { task_id } => {
                    assert_eq!(task_id, 1);
                    break;
                }
                other => panic!("unexpected {other:?}"),
            }
        }
        lines.sort();
        assert_eq!(lines, vec![("hello".into(), false), ("oops".into(), true)]);
        assert!(!agent.is_running(1));
    }

    #[tokio::test]
    async fn test_nonzero_exit_fails() {
        let (tx, mut rx) = signal_channel(16);
        let agent = CommandAgent::new(sh("exit 3"), tx).unwrap();
        agent.start(request(2)).await.unwrap();
        assert_eq!(
            next(&mut rx).await,
            AgentSignal::Failed {
                task_id: 2,
                reason: "Agent exited with status 3".into()
            }
        );
    }

    #[tokio::test]
    async fn test_rate_limit_line_stops_session() {
        let (tx, mut rx) = signal_channel(16);
        let agent = CommandAgent::new(sh("echo 'RATE LIMIT retry after 9'; sleep 30"), tx).unwrap();
        agent.start(request(3)).await.unwrap();

        assert!(matches!(next(&mut rx).await, AgentSignal::Log { .. }));
        assert_eq!(
            next(&mut rx).await,
            AgentSignal::RateLimited {
                task_id: 3,
                retry_after: Some(Duration::from_secs(9))
            }
        );
    }

    #[tokio::test]
    async fn test_cancel_is_acknowledged() {
        let (tx, mut rx) = signal_channel(16);
        let agent = CommandAgent::new(sh("sleep 30"), tx).unwrap();
        agent.start(request(4)).await.unwrap();

        agent.cancel(4).await.unwrap();
        assert_eq!(next(&mut rx).await, AgentSignal::CancelAcknowledged { task_id: 4 });
    }

    #[tokio::test]
    async fn test_pause_then_resume_respawns() {
        let (tx, mut rx) = signal_channel(16);
        let agent = CommandAgent::new(sh("sleep 30"), tx).unwrap();
        agent.start(request(5)).await.unwrap();

        agent.pause(5).await.unwrap();
        assert!(!agent.is_running(5));
        assert!(agent.pause(5).await.is_err());

        let mut resume = request(5);
        resume.reuse_session = true;
        agent.resume(resume).await.unwrap();
        assert_eq!(
            next(&mut rx).await,
            AgentSignal::Log {
                task_id: 5,
                line: "resumed".into(),
                is_error: false
            }
        );
        assert_eq!(next(&mut rx).await, AgentSignal::Completed { task_id: 5 });
    }

    #[tokio::test]
    async fn test_kill_waits_for_exit() {
        let (tx, _rx) = signal_channel(16);
        let agent = CommandAgent::new(sh("sleep 30"), tx).unwrap();
        agent.start(request(6)).await.unwrap();
        agent.kill(6).await.unwrap();
        assert!(!agent.is_running(6));
        // Killing a gone session is a no-op.
        agent.kill(6).await.unwrap();
    }
}
