//! Process-backed runner.

use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use tokio::io::{AsyncBufReadExt, AsyncRead, AsyncReadExt, BufReader};
use tokio::process::{Child, Command};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use super::parser::OutputParser;
use super::stream::{CHUNK_QUEUE_CAPACITY, ChunkStream, ExitInfo, StreamTracker};
use super::{Provider, Runner, RunnerConfig, StreamChunk};
use crate::error::RunnerError;
use crate::events::{AgentEvent, EventEmitter};
use crate::session::Session;

/// Maximum stderr bytes retained per invocation.
const MAX_STDERR_BYTES: usize = 16 * 1024;

/// How long to keep reading stderr after the process exits.
const STDERR_DRAIN_TIMEOUT: Duration = Duration::from_secs(2);

/// Handle on the process currently attached to the runner.
struct ActiveRun {
    cancel: CancellationToken,
    aborted: Arc<AtomicBool>,
}

/// Runs an assistant CLI as a child process.
pub struct CliRunner {
    config: RunnerConfig,
    cwd: PathBuf,
    emitter: Option<EventEmitter<AgentEvent>>,
    active: Arc<Mutex<Option<ActiveRun>>>,
    attempts: AtomicU32,
}

impl CliRunner {
    pub fn new(config: RunnerConfig, cwd: impl Into<PathBuf>) -> Self {
        Self {
            config,
            cwd: cwd.into(),
            emitter: None,
            active: Arc::new(Mutex::new(None)),
            attempts: AtomicU32::new(0),
        }
    }

    /// Publish session events on `emitter`.
    pub fn with_emitter(mut self, emitter: EventEmitter<AgentEvent>) -> Self {
        self.emitter = Some(emitter);
        self
    }

    pub fn config(&self) -> &RunnerConfig {
        &self.config
    }

    pub fn cwd(&self) -> &Path {
        &self.cwd
    }

    /// Attempts made by the most recent `run` call.
    pub fn attempts(&self) -> u32 {
        self.attempts.load(Ordering::SeqCst)
    }

    fn resolve_binary(&self) -> Result<PathBuf, RunnerError> {
        if let Some(binary) = &self.config.binary {
            return Ok(binary.clone());
        }
        let name = self.config.provider.binary_name();
        which::which(name).map_err(|_| RunnerError::BinaryNotFound {
            provider: self.config.provider.to_string(),
            binary: name.to_string(),
        })
    }

    fn build_command(&self, binary: &Path, prompt: &str) -> Command {
        let mut command = Command::new(binary);
        command
            .args(&self.config.launcher_args)
            .args(
                self.config
                    .provider
                    .args(prompt, self.config.model.as_deref()),
            )
            .args(&self.config.extra_args)
            .current_dir(&self.cwd)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);
        command
    }

    /// One attempt under the timeout ceiling.
    async fn run_once(&self, prompt: &str) -> Result<String, RunnerError> {
        let timeout = self.config.timeout;
        match tokio::time::timeout(timeout, self.collect(prompt)).await {
            Ok(result) => result,
            Err(_) => {
                self.abort();
                tracing::warn!(timeout = ?timeout, "Runner timed out, process aborted");
                Err(RunnerError::Timeout(timeout))
            }
        }
    }

    /// Drain a stream down to its final text.
    async fn collect(&self, prompt: &str) -> Result<String, RunnerError> {
        let stream = self.run_stream(prompt).await?;
        while let Some(chunk) = stream.next().await {
            match chunk {
                StreamChunk::Result { content } => return Ok(content),
                StreamChunk::Error { error } => {
                    return Err(RunnerError::ExecutionFailed {
                        exit_code: stream.exit_info().and_then(|e| e.code),
                        diagnostic: error,
                    });
                }
                StreamChunk::TextDelta { .. }
                | StreamChunk::Thinking { .. }
                | StreamChunk::ToolUse { .. } => {}
            }
        }
        Err(RunnerError::Aborted)
    }
}

#[async_trait]
impl Runner for CliRunner {
    fn provider(&self) -> Provider {
        self.config.provider
    }

    async fn run(&self, prompt: &str) -> Result<String, RunnerError> {
        let policy = self.config.retry;
        let mut attempt = 0;
        loop {
            attempt += 1;
            self.attempts.store(attempt, Ordering::SeqCst);

            match self.run_once(prompt).await {
                Ok(output) => return Ok(output),
                Err(e) if e.is_retryable() && policy.should_retry(attempt) => {
                    let delay = policy.delay_for(attempt);
                    tracing::warn!(
                        attempt,
                        max_attempts = policy.max_attempts,
                        delay = ?delay,
                        error = %e,
                        "Runner attempt failed, retrying"
                    );
                    tokio::time::sleep(delay).await;
                }
                Err(e) => return Err(e),
            }
        }
    }

    async fn run_stream(&self, prompt: &str) -> Result<ChunkStream, RunnerError> {
        let cancel = CancellationToken::new();
        let aborted = Arc::new(AtomicBool::new(false));
        {
            let mut active = self.active.lock().map_err(|_| RunnerError::Busy)?;
            if active.is_some() {
                return Err(RunnerError::Busy);
            }
            *active = Some(ActiveRun {
                cancel: cancel.clone(),
                aborted: aborted.clone(),
            });
        }

        let session = Session::new(self.config.provider.as_str(), self.config.model.clone());
        let session_id = session.id.clone();
        let mut tracker = StreamTracker::new(session, self.emitter.clone());
        tracker.start(prompt);

        let spawned = self
            .resolve_binary()
            .and_then(|binary| {
                let program = binary.display().to_string();
                self.build_command(&binary, prompt)
                    .spawn()
                    .map_err(|e| RunnerError::Spawn {
                        program,
                        reason: e.to_string(),
                    })
            });
        let mut child = match spawned {
            Ok(child) => child,
            Err(e) => {
                tracker.spawn_failed(&e.to_string());
                clear_active(&self.active);
                return Err(e);
            }
        };
        tracker.spawned();
        tracing::debug!(
            session_id = %session_id,
            provider = %self.config.provider,
            pid = child.id(),
            cwd = %self.cwd.display(),
            "Runner process spawned"
        );

        let (Some(stdout), Some(stderr)) = (child.stdout.take(), child.stderr.take()) else {
            let _ = child.start_kill();
            tracker.spawn_failed("process stdio was not captured");
            clear_active(&self.active);
            return Err(RunnerError::Spawn {
                program: self.config.provider.to_string(),
                reason: "stdio not captured".to_string(),
            });
        };

        let (tx, rx) = mpsc::channel(CHUNK_QUEUE_CAPACITY);
        let exit = Arc::new(Mutex::new(None));
        let reader = ReaderTask {
            child,
            parser: self.config.provider.parser(),
            tracker,
            tx,
            cancel,
            aborted,
            exit: exit.clone(),
            active: self.active.clone(),
        };
        tokio::spawn(reader.run(stdout, stderr));

        Ok(ChunkStream::new(session_id, rx, exit))
    }

    fn abort(&self) -> bool {
        let Ok(active) = self.active.lock() else {
            return false;
        };
        match active.as_ref() {
            Some(run) if !run.aborted.swap(true, Ordering::SeqCst) => {
                run.cancel.cancel();
                tracing::info!("Runner abort requested");
                true
            }
            _ => false,
        }
    }
}

fn clear_active(active: &Mutex<Option<ActiveRun>>) {
    if let Ok(mut guard) = active.lock() {
        guard.take();
    }
}

/// Outcome of handing a chunk to the queue.
enum Forward {
    Sent,
    Closed,
    Cancelled,
}

/// Owns the child process and feeds the queue until it exits.
struct ReaderTask {
    child: Child,
    parser: Box<dyn OutputParser>,
    tracker: StreamTracker,
    tx: mpsc::Sender<StreamChunk>,
    cancel: CancellationToken,
    aborted: Arc<AtomicBool>,
    exit: Arc<Mutex<Option<ExitInfo>>>,
    active: Arc<Mutex<Option<ActiveRun>>>,
}

/// Hand one chunk to the queue unless the run is cancelled first.
async fn forward(tx: &mpsc::Sender<StreamChunk>, cancel: &CancellationToken, chunk: StreamChunk) -> Forward {
    tokio::select! {
        sent = tx.send(chunk) => match sent {
            Ok(()) => Forward::Sent,
            Err(_) => Forward::Closed,
        },
        _ = cancel.cancelled() => Forward::Cancelled,
    }
}

impl ReaderTask {
    async fn run<O, E>(mut self, stdout: O, stderr: E)
    where
        O: AsyncRead + Unpin + Send + 'static,
        E: AsyncRead + Unpin + Send + 'static,
    {
        let stderr_task = tokio::spawn(collect_stderr(stderr));
        let mut lines = BufReader::new(stdout).lines();

        'read: loop {
            let line = tokio::select! {
                line = lines.next_line() => line,
                _ = self.cancel.cancelled() => break 'read,
            };
            match line {
                Ok(Some(line)) => {
                    for item in self.parser.parse_line(&line) {
                        let Some(chunk) = self.tracker.observe(item) else {
                            continue;
                        };
                        match forward(&self.tx, &self.cancel, chunk).await {
                            Forward::Sent => {}
                            Forward::Cancelled => break 'read,
                            Forward::Closed => {
                                tracing::debug!("Chunk consumers gone, stopping process");
                                break 'read;
                            }
                        }
                    }
                }
                Ok(None) => break,
                Err(e) => {
                    tracing::warn!(error = %e, "Failed reading runner output");
                    break;
                }
            }
        }

        if self.cancel.is_cancelled() || self.tx.is_closed() {
            let _ = self.child.start_kill();
        }

        let code = match self.child.wait().await {
            Ok(status) => status.code(),
            Err(e) => {
                tracing::warn!(error = %e, "Failed waiting for runner process");
                None
            }
        };
        let mut stderr_task = stderr_task;
        let stderr = match tokio::time::timeout(STDERR_DRAIN_TIMEOUT, &mut stderr_task).await {
            Ok(collected) => collected.unwrap_or_default(),
            Err(_) => {
                // A grandchild still holds the pipe.
                stderr_task.abort();
                String::new()
            }
        };
        let info = ExitInfo {
            code,
            aborted: self.aborted.load(Ordering::SeqCst),
        };

        tracing::debug!(
            session_id = %self.tracker.session().id,
            exit_code = ?info.code,
            aborted = info.aborted,
            "Runner process exited"
        );

        if let Ok(mut exit) = self.exit.lock() {
            *exit = Some(info.clone());
        }
        clear_active(&self.active);

        if let Some(chunk) = self.tracker.finish(&info, &stderr) {
            let _ = self.tx.send(chunk).await;
        }
    }
}

async fn collect_stderr<E: AsyncRead + Unpin>(mut stderr: E) -> String {
    let mut buf = Vec::new();
    let mut chunk = [0u8; 4096];
    loop {
        match stderr.read(&mut chunk).await {
            Ok(0) | Err(_) => break,
            Ok(n) => {
                buf.extend_from_slice(&chunk[..n]);
                if buf.len() > MAX_STDERR_BYTES {
                    let excess = buf.len() - MAX_STDERR_BYTES;
                    buf.drain(..excess);
                }
            }
        }
    }
    String::from_utf8_lossy(&buf).into_owned()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::runner::RetryPolicy;
    use crate::session::SessionStatus;

    /// Runner whose "assistant" is `sh -c <script>`. Provider arguments
    /// land in `$0..$n` and are ignored by the script.
    fn sh_runner(script: &str) -> CliRunner {
        let config = RunnerConfig::default()
            .with_binary("sh")
            .with_launcher_args(["-c", script])
            .with_retry(RetryPolicy {
                max_attempts: 3,
                base_delay: Duration::from_millis(10),
            });
        CliRunner::new(config, std::env::temp_dir())
    }

    fn fixture(lines: &[&str]) -> tempfile::NamedTempFile {
        use std::io::Write;
        let mut file = tempfile::NamedTempFile::new().unwrap();
        for line in lines {
            writeln!(file, "{line}").unwrap();
        }
        file
    }

    const ASSISTANT_TEXT: &str =
        r#"{"type":"assistant","message":{"content":[{"type":"text","text":"Working on it"}]}}"#;
    const ASSISTANT_TOOL: &str = r#"{"type":"assistant","message":{"content":[{"type":"tool_use","id":"t1","name":"Bash","input":{}}]}}"#;
    const RESULT: &str = r#"{"type":"result","subtype":"success","is_error":false,"result":"Fixed the bug"}"#;

    #[tokio::test]
    async fn stream_yields_chunks_then_result() {
        let file = fixture(&[ASSISTANT_TEXT, ASSISTANT_TOOL, RESULT]);
        let runner = sh_runner(&format!("cat '{}'", file.path().display()));

        let stream = runner.run_stream("go").await.unwrap();
        let mut chunks = Vec::new();
        while let Some(chunk) = stream.next().await {
            chunks.push(chunk);
        }
        assert_eq!(
            chunks,
            vec![
                StreamChunk::TextDelta {
                    content: "Working on it".to_string()
                },
                StreamChunk::ToolUse {
                    tool: "Bash".to_string(),
                    id: "t1".to_string()
                },
                StreamChunk::Result {
                    content: "Fixed the bug".to_string()
                },
            ]
        );
        assert_eq!(
            stream.exit_info(),
            Some(ExitInfo {
                code: Some(0),
                aborted: false
            })
        );
    }

    #[tokio::test]
    async fn events_follow_chunk_order() {
        let file = fixture(&[ASSISTANT_TEXT, ASSISTANT_TOOL, ASSISTANT_TOOL, RESULT]);
        let emitter = EventEmitter::new();
        let mut rx = emitter.subscribe();
        let runner = sh_runner(&format!("cat '{}'", file.path().display())).with_emitter(emitter);

        let output = runner.run("go").await.unwrap();
        assert_eq!(output, "Fixed the bug");

        let mut kinds = Vec::new();
        let mut ended = None;
        while let Ok(event) = rx.try_recv() {
            kinds.push(event.kind());
            if let AgentEvent::SessionEnded { summary, .. } = event {
                ended = Some(summary);
            }
        }
        assert_eq!(
            kinds,
            vec![
                "session_started",
                "prompt_submitted",
                "text_delta",
                "tool_started",
                "tool_completed",
                "tool_started",
                "tool_completed",
                "response_completed",
                "session_ended",
            ]
        );
        let summary = ended.unwrap();
        assert_eq!(summary.status, SessionStatus::Completed);
        assert_eq!(summary.tool_calls, 2);
    }

    #[tokio::test]
    async fn nonzero_exit_is_retried_then_reported() {
        let runner = sh_runner("echo 'model overloaded' >&2; exit 3");
        let err = runner.run("go").await.unwrap_err();
        assert_eq!(runner.attempts(), 3);
        match err {
            RunnerError::ExecutionFailed {
                exit_code,
                diagnostic,
            } => {
                assert_eq!(exit_code, Some(3));
                assert!(diagnostic.contains("model overloaded"));
            }
            other => panic!("unexpected error: {other}"),
        }
    }

    #[tokio::test]
    async fn transient_failure_recovers_on_retry() {
        let dir = tempfile::tempdir().unwrap();
        let marker = dir.path().join("attempted");
        let script = format!(
            "if [ -f '{m}' ]; then echo 'second time lucky'; else touch '{m}'; exit 1; fi",
            m = marker.display()
        );
        let runner = sh_runner(&script);
        let output = runner.run("go").await.unwrap();
        assert_eq!(output, "second time lucky");
        assert_eq!(runner.attempts(), 2);
    }

    #[tokio::test]
    async fn timeout_is_not_retried() {
        let runner = CliRunner::new(
            RunnerConfig::default()
                .with_binary("sh")
                .with_launcher_args(["-c", "sleep 30"])
                .with_timeout(Duration::from_millis(200))
                .with_retry(RetryPolicy {
                    max_attempts: 3,
                    base_delay: Duration::from_millis(10),
                }),
            std::env::temp_dir(),
        );

        let started = std::time::Instant::now();
        let err = runner.run("go").await.unwrap_err();
        assert!(matches!(err, RunnerError::Timeout(_)), "got {err}");
        assert_eq!(runner.attempts(), 1);
        assert!(started.elapsed() < Duration::from_secs(10));
    }

    #[tokio::test]
    async fn abort_suppresses_error_and_signals_once() {
        let emitter = EventEmitter::new();
        let mut rx = emitter.subscribe();
        let runner = sh_runner("echo started; sleep 30").with_emitter(emitter);

        let stream = runner.run_stream("go").await.unwrap();
        let first = stream.next().await;
        assert!(matches!(first, Some(StreamChunk::TextDelta { .. })));

        assert!(runner.abort());
        assert!(!runner.abort());

        assert_eq!(stream.next().await, None);
        let info = stream.exit_info().unwrap();
        assert!(info.aborted);

        let mut saw_error = false;
        let mut final_status = None;
        while let Ok(event) = rx.try_recv() {
            match event {
                AgentEvent::ErrorOccurred { .. } => saw_error = true,
                AgentEvent::SessionEnded { summary, .. } => final_status = Some(summary.status),
                _ => {}
            }
        }
        assert!(!saw_error);
        assert_eq!(final_status, Some(SessionStatus::Canceled));
    }

    #[tokio::test]
    async fn missing_binary_is_a_spawn_error() {
        let runner = CliRunner::new(
            RunnerConfig::default().with_binary("/definitely/not/here/claude"),
            std::env::temp_dir(),
        );
        let err = runner.run("go").await.unwrap_err();
        assert!(matches!(err, RunnerError::Spawn { .. }));
        assert_eq!(runner.attempts(), 1);
        assert!(!runner.abort());
    }

    #[tokio::test]
    async fn second_stream_while_active_is_busy() {
        let runner = sh_runner("sleep 30");
        let _stream = runner.run_stream("one").await.unwrap();
        assert!(matches!(
            runner.run_stream("two").await,
            Err(RunnerError::Busy)
        ));
        runner.abort();
    }
}
