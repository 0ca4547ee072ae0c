//! Chunk queue and per-session stream tracking.

use std::sync::{Arc, Mutex};

use futures::Stream;
use tokio::sync::mpsc;

use super::StreamChunk;
use super::parser::ParsedItem;
use crate::events::{AgentEvent, EventEmitter, SessionSummary};
use crate::session::{ProtocolEvent, Session, SessionStatus};

/// Chunks buffered between the process reader and consumers. The reader
/// waits when the queue is full.
pub(crate) const CHUNK_QUEUE_CAPACITY: usize = 64;

/// Maximum stderr kept for diagnostics.
const STDERR_EXCERPT_CHARS: usize = 800;

/// How the process ended.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExitInfo {
    /// `None` when the process was killed by a signal.
    pub code: Option<i32>,
    pub aborted: bool,
}

/// Consumer handle for one streamed execution.
///
/// Clones share the same queue, so several tasks can drain it concurrently;
/// each chunk is delivered to exactly one of them.
#[derive(Debug, Clone)]
pub struct ChunkStream {
    session_id: String,
    rx: Arc<tokio::sync::Mutex<mpsc::Receiver<StreamChunk>>>,
    exit: Arc<Mutex<Option<ExitInfo>>>,
}

impl ChunkStream {
    pub(crate) fn new(
        session_id: String,
        rx: mpsc::Receiver<StreamChunk>,
        exit: Arc<Mutex<Option<ExitInfo>>>,
    ) -> Self {
        Self {
            session_id,
            rx: Arc::new(tokio::sync::Mutex::new(rx)),
            exit,
        }
    }

    pub fn session_id(&self) -> &str {
        &self.session_id
    }

    /// Wait for the next chunk. `None` once the process is gone and the
    /// queue is drained.
    pub async fn next(&self) -> Option<StreamChunk> {
        self.rx.lock().await.recv().await
    }

    /// Exit information, available once the final chunk has been queued.
    pub fn exit_info(&self) -> Option<ExitInfo> {
        self.exit.lock().ok().and_then(|guard| guard.clone())
    }

    /// Adapt into a `futures::Stream`.
    pub fn into_stream(self) -> impl Stream<Item = StreamChunk> {
        futures::stream::unfold(self, |stream| async move {
            stream.next().await.map(|chunk| (chunk, stream))
        })
    }
}

/// Drives the session record and event emission from parsed output.
///
/// Keeps two pieces of cross-line state: the currently open tool (closed
/// when the next tool starts, when text resumes, when its result arrives, or
/// at the end) and whether a thinking span is open.
pub(crate) struct StreamTracker {
    session: Session,
    emitter: Option<EventEmitter<AgentEvent>>,
    open_tool: Option<(String, String)>,
    thinking: bool,
    text: String,
    final_result: Option<String>,
    last_error: Option<String>,
}

impl StreamTracker {
    pub(crate) fn new(session: Session, emitter: Option<EventEmitter<AgentEvent>>) -> Self {
        Self {
            session,
            emitter,
            open_tool: None,
            thinking: false,
            text: String::new(),
            final_result: None,
            last_error: None,
        }
    }

    pub(crate) fn session(&self) -> &Session {
        &self.session
    }

    fn sid(&self) -> String {
        self.session.id.clone()
    }

    fn emit(&self, event: AgentEvent) {
        if let Some(emitter) = &self.emitter {
            emitter.emit(event);
        }
    }

    fn transition(&mut self, event: ProtocolEvent) {
        if let Err(e) = self.session.apply(event) {
            tracing::debug!(error = %e, "Ignoring out-of-order session event");
        }
    }

    pub(crate) fn start(&mut self, prompt: &str) {
        self.transition(ProtocolEvent::CreateSession);
        self.emit(AgentEvent::SessionStarted {
            session_id: self.sid(),
            provider: self.session.provider.clone(),
            model: self.session.model.clone(),
        });
        self.emit(AgentEvent::PromptSubmitted {
            session_id: self.sid(),
            prompt: prompt.to_string(),
        });
    }

    pub(crate) fn spawned(&mut self) {
        self.transition(ProtocolEvent::CliSpawned);
    }

    pub(crate) fn spawn_failed(&mut self, error: &str) {
        self.transition(ProtocolEvent::SpawnFailed);
        self.emit(AgentEvent::ErrorOccurred {
            session_id: self.sid(),
            error: error.to_string(),
        });
        self.end(None);
    }

    fn stop_thinking(&mut self) {
        if self.thinking {
            self.thinking = false;
            self.emit(AgentEvent::ThinkingStopped {
                session_id: self.sid(),
            });
        }
    }

    fn close_tool(&mut self) {
        if let Some((tool, tool_id)) = self.open_tool.take() {
            self.emit(AgentEvent::ToolCompleted {
                session_id: self.sid(),
                tool,
                tool_id,
            });
        }
    }

    /// Update state for one parsed item; returns the chunk to forward, if any.
    pub(crate) fn observe(&mut self, item: ParsedItem) -> Option<StreamChunk> {
        match item {
            ParsedItem::Chunk(chunk) => {
                match &chunk {
                    StreamChunk::TextDelta { content } => {
                        self.stop_thinking();
                        self.close_tool();
                        if self.session.status() == SessionStatus::Running {
                            self.transition(ProtocolEvent::FirstTextDelta);
                        }
                        self.session.record_text(content.chars().count());
                        self.text.push_str(content);
                        self.emit(AgentEvent::TextDelta {
                            session_id: self.sid(),
                            content: content.clone(),
                        });
                    }
                    StreamChunk::Thinking { .. } => {
                        if !self.thinking {
                            self.thinking = true;
                            self.emit(AgentEvent::ThinkingStarted {
                                session_id: self.sid(),
                            });
                        }
                    }
                    StreamChunk::ToolUse { tool, id } => {
                        self.stop_thinking();
                        self.close_tool();
                        self.session.record_tool();
                        self.open_tool = Some((tool.clone(), id.clone()));
                        self.emit(AgentEvent::ToolStarted {
                            session_id: self.sid(),
                            tool: tool.clone(),
                            tool_id: id.clone(),
                        });
                    }
                    StreamChunk::Result { content } => {
                        self.final_result = Some(content.clone());
                        return None;
                    }
                    StreamChunk::Error { error } => {
                        self.last_error = Some(error.clone());
                        return None;
                    }
                }
                Some(chunk)
            }
            ParsedItem::ToolResult { id } => {
                let matches = self
                    .open_tool
                    .as_ref()
                    .is_some_and(|(_, open_id)| open_id == &id || id.is_empty());
                if matches {
                    self.close_tool();
                }
                None
            }
            ParsedItem::Usage(usage) => {
                self.session.record_usage(usage);
                None
            }
            ParsedItem::FinalResult { content, .. } => {
                self.final_result = Some(content);
                None
            }
            ParsedItem::ErrorMessage(message) => {
                self.last_error = Some(message);
                None
            }
        }
    }

    /// Close out the session once the process has exited. Returns the final
    /// chunk: `result` on a zero exit, `error` on a failed exit that was not
    /// aborted, nothing for an abort.
    pub(crate) fn finish(&mut self, exit: &ExitInfo, stderr: &str) -> Option<StreamChunk> {
        self.stop_thinking();
        self.close_tool();

        let chunk = match exit.code {
            Some(0) => {
                let content = self
                    .final_result
                    .clone()
                    .unwrap_or_else(|| self.text.trim().to_string());
                self.transition(ProtocolEvent::ResultReceived);
                self.emit(AgentEvent::ResponseCompleted {
                    session_id: self.sid(),
                    content: content.clone(),
                });
                Some(StreamChunk::Result { content })
            }
            _ if exit.aborted => {
                self.transition(ProtocolEvent::Cancel);
                None
            }
            code => {
                let diagnostic = build_diagnostic(
                    code,
                    stderr,
                    self.last_error.as_deref(),
                    self.final_result.as_deref(),
                );
                self.transition(if code.is_none() {
                    ProtocolEvent::ProcessCrashed
                } else {
                    ProtocolEvent::ErrorReceived
                });
                self.emit(AgentEvent::ErrorOccurred {
                    session_id: self.sid(),
                    error: diagnostic.clone(),
                });
                Some(StreamChunk::Error { error: diagnostic })
            }
        };

        self.end(exit.code);
        chunk
    }

    fn end(&mut self, exit_code: Option<i32>) {
        let summary = SessionSummary {
            status: self.session.status(),
            text_chars: self.session.text_chars,
            tool_calls: self.session.tool_calls,
            usage: self.session.usage,
            duration_ms: self.session.duration_ms(),
            exit_code,
        };
        self.emit(AgentEvent::SessionEnded {
            session_id: self.sid(),
            summary,
        });
    }
}

/// Human-readable explanation of a failed run.
pub(crate) fn build_diagnostic(
    code: Option<i32>,
    stderr: &str,
    last_error: Option<&str>,
    last_result: Option<&str>,
) -> String {
    let mut parts = vec![match code {
        Some(code) => format!("exit code {code}"),
        None => "terminated by signal".to_string(),
    }];

    let stderr = stderr.trim();
    if !stderr.is_empty() {
        parts.push(format!("stderr: {}", tail(stderr, STDERR_EXCERPT_CHARS)));
    }
    if let Some(error) = last_error.filter(|e| !e.trim().is_empty()) {
        parts.push(format!("error: {}", tail(error.trim(), STDERR_EXCERPT_CHARS)));
    } else if let Some(result) = last_result.filter(|r| !r.trim().is_empty()) {
        parts.push(format!("last result: {}", tail(result.trim(), STDERR_EXCERPT_CHARS)));
    }
    parts.join("; ")
}

/// Last `max` characters of `s`, prefixed with an ellipsis when cut.
fn tail(s: &str, max: usize) -> String {
    let count = s.chars().count();
    if count <= max {
        return s.to_string();
    }
    let skipped: String = s.chars().skip(count - max).collect();
    format!("...{skipped}")
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::session::TokenUsage;

    fn tracker() -> (StreamTracker, tokio::sync::broadcast::Receiver<AgentEvent>) {
        let emitter = EventEmitter::new();
        let rx = emitter.subscribe();
        let mut tracker = StreamTracker::new(Session::new("claude", None), Some(emitter));
        tracker.start("do it");
        tracker.spawned();
        (tracker, rx)
    }

    fn kinds(rx: &mut tokio::sync::broadcast::Receiver<AgentEvent>) -> Vec<&'static str> {
        let mut kinds = Vec::new();
        while let Ok(event) = rx.try_recv() {
            kinds.push(event.kind());
        }
        kinds
    }

    fn chunk(c: StreamChunk) -> ParsedItem {
        ParsedItem::Chunk(c)
    }

    fn tool(id: &str) -> ParsedItem {
        chunk(StreamChunk::ToolUse {
            tool: "Bash".to_string(),
            id: id.to_string(),
        })
    }

    fn thinking() -> ParsedItem {
        chunk(StreamChunk::Thinking {
            content: "...".to_string(),
        })
    }

    fn text(s: &str) -> ParsedItem {
        chunk(StreamChunk::TextDelta {
            content: s.to_string(),
        })
    }

    #[test]
    fn new_tool_closes_previous_tool() {
        let (mut t, mut rx) = tracker();
        t.observe(tool("a"));
        t.observe(tool("b"));
        t.finish(&ExitInfo { code: Some(0), aborted: false }, "");

        let events: Vec<_> = std::iter::from_fn(|| rx.try_recv().ok()).collect();
        let tool_events: Vec<_> = events
            .iter()
            .filter_map(|e| match e {
                AgentEvent::ToolStarted { tool_id, .. } => Some(format!("start:{tool_id}")),
                AgentEvent::ToolCompleted { tool_id, .. } => Some(format!("done:{tool_id}")),
                _ => None,
            })
            .collect();
        assert_eq!(tool_events, vec!["start:a", "done:a", "start:b", "done:b"]);
    }

    #[test]
    fn consecutive_thinking_is_one_span() {
        let (mut t, mut rx) = tracker();
        t.observe(thinking());
        t.observe(thinking());
        t.observe(thinking());
        t.observe(text("answer"));
        let kinds = kinds(&mut rx);
        assert_eq!(
            kinds,
            vec![
                "session_started",
                "prompt_submitted",
                "thinking_started",
                "thinking_stopped",
                "text_delta"
            ]
        );
    }

    #[test]
    fn first_text_moves_to_streaming_and_result_completes() {
        let (mut t, _rx) = tracker();
        assert_eq!(t.session().status(), SessionStatus::Running);
        t.observe(text("hello "));
        assert_eq!(t.session().status(), SessionStatus::Streaming);
        t.observe(text("world"));
        let last = t.finish(&ExitInfo { code: Some(0), aborted: false }, "");
        assert_eq!(
            last,
            Some(StreamChunk::Result {
                content: "hello world".to_string()
            })
        );
        assert_eq!(t.session().status(), SessionStatus::Completed);
    }

    #[test]
    fn structured_result_wins_over_text() {
        let (mut t, _rx) = tracker();
        t.observe(text("thinking out loud"));
        t.observe(ParsedItem::FinalResult {
            content: "final".to_string(),
            is_error: false,
        });
        t.observe(ParsedItem::Usage(TokenUsage {
            input_tokens: 3,
            output_tokens: 4,
        }));
        let last = t.finish(&ExitInfo { code: Some(0), aborted: false }, "");
        assert_eq!(
            last,
            Some(StreamChunk::Result {
                content: "final".to_string()
            })
        );
        assert_eq!(t.session().usage.total(), 7);
    }

    #[test]
    fn failed_exit_yields_error_with_diagnostic() {
        let (mut t, mut rx) = tracker();
        t.observe(ParsedItem::ErrorMessage("API overloaded".to_string()));
        let last = t.finish(&ExitInfo { code: Some(2), aborted: false }, "warning: retrying\n");
        let Some(StreamChunk::Error { error }) = last else {
            panic!("expected error chunk");
        };
        assert!(error.contains("exit code 2"));
        assert!(error.contains("stderr: warning: retrying"));
        assert!(error.contains("API overloaded"));
        assert_eq!(t.session().status(), SessionStatus::Failed);
        let kinds = kinds(&mut rx);
        assert!(kinds.ends_with(&["error_occurred", "session_ended"]));
    }

    #[test]
    fn aborted_exit_is_silent() {
        let (mut t, mut rx) = tracker();
        t.observe(text("partial"));
        let last = t.finish(&ExitInfo { code: None, aborted: true }, "");
        assert_eq!(last, None);
        assert_eq!(t.session().status(), SessionStatus::Canceled);
        assert!(!kinds(&mut rx).contains(&"error_occurred"));
    }

    #[test]
    fn zero_exit_after_abort_is_success() {
        let (mut t, _rx) = tracker();
        let last = t.finish(&ExitInfo { code: Some(0), aborted: true }, "");
        assert!(matches!(last, Some(StreamChunk::Result { .. })));
        assert_eq!(t.session().status(), SessionStatus::Completed);
    }

    #[test]
    fn signal_death_without_abort_is_interrupted() {
        let (mut t, _rx) = tracker();
        let last = t.finish(&ExitInfo { code: None, aborted: false }, "");
        assert!(matches!(last, Some(StreamChunk::Error { error }) if error.contains("signal")));
        assert_eq!(t.session().status(), SessionStatus::Interrupted);
    }

    #[test]
    fn tool_result_closes_matching_tool_only() {
        let (mut t, mut rx) = tracker();
        t.observe(tool("a"));
        t.observe(ParsedItem::ToolResult {
            id: "other".to_string(),
        });
        assert!(!kinds(&mut rx).contains(&"tool_completed"));
        t.observe(ParsedItem::ToolResult { id: "a".to_string() });
        assert_eq!(kinds(&mut rx), vec!["tool_completed"]);
    }

    #[test]
    fn diagnostic_truncates_long_stderr() {
        let stderr = "x".repeat(2000);
        let diagnostic = build_diagnostic(Some(1), &stderr, None, Some("partial answer"));
        assert!(diagnostic.starts_with("exit code 1; stderr: ..."));
        assert!(diagnostic.contains("last result: partial answer"));
        assert!(diagnostic.len() < 1000);
    }

    #[tokio::test]
    async fn concurrent_readers_share_one_queue() {
        let (tx, rx) = mpsc::channel(4);
        let stream = ChunkStream::new("s".to_string(), rx, Arc::new(Mutex::new(None)));
        let a = stream.clone();
        let b = stream.clone();

        let producer = tokio::spawn(async move {
            for i in 0..20 {
                tx.send(StreamChunk::TextDelta {
                    content: i.to_string(),
                })
                .await
                .unwrap();
            }
        });

        let drain = |s: ChunkStream| async move {
            let mut n = 0;
            while s.next().await.is_some() {
                n += 1;
            }
            n
        };
        let (na, nb) = tokio::join!(drain(a), drain(b));
        producer.await.unwrap();
        assert_eq!(na + nb, 20);
    }
}
