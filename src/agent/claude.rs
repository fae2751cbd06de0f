//! Child process adapter for the Claude CLI.
//!
//! One [`ClaudeAgent`] wraps one long-lived `claude` process speaking the
//! stream-json stdio dialect. The process is started lazily on the first
//! message. [`ClaudeAgent::send_message`] returns the event stream for
//! exactly one user turn; the stream ends with a terminal event.
//!
//! Prompt serialisation: the child's protocol assumes at most one
//! permission/question round-trip in flight, so the turn reader blocks on the
//! pending-response queue after emitting a prompt event and only resumes
//! reading stdout once the reply has been written to stdin (or the per-prompt
//! deadline passes).

use std::process::Stdio;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use serde_json::json;
use tokio::io::{AsyncBufRead, AsyncBufReadExt, AsyncReadExt, AsyncWriteExt, BufReader};
use tokio::process::{Child, ChildStdin, ChildStdout, Command};
use tokio::sync::{mpsc, Mutex};
use tracing::{debug, info, warn};

use super::{parse_child_line, AgentEvent};

/// Hard cap on one stdout line from the child (10 MiB).
const MAX_LINE_BYTES: u64 = 10 * 1024 * 1024;

/// Event channel depth per turn. A slow consumer blocks the reader, which is
/// acceptable: the single consumer is the chat pump.
const EVENT_QUEUE: usize = 100;

/// Depth of the pending permission/question response queue.
const RESPONSE_QUEUE: usize = 10;

/// How long the turn reader waits for a user reply to a prompt before giving
/// up and continuing the stream.
const RESPONSE_TIMEOUT: Duration = Duration::from_secs(5 * 60);

/// Errors surfaced from agent operations.
#[derive(Debug)]
pub enum AgentError {
    /// The `claude` binary could not be started.
    Spawn(std::io::Error),
    /// A stdio pipe was unavailable after spawn.
    MissingPipe(&'static str),
    /// Writing a frame to the child's stdin failed.
    Stdin(std::io::Error),
    /// The response queue to the turn reader is gone.
    Closed,
}

impl std::fmt::Display for AgentError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            AgentError::Spawn(e) => write!(f, "Failed to start assistant process: {e}"),
            AgentError::MissingPipe(p) => write!(f, "Assistant process has no {p} pipe"),
            AgentError::Stdin(e) => write!(f, "Failed to write to assistant stdin: {e}"),
            AgentError::Closed => write!(f, "Assistant response queue is closed"),
        }
    }
}

impl std::error::Error for AgentError {}

/// A user reply to a blocking prompt, queued in arrival order.
#[derive(Debug)]
enum PendingResponse {
    Permission { permission_id: String, allowed: bool },
    Question { question_id: String, answer: String },
}

struct AgentProcess {
    child: Child,
    stdin: Arc<Mutex<ChildStdin>>,
    stdout: Arc<Mutex<BufReader<ChildStdout>>>,
}

/// One assistant child process bound to a session.
pub struct ClaudeAgent {
    session_id: String,
    work_dir: String,
    process: Mutex<Option<AgentProcess>>,
    running: Arc<AtomicBool>,
    pending_tx: mpsc::Sender<PendingResponse>,
    pending_rx: Arc<Mutex<mpsc::Receiver<PendingResponse>>>,
}

impl ClaudeAgent {
    pub fn new(session_id: &str, work_dir: &str) -> Self {
        let (pending_tx, pending_rx) = mpsc::channel(RESPONSE_QUEUE);
        Self {
            session_id: session_id.to_string(),
            work_dir: work_dir.to_string(),
            process: Mutex::new(None),
            running: Arc::new(AtomicBool::new(false)),
            pending_tx,
            pending_rx: Arc::new(Mutex::new(pending_rx)),
        }
    }

    /// Spawn the child if it isn't running yet.
    async fn ensure_started(&self) -> Result<(), AgentError> {
        let mut guard = self.process.lock().await;
        if guard.is_some() {
            return Ok(());
        }

        let mut child = Command::new("claude")
            .arg("--output-format")
            .arg("stream-json")
            .arg("--input-format")
            .arg("stream-json")
            .arg("--permission-prompt-tool")
            .arg("stdio")
            .arg("--session-id")
            .arg(&self.session_id)
            .current_dir(&self.work_dir)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .map_err(AgentError::Spawn)?;

        let stdin = child.stdin.take().ok_or(AgentError::MissingPipe("stdin"))?;
        let stdout = child
            .stdout
            .take()
            .ok_or(AgentError::MissingPipe("stdout"))?;
        let stderr = child
            .stderr
            .take()
            .ok_or(AgentError::MissingPipe("stderr"))?;

        // Drain stderr into the log for the child's lifetime.
        let session_id = self.session_id.clone();
        tokio::spawn(async move {
            let mut lines = BufReader::new(stderr).lines();
            while let Ok(Some(line)) = lines.next_line().await {
                debug!(session_id = %session_id, "assistant stderr: {line}");
            }
        });

        info!(session_id = %self.session_id, "Assistant process started");
        *guard = Some(AgentProcess {
            child,
            stdin: Arc::new(Mutex::new(stdin)),
            stdout: Arc::new(Mutex::new(BufReader::new(stdout))),
        });
        Ok(())
    }

    async fn write_frame(
        stdin: &Arc<Mutex<ChildStdin>>,
        frame: &serde_json::Value,
    ) -> Result<(), AgentError> {
        let mut line = frame.to_string();
        line.push('\n');
        let mut stdin = stdin.lock().await;
        stdin
            .write_all(line.as_bytes())
            .await
            .map_err(AgentError::Stdin)?;
        stdin.flush().await.map_err(AgentError::Stdin)
    }

    /// Send a user message and stream the events of the resulting turn.
    ///
    /// The returned receiver yields events in child order and closes after
    /// the terminal event.
    pub async fn send_message(
        &self,
        content: &str,
    ) -> Result<mpsc::Receiver<AgentEvent>, AgentError> {
        self.ensure_started().await?;
        let (stdin, stdout) = {
            let guard = self.process.lock().await;
            // ensure_started just populated this.
            let proc = guard.as_ref().ok_or(AgentError::Closed)?;
            (proc.stdin.clone(), proc.stdout.clone())
        };

        Self::write_frame(&stdin, &json!({"type": "user_message", "content": content})).await?;
        self.running.store(true, Ordering::SeqCst);

        let (events_tx, events_rx) = mpsc::channel(EVENT_QUEUE);
        let pending_rx = self.pending_rx.clone();
        let running = self.running.clone();
        let session_id = self.session_id.clone();
        tokio::spawn(async move {
            run_turn(&session_id, stdout, stdin, pending_rx, events_tx).await;
            running.store(false, Ordering::SeqCst);
        });

        Ok(events_rx)
    }

    /// Ask the child to abort the current turn. Goes straight to stdin so an
    /// outstanding prompt round-trip can't delay it; the child answers with a
    /// terminal event on stdout.
    pub async fn interrupt(&self) -> Result<(), AgentError> {
        let guard = self.process.lock().await;
        let Some(proc) = guard.as_ref() else {
            return Ok(());
        };
        Self::write_frame(&proc.stdin, &json!({"type": "interrupt"})).await
    }

    /// Queue a reply to a pending permission request.
    pub async fn respond_to_permission(
        &self,
        permission_id: &str,
        allowed: bool,
    ) -> Result<(), AgentError> {
        self.pending_tx
            .send(PendingResponse::Permission {
                permission_id: permission_id.to_string(),
                allowed,
            })
            .await
            .map_err(|_| AgentError::Closed)
    }

    /// Queue a reply to a pending user question.
    pub async fn respond_to_question(
        &self,
        question_id: &str,
        answer: &str,
    ) -> Result<(), AgentError> {
        self.pending_tx
            .send(PendingResponse::Question {
                question_id: question_id.to_string(),
                answer: answer.to_string(),
            })
            .await
            .map_err(|_| AgentError::Closed)
    }

    /// True between `send_message` and the turn's terminal event.
    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }

    /// OS pid of the child, if it has been started.
    pub async fn pid(&self) -> Option<u32> {
        self.process.lock().await.as_ref().and_then(|p| p.child.id())
    }

    /// Kill the child. Safe to call repeatedly.
    pub async fn close(&self) {
        self.running.store(false, Ordering::SeqCst);
        if let Some(mut proc) = self.process.lock().await.take() {
            if proc.child.start_kill().is_ok() {
                // Reap off-path so close() doesn't wait on process exit.
                tokio::spawn(async move {
                    let _ = proc.child.wait().await;
                });
            }
            info!(session_id = %self.session_id, "Assistant process closed");
        }
    }
}

/// Outcome of one capped line read.
enum LineRead {
    Line(String),
    Eof,
    TooLong,
}

/// Read one newline-terminated line, refusing lines over `cap` bytes.
///
/// On `TooLong` the remainder of the line is left unread; callers must treat
/// the stream as poisoned and end the turn.
async fn read_line_capped(
    reader: &mut (impl AsyncBufRead + Unpin),
    cap: u64,
) -> std::io::Result<LineRead> {
    let mut buf = Vec::new();
    let n = reader.take(cap + 1).read_until(b'\n', &mut buf).await?;
    if n == 0 {
        return Ok(LineRead::Eof);
    }
    if buf.last() == Some(&b'\n') {
        buf.pop();
        if buf.last() == Some(&b'\r') {
            buf.pop();
        }
    } else if buf.len() as u64 > cap {
        return Ok(LineRead::TooLong);
    }
    Ok(LineRead::Line(String::from_utf8_lossy(&buf).into_owned()))
}

/// Read the child's stdout for one turn, forwarding events until a terminal
/// event, EOF, or a read failure.
async fn run_turn(
    session_id: &str,
    stdout: Arc<Mutex<BufReader<ChildStdout>>>,
    stdin: Arc<Mutex<ChildStdin>>,
    pending_rx: Arc<Mutex<mpsc::Receiver<PendingResponse>>>,
    events: mpsc::Sender<AgentEvent>,
) {
    // Holding the reader for the whole turn also guarantees turns can't
    // interleave on stdout.
    let mut reader = stdout.lock().await;
    loop {
        let line = match read_line_capped(&mut *reader, MAX_LINE_BYTES).await {
            Ok(LineRead::Line(line)) => line,
            Ok(LineRead::Eof) => {
                let _ = events
                    .send(AgentEvent::Error {
                        message: "assistant process closed its output".to_string(),
                    })
                    .await;
                return;
            }
            Ok(LineRead::TooLong) => {
                warn!(session_id = %session_id, "Assistant emitted a line over the 10 MiB cap");
                let _ = events
                    .send(AgentEvent::Error {
                        message: "assistant output line too long".to_string(),
                    })
                    .await;
                return;
            }
            Err(e) => {
                let _ = events
                    .send(AgentEvent::Error {
                        message: format!("failed to read assistant output: {e}"),
                    })
                    .await;
                return;
            }
        };
        if line.is_empty() {
            continue;
        }

        for event in parse_child_line(&line) {
            let terminal = event.is_terminal();
            let needs_response = event.needs_response();
            if events.send(event).await.is_err() {
                return; // consumer gone
            }
            if needs_response {
                forward_prompt_response(session_id, &stdin, &pending_rx).await;
            }
            if terminal {
                return;
            }
        }
    }
}

/// Block until the user's reply to the outstanding prompt arrives, then write
/// it to the child. On deadline the stream simply continues; the child may
/// emit its own error for the unanswered prompt.
async fn forward_prompt_response(
    session_id: &str,
    stdin: &Arc<Mutex<ChildStdin>>,
    pending_rx: &Arc<Mutex<mpsc::Receiver<PendingResponse>>>,
) {
    let mut rx = pending_rx.lock().await;
    match tokio::time::timeout(RESPONSE_TIMEOUT, rx.recv()).await {
        Ok(Some(response)) => {
            let frame = match response {
                PendingResponse::Permission {
                    permission_id,
                    allowed,
                } => json!({
                    "type": "permission_response",
                    "permission_id": permission_id,
                    "allowed": allowed,
                }),
                PendingResponse::Question {
                    question_id,
                    answer,
                } => json!({
                    "type": "question_response",
                    "question_id": question_id,
                    "answer": answer,
                }),
            };
            if let Err(e) = ClaudeAgent::write_frame(stdin, &frame).await {
                warn!(session_id = %session_id, "Failed to forward prompt response: {e}");
            }
        }
        Ok(None) => {}
        Err(_) => {
            warn!(session_id = %session_id, "Timed out waiting for prompt response");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Cursor;

    #[tokio::test]
    async fn read_line_capped_reads_lines_and_eof() {
        let mut reader = BufReader::new(Cursor::new(b"one\ntwo\r\nthree".to_vec()));
        assert!(matches!(
            read_line_capped(&mut reader, 64).await.unwrap(),
            LineRead::Line(l) if l == "one"
        ));
        assert!(matches!(
            read_line_capped(&mut reader, 64).await.unwrap(),
            LineRead::Line(l) if l == "two"
        ));
        // Final line without trailing newline is still a line.
        assert!(matches!(
            read_line_capped(&mut reader, 64).await.unwrap(),
            LineRead::Line(l) if l == "three"
        ));
        assert!(matches!(
            read_line_capped(&mut reader, 64).await.unwrap(),
            LineRead::Eof
        ));
    }

    #[tokio::test]
    async fn read_line_capped_refuses_oversized_lines() {
        let long = vec![b'x'; 100];
        let mut reader = BufReader::new(Cursor::new(long));
        assert!(matches!(
            read_line_capped(&mut reader, 10).await.unwrap(),
            LineRead::TooLong
        ));
    }

    #[tokio::test]
    async fn responses_queue_in_order() {
        let agent = ClaudeAgent::new("s1", ".");
        agent.respond_to_permission("p1", true).await.unwrap();
        agent.respond_to_question("q1", "yes").await.unwrap();

        let mut rx = agent.pending_rx.lock().await;
        assert!(matches!(
            rx.try_recv().unwrap(),
            PendingResponse::Permission { permission_id, allowed: true } if permission_id == "p1"
        ));
        assert!(matches!(
            rx.try_recv().unwrap(),
            PendingResponse::Question { question_id, .. } if question_id == "q1"
        ));
    }

    #[test]
    fn agent_starts_not_running() {
        let agent = ClaudeAgent::new("s1", ".");
        assert!(!agent.is_running());
    }
}
