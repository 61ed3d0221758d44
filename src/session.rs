use crate::errors::RunnerError;
use async_trait::async_trait;
use bollard::container::{AttachContainerOptions, AttachContainerResults, LogOutput};
use bollard::Docker;
use futures_util::{Stream, StreamExt};
use std::collections::HashSet;
use std::pin::Pin;
use std::time::Duration;
use tokio::io::AsyncWriteExt;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

/// The write half of the attached stream: raw bytes in, no framing.
#[async_trait]
pub trait AttachWriter: Send {
    async fn write_all(&mut self, data: &[u8]) -> Result<(), RunnerError>;
}

/// The read half of the attached stream. A `None` chunk signals a clean
/// stream close; an `Err` signals an I/O failure.
#[async_trait]
pub trait AttachReader: Send {
    async fn next_chunk(&mut self) -> Result<Option<Vec<u8>>, RunnerError>;
}

pub struct BollardWriter {
    inner: Pin<Box<dyn tokio::io::AsyncWrite + Send>>,
}

#[async_trait]
impl AttachWriter for BollardWriter {
    async fn write_all(&mut self, data: &[u8]) -> Result<(), RunnerError> {
        self.inner
            .write_all(data)
            .await
            .map_err(|e| RunnerError::Session(format!("write failed: {}", e)))
    }
}

pub struct BollardReader {
    inner: Pin<Box<dyn Stream<Item = Result<LogOutput, bollard::errors::Error>> + Send>>,
}

#[async_trait]
impl AttachReader for BollardReader {
    async fn next_chunk(&mut self) -> Result<Option<Vec<u8>>, RunnerError> {
        loop {
            match self.inner.next().await {
                None => return Ok(None),
                Some(Err(e)) => {
                    return Err(RunnerError::Session(format!("read failed: {}", e)))
                }
                Some(Ok(LogOutput::StdOut { message })) | Some(Ok(LogOutput::StdErr { message })) => {
                    return Ok(Some(message.to_vec()))
                }
                // stdin echo / console frames carry nothing we care about.
                Some(Ok(_)) => continue,
            }
        }
    }
}

/// Opens an attach socket configured for stdin+stdout+stderr+streaming,
/// per §4.5.
pub async fn attach(
    docker: &Docker,
    container_id: &str,
) -> Result<(BollardReader, BollardWriter), RunnerError> {
    let AttachContainerResults { output, input } = docker
        .attach_container(
            container_id,
            Some(AttachContainerOptions::<String> {
                stdin: Some(true),
                stdout: Some(true),
                stderr: Some(true),
                stream: Some(true),
                logs: Some(false),
                ..Default::default()
            }),
        )
        .await
        .map_err(|e| RunnerError::Session(format!("failed to attach: {}", e)))?;

    Ok((BollardReader { inner: output }, BollardWriter { inner: input }))
}

/// Outcome of a single checked-send.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ExitOutcome {
    Code(i32),
    Cancelled,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CheckedResult {
    pub exit: ExitOutcome,
    pub captured: Vec<String>,
}

enum LineEvent {
    Line(String),
    Error(String),
}

/// Turns a raw, interleaved bidirectional byte stream into a reliable
/// sequence of checked commands with recovered exit codes (§4.5). One
/// reader task runs concurrently with the owner of this struct; sends are
/// serialized by the caller.
pub struct Session {
    writer: Box<dyn AttachWriter>,
    rx: mpsc::Receiver<LineEvent>,
    reader_task: JoinHandle<()>,
    history: Vec<String>,
    sentinels_seen: HashSet<String>,
    poisoned: bool,
    no_response_timeout: Duration,
    command_timeout: Duration,
}

/// Queue depth between the reader task and the consumer; bounds how far
/// the reader can run ahead of a slow consumer (backpressure per §5).
const LINE_QUEUE_CAPACITY: usize = 256;

impl Session {
    pub fn attach_with(
        reader: impl AttachReader + 'static,
        writer: impl AttachWriter + 'static,
        no_response_timeout: Duration,
        command_timeout: Duration,
    ) -> Session {
        let (tx, rx) = mpsc::channel(LINE_QUEUE_CAPACITY);
        let reader_task = tokio::spawn(reader_loop(reader, tx));
        Session {
            writer: Box::new(writer),
            rx,
            reader_task,
            history: Vec::new(),
            sentinels_seen: HashSet::new(),
            poisoned: false,
            no_response_timeout,
            command_timeout,
        }
    }

    /// Writes the given commands to the socket, each followed by `\n`, in
    /// order, and records them in the send history.
    pub async fn send(&mut self, commands: &[String]) -> Result<(), RunnerError> {
        for cmd in commands {
            self.history.push(cmd.clone());
            let line = format!("{}\n", cmd);
            self.writer.write_all(line.as_bytes()).await?;
        }
        Ok(())
    }

    /// The core protocol (§4.5): transmit the commands, then a sentinel
    /// echo, then drain the line queue until the sentinel line is seen.
    pub async fn send_checked(&mut self, commands: &[String]) -> Result<CheckedResult, RunnerError> {
        if self.poisoned {
            return Ok(CheckedResult {
                exit: ExitOutcome::Cancelled,
                captured: Vec::new(),
            });
        }

        let token = self.fresh_sentinel();
        self.send(commands).await?;
        self.send(&[format!("echo {} $?", token)]).await?;

        let command_timeout = self.command_timeout;
        match tokio::time::timeout(command_timeout, self.drain_until_sentinel(&token)).await {
            Ok(Ok(result)) => Ok(result),
            Ok(Err(e)) => {
                self.poisoned = true;
                Err(e)
            }
            Err(_) => {
                self.poisoned = true;
                Err(RunnerError::Timeout(token))
            }
        }
    }

    async fn drain_until_sentinel(&mut self, token: &str) -> Result<CheckedResult, RunnerError> {
        let mut captured = Vec::new();
        loop {
            let next = tokio::time::timeout(self.no_response_timeout, self.rx.recv()).await;
            match next {
                Err(_) => return Err(RunnerError::Timeout(token.to_string())),
                Ok(None) => {
                    return Ok(CheckedResult {
                        exit: ExitOutcome::Cancelled,
                        captured,
                    })
                }
                Ok(Some(LineEvent::Error(e))) => return Err(RunnerError::Session(e)),
                Ok(Some(LineEvent::Line(line))) => {
                    let trimmed = line.trim_end();
                    if trimmed.is_empty() {
                        continue;
                    }
                    // Compared as a whole first token, not a substring
                    // match, so adversarial step output containing the
                    // token as a prefix of a longer word is never
                    // mistaken for the delimiter.
                    let mut parts = trimmed.splitn(2, ' ');
                    let first = parts.next().unwrap_or("");
                    if first == token {
                        let rest = parts.next().unwrap_or("").trim();
                        let code = rest
                            .parse::<i32>()
                            .map_err(|_| RunnerError::Protocol(trimmed.to_string()))?;
                        return Ok(CheckedResult {
                            exit: ExitOutcome::Code(code),
                            captured,
                        });
                    }
                    captured.push(trimmed.to_string());
                }
            }
        }
    }

    fn fresh_sentinel(&mut self) -> String {
        loop {
            let candidate = uuid::Uuid::new_v4().simple().to_string();
            if self.sentinels_seen.insert(candidate.clone()) {
                return candidate;
            }
        }
    }

    /// Cancels the reader and marks the session poisoned; any in-flight or
    /// subsequent `send_checked` returns `Cancelled`.
    pub fn close(&mut self) {
        self.reader_task.abort();
        self.poisoned = true;
    }

    #[cfg(test)]
    pub fn history(&self) -> &[String] {
        &self.history
    }
}

async fn reader_loop(mut reader: impl AttachReader, tx: mpsc::Sender<LineEvent>) {
    let mut buf = String::new();
    loop {
        match reader.next_chunk().await {
            Ok(Some(chunk)) => {
                buf.push_str(&String::from_utf8_lossy(&chunk));
                while let Some(pos) = buf.find('\n') {
                    let line = buf[..pos].to_string();
                    buf = buf[pos + 1..].to_string();
                    if tx.send(LineEvent::Line(line)).await.is_err() {
                        return;
                    }
                }
            }
            Ok(None) => return,
            Err(e) => {
                let _ = tx.send(LineEvent::Error(e.to_string())).await;
                return;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::sync::mpsc::{unbounded_channel, UnboundedReceiver, UnboundedSender};

    struct MockWriter {
        sent: UnboundedSender<String>,
    }

    #[async_trait]
    impl AttachWriter for MockWriter {
        async fn write_all(&mut self, data: &[u8]) -> Result<(), RunnerError> {
            let _ = self.sent.send(String::from_utf8_lossy(data).to_string());
            Ok(())
        }
    }

    struct MockReader {
        chunks: mpsc::UnboundedReceiver<Vec<u8>>,
    }

    #[async_trait]
    impl AttachReader for MockReader {
        async fn next_chunk(&mut self) -> Result<Option<Vec<u8>>, RunnerError> {
            Ok(self.chunks.recv().await)
        }
    }

    /// Wires a `Session` up to a mock pair: `sent_rx` observes every raw
    /// line written to the socket, `chunks_tx` lets the test play the
    /// part of the container's shell by feeding bytes back in.
    fn mock_session(
        no_response_timeout: Duration,
        command_timeout: Duration,
    ) -> (Session, UnboundedReceiver<String>, mpsc::UnboundedSender<Vec<u8>>) {
        let (sent_tx, sent_rx) = unbounded_channel();
        let (chunks_tx, chunks_rx) = mpsc::unbounded_channel();
        let writer = MockWriter { sent: sent_tx };
        let reader = MockReader { chunks: chunks_rx };
        let session = Session::attach_with(reader, writer, no_response_timeout, command_timeout);
        (session, sent_rx, chunks_tx)
    }

    /// Extracts the token from a sent `echo <token> $?` line.
    fn extract_token(sent: &str) -> String {
        sent.trim()
            .strip_prefix("echo ")
            .unwrap()
            .strip_suffix(" $?")
            .unwrap()
            .to_string()
    }

    #[tokio::test]
    async fn send_checked_recovers_exit_code_and_output() {
        let (mut session, mut sent_rx, chunks_tx) = mock_session(
            Duration::from_secs(2),
            Duration::from_secs(2),
        );

        let handle = tokio::spawn(async move {
            session
                .send_checked(&["echo hi".to_string()])
                .await
                .map(|r| (r, session))
        });

        // Drain the two sent lines: the command, then the sentinel echo.
        let _cmd_line = sent_rx.recv().await.unwrap();
        let sentinel_line = sent_rx.recv().await.unwrap();
        let token = extract_token(&sentinel_line);

        chunks_tx.send(b"hi\n".to_vec()).unwrap();
        chunks_tx
            .send(format!("{} 0\n", token).into_bytes())
            .unwrap();

        let (result, _session) = handle.await.unwrap().unwrap();
        assert_eq!(result.exit, ExitOutcome::Code(0));
        assert_eq!(result.captured, vec!["hi".to_string()]);
    }

    #[tokio::test]
    async fn nonzero_exit_code_is_recovered() {
        let (mut session, mut sent_rx, chunks_tx) = mock_session(
            Duration::from_secs(2),
            Duration::from_secs(2),
        );

        let handle = tokio::spawn(async move {
            session
                .send_checked(&["exit 7".to_string()])
                .await
                .unwrap()
        });

        let _cmd_line = sent_rx.recv().await.unwrap();
        let sentinel_line = sent_rx.recv().await.unwrap();
        let token = extract_token(&sentinel_line);
        chunks_tx
            .send(format!("{} 7\n", token).into_bytes())
            .unwrap();

        let result = handle.await.unwrap();
        assert_eq!(result.exit, ExitOutcome::Code(7));
    }

    #[tokio::test]
    async fn sentinel_lookalike_in_step_output_is_captured_not_matched() {
        let (mut session, mut sent_rx, chunks_tx) = mock_session(
            Duration::from_secs(2),
            Duration::from_secs(2),
        );

        let handle = tokio::spawn(async move {
            session
                .send_checked(&["echo deadbeefdeadbeefdeadbeefdeadbeef leftover"
                    .to_string()])
                .await
                .unwrap()
        });

        let _cmd_line = sent_rx.recv().await.unwrap();
        let sentinel_line = sent_rx.recv().await.unwrap();
        let token = extract_token(&sentinel_line);

        // A line that merely starts with a 32-hex-char string, but is not
        // followed by a space and then only the real token, must not be
        // mistaken for the delimiter.
        chunks_tx
            .send(b"deadbeefdeadbeefdeadbeefdeadbeef leftover\n".to_vec())
            .unwrap();
        chunks_tx
            .send(format!("{} 0\n", token).into_bytes())
            .unwrap();

        let result = handle.await.unwrap();
        assert_eq!(result.exit, ExitOutcome::Code(0));
        assert_eq!(
            result.captured,
            vec!["deadbeefdeadbeefdeadbeefdeadbeef leftover".to_string()]
        );
    }

    #[tokio::test]
    async fn empty_lines_are_skipped_from_capture() {
        let (mut session, mut sent_rx, chunks_tx) = mock_session(
            Duration::from_secs(2),
            Duration::from_secs(2),
        );

        let handle = tokio::spawn(async move {
            session.send_checked(&["true".to_string()]).await.unwrap()
        });

        let _cmd_line = sent_rx.recv().await.unwrap();
        let sentinel_line = sent_rx.recv().await.unwrap();
        let token = extract_token(&sentinel_line);

        chunks_tx.send(b"\n".to_vec()).unwrap();
        chunks_tx.send(b"  \n".to_vec()).unwrap();
        chunks_tx
            .send(format!("{} 0\n", token).into_bytes())
            .unwrap();

        let result = handle.await.unwrap();
        assert!(result.captured.is_empty());
    }

    #[tokio::test]
    async fn two_consecutive_checked_sends_partition_output_correctly() {
        let (mut session, mut sent_rx, chunks_tx) = mock_session(
            Duration::from_secs(2),
            Duration::from_secs(2),
        );

        let (mut session, first) = {
            let handle = tokio::spawn(async move {
                let r = session.send_checked(&["echo a".to_string()]).await.unwrap();
                (session, r)
            });
            let _cmd = sent_rx.recv().await.unwrap();
            let sentinel_line = sent_rx.recv().await.unwrap();
            let token = extract_token(&sentinel_line);
            chunks_tx.send(b"a\n".to_vec()).unwrap();
            chunks_tx
                .send(format!("{} 0\n", token).into_bytes())
                .unwrap();
            handle.await.unwrap()
        };
        assert_eq!(first.captured, vec!["a".to_string()]);

        let handle = tokio::spawn(async move {
            session.send_checked(&["echo b".to_string()]).await.unwrap()
        });
        let _cmd = sent_rx.recv().await.unwrap();
        let sentinel_line = sent_rx.recv().await.unwrap();
        let token = extract_token(&sentinel_line);
        chunks_tx.send(b"b\n".to_vec()).unwrap();
        chunks_tx
            .send(format!("{} 0\n", token).into_bytes())
            .unwrap();

        let second = handle.await.unwrap();
        assert_eq!(second.captured, vec!["b".to_string()]);
    }

    #[tokio::test]
    async fn command_timeout_poisons_the_session() {
        let (mut session, mut sent_rx, _chunks_tx) = mock_session(
            Duration::from_millis(50),
            Duration::from_millis(50),
        );

        let result = session.send_checked(&["sleep 999".to_string()]).await;
        assert!(matches!(result, Err(RunnerError::Timeout(_))));
        let _ = sent_rx.recv().await;

        // Subsequent sends on a poisoned session short-circuit to Cancelled.
        let second = session.send_checked(&["echo x".to_string()]).await.unwrap();
        assert_eq!(second.exit, ExitOutcome::Cancelled);
    }

    #[tokio::test]
    async fn close_causes_in_flight_send_checked_to_cancel() {
        let (mut session, _sent_rx, chunks_tx) = mock_session(
            Duration::from_secs(5),
            Duration::from_secs(5),
        );
        session.close();
        drop(chunks_tx);

        let result = session.send_checked(&["echo x".to_string()]).await.unwrap();
        assert_eq!(result.exit, ExitOutcome::Cancelled);
    }
}
