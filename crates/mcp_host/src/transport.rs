//! Child process ownership and stdio plumbing for one MCP server.
//!
//! The transport spawns the configured command with piped stdio and runs three
//! helper tasks: a writer draining an envelope channel into the child's stdin,
//! a reader decoding stdout lines into an envelope channel, and a drain
//! logging stderr line-by-line under the server id. stderr is never merged
//! into stdout. At any instant exactly one task reads stdout and exactly one
//! task writes stdin.

use std::{
    io,
    process::Stdio,
    sync::{Mutex, MutexGuard, PoisonError},
    time::Duration,
};

use tokio::{
    io::{AsyncBufReadExt, AsyncWriteExt, BufReader},
    process::{Child, ChildStderr, ChildStdin, Command},
    sync::mpsc,
    task::JoinHandle,
    time,
};
use tracing::{debug, warn};

use crate::{
    codec::{write_envelope, EnvelopeReader, ReadCycle},
    config::ServerConfig,
    error::HostError,
    protocol::Envelope,
};

/// Bound on joining helper tasks during shutdown.
const TASK_JOIN_GRACE: Duration = Duration::from_secs(3);
/// Wait after a kill signal before abandoning the child.
const KILL_GRACE: Duration = Duration::from_secs(3);

pub(crate) struct StdioTransport {
    server_id: String,
    inner: Mutex<TransportInner>,
}

struct TransportInner {
    outbound: Option<mpsc::UnboundedSender<Envelope>>,
    child: Option<Child>,
    tasks: Vec<JoinHandle<()>>,
}

impl StdioTransport {
    /// Spawns the child and returns the transport together with the inbound
    /// envelope stream read off its stdout.
    pub(crate) fn spawn(
        server_id: &str,
        config: &ServerConfig,
    ) -> Result<(Self, mpsc::UnboundedReceiver<Envelope>), HostError> {
        let mut command = Command::new(&config.command);
        command
            .args(&config.args)
            .envs(&config.env)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);

        let mut child = spawn_with_retry(&mut command, server_id, &config.command)?;

        let stdin = child
            .stdin
            .take()
            .ok_or_else(|| pipe_error(server_id, &config.command, "stdin"))?;
        let stdout = child
            .stdout
            .take()
            .ok_or_else(|| pipe_error(server_id, &config.command, "stdout"))?;
        let stderr = child
            .stderr
            .take()
            .ok_or_else(|| pipe_error(server_id, &config.command, "stderr"))?;

        let (outbound_tx, outbound_rx) = mpsc::unbounded_channel();
        let (inbound_tx, inbound_rx) = mpsc::unbounded_channel();

        let writer = tokio::spawn(writer_task(stdin, outbound_rx));
        let reader = tokio::spawn(reader_task(
            EnvelopeReader::new(server_id, stdout),
            inbound_tx,
        ));
        let stderr_drain = tokio::spawn(stderr_task(server_id.to_string(), stderr));

        let transport = Self {
            server_id: server_id.to_string(),
            inner: Mutex::new(TransportInner {
                outbound: Some(outbound_tx),
                child: Some(child),
                tasks: vec![writer, reader, stderr_drain],
            }),
        };
        Ok((transport, inbound_rx))
    }

    /// Queues one envelope for the writer task.
    pub(crate) fn send(&self, envelope: Envelope) -> Result<(), HostError> {
        let sender = self.lock().outbound.clone();
        match sender {
            Some(sender) if sender.send(envelope).is_ok() => Ok(()),
            _ => Err(HostError::ConnectionClosed {
                server: self.server_id.clone(),
            }),
        }
    }

    /// True while the child has not exited.
    pub(crate) fn is_alive(&self) -> bool {
        let mut guard = self.lock();
        match guard.child.as_mut() {
            Some(child) => matches!(child.try_wait(), Ok(None)),
            None => false,
        }
    }

    /// Closes stdin, waits up to `grace` for a voluntary exit, then kills the
    /// child and waits a secondary grace. Helper tasks are interrupted and
    /// joined with a bounded wait.
    pub(crate) async fn stop(&self, grace: Duration) {
        let (outbound, child, tasks) = {
            let mut guard = self.lock();
            (
                guard.outbound.take(),
                guard.child.take(),
                std::mem::take(&mut guard.tasks),
            )
        };

        // Dropping the sender ends the writer task, which closes stdin.
        drop(outbound);

        if let Some(mut child) = child {
            match time::timeout(grace, child.wait()).await {
                Ok(Ok(status)) => {
                    debug!(server = %self.server_id, ?status, "server exited")
                }
                Ok(Err(source)) => {
                    warn!(server = %self.server_id, %source, "failed waiting for server exit")
                }
                Err(_) => {
                    warn!(server = %self.server_id, "server ignored stdin close; killing");
                    let _ = child.start_kill();
                    if time::timeout(KILL_GRACE, child.wait()).await.is_err() {
                        warn!(server = %self.server_id, "server survived the kill grace");
                    }
                }
            }
        }

        for task in tasks {
            task.abort();
            if time::timeout(TASK_JOIN_GRACE, task).await.is_err() {
                warn!(server = %self.server_id, "helper task did not stop within grace");
            }
        }
    }

    fn lock(&self) -> MutexGuard<'_, TransportInner> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

impl Drop for StdioTransport {
    fn drop(&mut self) {
        let mut guard = self.lock();
        for task in &guard.tasks {
            task.abort();
        }
        if let Some(mut child) = guard.child.take() {
            let _ = child.start_kill();
        }
    }
}

fn spawn_with_retry(
    command: &mut Command,
    server_id: &str,
    binary: &str,
) -> Result<Child, HostError> {
    let mut backoff = Duration::from_millis(2);
    for attempt in 0..5 {
        match command.spawn() {
            Ok(child) => return Ok(child),
            Err(source) => {
                let is_busy = matches!(source.kind(), io::ErrorKind::ExecutableFileBusy)
                    || source.raw_os_error() == Some(26);
                if is_busy && attempt < 4 {
                    std::thread::sleep(backoff);
                    backoff = std::cmp::min(backoff * 2, Duration::from_millis(50));
                    continue;
                }
                return Err(HostError::TransportStart {
                    server: server_id.to_string(),
                    command: binary.to_string(),
                    source,
                });
            }
        }
    }

    unreachable!("spawn loop returns before exhausting retries")
}

fn pipe_error(server_id: &str, command: &str, pipe: &str) -> HostError {
    HostError::TransportStart {
        server: server_id.to_string(),
        command: command.to_string(),
        source: io::Error::other(format!("child {pipe} unavailable")),
    }
}

async fn writer_task(mut stdin: ChildStdin, mut outbound: mpsc::UnboundedReceiver<Envelope>) {
    while let Some(envelope) = outbound.recv().await {
        if write_envelope(&mut stdin, &envelope).await.is_err() {
            break;
        }
    }
    let _ = stdin.shutdown().await;
}

async fn reader_task<R>(mut reader: EnvelopeReader<R>, inbound: mpsc::UnboundedSender<Envelope>)
where
    R: tokio::io::AsyncRead + Unpin,
{
    loop {
        match reader.next_cycle().await {
            Ok(ReadCycle::Envelope(envelope)) => {
                if inbound.send(envelope).is_err() {
                    break;
                }
            }
            Ok(ReadCycle::Idle) => continue,
            Ok(ReadCycle::Eof) | Err(_) => break,
        }
    }
}

async fn stderr_task(server_id: String, stderr: ChildStderr) {
    let mut lines = BufReader::new(stderr).lines();
    while let Ok(Some(line)) = lines.next_line().await {
        debug!(server = %server_id, "stderr: {line}");
    }
}
