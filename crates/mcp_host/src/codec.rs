//! Newline-delimited JSON framing over a child's stdio.
//!
//! Writing is one compact JSON object per `\n`-terminated line, flushed per
//! message. Reading tolerates the reality that child processes occasionally
//! leak banner or log text onto stdout: a cheap syntactic pre-filter rejects
//! obvious noise before the parser runs, and rejected lines are discarded at
//! debug level without disturbing subsequent well-formed messages.

use std::io;

use tokio::io::{AsyncBufReadExt, AsyncRead, AsyncWrite, AsyncWriteExt, BufReader, Lines};
use tracing::debug;

use crate::protocol::Envelope;

/// Consecutive rejected lines tolerated per read cycle before the reader
/// yields, so a flood of noise cannot starve the caller.
const MAX_REJECTED_LINES_PER_CYCLE: usize = 10;

/// Serializes one envelope as a compact JSON line and flushes it.
pub async fn write_envelope<W>(writer: &mut W, envelope: &Envelope) -> io::Result<()>
where
    W: AsyncWrite + Unpin,
{
    let line = envelope.to_line().map_err(io::Error::other)?;
    writer.write_all(line.as_bytes()).await?;
    writer.write_all(b"\n").await?;
    writer.flush().await
}

/// Outcome of one read cycle over the child's stdout.
#[derive(Debug)]
pub enum ReadCycle {
    /// A well-formed envelope was decoded.
    Envelope(Envelope),
    /// The noise budget for this cycle was exhausted; call again.
    Idle,
    /// The underlying stream closed.
    Eof,
}

/// Line reader that extracts JSON-RPC envelopes from a noisy byte stream.
pub struct EnvelopeReader<R> {
    server_id: String,
    lines: Lines<BufReader<R>>,
}

impl<R> EnvelopeReader<R>
where
    R: AsyncRead + Unpin,
{
    pub fn new(server_id: impl Into<String>, reader: R) -> Self {
        Self {
            server_id: server_id.into(),
            lines: BufReader::new(reader).lines(),
        }
    }

    /// Reads until an envelope decodes, the noise budget is exhausted, or EOF.
    pub async fn next_cycle(&mut self) -> io::Result<ReadCycle> {
        let mut rejected = 0usize;
        while let Some(line) = self.lines.next_line().await? {
            let line = line.strip_suffix('\r').unwrap_or(line.as_str());
            if line.trim().is_empty() {
                continue;
            }

            if !looks_like_envelope(line) {
                debug!(server = %self.server_id, line, "discarding contaminating stdout line");
                rejected += 1;
                if rejected >= MAX_REJECTED_LINES_PER_CYCLE {
                    return Ok(ReadCycle::Idle);
                }
                continue;
            }

            match Envelope::from_line(line) {
                Ok(envelope) => return Ok(ReadCycle::Envelope(envelope)),
                Err(err) => {
                    debug!(server = %self.server_id, %err, line, "discarding unparseable stdout line");
                    rejected += 1;
                    if rejected >= MAX_REJECTED_LINES_PER_CYCLE {
                        return Ok(ReadCycle::Idle);
                    }
                }
            }
        }
        Ok(ReadCycle::Eof)
    }
}

/// Cheap syntactic check that a line plausibly holds one JSON value.
///
/// Rules: the line must open with `{`/`[` and close with `}`/`]`; brackets
/// must balance outside quoted strings (backslash escapes respected); objects
/// must contain at least one `:`; and `?` or `=` outside strings mark the
/// line as log noise, since neither can occur in JSON structure.
pub fn looks_like_envelope(line: &str) -> bool {
    let line = line.trim();
    let bytes = line.as_bytes();
    let (Some(&first), Some(&last)) = (bytes.first(), bytes.last()) else {
        return false;
    };
    if !matches!(first, b'{' | b'[') || !matches!(last, b'}' | b']') {
        return false;
    }

    let mut stack: Vec<u8> = Vec::new();
    let mut in_string = false;
    let mut escaped = false;
    let mut has_colon = false;

    for &byte in bytes {
        if in_string {
            if escaped {
                escaped = false;
            } else if byte == b'\\' {
                escaped = true;
            } else if byte == b'"' {
                in_string = false;
            }
            continue;
        }
        match byte {
            b'"' => in_string = true,
            b'{' => stack.push(b'}'),
            b'[' => stack.push(b']'),
            b'}' | b']' => {
                if stack.pop() != Some(byte) {
                    return false;
                }
            }
            b':' => has_colon = true,
            b'?' | b'=' => return false,
            _ => {}
        }
    }

    if in_string || !stack.is_empty() {
        return false;
    }
    if first == b'{' && !has_colon {
        return false;
    }
    true
}
