//! Length-delimited record I/O.
//!
//! A record is a 4-byte big-endian length followed by that many bytes. Reads
//! are bounded by a maximum size and, optionally, a timeout. When the timeout
//! fires the error reports how far the read got, so a stalled peer can be told
//! apart from one that never started writing.

use std::fmt;
use std::io;
use std::time::Duration;

use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

/// Size of the length prefix.
pub const PREFIX_LEN: usize = 4;

/// Default upper bound for a single record (16 MiB).
pub const DEFAULT_MAX_SIZE: usize = 16 * 1024 * 1024;

/// Which part of a record a read was working on.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Phase {
    LengthPrefix,
    Message,
}

impl fmt::Display for Phase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Phase::LengthPrefix => f.write_str("length prefix"),
            Phase::Message => f.write_str("message"),
        }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum DelimitedError {
    #[error("timed out waiting for result from {from}: read {read}/{expected} bytes of {phase}")]
    Timeout {
        from: String,
        phase: Phase,
        read: usize,
        expected: usize,
    },

    #[error("unexpected EOF from {from}: read {read}/{expected} bytes of {phase}")]
    UnexpectedEof {
        from: String,
        phase: Phase,
        read: usize,
        expected: usize,
    },

    #[error("message from {from} has size {size} but should not exceed {max}")]
    TooLarge { from: String, size: usize, max: usize },

    #[error("read from {from}: {err}")]
    Io { from: String, err: io::Error },
}

impl DelimitedError {
    pub fn is_unexpected_eof(&self) -> bool {
        matches!(self, DelimitedError::UnexpectedEof { .. })
    }

    pub fn is_timeout(&self) -> bool {
        matches!(self, DelimitedError::Timeout { .. })
    }
}

/// Tracks how far the current record has been read. Lives outside the read
/// future so it survives a timeout.
struct Progress {
    prefix: [u8; PREFIX_LEN],
    prefix_read: usize,
    body: Vec<u8>,
    body_read: usize,
    expected: Option<usize>,
}

impl Progress {
    fn new() -> Self {
        Progress {
            prefix: [0; PREFIX_LEN],
            prefix_read: 0,
            body: Vec::new(),
            body_read: 0,
            expected: None,
        }
    }

    fn position(&self) -> (Phase, usize, usize) {
        match self.expected {
            None => (Phase::LengthPrefix, self.prefix_read, PREFIX_LEN),
            Some(expected) => (Phase::Message, self.body_read, expected),
        }
    }
}

enum Outcome {
    Record,
    CleanEof,
}

async fn read_into<R>(
    reader: &mut R,
    progress: &mut Progress,
    from: &str,
    max_size: usize,
) -> Result<Outcome, DelimitedError>
where
    R: AsyncRead + Unpin + ?Sized,
{
    while progress.prefix_read < PREFIX_LEN {
        let n = reader
            .read(&mut progress.prefix[progress.prefix_read..])
            .await
            .map_err(|err| DelimitedError::Io {
                from: from.to_string(),
                err,
            })?;
        if n == 0 {
            if progress.prefix_read == 0 {
                return Ok(Outcome::CleanEof);
            }
            let (phase, read, expected) = progress.position();
            return Err(DelimitedError::UnexpectedEof {
                from: from.to_string(),
                phase,
                read,
                expected,
            });
        }
        progress.prefix_read += n;
    }

    let size = u32::from_be_bytes(progress.prefix) as usize;
    if size > max_size {
        return Err(DelimitedError::TooLarge {
            from: from.to_string(),
            size,
            max: max_size,
        });
    }
    if progress.expected.is_none() {
        progress.expected = Some(size);
        progress.body = vec![0; size];
    }

    while progress.body_read < size {
        let n = reader
            .read(&mut progress.body[progress.body_read..])
            .await
            .map_err(|err| DelimitedError::Io {
                from: from.to_string(),
                err,
            })?;
        if n == 0 {
            let (phase, read, expected) = progress.position();
            return Err(DelimitedError::UnexpectedEof {
                from: from.to_string(),
                phase,
                read,
                expected,
            });
        }
        progress.body_read += n;
    }
    Ok(Outcome::Record)
}

/// Read the next record.
///
/// Returns `Ok(None)` on EOF before any byte of a new record. EOF anywhere
/// inside a record is an [`DelimitedError::UnexpectedEof`]. A length prefix
/// above `max_size` fails before any byte of the payload is consumed.
pub async fn read_delimited<R>(
    reader: &mut R,
    from: &str,
    max_size: usize,
    timeout: Option<Duration>,
) -> Result<Option<Vec<u8>>, DelimitedError>
where
    R: AsyncRead + Unpin + ?Sized,
{
    let mut progress = Progress::new();
    let outcome = match timeout {
        None => read_into(reader, &mut progress, from, max_size).await?,
        Some(limit) => {
            match tokio::time::timeout(limit, read_into(reader, &mut progress, from, max_size))
                .await
            {
                Ok(result) => result?,
                Err(_elapsed) => {
                    let (phase, read, expected) = progress.position();
                    return Err(DelimitedError::Timeout {
                        from: from.to_string(),
                        phase,
                        read,
                        expected,
                    });
                }
            }
        }
    };
    match outcome {
        Outcome::CleanEof => Ok(None),
        Outcome::Record => Ok(Some(progress.body)),
    }
}

/// Write one record and flush.
pub async fn write_delimited<W>(writer: &mut W, data: &[u8]) -> io::Result<()>
where
    W: AsyncWrite + Unpin + ?Sized,
{
    let len = u32::try_from(data.len()).map_err(|_| {
        io::Error::new(
            io::ErrorKind::InvalidInput,
            format!("record of {} bytes does not fit a 32-bit length prefix", data.len()),
        )
    })?;
    writer.write_all(&len.to_be_bytes()).await?;
    writer.write_all(data).await?;
    writer.flush().await
}

#[cfg(test)]
pub(crate) mod test_io {
    use std::collections::VecDeque;
    use std::pin::Pin;
    use std::task::{Context, Poll};

    use tokio::io::{AsyncRead, ReadBuf};

    /// Hands out one scripted chunk per read, then either EOF or never
    /// completes.
    pub struct ScriptedReader {
        chunks: VecDeque<Vec<u8>>,
        stuck_at_end: bool,
    }

    impl ScriptedReader {
        pub fn new(chunks: Vec<Vec<u8>>) -> Self {
            ScriptedReader {
                chunks: chunks.into(),
                stuck_at_end: false,
            }
        }

        pub fn stuck(chunks: Vec<Vec<u8>>) -> Self {
            ScriptedReader {
                chunks: chunks.into(),
                stuck_at_end: true,
            }
        }

        pub fn is_drained(&self) -> bool {
            self.chunks.is_empty()
        }
    }

    impl AsyncRead for ScriptedReader {
        fn poll_read(
            mut self: Pin<&mut Self>,
            _cx: &mut Context<'_>,
            buf: &mut ReadBuf<'_>,
        ) -> Poll<std::io::Result<()>> {
            match self.chunks.pop_front() {
                Some(mut chunk) => {
                    let n = chunk.len().min(buf.remaining());
                    buf.put_slice(&chunk[..n]);
                    if n < chunk.len() {
                        let rest = chunk.split_off(n);
                        self.chunks.push_front(rest);
                    }
                    Poll::Ready(Ok(()))
                }
                None if self.stuck_at_end => Poll::Pending,
                None => Poll::Ready(Ok(())),
            }
        }
    }
}
