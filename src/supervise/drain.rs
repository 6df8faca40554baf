// src/supervise/drain.rs

//! Stream drainers: one background task per child pipe.
//!
//! Each drainer reads its stream line by line until end-of-stream and pushes
//! every line onto the shared queue. On EOF (or a "stream already closed"
//! class of error) it pushes exactly one [`QueueEntry::Closed`] sentinel and
//! returns. Errors never propagate past this boundary; an unexpected I/O
//! error is reported to the controller as [`QueueEntry::Fatal`] before the
//! sentinel.
//!
//! Drainers never touch the process handle, only stream I/O.

use std::io::ErrorKind;

use tokio::io::{AsyncBufReadExt, AsyncRead, BufReader};
use tokio::task::JoinHandle;
use tracing::{debug, warn};

use crate::supervise::queue::{LineSender, QueueEntry, StreamSource};

/// Spawn a drainer task for one stream of the child.
///
/// Generic over the reader so tests can inject in-memory or failing streams.
pub fn spawn_drainer<R>(
    reader: R,
    source: StreamSource,
    tx: LineSender,
    identifier: String,
) -> JoinHandle<()>
where
    R: AsyncRead + Unpin + Send + 'static,
{
    tokio::spawn(async move {
        let mut reader = BufReader::new(reader);
        let mut buf: Vec<u8> = Vec::new();

        loop {
            buf.clear();
            match reader.read_until(b'\n', &mut buf).await {
                Ok(0) => break,
                Ok(_) => {
                    while matches!(buf.last(), Some(b'\n') | Some(b'\r')) {
                        buf.pop();
                    }
                    let entry = QueueEntry::Line {
                        bytes: std::mem::take(&mut buf),
                        source,
                    };
                    if tx.send(entry).is_err() {
                        // Consumer is gone; nothing left to report to.
                        break;
                    }
                }
                Err(err) if is_closed_error(&err) => {
                    debug!(
                        identifier = %identifier,
                        stream = source.label(),
                        error = %err,
                        "communication line seems to be closed"
                    );
                    break;
                }
                Err(err) => {
                    warn!(
                        identifier = %identifier,
                        stream = source.label(),
                        error = %err,
                        "unexpected read error on child stream"
                    );
                    let _ = tx.send(QueueEntry::Fatal(err.to_string()));
                    break;
                }
            }
        }

        debug!(identifier = %identifier, stream = source.label(), "drainer done");
        let _ = tx.send(QueueEntry::Closed(source));
        // The reader is dropped here, closing our end of the pipe.
    })
}

/// Errors that mean "the stream went away", which is the normal way a pipe
/// ends when the child dies or closes its end.
fn is_closed_error(err: &std::io::Error) -> bool {
    matches!(
        err.kind(),
        ErrorKind::BrokenPipe | ErrorKind::UnexpectedEof | ErrorKind::InvalidInput
    )
}

#[cfg(test)]
mod tests {
    use std::io::Cursor;
    use std::pin::Pin;
    use std::task::{Context, Poll};

    use tokio::io::{AsyncRead, ReadBuf};

    use super::*;
    use crate::supervise::queue;

    /// Yields some bytes, then fails with the given error kind.
    struct FailingReader {
        data: Vec<u8>,
        kind: ErrorKind,
    }

    impl AsyncRead for FailingReader {
        fn poll_read(
            mut self: Pin<&mut Self>,
            _cx: &mut Context<'_>,
            buf: &mut ReadBuf<'_>,
        ) -> Poll<std::io::Result<()>> {
            if self.data.is_empty() {
                return Poll::Ready(Err(std::io::Error::new(self.kind, "boom")));
            }
            let data = std::mem::take(&mut self.data);
            buf.put_slice(&data);
            Poll::Ready(Ok(()))
        }
    }

    #[tokio::test]
    async fn lines_then_single_sentinel() {
        let (tx, mut rx) = queue::channel();
        let reader = Cursor::new(b"alpha\nbeta\r\n".to_vec());
        let handle = spawn_drainer(reader, StreamSource::Stdout, tx, "t".into());

        assert_eq!(
            rx.recv().await.unwrap(),
            QueueEntry::Line {
                bytes: b"alpha".to_vec(),
                source: StreamSource::Stdout
            }
        );
        assert_eq!(
            rx.recv().await.unwrap(),
            QueueEntry::Line {
                bytes: b"beta".to_vec(),
                source: StreamSource::Stdout
            }
        );
        assert_eq!(
            rx.recv().await.unwrap(),
            QueueEntry::Closed(StreamSource::Stdout)
        );
        assert!(rx.recv().await.is_none());
        handle.await.unwrap();
    }

    #[tokio::test]
    async fn closed_error_becomes_plain_sentinel() {
        let (tx, mut rx) = queue::channel();
        let reader = FailingReader {
            data: b"one\n".to_vec(),
            kind: ErrorKind::BrokenPipe,
        };
        let handle = spawn_drainer(reader, StreamSource::Stderr, tx, "t".into());

        assert!(matches!(
            rx.recv().await.unwrap(),
            QueueEntry::Line { .. }
        ));
        assert_eq!(
            rx.recv().await.unwrap(),
            QueueEntry::Closed(StreamSource::Stderr)
        );
        assert!(rx.recv().await.is_none());
        handle.await.unwrap();
    }

    #[tokio::test]
    async fn unexpected_error_reports_fatal_before_sentinel() {
        let (tx, mut rx) = queue::channel();
        let reader = FailingReader {
            data: Vec::new(),
            kind: ErrorKind::Other,
        };
        let handle = spawn_drainer(reader, StreamSource::Stdout, tx, "t".into());

        assert!(matches!(rx.recv().await.unwrap(), QueueEntry::Fatal(_)));
        assert_eq!(
            rx.recv().await.unwrap(),
            QueueEntry::Closed(StreamSource::Stdout)
        );
        handle.await.unwrap();
    }
}
