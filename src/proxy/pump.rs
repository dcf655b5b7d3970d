//! Bidirectional byte shuttling between a downstream and an upstream.
//!
//! One copy loop per direction, joined so the pump returns only when both
//! have terminated. When a loop's read side ends, for any reason, it shuts
//! down its sink's write half; the resulting end-of-stream unblocks the
//! opposite loop, so one side closing tears the whole pair down within a
//! read cycle.
//!
//! Each direction reports its data-transfer error and its close error
//! separately, letting the caller tell a connection that simply ended from
//! one that misbehaved.

use std::io;

use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt, ReadHalf, WriteHalf};

/// Copy buffer size per direction.
const BUFFER_SIZE: usize = 64 * 1024;

/// What one direction of the pump observed.
#[derive(Debug, Default)]
pub struct DirectionOutcome {
    /// Read or write failure that ended the transfer, if any.
    pub data_error: Option<io::Error>,
    /// Failure to close the sink afterwards, if any.
    pub close_error: Option<io::Error>,
}

impl DirectionOutcome {
    /// Whether the transfer finished without a data error.
    pub fn transferred_cleanly(&self) -> bool {
        self.data_error.is_none()
    }

    /// Whether the close error, if any, is worth reporting.
    pub fn close_needs_attention(&self) -> bool {
        self.close_error
            .as_ref()
            .is_some_and(|err| !is_benign_close(err))
    }
}

/// Outcomes of both directions of one proxied pair.
#[derive(Debug)]
pub struct PumpOutcome {
    /// Downstream-to-upstream direction.
    pub to_upstream: DirectionOutcome,
    /// Upstream-to-downstream direction.
    pub to_downstream: DirectionOutcome,
}

/// Closing an endpoint that is already closed is the expected way for the
/// second direction to learn the pair is done.
pub fn is_benign_close(err: &io::Error) -> bool {
    matches!(err.kind(), io::ErrorKind::NotConnected)
}

/// Shuttle bytes both ways between `down` and `up` until both directions
/// terminate.
pub async fn bidirectional<D, U>(down: D, up: U) -> PumpOutcome
where
    D: AsyncRead + AsyncWrite,
    U: AsyncRead + AsyncWrite,
{
    let (down_read, down_write) = tokio::io::split(down);
    let (up_read, up_write) = tokio::io::split(up);

    let (to_upstream, to_downstream) = tokio::join!(
        copy_until_close(down_read, up_write),
        copy_until_close(up_read, down_write),
    );

    PumpOutcome {
        to_upstream,
        to_downstream,
    }
}

/// One direction: blocking reads from `source`, writing every byte read to
/// `sink`, closing the sink on any termination.
async fn copy_until_close<R, W>(mut source: ReadHalf<R>, mut sink: WriteHalf<W>) -> DirectionOutcome
where
    R: AsyncRead,
    W: AsyncWrite,
{
    let mut buf = vec![0u8; BUFFER_SIZE];

    loop {
        match source.read(&mut buf).await {
            Ok(0) => {
                return DirectionOutcome {
                    data_error: None,
                    close_error: close_sink(&mut sink).await,
                };
            }
            Ok(n) => {
                // A short write surfaces here as an error and ends the loop.
                if let Err(err) = sink.write_all(&buf[..n]).await {
                    return DirectionOutcome {
                        data_error: Some(err),
                        close_error: close_sink(&mut sink).await,
                    };
                }
            }
            Err(err) if err.kind() == io::ErrorKind::NotConnected => {
                // Reading from an already-closed endpoint is a clean end.
                return DirectionOutcome {
                    data_error: None,
                    close_error: close_sink(&mut sink).await,
                };
            }
            Err(err) => {
                return DirectionOutcome {
                    data_error: Some(err),
                    close_error: close_sink(&mut sink).await,
                };
            }
        }
    }
}

async fn close_sink<W: AsyncWrite>(sink: &mut WriteHalf<W>) -> Option<io::Error> {
    sink.shutdown().await.err()
}

#[cfg(test)]
mod tests {
    use tokio::io::duplex;

    use super::*;

    /// Echo everything until end-of-stream, then close.
    async fn echo_peer<S: AsyncRead + AsyncWrite + Unpin>(mut stream: S) {
        let mut buf = vec![0u8; 4096];
        loop {
            match stream.read(&mut buf).await {
                Ok(0) | Err(_) => break,
                Ok(n) => {
                    if stream.write_all(&buf[..n]).await.is_err() {
                        break;
                    }
                }
            }
        }
        let _ = stream.shutdown().await;
    }

    #[tokio::test]
    async fn round_trips_bytes_through_echo() {
        let (client, down_side) = duplex(1024);
        let (up_side, backend) = duplex(1024);

        let pump = tokio::spawn(bidirectional(down_side, up_side));
        let echo = tokio::spawn(echo_peer(backend));

        let payload = b"This data should be echoed back";
        let (mut client_read, mut client_write) = tokio::io::split(client);
        client_write.write_all(payload).await.unwrap();

        let mut received = vec![0u8; payload.len()];
        client_read.read_exact(&mut received).await.unwrap();
        assert_eq!(&received, payload);

        // Client finishing its write side unwinds echo and both pump loops.
        client_write.shutdown().await.unwrap();
        let outcome = pump.await.unwrap();
        echo.await.unwrap();

        assert!(outcome.to_upstream.transferred_cleanly());
        assert!(outcome.to_downstream.transferred_cleanly());
        assert!(!outcome.to_upstream.close_needs_attention());
        assert!(!outcome.to_downstream.close_needs_attention());
    }

    #[tokio::test]
    async fn upstream_close_propagates_to_downstream() {
        let (client, down_side) = duplex(1024);
        let (up_side, backend) = duplex(1024);

        let pump = tokio::spawn(bidirectional(down_side, up_side));

        // Upstream closes without sending anything.
        drop(backend);

        let (mut client_read, mut client_write) = tokio::io::split(client);
        client_write.shutdown().await.unwrap();
        let mut buf = [0u8; 16];
        let n = client_read.read(&mut buf).await.unwrap();
        assert_eq!(n, 0, "downstream read should see end-of-stream");

        let outcome = pump.await.unwrap();
        assert!(outcome.to_downstream.transferred_cleanly());
    }

    #[tokio::test]
    async fn large_transfer_is_byte_identical() {
        let (client, down_side) = duplex(64 * 1024);
        let (up_side, backend) = duplex(64 * 1024);

        let pump = tokio::spawn(bidirectional(down_side, up_side));
        let echo = tokio::spawn(echo_peer(backend));

        // Larger than one copy buffer, patterned for mismatch detection.
        let payload: Vec<u8> = (0..200_000u32).map(|i| (i % 251) as u8).collect();
        let (mut client_read, mut client_write) = tokio::io::split(client);

        let expected = payload.clone();
        let writer = tokio::spawn(async move {
            client_write.write_all(&payload).await.unwrap();
            client_write.shutdown().await.unwrap();
        });

        let mut received = Vec::with_capacity(expected.len());
        client_read.read_to_end(&mut received).await.unwrap();
        assert_eq!(received, expected);

        writer.await.unwrap();
        echo.await.unwrap();
        let outcome = pump.await.unwrap();
        assert!(outcome.to_upstream.transferred_cleanly());
        assert!(outcome.to_downstream.transferred_cleanly());
    }

    #[tokio::test]
    async fn write_failure_is_reported_on_that_direction_only() {
        let (client, down_side) = duplex(1024);
        let (up_side, backend) = duplex(16);

        let pump = tokio::spawn(bidirectional(down_side, up_side));

        // Backend vanishes; the next downstream-to-upstream write fails.
        drop(backend);
        let (mut client_read, mut client_write) = tokio::io::split(client);
        // Writes may buffer before the broken pipe surfaces; keep pushing.
        let mut write_failed = false;
        for _ in 0..64 {
            if client_write.write_all(&[0u8; 64]).await.is_err() {
                write_failed = true;
                break;
            }
        }

        // Downstream sees end-of-stream once the pump tears down.
        let mut buf = [0u8; 16];
        while client_read.read(&mut buf).await.is_ok_and(|n| n > 0) {}

        drop(client_write);
        drop(client_read);
        let outcome = pump.await.unwrap();

        assert!(
            write_failed || outcome.to_upstream.data_error.is_some(),
            "the broken upstream should surface on the client write or the pump outcome"
        );
        assert!(outcome.to_downstream.transferred_cleanly());
    }
}
