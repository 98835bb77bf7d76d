//! Raw two-way byte pipe between a joined socket pair

use std::sync::atomic::{AtomicU64, Ordering};

use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tracing::debug;

const COPY_BUFFER_SIZE: usize = 8192;

/// Which side of the pair ended the pipe
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PipeSide {
    A,
    B,
}

/// Outcome of a finished pipe
#[derive(Debug)]
pub struct PipeSummary {
    /// The side whose read half hit EOF or an error first
    pub closed_by: PipeSide,
    /// Error observed on the closing direction, if any
    pub error: Option<std::io::Error>,
    pub a_to_b: u64,
    pub b_to_a: u64,
}

/// Copy bytes both ways between `a` and `b` until either side closes or errors
///
/// As soon as one direction ends, its EOF is forwarded (write shutdown) and
/// both streams are dropped: a joined pair never outlives its first closed leg.
pub async fn pipe_two_way<A, B>(a: A, b: B) -> PipeSummary
where
    A: AsyncRead + AsyncWrite + Unpin,
    B: AsyncRead + AsyncWrite + Unpin,
{
    let (a_read, a_write) = tokio::io::split(a);
    let (b_read, b_write) = tokio::io::split(b);

    let a_to_b = AtomicU64::new(0);
    let b_to_a = AtomicU64::new(0);

    let (closed_by, result) = tokio::select! {
        res = copy_half(a_read, b_write, &a_to_b) => (PipeSide::A, res),
        res = copy_half(b_read, a_write, &b_to_a) => (PipeSide::B, res),
    };

    let summary = PipeSummary {
        closed_by,
        error: result.err(),
        a_to_b: a_to_b.load(Ordering::Relaxed),
        b_to_a: b_to_a.load(Ordering::Relaxed),
    };
    debug!(
        closed_by = ?summary.closed_by,
        a_to_b = summary.a_to_b,
        b_to_a = summary.b_to_a,
        "pipe finished"
    );
    summary
}

async fn copy_half<R, W>(mut reader: R, mut writer: W, counter: &AtomicU64) -> std::io::Result<()>
where
    R: AsyncRead + Unpin,
    W: AsyncWrite + Unpin,
{
    let mut buffer = vec![0u8; COPY_BUFFER_SIZE];
    loop {
        let n = reader.read(&mut buffer).await?;
        if n == 0 {
            let _ = writer.shutdown().await;
            return Ok(());
        }
        writer.write_all(&buffer[..n]).await?;
        counter.fetch_add(n as u64, Ordering::Relaxed);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::duplex;

    #[tokio::test]
    async fn test_bytes_flow_both_ways() {
        let (mut client_a, pipe_a) = duplex(1024);
        let (pipe_b, mut client_b) = duplex(1024);

        let pipe = tokio::spawn(pipe_two_way(pipe_a, pipe_b));

        client_a.write_all(b"ping").await.unwrap();
        let mut buf = [0u8; 4];
        client_b.read_exact(&mut buf).await.unwrap();
        assert_eq!(&buf, b"ping");

        client_b.write_all(b"pong!").await.unwrap();
        let mut buf = [0u8; 5];
        client_a.read_exact(&mut buf).await.unwrap();
        assert_eq!(&buf, b"pong!");

        drop(client_a);
        let summary = pipe.await.unwrap();
        assert_eq!(summary.closed_by, PipeSide::A);
        assert_eq!(summary.a_to_b, 4);
        assert_eq!(summary.b_to_a, 5);
    }

    #[tokio::test]
    async fn test_closing_one_side_tears_down_the_other() {
        let (client_a, pipe_a) = duplex(1024);
        let (pipe_b, mut client_b) = duplex(1024);

        let pipe = tokio::spawn(pipe_two_way(pipe_a, pipe_b));
        drop(client_a);

        let summary = pipe.await.unwrap();
        assert_eq!(summary.closed_by, PipeSide::A);

        // B observes EOF: its partner is gone
        let mut buf = Vec::new();
        let n = client_b.read_to_end(&mut buf).await.unwrap();
        assert_eq!(n, 0);
    }
}
