//! Bidirectional byte pipe between two duplex streams.

use std::io;

use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

/// Per-direction buffer size. Each direction holds at most one chunk in flight.
pub const PIPE_CHUNK: usize = 1024;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Side {
    A,
    B,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PipeStats {
    pub a_to_b: u64,
    pub b_to_a: u64,
    /// The side whose read ended the pipe, by EOF or by error.
    pub closed_by: Side,
}

/// Copy `a` to `b` and `b` to `a` until either side reaches EOF or fails, then shut
/// down both ends.
///
/// A read of zero bytes is a graceful close. Resets and broken pipes are treated
/// the same way; any other I/O error is returned after both ends are shut down.
pub async fn pipe<A, B>(a: A, b: B) -> io::Result<PipeStats>
where
    A: AsyncRead + AsyncWrite + Unpin,
    B: AsyncRead + AsyncWrite + Unpin,
{
    let (mut a_rd, mut a_wr) = tokio::io::split(a);
    let (mut b_rd, mut b_wr) = tokio::io::split(b);

    let mut a_to_b = 0u64;
    let mut b_to_a = 0u64;

    let (closed_by, res) = {
        let fwd = copy_chunked(&mut a_rd, &mut b_wr, &mut a_to_b);
        let rev = copy_chunked(&mut b_rd, &mut a_wr, &mut b_to_a);
        tokio::pin!(fwd, rev);

        tokio::select! {
            r = &mut fwd => (Side::A, r),
            r = &mut rev => (Side::B, r),
        }
    };

    let _ = a_wr.shutdown().await;
    let _ = b_wr.shutdown().await;

    match res {
        Ok(()) => {}
        Err(err) if is_graceful(&err) => {}
        Err(err) => return Err(err),
    }

    Ok(PipeStats {
        a_to_b,
        b_to_a,
        closed_by,
    })
}

async fn copy_chunked<R, W>(rd: &mut R, wr: &mut W, total: &mut u64) -> io::Result<()>
where
    R: AsyncRead + Unpin,
    W: AsyncWrite + Unpin,
{
    let mut buf = [0u8; PIPE_CHUNK];
    loop {
        let n = rd.read(&mut buf).await?;
        if n == 0 {
            return Ok(());
        }
        wr.write_all(&buf[..n]).await?;
        wr.flush().await?;
        *total += n as u64;
    }
}

fn is_graceful(err: &io::Error) -> bool {
    matches!(
        err.kind(),
        io::ErrorKind::BrokenPipe
            | io::ErrorKind::ConnectionReset
            | io::ErrorKind::ConnectionAborted
            | io::ErrorKind::NotConnected
            | io::ErrorKind::UnexpectedEof
    )
}
