//! Dedicated writer task for the session's send side.
//!
//! The engine never writes to the socket directly: it swaps the pending
//! send buffer into flight and hands it to this task over a capacity-1
//! channel, so at most one socket write is outstanding per session. When
//! the write completes the cleared buffer travels back to the engine as a
//! [`Command::WriteDone`], ready to be reused as the next pending buffer
//! (two-buffer ping-pong without reallocation).
//!
//! Closing the channel is the shutdown signal: the task flushes what it
//! holds and shuts the write half down.

use tokio::io::{AsyncWrite, AsyncWriteExt};
use tokio::sync::mpsc;

use super::Command;

/// Spawn the writer task; returns the buffer channel.
pub(crate) fn spawn_writer<W>(
    writer: W,
    completions: mpsc::UnboundedSender<Command>,
) -> mpsc::Sender<Vec<u8>>
where
    W: AsyncWrite + Unpin + Send + 'static,
{
    let (tx, rx) = mpsc::channel(1);
    tokio::spawn(writer_loop(rx, writer, completions));
    tx
}

async fn writer_loop<W>(
    mut rx: mpsc::Receiver<Vec<u8>>,
    mut writer: W,
    completions: mpsc::UnboundedSender<Command>,
) where
    W: AsyncWrite + Unpin,
{
    while let Some(buf) = rx.recv().await {
        let written = buf.len();
        let result = write_buffer(&mut writer, &buf).await;
        let failed = result.is_err();

        let mut buf = buf;
        buf.clear();

        let done = Command::WriteDone {
            result: result.map(|_| written),
            buf,
        };
        if completions.send(done).is_err() || failed {
            break;
        }
    }

    let _ = writer.shutdown().await;
}

async fn write_buffer<W>(writer: &mut W, buf: &[u8]) -> std::io::Result<()>
where
    W: AsyncWrite + Unpin,
{
    writer.write_all(buf).await?;
    writer.flush().await
}
