//! Sink — writes delivered entries as JSON lines.

use std::io;

use tokio::io::{AsyncWrite, AsyncWriteExt};
use tokio::sync::mpsc;

use crate::emit::LogEntry;

/// Drain `entries` into `out`, one JSON object per line, until every
/// sender is gone. Returns the number of entries written.
pub async fn write_json_lines<W>(mut entries: mpsc::Receiver<LogEntry>, mut out: W) -> io::Result<u64>
where
    W: AsyncWrite + Unpin,
{
    let mut written = 0u64;
    while let Some(entry) = entries.recv().await {
        let mut line = serde_json::to_vec(&entry)
            .map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e))?;
        line.push(b'\n');
        out.write_all(&line).await?;
        out.flush().await?;
        written += 1;
    }
    out.flush().await?;
    Ok(written)
}
