use std::io;

use tokio::io::{AsyncBufReadExt, AsyncRead, BufReader};
use tokio::sync::mpsc;

/// Largest single read, and so roughly the largest relayed chunk.
const CHUNK_BYTES: usize = 8 * 1024;

/// Forwards a pipe read by read, so prompts and `\r` progress lines show up
/// without waiting for a newline. Returns early once the receiver is gone.
pub(super) async fn forward_chunks<R: AsyncRead + Unpin>(
    reader: R,
    chunks: mpsc::Sender<String>,
) -> io::Result<()> {
    let mut reader = BufReader::with_capacity(CHUNK_BYTES, reader);
    let mut pending: Vec<u8> = Vec::new();
    loop {
        let available = reader.fill_buf().await?;
        if available.is_empty() {
            break;
        }
        pending.extend_from_slice(available);
        let consumed = available.len();
        reader.consume(consumed);

        let chunk = take_chunk(&mut pending);
        if !chunk.is_empty() && chunks.send(chunk).await.is_err() {
            return Ok(());
        }
    }
    if !pending.is_empty() {
        let chunk = String::from_utf8_lossy(&pending).into_owned();
        let _ = chunks.send(chunk).await;
    }
    Ok(())
}

/// Drains `pending` up to the last complete UTF-8 sequence.
fn take_chunk(pending: &mut Vec<u8>) -> String {
    let split = match std::str::from_utf8(pending) {
        Ok(_) => pending.len(),
        // Incomplete sequence at the tail: keep it for the next read.
        Err(err) if err.error_len().is_none() => err.valid_up_to(),
        Err(_) => pending.len(),
    };
    let rest = pending.split_off(split);
    let chunk = String::from_utf8_lossy(pending).into_owned();
    *pending = rest;
    chunk
}
