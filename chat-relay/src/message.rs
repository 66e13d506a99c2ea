use std::io;

use tokio::io::{AsyncBufRead, AsyncBufReadExt, AsyncWrite, AsyncWriteExt};

const LINE_ENDINGS: &[u8] = b"\r\n";

pub const NAME_PROMPT: &str = "Enter your name: ";
pub const DEFAULT_NAME: &str = "Anonymous";
pub const QUIT_COMMAND: &str = "/quit";
pub const SHUTDOWN_NOTICE: &str = "server shutting down";

/// Picks the display name from the first line a client sends.
///
/// Absent or blank input falls back to [`DEFAULT_NAME`]; negotiation never
/// rejects a connection. Any other name is kept exactly as typed.
pub fn display_name(line: Option<&str>) -> String {
    match line {
        Some(name) if !name.trim().is_empty() => name.to_string(),
        _ => DEFAULT_NAME.to_string(),
    }
}

pub fn is_quit(line: &str) -> bool {
    line.eq_ignore_ascii_case(QUIT_COMMAND)
}

pub fn join_notice(name: &str) -> String {
    format!("🟡 {name} joined the chat.")
}

pub fn leave_notice(name: &str) -> String {
    format!("🔴 {name} left the chat.")
}

pub fn chat_line(name: &str, text: &str) -> String {
    format!("[{name}]: {text}")
}

/// Reads one newline-terminated line, without its line ending.
///
/// Returns `Ok(None)` at end of stream. Empty lines are returned as empty
/// strings rather than skipped. Bytes that are not valid UTF-8 are replaced
/// with U+FFFD instead of failing the read.
pub async fn read_line<R>(reader: &mut R) -> io::Result<Option<String>>
where
    R: AsyncBufRead + Unpin,
{
    let mut buf = Vec::new();
    let bytes = reader.read_until(b'\n', &mut buf).await?;
    if bytes == 0 {
        return Ok(None);
    }

    while buf.last().is_some_and(|byte| LINE_ENDINGS.contains(byte)) {
        buf.pop();
    }
    Ok(Some(String::from_utf8_lossy(&buf).into_owned()))
}

pub async fn write_line<W>(writer: &mut W, line: &str) -> io::Result<()>
where
    W: AsyncWrite + Unpin,
{
    // One write per line so a peer never observes half a message followed by another.
    let mut encoded = Vec::with_capacity(line.len() + 1);
    encoded.extend_from_slice(line.as_bytes());
    encoded.push(b'\n');
    writer.write_all(&encoded).await?;
    writer.flush().await?;
    Ok(())
}
