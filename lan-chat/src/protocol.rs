//! Newline-delimited text protocol spoken between clients and the server.

use std::io;

use tokio::io::{AsyncBufRead, AsyncBufReadExt, AsyncWrite, AsyncWriteExt};

pub const DEFAULT_PORT: u16 = 55555;

const LINE_ENDINGS: &[char] = &['\n', '\r'];
const QUIT_COMMAND: &str = "/quit";
const PRIVATE_PREFIX: &str = "/msg ";
const USERS_PREFIX: &str = "USERS:";
const PRIVATE_TAG: &str = "PRIVATE:";
const SYSTEM_SENDER: &str = "SERVER";

/// What a client asked for with one line, once registered.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Command {
    /// Whitespace only; ignored.
    Blank,
    Quit,
    Private { target: String, text: String },
    Chat(String),
}

/// Classifies one inbound line.
///
/// `/msg` splits on the first space after the target. A `/msg` line without
/// any text is not a private message and falls back to ordinary chat.
pub fn parse_command(line: &str) -> Command {
    if line.trim().is_empty() {
        return Command::Blank;
    }

    if line.trim().eq_ignore_ascii_case(QUIT_COMMAND) {
        return Command::Quit;
    }

    let private = line
        .strip_prefix(PRIVATE_PREFIX)
        .and_then(|rest| rest.split_once(' '));
    if let Some((target, text)) = private {
        return Command::Private {
            target: target.to_string(),
            text: text.to_string(),
        };
    }

    Command::Chat(line.to_string())
}

/// The username a client asked for, or `None` when the line is blank.
pub fn requested_username(line: &str) -> Option<String> {
    let name = line.trim();
    (!name.is_empty()).then(|| name.to_string())
}

pub fn placeholder_username(connection_id: u64) -> String {
    format!("Anonymous_{connection_id}")
}

pub fn chat_line(username: &str, text: &str) -> String {
    format!("{username}: {text}")
}

pub fn system_line(body: &str) -> String {
    chat_line(SYSTEM_SENDER, body)
}

pub fn join_usernames<S: AsRef<str>>(usernames: &[S]) -> String {
    usernames
        .iter()
        .map(AsRef::as_ref)
        .collect::<Vec<_>>()
        .join(",")
}

pub fn users_line(joined: &str) -> String {
    format!("{USERS_PREFIX}{joined}")
}

pub fn private_line(from: &str, body: &str) -> String {
    format!("{PRIVATE_TAG}{from}:{body}")
}

pub fn joined_notice(username: &str) -> String {
    format!("{username} joined the chat")
}

pub fn left_notice(username: &str) -> String {
    format!("{username} left the chat")
}

pub fn private_sent_line(target: &str) -> String {
    format!("OK: private message sent to {target}")
}

pub fn private_failed_line(target: &str) -> String {
    format!("ERROR: user '{target}' not found or disconnected")
}

pub fn name_taken_line(username: &str) -> String {
    format!("ERROR: username '{username}' is already in use")
}

/// Reads the next line without its terminator. `Ok(None)` means end of stream.
///
/// Invalid UTF-8 is replaced with U+FFFD rather than reported, so only real
/// transport failures surface as errors.
pub async fn read_line<R>(reader: &mut R) -> io::Result<Option<String>>
where
    R: AsyncBufRead + Unpin,
{
    let mut raw = Vec::new();
    let bytes = reader.read_until(b'\n', &mut raw).await?;
    if bytes == 0 {
        return Ok(None);
    }
    let line = String::from_utf8_lossy(&raw);
    Ok(Some(line.trim_end_matches(LINE_ENDINGS).to_string()))
}

pub async fn write_line<W>(writer: &mut W, line: &str) -> io::Result<()>
where
    W: AsyncWrite + Unpin,
{
    // One write per line so a peer never sees a torn message.
    let mut encoded = Vec::with_capacity(line.len() + 1);
    encoded.extend_from_slice(line.as_bytes());
    encoded.push(b'\n');
    writer.write_all(&encoded).await?;
    writer.flush().await
}
