//! Minimal STOMP 1.2 framing, just the subset the broker conversation needs:
//! CONNECT/SUBSCRIBE/SEND out, CONNECTED/MESSAGE/ERROR/RECEIPT in.

use std::fmt;

const FRAME_TERMINATOR: char = '\0';

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Command {
    Connect,
    Connected,
    Subscribe,
    Send,
    Message,
    Error,
    Receipt,
}

impl Command {
    fn as_str(self) -> &'static str {
        match self {
            Command::Connect => "CONNECT",
            Command::Connected => "CONNECTED",
            Command::Subscribe => "SUBSCRIBE",
            Command::Send => "SEND",
            Command::Message => "MESSAGE",
            Command::Error => "ERROR",
            Command::Receipt => "RECEIPT",
        }
    }

    fn parse(input: &str) -> Option<Self> {
        match input {
            "CONNECT" => Some(Command::Connect),
            "CONNECTED" => Some(Command::Connected),
            "SUBSCRIBE" => Some(Command::Subscribe),
            "SEND" => Some(Command::Send),
            "MESSAGE" => Some(Command::Message),
            "ERROR" => Some(Command::Error),
            "RECEIPT" => Some(Command::Receipt),
            _ => None,
        }
    }
}

impl fmt::Display for Command {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Frame {
    pub command: Command,
    pub headers: Vec<(String, String)>,
    pub body: String,
}

#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum FrameError {
    #[error("empty frame")]
    Empty,
    #[error("unknown command: {0}")]
    UnknownCommand(String),
    #[error("header line without colon: {0}")]
    BadHeader(String),
    #[error("invalid escape sequence in header")]
    BadEscape,
    #[error("missing blank line between headers and body")]
    MissingBodySeparator,
}

impl Frame {
    pub fn new(command: Command) -> Self {
        Self {
            command,
            headers: Vec::new(),
            body: String::new(),
        }
    }

    pub fn header(mut self, name: &str, value: &str) -> Self {
        self.headers.push((name.to_string(), value.to_string()));
        self
    }

    pub fn body(mut self, body: impl Into<String>) -> Self {
        self.body = body.into();
        self
    }

    /// First value for a header name, if present.
    pub fn get(&self, name: &str) -> Option<&str> {
        self.headers
            .iter()
            .find(|(k, _)| k == name)
            .map(|(_, v)| v.as_str())
    }

    /// Serialize to the wire form: command, escaped headers, blank line,
    /// body, NUL.
    pub fn encode(&self) -> String {
        let mut out = String::with_capacity(self.body.len() + 64);
        out.push_str(self.command.as_str());
        out.push('\n');
        for (name, value) in &self.headers {
            out.push_str(&escape(name));
            out.push(':');
            out.push_str(&escape(value));
            out.push('\n');
        }
        out.push('\n');
        out.push_str(&self.body);
        out.push(FRAME_TERMINATOR);
        out
    }

    /// Parse a single frame from the text payload of a WebSocket message.
    pub fn decode(raw: &str) -> Result<Self, FrameError> {
        let raw = raw.replace("\r\n", "\n");
        let raw = raw.trim_end_matches(FRAME_TERMINATOR);
        // Broker heart-beats are lone EOLs; callers skip those before decode.
        let (head, body) = raw
            .split_once("\n\n")
            .ok_or(FrameError::MissingBodySeparator)?;

        let mut lines = head.lines();
        let command_line = lines.next().ok_or(FrameError::Empty)?;
        if command_line.is_empty() {
            return Err(FrameError::Empty);
        }
        let command = Command::parse(command_line)
            .ok_or_else(|| FrameError::UnknownCommand(command_line.to_string()))?;

        let mut headers = Vec::new();
        for line in lines {
            if line.is_empty() {
                continue;
            }
            let (name, value) = line
                .split_once(':')
                .ok_or_else(|| FrameError::BadHeader(line.to_string()))?;
            headers.push((unescape(name)?, unescape(value)?));
        }

        Ok(Self {
            command,
            headers,
            body: body.to_string(),
        })
    }
}

/// STOMP 1.2 header value escaping.
fn escape(input: &str) -> String {
    let mut out = String::with_capacity(input.len());
    for ch in input.chars() {
        match ch {
            '\\' => out.push_str("\\\\"),
            '\r' => out.push_str("\\r"),
            '\n' => out.push_str("\\n"),
            ':' => out.push_str("\\c"),
            other => out.push(other),
        }
    }
    out
}

fn unescape(input: &str) -> Result<String, FrameError> {
    let mut out = String::with_capacity(input.len());
    let mut chars = input.chars();
    while let Some(ch) = chars.next() {
        if ch != '\\' {
            out.push(ch);
            continue;
        }
        match chars.next() {
            Some('\\') => out.push('\\'),
            Some('r') => out.push('\r'),
            Some('n') => out.push('\n'),
            Some('c') => out.push(':'),
            _ => return Err(FrameError::BadEscape),
        }
    }
    Ok(out)
}

/// True if the payload is only heart-beat EOLs rather than a frame.
pub fn is_heartbeat(raw: &str) -> bool {
    raw.trim_matches(|c| c == '\n' || c == '\r' || c == FRAME_TERMINATOR)
        .is_empty()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn encodes_a_send_frame() {
        let frame = Frame::new(Command::Send)
            .header("destination", "/app/chat/42")
            .header("content-type", "application/json")
            .body(r#"{"message":"hello"}"#);
        let wire = frame.encode();
        assert!(wire.starts_with("SEND\ndestination:/app/chat/42\n"));
        assert!(wire.ends_with("{\"message\":\"hello\"}\0"));
    }

    #[test]
    fn decodes_a_message_frame() {
        let wire = "MESSAGE\ndestination:/topic/theaters/42/state\nsubscription:sub-1\n\n{\"status\":\"PLAYING\"}\0";
        let frame = Frame::decode(wire).unwrap();
        assert_eq!(frame.command, Command::Message);
        assert_eq!(frame.get("destination"), Some("/topic/theaters/42/state"));
        assert_eq!(frame.body, "{\"status\":\"PLAYING\"}");
    }

    #[test]
    fn header_escaping_round_trips() {
        let frame = Frame::new(Command::Send)
            .header("destination", "/app/chat/1")
            .header("odd", "a:b\nc\\d");
        let decoded = Frame::decode(&frame.encode()).unwrap();
        assert_eq!(decoded.get("odd"), Some("a:b\nc\\d"));
    }

    #[test]
    fn rejects_garbage() {
        assert_eq!(
            Frame::decode("BOGUS\n\n\0"),
            Err(FrameError::UnknownCommand("BOGUS".into()))
        );
        assert_eq!(Frame::decode("no separator"), Err(FrameError::MissingBodySeparator));
        assert_eq!(
            Frame::decode("MESSAGE\nbroken header\n\n\0"),
            Err(FrameError::BadHeader("broken header".into()))
        );
    }

    #[test]
    fn carriage_returns_are_tolerated() {
        let wire = "CONNECTED\r\nversion:1.2\r\n\r\n\0";
        let frame = Frame::decode(wire).unwrap();
        assert_eq!(frame.command, Command::Connected);
        assert_eq!(frame.get("version"), Some("1.2"));
    }

    #[test]
    fn heartbeats_are_not_frames() {
        assert!(is_heartbeat("\n"));
        assert!(is_heartbeat("\r\n"));
        assert!(!is_heartbeat("MESSAGE\n\n\0"));
    }
}
