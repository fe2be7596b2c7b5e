//! POP3 response formatting.

/// A single POP3 response: a status line with an optional multi-line body,
/// or a SASL continuation challenge.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Response {
    Ok {
        message: String,
        lines: Option<Vec<String>>,
    },
    Err {
        message: String,
    },
    /// `+ <base64>` continuation during a SASL exchange. The space is
    /// mandatory even when the challenge is empty.
    Continuation {
        challenge: String,
    },
}

impl Response {
    pub fn ok(message: impl Into<String>) -> Self {
        Response::Ok {
            message: message.into(),
            lines: None,
        }
    }

    pub fn ok_with_lines(message: impl Into<String>, lines: Vec<String>) -> Self {
        Response::Ok {
            message: message.into(),
            lines: Some(lines),
        }
    }

    pub fn err(message: impl Into<String>) -> Self {
        Response::Err {
            message: message.into(),
        }
    }

    pub fn continuation(challenge: impl Into<String>) -> Self {
        Response::Continuation {
            challenge: challenge.into(),
        }
    }

    pub fn is_ok(&self) -> bool {
        matches!(self, Response::Ok { .. })
    }

    pub fn is_continuation(&self) -> bool {
        matches!(self, Response::Continuation { .. })
    }

    /// Serialize to the wire format. Multi-line payloads are CRLF-framed,
    /// byte-stuffed, and closed with the `.` terminator line.
    pub fn to_bytes(&self) -> Vec<u8> {
        let mut buf = Vec::with_capacity(64);

        match self {
            Response::Continuation { challenge } => {
                buf.extend_from_slice(b"+ ");
                buf.extend_from_slice(challenge.as_bytes());
                buf.extend_from_slice(b"\r\n");
            }
            Response::Ok { message, lines } => {
                buf.extend_from_slice(b"+OK");
                push_message(&mut buf, message);
                if let Some(lines) = lines {
                    push_multi_line(&mut buf, lines);
                }
            }
            Response::Err { message } => {
                buf.extend_from_slice(b"-ERR");
                push_message(&mut buf, message);
            }
        }

        buf
    }
}

fn push_message(buf: &mut Vec<u8>, message: &str) {
    if !message.is_empty() {
        buf.push(b' ');
        buf.extend_from_slice(message.as_bytes());
    }
    buf.extend_from_slice(b"\r\n");
}

fn push_multi_line(buf: &mut Vec<u8>, lines: &[String]) {
    for line in lines {
        // Byte-stuffing: a leading '.' is doubled so the line cannot be
        // mistaken for the terminator.
        if line.starts_with('.') {
            buf.push(b'.');
        }
        buf.extend_from_slice(line.as_bytes());
        buf.extend_from_slice(b"\r\n");
    }
    buf.extend_from_slice(b".\r\n");
}
