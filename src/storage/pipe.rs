use crate::error::{Pop3Error, Result};
use crate::spawn::authsignal::{write_auth_signal, AuthSignal};
use crate::storage::{MessageInfo, MessageStore};
use std::io::{BufRead, BufReader, Read, Write};

/// Sanity cap on the number of messages a mail-session may report. A
/// legitimate mailbox never approaches this; the cap bounds the allocation a
/// compromised mail-session could trigger.
const MAX_LIST_COUNT: u64 = 10_000_000;

/// Message store that tunnels every operation over the session pipe to the
/// mail-session process (fds 5 and 6 in the protocol-handler).
///
/// On the first operation that needs a live mail-session it writes the auth
/// signal to the auth pipe (fd 4), closes that pipe so the dispatcher can
/// unblock, then performs the MAILBOX handshake. The auth pipe is closed
/// exactly once whether or not the handshake succeeds. A failed handshake is
/// terminal: the store records the failure and every subsequent call returns
/// an error without touching the pipe again.
pub struct SessionPipeStore {
    auth_pipe: Option<Box<dyn Write + Send>>,
    reader: BufReader<Box<dyn Read + Send>>,
    writer: Box<dyn Write + Send>,
    ready: bool,
    handshake_done: bool,
}

impl SessionPipeStore {
    pub fn new(
        auth_pipe: Box<dyn Write + Send>,
        from_session: Box<dyn Read + Send>,
        to_session: Box<dyn Write + Send>,
    ) -> Self {
        Self {
            auth_pipe: Some(auth_pipe),
            reader: BufReader::new(from_session),
            writer: to_session,
            ready: false,
            handshake_done: false,
        }
    }

    /// Run the handshake on the first call; error out immediately if a
    /// previous attempt failed (the auth pipe has already been consumed).
    fn ensure_ready(&mut self, mailbox: &str) -> Result<()> {
        if self.ready {
            return Ok(());
        }
        if self.handshake_done {
            return Err(Pop3Error::Pipe(
                "session pipe handshake already failed; store is not usable".to_string(),
            ));
        }
        self.handshake(mailbox)
    }

    fn handshake(&mut self, mailbox: &str) -> Result<()> {
        self.handshake_done = true;
        let result = self.handshake_inner(mailbox);
        // Dropping the write end closes it, which unblocks the dispatcher on
        // EOF even when the signal was never written. Taking out of the
        // Option guarantees the single close.
        drop(self.auth_pipe.take());
        if result.is_ok() {
            self.ready = true;
        }
        result
    }

    fn handshake_inner(&mut self, mailbox: &str) -> Result<()> {
        validate_token("mailbox", mailbox)?;

        let pipe = self
            .auth_pipe
            .as_mut()
            .ok_or_else(|| Pop3Error::Pipe("auth pipe already consumed".to_string()))?;

        // The mailbox identifier is also the fully-qualified username the
        // dispatcher resolves credentials for.
        let signal = AuthSignal {
            version: 1,
            username: mailbox.to_string(),
        };
        write_auth_signal(pipe.as_mut(), &signal)
            .map_err(|e| Pop3Error::Pipe(format!("write auth signal: {e}")))?;

        write!(self.writer, "MAILBOX {mailbox}\r\n")
            .map_err(|e| Pop3Error::Pipe(format!("send MAILBOX: {e}")))?;
        self.writer.flush()?;

        let line = self.read_line("MAILBOX")?;
        if !line.starts_with("+OK") {
            return Err(Pop3Error::Pipe(format!("MAILBOX rejected: {line}")));
        }
        Ok(())
    }

    /// Read one CRLF-terminated response line, with the terminator stripped.
    fn read_line(&mut self, op: &str) -> Result<String> {
        let mut line = String::new();
        let n = self
            .reader
            .read_line(&mut line)
            .map_err(|e| Pop3Error::Pipe(format!("{op}: read response: {e}")))?;
        if n == 0 {
            return Err(Pop3Error::Pipe(format!("{op}: unexpected EOF")));
        }
        Ok(line.trim_end_matches(['\r', '\n']).to_string())
    }

    fn read_ok(&mut self, op: &str) -> Result<()> {
        let line = self.read_line(op)?;
        if !line.starts_with("+OK") {
            return Err(Pop3Error::Pipe(format!("{op} error: {line}")));
        }
        Ok(())
    }

    /// Send a GET/HEADERS style request and return a reader over the
    /// length-prefixed payload. The reader drains unread bytes when dropped
    /// so the shared pipe reader stays synchronised.
    fn read_data_payload(&mut self, op: &str) -> Result<Box<dyn Read + Send + '_>> {
        let line = self.read_line(op)?;
        let Some(size_str) = line.strip_prefix("+DATA") else {
            return Err(Pop3Error::Pipe(format!("{op} error: {line}")));
        };
        let size: i64 = size_str
            .trim()
            .parse()
            .map_err(|_| Pop3Error::Pipe(format!("{op}: invalid data size {:?}", size_str.trim())))?;
        if size < 0 {
            return Err(Pop3Error::Pipe(format!("{op}: negative data size {size}")));
        }
        Ok(Box::new(DrainingReader {
            inner: (&mut self.reader).take(size as u64),
        }))
    }
}

impl MessageStore for SessionPipeStore {
    /// Wire: `LIST\r\n` → `+OK <count> <octets>\r\n` then `<count>` lines of
    /// `<uid> <size> [flags…]\r\n` (fields after the size are ignored).
    fn list(&mut self, mailbox: &str) -> Result<Vec<MessageInfo>> {
        self.ensure_ready(mailbox)?;

        write!(self.writer, "LIST\r\n").map_err(|e| Pop3Error::Pipe(format!("send LIST: {e}")))?;
        self.writer.flush()?;

        let header = self.read_line("LIST")?;
        if !header.starts_with("+OK") {
            return Err(Pop3Error::Pipe(format!("LIST error: {header}")));
        }

        let mut fields = header.trim_start_matches("+OK").split_whitespace();
        let count_str = fields
            .next()
            .ok_or_else(|| Pop3Error::Pipe(format!("LIST: missing count in {header:?}")))?;
        let count: u64 = count_str
            .parse()
            .map_err(|_| Pop3Error::Pipe(format!("LIST: invalid count {count_str:?}")))?;
        if count > MAX_LIST_COUNT {
            return Err(Pop3Error::Pipe(format!("LIST: unreasonable count {count}")));
        }

        let mut messages = Vec::with_capacity(count as usize);
        for i in 0..count {
            let entry = self.read_line("LIST entry")?;
            let mut fields = entry.split_whitespace();
            let (Some(uid), Some(size_str)) = (fields.next(), fields.next()) else {
                return Err(Pop3Error::Pipe(format!(
                    "LIST entry {}: malformed {entry:?}",
                    i + 1
                )));
            };
            let size: i64 = size_str.parse().map_err(|_| {
                Pop3Error::Pipe(format!("LIST entry {}: invalid size {size_str:?}", i + 1))
            })?;
            if size < 0 {
                return Err(Pop3Error::Pipe(format!(
                    "LIST entry {}: negative size {size}",
                    i + 1
                )));
            }
            messages.push(MessageInfo {
                uid: uid.to_string(),
                size: size as u64,
            });
        }
        Ok(messages)
    }

    /// Wire: `STAT\r\n` → `+OK <count> <octets>\r\n`.
    fn stat(&mut self, mailbox: &str) -> Result<(usize, u64)> {
        self.ensure_ready(mailbox)?;

        write!(self.writer, "STAT\r\n").map_err(|e| Pop3Error::Pipe(format!("send STAT: {e}")))?;
        self.writer.flush()?;

        let line = self.read_line("STAT")?;
        if !line.starts_with("+OK") {
            return Err(Pop3Error::Pipe(format!("STAT error: {line}")));
        }
        let mut fields = line.trim_start_matches("+OK").split_whitespace();
        let (Some(count_str), Some(total_str)) = (fields.next(), fields.next()) else {
            return Err(Pop3Error::Pipe(format!("STAT: malformed response {line:?}")));
        };
        let count: usize = count_str
            .parse()
            .map_err(|_| Pop3Error::Pipe(format!("STAT: invalid count {count_str:?}")))?;
        let total: u64 = total_str
            .parse()
            .map_err(|_| Pop3Error::Pipe(format!("STAT: invalid total {total_str:?}")))?;
        Ok((count, total))
    }

    /// Wire: `GET <uid>\r\n` → `+DATA <size>\r\n` then exactly `<size>` bytes.
    fn retrieve(&mut self, _mailbox: &str, uid: &str) -> Result<Box<dyn Read + Send + '_>> {
        validate_token("uid", uid)?;
        write!(self.writer, "GET {uid}\r\n")
            .map_err(|e| Pop3Error::Pipe(format!("send GET: {e}")))?;
        self.writer.flush()?;
        self.read_data_payload("GET")
    }

    /// Wire: `HEADERS <uid> <n>\r\n` with the same framing as GET.
    fn retrieve_headers(
        &mut self,
        _mailbox: &str,
        uid: &str,
        body_lines: usize,
    ) -> Result<Box<dyn Read + Send + '_>> {
        validate_token("uid", uid)?;
        write!(self.writer, "HEADERS {uid} {body_lines}\r\n")
            .map_err(|e| Pop3Error::Pipe(format!("send HEADERS: {e}")))?;
        self.writer.flush()?;
        self.read_data_payload("HEADERS")
    }

    /// Wire: `DELETE <uid>\r\n` → `+OK\r\n`.
    fn delete(&mut self, _mailbox: &str, uid: &str) -> Result<()> {
        validate_token("uid", uid)?;
        write!(self.writer, "DELETE {uid}\r\n")
            .map_err(|e| Pop3Error::Pipe(format!("send DELETE: {e}")))?;
        self.writer.flush()?;
        self.read_ok("DELETE")
    }

    /// Wire: `COMMIT\r\n` → `+OK\r\n`; the mail-session exits afterwards.
    fn expunge(&mut self, mailbox: &str) -> Result<()> {
        self.ensure_ready(mailbox)?;
        write!(self.writer, "COMMIT\r\n")
            .map_err(|e| Pop3Error::Pipe(format!("send COMMIT: {e}")))?;
        self.writer.flush()?;
        self.read_ok("COMMIT")
    }
}

/// Reader over a length-prefixed payload that drains any unread bytes on
/// drop. Leaving bytes behind would desynchronise every later exchange on
/// the shared pipe reader.
struct DrainingReader<'a> {
    inner: std::io::Take<&'a mut BufReader<Box<dyn Read + Send>>>,
}

impl Read for DrainingReader<'_> {
    fn read(&mut self, buf: &mut [u8]) -> std::io::Result<usize> {
        self.inner.read(buf)
    }
}

impl Drop for DrainingReader<'_> {
    fn drop(&mut self) {
        let _ = std::io::copy(&mut self.inner, &mut std::io::sink());
    }
}

/// Reject tokens that would break the line-oriented wire protocol.
fn validate_token(label: &str, s: &str) -> Result<()> {
    if s.is_empty() {
        return Err(Pop3Error::Pipe(format!("{label} must not be empty")));
    }
    if s.contains([' ', '\t', '\r', '\n']) {
        return Err(Pop3Error::Pipe(format!(
            "{label} contains illegal whitespace"
        )));
    }
    Ok(())
}
