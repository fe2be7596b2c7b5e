use std::io::{BufRead, Write};

/// Authentication signal written by the protocol-handler to the auth pipe
/// (fd 4) after the user has authenticated successfully.
///
/// Wire format (CRLF-terminated lines; bare LF is accepted on read):
///
/// ```text
/// AUTH <version>\r\n
/// USER:<local@domain>\r\n
/// END\r\n
/// ```
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AuthSignal {
    pub version: u32,
    pub username: String,
}

/// Serialize one auth signal to `w`.
pub fn write_auth_signal<W: Write + ?Sized>(
    w: &mut W,
    signal: &AuthSignal,
) -> std::io::Result<()> {
    write!(
        w,
        "AUTH {}\r\nUSER:{}\r\nEND\r\n",
        signal.version, signal.username
    )?;
    w.flush()
}

/// Read and parse one auth signal from `r`. Any malformed line, a bad
/// version, an empty username, or EOF before `END` is a hard parse error.
pub fn read_auth_signal<R: BufRead>(r: &mut R) -> std::io::Result<AuthSignal> {
    let auth_line = read_signal_line(r, "AUTH")?;
    let Some(version_str) = auth_line.strip_prefix("AUTH ") else {
        return Err(parse_error(format!("expected AUTH line, got {auth_line:?}")));
    };
    let version: u32 = version_str
        .trim()
        .parse()
        .map_err(|_| parse_error(format!("unsupported auth signal version in {auth_line:?}")))?;
    if version != 1 {
        return Err(parse_error(format!(
            "unsupported auth signal version in {auth_line:?}"
        )));
    }

    let user_line = read_signal_line(r, "USER")?;
    let Some(username) = user_line.strip_prefix("USER:") else {
        return Err(parse_error(format!("expected USER: line, got {user_line:?}")));
    };
    if username.is_empty() {
        return Err(parse_error("empty username in USER line".to_string()));
    }
    let username = username.to_string();

    let end_line = read_signal_line(r, "END")?;
    if end_line != "END" {
        return Err(parse_error(format!("expected END, got {end_line:?}")));
    }

    Ok(AuthSignal { version, username })
}

fn read_signal_line<R: BufRead>(r: &mut R, what: &str) -> std::io::Result<String> {
    let mut line = String::new();
    let n = r.read_line(&mut line)?;
    if n == 0 {
        return Err(parse_error(format!("read {what} line: unexpected EOF")));
    }
    Ok(line.trim_end_matches(['\r', '\n']).to_string())
}

fn parse_error(msg: String) -> std::io::Error {
    std::io::Error::new(std::io::ErrorKind::InvalidData, msg)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn parse(input: &str) -> std::io::Result<AuthSignal> {
        read_auth_signal(&mut input.as_bytes())
    }

    #[test]
    fn test_read_valid() {
        let signal = parse("AUTH 1\r\nUSER:alice@test.local\r\nEND\r\n").unwrap();
        assert_eq!(signal.version, 1);
        assert_eq!(signal.username, "alice@test.local");
    }

    #[test]
    fn test_read_valid_lf_only() {
        let signal = parse("AUTH 1\nUSER:alice@test.local\nEND\n").unwrap();
        assert_eq!(signal.username, "alice@test.local");
    }

    #[test]
    fn test_read_unexpected_eof() {
        assert!(parse("").is_err());
        assert!(parse("AUTH 1\r\n").is_err());
        assert!(parse("AUTH 1\r\nUSER:alice@test.local\r\n").is_err());
    }

    #[test]
    fn test_read_bad_version() {
        assert!(parse("AUTH 2\r\nUSER:alice@test.local\r\nEND\r\n").is_err());
        assert!(parse("AUTH x\r\nUSER:alice@test.local\r\nEND\r\n").is_err());
    }

    #[test]
    fn test_read_missing_prefix() {
        assert!(parse("HELLO 1\r\nUSER:alice@test.local\r\nEND\r\n").is_err());
        assert!(parse("AUTH 1\r\nNAME:alice@test.local\r\nEND\r\n").is_err());
        assert!(parse("AUTH 1\r\nUSER:alice@test.local\r\nFIN\r\n").is_err());
    }

    #[test]
    fn test_read_empty_username() {
        assert!(parse("AUTH 1\r\nUSER:\r\nEND\r\n").is_err());
    }

    #[test]
    fn test_write_then_read_round_trip() {
        let signal = AuthSignal {
            version: 1,
            username: "bob@example.net".to_string(),
        };
        let mut buf = Vec::new();
        write_auth_signal(&mut buf, &signal).unwrap();
        assert_eq!(buf, b"AUTH 1\r\nUSER:bob@example.net\r\nEND\r\n");

        let parsed = read_auth_signal(&mut buf.as_slice()).unwrap();
        assert_eq!(parsed, signal);
    }
}
