//! Server side of the session-pipe protocol.
//!
//! The mail-session process runs this loop over its stdin/stdout, which the
//! dispatcher wired to the protocol-handler's fds 6/5. One mailbox is
//! selected per process lifetime; COMMIT (or EOF) ends the loop.

use crate::error::{Pop3Error, Result};
use crate::storage::MessageStore;
use std::io::{BufRead, Read, Write};
use tracing::debug;

/// Serve the session-pipe protocol until COMMIT or EOF.
pub fn serve_session<R: BufRead, W: Write>(
    store: &mut dyn MessageStore,
    mut input: R,
    mut output: W,
) -> Result<()> {
    let mut mailbox: Option<String> = None;
    let mut line = String::new();

    loop {
        line.clear();
        if input.read_line(&mut line)? == 0 {
            // Protocol-handler closed its pipe ends; exit cleanly.
            return Ok(());
        }
        let trimmed = line.trim_end_matches(['\r', '\n']);
        if trimmed.is_empty() {
            continue;
        }

        let mut parts = trimmed.split_whitespace();
        let verb = parts.next().unwrap_or("").to_ascii_uppercase();
        let args: Vec<&str> = parts.collect();
        debug!(verb, "session pipe command");

        if verb == "MAILBOX" {
            let &[name] = args.as_slice() else {
                respond(&mut output, "-ERR MAILBOX requires a name")?;
                continue;
            };
            match store.stat(name) {
                Ok(_) => {
                    mailbox = Some(name.to_string());
                    respond(&mut output, "+OK mailbox selected")?;
                }
                Err(_) => respond(&mut output, "-ERR no such mailbox")?,
            }
            continue;
        }

        let Some(mailbox) = mailbox.as_deref() else {
            respond(&mut output, "-ERR no mailbox selected")?;
            continue;
        };

        match verb.as_str() {
            "LIST" => match store.list(mailbox) {
                Ok(messages) => {
                    let total: u64 = messages.iter().map(|m| m.size).sum();
                    write!(output, "+OK {} {}\r\n", messages.len(), total)?;
                    for m in &messages {
                        write!(output, "{} {}\r\n", m.uid, m.size)?;
                    }
                    output.flush()?;
                }
                Err(_) => respond(&mut output, "-ERR storage failure")?,
            },
            "STAT" => match store.stat(mailbox) {
                Ok((count, total)) => respond(&mut output, &format!("+OK {count} {total}"))?,
                Err(_) => respond(&mut output, "-ERR storage failure")?,
            },
            "GET" => {
                let &[uid] = args.as_slice() else {
                    respond(&mut output, "-ERR GET requires a uid")?;
                    continue;
                };
                send_payload(&mut output, store.retrieve(mailbox, uid))?;
            }
            "HEADERS" => {
                let &[uid, lines_str] = args.as_slice() else {
                    respond(&mut output, "-ERR HEADERS requires uid and line count")?;
                    continue;
                };
                let Ok(body_lines) = lines_str.parse::<usize>() else {
                    respond(&mut output, "-ERR invalid line count")?;
                    continue;
                };
                send_payload(
                    &mut output,
                    store.retrieve_headers(mailbox, uid, body_lines),
                )?;
            }
            "DELETE" => {
                let &[uid] = args.as_slice() else {
                    respond(&mut output, "-ERR DELETE requires a uid")?;
                    continue;
                };
                match store.delete(mailbox, uid) {
                    Ok(()) => respond(&mut output, "+OK deleted")?,
                    Err(Pop3Error::NoSuchMessage) => {
                        respond(&mut output, "-ERR no such message")?
                    }
                    Err(_) => respond(&mut output, "-ERR storage failure")?,
                }
            }
            "COMMIT" => {
                let result = store.expunge(mailbox);
                match result {
                    Ok(()) => respond(&mut output, "+OK committed")?,
                    Err(_) => respond(&mut output, "-ERR storage failure")?,
                }
                return Ok(());
            }
            _ => respond(&mut output, "-ERR unknown command")?,
        }
    }
}

fn respond<W: Write>(output: &mut W, line: &str) -> Result<()> {
    write!(output, "{line}\r\n")?;
    output.flush()?;
    Ok(())
}

fn send_payload<W: Write>(
    output: &mut W,
    reader: Result<Box<dyn Read + Send + '_>>,
) -> Result<()> {
    match reader {
        Ok(mut reader) => {
            let mut content = Vec::new();
            reader.read_to_end(&mut content)?;
            drop(reader);
            write!(output, "+DATA {}\r\n", content.len())?;
            output.write_all(&content)?;
            output.flush()?;
            Ok(())
        }
        Err(Pop3Error::NoSuchMessage) => respond(output, "-ERR no such message"),
        Err(_) => respond(output, "-ERR storage failure"),
    }
}
