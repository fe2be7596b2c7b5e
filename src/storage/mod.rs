//! Message storage backends.
//!
//! Two concrete [`MessageStore`] implementations exist and are selected at
//! wiring time: [`MaildirStore`] reads the mailbox directly from disk (used
//! by the mail-session process and by tests), and [`SessionPipeStore`]
//! tunnels every operation over the session pipe to a mail-session process
//! running under the authenticated user's uid.

pub mod folder;
pub mod maildir;
pub mod pipe;
pub mod session;

pub use folder::FolderRedirect;
pub use maildir::MaildirStore;
pub use pipe::SessionPipeStore;

use crate::error::Result;
use std::io::{BufRead, BufReader, Read};

/// Per-message metadata as reported by a store.
///
/// The `uid` is opaque and stable for the lifetime of the message; it never
/// contains whitespace or CR/LF.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MessageInfo {
    pub uid: String,
    pub size: u64,
}

/// A mailbox store. All methods take the fully-qualified mailbox identifier
/// (`local@domain`).
pub trait MessageStore: Send {
    /// List all messages in the mailbox, in stable order.
    fn list(&mut self, mailbox: &str) -> Result<Vec<MessageInfo>>;

    /// Message count and total size in octets.
    fn stat(&mut self, mailbox: &str) -> Result<(usize, u64)>;

    /// Full message content. Dropping the reader before exhausting it must
    /// leave the store usable for subsequent operations.
    fn retrieve(&mut self, mailbox: &str, uid: &str) -> Result<Box<dyn Read + Send + '_>>;

    /// Header section plus the first `body_lines` lines of the body,
    /// CRLF-terminated.
    fn retrieve_headers(
        &mut self,
        mailbox: &str,
        uid: &str,
        body_lines: usize,
    ) -> Result<Box<dyn Read + Send + '_>>;

    /// Remove one message.
    fn delete(&mut self, mailbox: &str, uid: &str) -> Result<()>;

    /// Flush pending deletions. For the session-pipe store this sends COMMIT
    /// and ends the mail-session.
    fn expunge(&mut self, mailbox: &str) -> Result<()>;

    /// Folder capability, when the backend supports folders.
    fn folders(&mut self) -> Option<&mut dyn FolderStore> {
        None
    }
}

/// Folder-qualified variants of the store operations, for backends that
/// support subaddress folders.
pub trait FolderStore {
    fn folder_exists(&mut self, mailbox: &str, folder: &str) -> bool;

    fn list_in_folder(&mut self, mailbox: &str, folder: &str) -> Result<Vec<MessageInfo>>;

    fn stat_folder(&mut self, mailbox: &str, folder: &str) -> Result<(usize, u64)>;

    fn retrieve_from_folder(
        &mut self,
        mailbox: &str,
        folder: &str,
        uid: &str,
    ) -> Result<Box<dyn Read + Send + '_>>;

    fn delete_in_folder(&mut self, mailbox: &str, folder: &str, uid: &str) -> Result<()>;

    fn expunge_folder(&mut self, mailbox: &str, folder: &str) -> Result<()>;
}

/// Extract the header section and the first `body_lines` body lines from a
/// message, normalising line endings. The blank separator line is included
/// with the headers.
pub fn extract_top_lines<R: Read>(reader: R, body_lines: usize) -> Result<Vec<String>> {
    let mut lines = Vec::new();
    let mut in_body = false;
    let mut body_count = 0;

    for line in BufReader::new(reader).lines() {
        let line = line?;
        let line = line.strip_suffix('\r').unwrap_or(&line).to_string();

        if !in_body {
            let is_blank = line.is_empty();
            lines.push(line);
            if is_blank {
                in_body = true;
            }
        } else {
            if body_count >= body_lines {
                break;
            }
            lines.push(line);
            body_count += 1;
        }
    }

    Ok(lines)
}
