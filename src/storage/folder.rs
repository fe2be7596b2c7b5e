use crate::error::{Pop3Error, Result};
use crate::storage::{extract_top_lines, FolderStore, MessageInfo, MessageStore};
use std::io::{Cursor, Read};

/// Presents one folder of a folder-capable store as if it were the inbox.
///
/// Used when the authenticated identity carried a subaddress
/// (`user+folder@domain`): the command layer keeps talking to a plain
/// [`MessageStore`] while every operation is redirected to the folder.
pub struct FolderRedirect {
    inner: Box<dyn MessageStore>,
    folder: String,
}

impl FolderRedirect {
    pub fn new(inner: Box<dyn MessageStore>, folder: impl Into<String>) -> Self {
        Self {
            inner,
            folder: folder.into(),
        }
    }

    fn folder_store(&mut self) -> Result<&mut dyn FolderStore> {
        self.inner
            .folders()
            .ok_or_else(|| Pop3Error::Storage("store has no folder support".to_string()))
    }
}

impl MessageStore for FolderRedirect {
    fn list(&mut self, mailbox: &str) -> Result<Vec<MessageInfo>> {
        let folder = self.folder.clone();
        self.folder_store()?.list_in_folder(mailbox, &folder)
    }

    fn stat(&mut self, mailbox: &str) -> Result<(usize, u64)> {
        let folder = self.folder.clone();
        self.folder_store()?.stat_folder(mailbox, &folder)
    }

    fn retrieve(&mut self, mailbox: &str, uid: &str) -> Result<Box<dyn Read + Send + '_>> {
        let folder = self.folder.clone();
        self.folder_store()?
            .retrieve_from_folder(mailbox, &folder, uid)
    }

    fn retrieve_headers(
        &mut self,
        mailbox: &str,
        uid: &str,
        body_lines: usize,
    ) -> Result<Box<dyn Read + Send + '_>> {
        let folder = self.folder.clone();
        let lines = {
            let reader = self
                .folder_store()?
                .retrieve_from_folder(mailbox, &folder, uid)?;
            extract_top_lines(reader, body_lines)?
        };
        let mut buf = String::new();
        for line in &lines {
            buf.push_str(line);
            buf.push_str("\r\n");
        }
        Ok(Box::new(Cursor::new(buf.into_bytes())))
    }

    fn delete(&mut self, mailbox: &str, uid: &str) -> Result<()> {
        let folder = self.folder.clone();
        self.folder_store()?.delete_in_folder(mailbox, &folder, uid)
    }

    fn expunge(&mut self, mailbox: &str) -> Result<()> {
        let folder = self.folder.clone();
        self.folder_store()?.expunge_folder(mailbox, &folder)
    }
}
