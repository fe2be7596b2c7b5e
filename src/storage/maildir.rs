use crate::error::{Pop3Error, Result};
use crate::storage::{extract_top_lines, FolderStore, MessageInfo, MessageStore};
use crate::utils::parse_address;
use std::fs;
use std::io::{Cursor, Read};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};

static DELIVERY_SEQ: AtomicU64 = AtomicU64::new(0);

/// Maildir storage backend.
///
/// Each mailbox is a maildir under the base path, keyed by the local part of
/// the mailbox identifier:
///
/// ```text
/// base/
/// ├── alice/
/// │   ├── tmp/            # temporary files during write
/// │   ├── new/            # unread messages
/// │   ├── cur/            # read messages
/// │   └── .work/          # subaddress folder (maildir++ style)
/// ```
///
/// Message UIDs are the maildir basename without the `:2,flags` suffix,
/// which keeps them stable across the new/ → cur/ move.
pub struct MaildirStore {
    base_path: PathBuf,
}

impl MaildirStore {
    pub fn new<P: Into<PathBuf>>(base_path: P) -> Self {
        Self {
            base_path: base_path.into(),
        }
    }

    /// Store a message in the mailbox's `new/` directory, creating the
    /// maildir structure if needed. Returns the assigned UID.
    pub fn deliver(&self, mailbox: &str, data: &[u8]) -> Result<String> {
        let dir = self.mailbox_dir(mailbox)?;
        self.deliver_into(&dir, data)
    }

    /// Store a message in a subaddress folder of the mailbox.
    pub fn deliver_to_folder(&self, mailbox: &str, folder: &str, data: &[u8]) -> Result<String> {
        let dir = self.folder_dir(mailbox, folder)?;
        self.deliver_into(&dir, data)
    }

    fn deliver_into(&self, dir: &Path, data: &[u8]) -> Result<String> {
        ensure_maildir_structure(dir)?;

        let filename = generate_filename();
        let tmp_path = dir.join("tmp").join(&filename);
        let new_path = dir.join("new").join(&filename);

        // Write to tmp first, then rename into new: the rename is atomic, so
        // readers never observe a partial message.
        fs::write(&tmp_path, data)?;
        fs::rename(&tmp_path, &new_path)?;

        Ok(filename)
    }

    fn mailbox_dir(&self, mailbox: &str) -> Result<PathBuf> {
        let (local, _domain) = parse_address(mailbox)?;
        Ok(self.base_path.join(local))
    }

    fn folder_dir(&self, mailbox: &str, folder: &str) -> Result<PathBuf> {
        Ok(self.mailbox_dir(mailbox)?.join(format!(".{folder}")))
    }

    fn scan_dir(dir: &Path) -> Result<Vec<MessageInfo>> {
        if !dir.is_dir() {
            return Err(Pop3Error::Storage(format!(
                "mailbox does not exist: {}",
                dir.display()
            )));
        }

        let mut messages = Vec::new();
        for subdir in ["new", "cur"] {
            let sub = dir.join(subdir);
            let entries = match fs::read_dir(&sub) {
                Ok(entries) => entries,
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => continue,
                Err(e) => return Err(e.into()),
            };
            let mut batch = Vec::new();
            for entry in entries {
                let entry = entry?;
                let name = entry.file_name().to_string_lossy().to_string();
                let uid = uid_from_filename(&name);
                let size = entry.metadata()?.len();
                batch.push(MessageInfo {
                    uid: uid.to_string(),
                    size,
                });
            }
            batch.sort_by(|a, b| a.uid.cmp(&b.uid));
            messages.extend(batch);
        }
        Ok(messages)
    }

    fn find_message(dir: &Path, uid: &str) -> Result<PathBuf> {
        for subdir in ["new", "cur"] {
            let direct = dir.join(subdir).join(uid);
            if direct.is_file() {
                return Ok(direct);
            }
            // cur/ entries carry a ":2,flags" suffix after the UID.
            let sub = dir.join(subdir);
            if let Ok(entries) = fs::read_dir(&sub) {
                let prefix = format!("{uid}:");
                for entry in entries.flatten() {
                    let name = entry.file_name().to_string_lossy().to_string();
                    if name.starts_with(&prefix) {
                        return Ok(entry.path());
                    }
                }
            }
        }
        Err(Pop3Error::NoSuchMessage)
    }

    fn list_dir(&self, dir: &Path) -> Result<Vec<MessageInfo>> {
        Self::scan_dir(dir)
    }

    fn stat_dir(&self, dir: &Path) -> Result<(usize, u64)> {
        let messages = Self::scan_dir(dir)?;
        let total = messages.iter().map(|m| m.size).sum();
        Ok((messages.len(), total))
    }

    fn retrieve_dir(&self, dir: &Path, uid: &str) -> Result<Box<dyn Read + Send + '_>> {
        let path = Self::find_message(dir, uid)?;
        Ok(Box::new(fs::File::open(path)?))
    }

    fn retrieve_headers_dir(
        &self,
        dir: &Path,
        uid: &str,
        body_lines: usize,
    ) -> Result<Box<dyn Read + Send + '_>> {
        let path = Self::find_message(dir, uid)?;
        let lines = extract_top_lines(fs::File::open(path)?, body_lines)?;
        let mut buf = String::new();
        for line in &lines {
            buf.push_str(line);
            buf.push_str("\r\n");
        }
        Ok(Box::new(Cursor::new(buf.into_bytes())))
    }

    fn delete_dir(&self, dir: &Path, uid: &str) -> Result<()> {
        let path = Self::find_message(dir, uid)?;
        fs::remove_file(path)?;
        Ok(())
    }
}

impl MessageStore for MaildirStore {
    fn list(&mut self, mailbox: &str) -> Result<Vec<MessageInfo>> {
        let dir = self.mailbox_dir(mailbox)?;
        self.list_dir(&dir)
    }

    fn stat(&mut self, mailbox: &str) -> Result<(usize, u64)> {
        let dir = self.mailbox_dir(mailbox)?;
        self.stat_dir(&dir)
    }

    fn retrieve(&mut self, mailbox: &str, uid: &str) -> Result<Box<dyn Read + Send + '_>> {
        let dir = self.mailbox_dir(mailbox)?;
        self.retrieve_dir(&dir, uid)
    }

    fn retrieve_headers(
        &mut self,
        mailbox: &str,
        uid: &str,
        body_lines: usize,
    ) -> Result<Box<dyn Read + Send + '_>> {
        let dir = self.mailbox_dir(mailbox)?;
        self.retrieve_headers_dir(&dir, uid, body_lines)
    }

    fn delete(&mut self, mailbox: &str, uid: &str) -> Result<()> {
        let dir = self.mailbox_dir(mailbox)?;
        self.delete_dir(&dir, uid)
    }

    fn expunge(&mut self, _mailbox: &str) -> Result<()> {
        // Deletions are applied immediately; nothing is pending.
        Ok(())
    }

    fn folders(&mut self) -> Option<&mut dyn FolderStore> {
        Some(self)
    }
}

impl FolderStore for MaildirStore {
    fn folder_exists(&mut self, mailbox: &str, folder: &str) -> bool {
        self.folder_dir(mailbox, folder)
            .map(|d| d.is_dir())
            .unwrap_or(false)
    }

    fn list_in_folder(&mut self, mailbox: &str, folder: &str) -> Result<Vec<MessageInfo>> {
        let dir = self.folder_dir(mailbox, folder)?;
        self.list_dir(&dir)
    }

    fn stat_folder(&mut self, mailbox: &str, folder: &str) -> Result<(usize, u64)> {
        let dir = self.folder_dir(mailbox, folder)?;
        self.stat_dir(&dir)
    }

    fn retrieve_from_folder(
        &mut self,
        mailbox: &str,
        folder: &str,
        uid: &str,
    ) -> Result<Box<dyn Read + Send + '_>> {
        let dir = self.folder_dir(mailbox, folder)?;
        self.retrieve_dir(&dir, uid)
    }

    fn delete_in_folder(&mut self, mailbox: &str, folder: &str, uid: &str) -> Result<()> {
        let dir = self.folder_dir(mailbox, folder)?;
        self.delete_dir(&dir, uid)
    }

    fn expunge_folder(&mut self, _mailbox: &str, _folder: &str) -> Result<()> {
        Ok(())
    }
}

fn ensure_maildir_structure(dir: &Path) -> Result<()> {
    for subdir in ["tmp", "new", "cur"] {
        let path = dir.join(subdir);
        if !path.exists() {
            fs::create_dir_all(&path).map_err(|e| {
                Pop3Error::Storage(format!("create {}: {}", path.display(), e))
            })?;
        }
    }
    Ok(())
}

fn uid_from_filename(name: &str) -> &str {
    name.split_once(':').map(|(uid, _)| uid).unwrap_or(name)
}

fn generate_filename() -> String {
    let timestamp = std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .map(|d| d.as_secs())
        .unwrap_or(0);
    let seq = DELIVERY_SEQ.fetch_add(1, Ordering::Relaxed);
    let pid = std::process::id();
    let hostname = gethostname::gethostname().to_string_lossy().to_string();

    format!("{timestamp}.M{seq}P{pid}.{hostname}")
}
