//! POP3 session state.
//!
//! Tracks the RFC 1939 state machine (AUTHORIZATION → TRANSACTION → UPDATE),
//! the TLS state of the connection, the SASL exchange in progress, and the
//! per-session view of the mailbox (message list plus deletion marks).

use crate::config::ListenerMode;
use crate::error::{Pop3Error, Result};
use crate::pop3::sasl::SaslExchange;
use crate::security::AuthSession;
use crate::storage::{FolderRedirect, MessageInfo, MessageStore};
use std::collections::BTreeSet;
use std::fmt;

/// RFC 1939 session states.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum State {
    Authorization,
    Transaction,
    Update,
}

impl fmt::Display for State {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            State::Authorization => "AUTHORIZATION",
            State::Transaction => "TRANSACTION",
            State::Update => "UPDATE",
        })
    }
}

/// TLS state of the connection. Transitions NONE → ACTIVE only.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TlsState {
    None,
    Active,
}

impl fmt::Display for TlsState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            TlsState::None => "NONE",
            TlsState::Active => "ACTIVE",
        })
    }
}

pub struct Session {
    state: State,
    tls_state: TlsState,

    hostname: String,
    mode: ListenerMode,
    /// Whether a TLS configuration is available for STLS.
    tls_available: bool,

    username: Option<String>,
    auth_session: Option<AuthSession>,
    sasl: Option<SaslExchange>,

    mailbox: Option<String>,
    store: Option<Box<dyn MessageStore>>,
    messages: Vec<MessageInfo>,
    /// 1-based message numbers marked for deletion.
    deleted: BTreeSet<usize>,
}

impl Session {
    pub fn new(
        hostname: impl Into<String>,
        mode: ListenerMode,
        tls_available: bool,
        is_tls: bool,
        store: Option<Box<dyn MessageStore>>,
    ) -> Self {
        let tls_state = if mode == ListenerMode::Pop3s || is_tls {
            TlsState::Active
        } else {
            TlsState::None
        };

        Self {
            state: State::Authorization,
            tls_state,
            hostname: hostname.into(),
            mode,
            tls_available,
            username: None,
            auth_session: None,
            sasl: None,
            mailbox: None,
            store,
            messages: Vec::new(),
            deleted: BTreeSet::new(),
        }
    }

    pub fn state(&self) -> State {
        self.state
    }

    pub fn hostname(&self) -> &str {
        &self.hostname
    }

    pub fn tls_state(&self) -> TlsState {
        self.tls_state
    }

    /// Mark the connection as TLS-protected after a successful STLS upgrade.
    pub fn set_tls_active(&mut self) {
        self.tls_state = TlsState::Active;
    }

    pub fn is_tls_active(&self) -> bool {
        self.tls_state == TlsState::Active
    }

    /// STLS is available only before authentication, on a plaintext pop3
    /// listener that has a TLS configuration.
    pub fn can_stls(&self) -> bool {
        self.state == State::Authorization
            && self.mode == ListenerMode::Pop3
            && self.tls_state == TlsState::None
            && self.tls_available
    }

    pub fn set_username(&mut self, username: impl Into<String>) {
        self.username = Some(username.into());
    }

    pub fn username(&self) -> Option<&str> {
        self.username.as_deref()
    }

    /// Transition to TRANSACTION after successful authentication.
    pub fn set_authenticated(&mut self, auth_session: AuthSession) {
        self.state = State::Transaction;
        self.auth_session = Some(auth_session);
    }

    pub fn is_authenticated(&self) -> bool {
        matches!(self.state, State::Transaction | State::Update)
    }

    /// Transition to UPDATE (QUIT received in TRANSACTION).
    pub fn enter_update(&mut self) {
        if self.state == State::Transaction {
            self.state = State::Update;
        }
    }

    pub fn set_sasl(&mut self, exchange: SaslExchange) {
        self.sasl = Some(exchange);
    }

    pub fn clear_sasl(&mut self) {
        self.sasl = None;
    }

    pub fn sasl_in_progress(&self) -> bool {
        self.sasl.is_some()
    }

    /// Capability list for CAPA. Changes with TLS state and STLS
    /// availability.
    pub fn capabilities(&self) -> Vec<String> {
        let mut caps = Vec::new();

        if self.tls_state == TlsState::Active {
            caps.push("USER".to_string());
        }
        caps.push("TOP".to_string());
        caps.push("UIDL".to_string());
        caps.push("RESP-CODES".to_string());
        if self.tls_state == TlsState::Active {
            caps.push("SASL PLAIN".to_string());
        }
        if self.can_stls() {
            caps.push("STLS".to_string());
        }

        caps
    }

    /// Zero sensitive material when the session ends.
    pub fn cleanup(&mut self) {
        self.auth_session = None;
    }

    /// When authentication resolved a subaddress, redirect the store to that
    /// folder. Falls back to the inbox when the folder does not exist.
    pub fn redirect_to_folder(&mut self, folder: &str) {
        let Some(mailbox) = self
            .auth_session
            .as_ref()
            .map(|a| a.mailbox().to_string())
        else {
            return;
        };
        if let Some(mut store) = self.store.take() {
            let exists = store
                .folders()
                .map(|f| f.folder_exists(&mailbox, folder))
                .unwrap_or(false);
            self.store = if exists {
                Some(Box::new(FolderRedirect::new(store, folder)))
            } else {
                Some(store)
            };
        }
    }

    /// Load the message list for the authenticated user's mailbox. Call
    /// after successful authentication.
    pub fn initialize_mailbox(&mut self) -> Result<()> {
        let mailbox = self
            .auth_session
            .as_ref()
            .map(|a| a.mailbox().to_string())
            .ok_or(Pop3Error::MailboxNotInitialized)?;
        let store = self
            .store
            .as_mut()
            .ok_or(Pop3Error::MailboxNotInitialized)?;

        let messages = store.list(&mailbox)?;
        self.mailbox = Some(mailbox);
        self.messages = messages;
        self.deleted.clear();
        Ok(())
    }

    pub fn mailbox(&self) -> Option<&str> {
        self.mailbox.as_deref()
    }

    pub fn store_mut(&mut self) -> Option<&mut (dyn MessageStore + 'static)> {
        self.store.as_deref_mut()
    }

    /// Count of messages not marked for deletion.
    pub fn message_count(&self) -> usize {
        self.messages.len() - self.deleted.len()
    }

    /// Total size of messages not marked for deletion.
    pub fn total_size(&self) -> u64 {
        self.messages
            .iter()
            .enumerate()
            .filter(|(i, _)| !self.deleted.contains(&(i + 1)))
            .map(|(_, m)| m.size)
            .sum()
    }

    /// Message info by 1-based number; errors for out-of-range or deleted
    /// messages.
    pub fn get_message(&self, msg_num: usize) -> Result<&MessageInfo> {
        if msg_num < 1 || msg_num > self.messages.len() {
            return Err(Pop3Error::NoSuchMessage);
        }
        if self.deleted.contains(&msg_num) {
            return Err(Pop3Error::MessageDeleted);
        }
        Ok(&self.messages[msg_num - 1])
    }

    /// Mark a message for deletion by 1-based number.
    pub fn mark_deleted(&mut self, msg_num: usize) -> Result<()> {
        if msg_num < 1 || msg_num > self.messages.len() {
            return Err(Pop3Error::NoSuchMessage);
        }
        if !self.deleted.insert(msg_num) {
            return Err(Pop3Error::MessageDeleted);
        }
        Ok(())
    }

    /// Clear all deletion marks (RSET).
    pub fn reset_deletions(&mut self) {
        self.deleted.clear();
    }

    /// UIDs of messages marked for deletion, in message-number order.
    pub fn deleted_uids(&self) -> Vec<String> {
        self.deleted
            .iter()
            .filter_map(|&n| self.messages.get(n - 1))
            .map(|m| m.uid.clone())
            .collect()
    }

    /// Visible (non-deleted) messages as (1-based number, info) pairs.
    pub fn visible_messages(&self) -> Vec<(usize, &MessageInfo)> {
        self.messages
            .iter()
            .enumerate()
            .filter(|(i, _)| !self.deleted.contains(&(i + 1)))
            .map(|(i, m)| (i + 1, m))
            .collect()
    }
}
