//! IMAP Session management
//!
//! Manages the state of an IMAP connection including authentication
//! and selected mailbox state.

use chrono::{DateTime, Utc};
use mailidx_common::types::MailboxDescriptor;
use std::net::SocketAddr;
use uuid::Uuid;

/// IMAP session state
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    /// Not authenticated
    NotAuthenticated,
    /// Authenticated but no mailbox selected
    Authenticated,
    /// Mailbox selected for read-write
    Selected,
    /// Mailbox selected for read-only (EXAMINE)
    ReadOnly,
    /// Session is closing
    Logout,
}

/// IMAP Session
#[derive(Debug)]
pub struct ImapSession {
    /// Registry key of the session
    pub id: Uuid,
    pub peer: SocketAddr,
    pub state: SessionState,
    pub user: Option<String>,
    /// Currently selected mailbox
    pub selected: Option<MailboxDescriptor>,
    pub started_at: DateTime<Utc>,
    pub last_activity: DateTime<Utc>,
}

impl ImapSession {
    pub fn new(id: Uuid, peer: SocketAddr) -> Self {
        let now = Utc::now();
        Self {
            id,
            peer,
            state: SessionState::NotAuthenticated,
            user: None,
            selected: None,
            started_at: now,
            last_activity: now,
        }
    }

    /// Check if session is authenticated
    pub fn is_authenticated(&self) -> bool {
        matches!(
            self.state,
            SessionState::Authenticated | SessionState::Selected | SessionState::ReadOnly
        )
    }

    /// Check if a mailbox is selected
    pub fn is_selected(&self) -> bool {
        matches!(self.state, SessionState::Selected | SessionState::ReadOnly)
    }

    /// Check if in read-only mode
    pub fn is_readonly(&self) -> bool {
        matches!(self.state, SessionState::ReadOnly)
    }

    pub fn authenticate(&mut self, user: String) {
        self.user = Some(user);
        self.state = SessionState::Authenticated;
        self.update_activity();
    }

    /// Select a mailbox
    pub fn select(&mut self, mailbox: MailboxDescriptor, readonly: bool) {
        self.selected = Some(mailbox);
        self.state = if readonly {
            SessionState::ReadOnly
        } else {
            SessionState::Selected
        };
        self.update_activity();
    }

    /// Close the selected mailbox
    pub fn close_mailbox(&mut self) {
        self.selected = None;
        self.state = SessionState::Authenticated;
        self.update_activity();
    }

    pub fn logout(&mut self) {
        self.state = SessionState::Logout;
    }

    pub fn update_activity(&mut self) {
        self.last_activity = Utc::now();
    }
}
