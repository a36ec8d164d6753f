//! IMAP Server
//!
//! Accept loop and per-connection command handling. Each connection is
//! admitted through the [`SessionManager`]; a session read is the point at
//! which shutdown can interrupt it.

use super::command::{FetchItem, ImapCommand, StoreFlags, StoreOperation, TaggedCommand};
use super::manager::SessionManager;
use super::parser::ImapParser;
use super::response::ImapResponse;
use super::session::{ImapSession, SessionState};
use crate::index::SearchKey;
use crate::mail_store::MailStore;

use argon2::{Argon2, PasswordHash, PasswordVerifier};
use mailidx_common::config::{Config, ImapConfig};
use mailidx_common::flags;
use mailidx_common::types::{IndexedItem, SequenceItem, SequenceSet, Uid};
use mailidx_common::{Error, Result};
use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, AsyncRead, AsyncWrite, AsyncWriteExt, BufReader};
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

/// IMAP Server
#[derive(Clone)]
pub struct ImapServer {
    config: ImapConfig,
    hostname: String,
    store: Arc<MailStore>,
    manager: Arc<SessionManager>,
}

impl ImapServer {
    pub fn new(config: &Config, store: Arc<MailStore>, manager: Arc<SessionManager>) -> Self {
        Self {
            config: config.imap.clone(),
            hostname: config.server.hostname.clone(),
            store,
            manager,
        }
    }

    pub async fn bind(&self) -> Result<TcpListener> {
        let listener = TcpListener::bind(&self.config.bind).await?;
        info!("IMAP server listening on {}", listener.local_addr()?);
        Ok(listener)
    }

    /// Accept connections until `token` is cancelled
    pub async fn run(&self, listener: TcpListener, token: CancellationToken) -> Result<()> {
        loop {
            let accepted = tokio::select! {
                _ = token.cancelled() => break,
                accepted = listener.accept() => accepted,
            };

            match accepted {
                Ok((stream, peer)) => {
                    debug!("New IMAP connection from {}", peer);
                    let server = self.clone();
                    let admitted = self
                        .manager
                        .admit(stream, peer, move |id, stream, token| async move {
                            server.handle_connection(id, stream, peer, token).await
                        })
                        .await;

                    match admitted {
                        Ok(id) => info!(session = %id, "Accepted connection from {}", peer),
                        Err(Error::TooManyClients) => {}
                        Err(e) => warn!("Failed to refuse connection from {}: {}", peer, e),
                    }
                }
                Err(e) => {
                    error!("Accept error: {}", e);
                }
            }
        }

        info!("IMAP server stopped accepting connections");
        Ok(())
    }

    /// Serve one connection until logout, disconnect, timeout or cancellation
    pub async fn handle_connection<S>(
        &self,
        id: Uuid,
        stream: S,
        peer: SocketAddr,
        token: CancellationToken,
    ) -> Result<()>
    where
        S: AsyncRead + AsyncWrite + Unpin,
    {
        let (reader, mut writer) = tokio::io::split(stream);
        let mut reader = BufReader::new(reader);
        let mut session = ImapSession::new(id, peer);
        let timeout = Duration::from_secs(self.config.timeout_minutes.saturating_mul(60));

        writer
            .write_all(ImapResponse::greeting(&self.hostname).as_bytes())
            .await?;
        writer.flush().await?;

        let mut line = String::new();

        loop {
            line.clear();

            let read_result = tokio::select! {
                _ = token.cancelled() => {
                    // Best effort; the peer may already be gone
                    let _ = writer
                        .write_all(ImapResponse::bye("IMAP server terminating connection").as_bytes())
                        .await;
                    info!(session = %id, "Session for {} cancelled", peer);
                    return Err(Error::Cancelled);
                }
                read = tokio::time::timeout(timeout, reader.read_line(&mut line)) => read,
            };

            match read_result {
                Ok(Ok(0)) => {
                    debug!("Connection closed by client {}", peer);
                    break;
                }
                Ok(Ok(_)) => {
                    debug!("Received from {}: {}", peer, line.trim_end());

                    let response = match ImapParser::parse(&line) {
                        Some(cmd) => self.handle_command(cmd, &mut session).await,
                        None => ImapResponse::bad("*", "Invalid command"),
                    };

                    writer.write_all(response.as_bytes()).await?;
                    writer.flush().await?;

                    if session.state == SessionState::Logout {
                        break;
                    }
                }
                Ok(Err(e)) => {
                    return Err(Error::Protocol(format!("read error from {}: {}", peer, e)));
                }
                Err(_) => {
                    warn!("Connection timeout for {}", peer);
                    writer
                        .write_all(ImapResponse::bye("Autologout; idle for too long").as_bytes())
                        .await?;
                    break;
                }
            }
        }

        info!(session = %id, "IMAP connection closed for {}", peer);
        Ok(())
    }

    /// Handle a parsed IMAP command
    async fn handle_command(&self, cmd: TaggedCommand, session: &mut ImapSession) -> String {
        let tag = cmd.tag.as_str();
        session.update_activity();

        match cmd.command {
            // Any state commands
            ImapCommand::Capability => format!(
                "{}{}",
                ImapResponse::capability(),
                ImapResponse::ok(tag, "CAPABILITY completed")
            ),
            ImapCommand::Noop => ImapResponse::ok(tag, "NOOP completed"),
            ImapCommand::Logout => {
                session.logout();
                format!(
                    "{}{}",
                    ImapResponse::bye("Logging out"),
                    ImapResponse::ok(tag, "LOGOUT completed")
                )
            }

            // Authentication
            ImapCommand::Login { username, password } => {
                self.handle_login(tag, username, &password, session)
            }

            // Authenticated state commands
            ImapCommand::Select { mailbox } => {
                self.handle_select(tag, &mailbox, false, session).await
            }
            ImapCommand::Examine { mailbox } => {
                self.handle_select(tag, &mailbox, true, session).await
            }
            ImapCommand::Status { mailbox, items } => {
                self.handle_status(tag, &mailbox, &items, session).await
            }
            ImapCommand::Close => self.handle_close(tag, session).await,

            // Selected state commands
            ImapCommand::Fetch {
                sequence,
                items,
                uid,
            } => self.handle_fetch(tag, &sequence, &items, uid, session).await,
            ImapCommand::Search { keys, uid } => {
                self.handle_search(tag, &keys, uid, session).await
            }
            ImapCommand::Store {
                sequence,
                flags,
                uid,
            } => self.handle_store(tag, &sequence, &flags, uid, session).await,

            ImapCommand::Unknown { command } => {
                ImapResponse::bad(tag, &format!("Unknown command: {}", command))
            }
        }
    }

    fn verify_login(&self, username: &str, password: &str) -> bool {
        if let Some(user) = &self.config.user {
            if user != username {
                return false;
            }
        }

        match &self.config.password_hash {
            None => true,
            Some(hash) => match PasswordHash::new(hash) {
                Ok(parsed) => Argon2::default()
                    .verify_password(password.as_bytes(), &parsed)
                    .is_ok(),
                Err(e) => {
                    error!("Configured password hash is invalid: {}", e);
                    false
                }
            },
        }
    }

    fn handle_login(
        &self,
        tag: &str,
        username: String,
        password: &str,
        session: &mut ImapSession,
    ) -> String {
        if session.is_authenticated() {
            return ImapResponse::bad(tag, "Already authenticated");
        }

        if self.verify_login(&username, password) {
            info!(session = %session.id, user = %username, "Login succeeded");
            session.authenticate(username);
            ImapResponse::ok(tag, "LOGIN completed")
        } else {
            warn!(session = %session.id, user = %username, "Login failed");
            ImapResponse::no(tag, "Invalid credentials")
        }
    }

    /// Handle SELECT/EXAMINE command
    async fn handle_select(
        &self,
        tag: &str,
        mailbox_name: &str,
        readonly: bool,
        session: &mut ImapSession,
    ) -> String {
        let command = if readonly { "EXAMINE" } else { "SELECT" };
        if !session.is_authenticated() {
            return ImapResponse::no(tag, "Not authenticated");
        }
        if session.is_selected() {
            session.close_mailbox();
        }

        let Some(mailbox) = self.store.mailbox(mailbox_name).await else {
            return ImapResponse::no(tag, "Mailbox not found");
        };

        let status = if readonly {
            self.store.status(&mailbox).await
        } else {
            self.store.peek(&mailbox.name).await
        };
        let status = match status {
            Ok(status) => status,
            Err(e) => return self.failure(tag, command, e),
        };

        let mut response = String::new();
        response.push_str(&ImapResponse::exists(status.messages));
        response.push_str(&ImapResponse::recent(status.recent));
        response.push_str(&ImapResponse::uid_validity(1));
        response.push_str(&ImapResponse::uid_next(self.store.next_uid().await));
        response.push_str(&ImapResponse::mailbox_flags());
        response.push_str(&ImapResponse::permanent_flags());

        session.select(mailbox, readonly);
        let access = if readonly { "READ-ONLY" } else { "READ-WRITE" };
        response.push_str(&ImapResponse::ok(
            tag,
            &format!("[{}] {} completed", access, command),
        ));
        response
    }

    async fn handle_status(
        &self,
        tag: &str,
        mailbox_name: &str,
        items: &[String],
        session: &ImapSession,
    ) -> String {
        if !session.is_authenticated() {
            return ImapResponse::no(tag, "Not authenticated");
        }

        let Some(mailbox) = self.store.mailbox(mailbox_name).await else {
            return ImapResponse::no(tag, "Mailbox not found");
        };

        let status = match self.store.status(&mailbox).await {
            Ok(status) => status,
            Err(e) => return self.failure(tag, "STATUS", e),
        };

        let mut status_items = Vec::new();
        for item in items {
            let value = match item.as_str() {
                "MESSAGES" => status.messages,
                "UNSEEN" => status.unseen,
                "RECENT" => status.recent,
                "UIDNEXT" => self.store.next_uid().await,
                "UIDVALIDITY" => 1,
                _ => return ImapResponse::bad(tag, &format!("Invalid status item: {}", item)),
            };
            status_items.push((item.clone(), value));
        }

        format!(
            "{}{}",
            ImapResponse::status(mailbox_name, &status_items),
            ImapResponse::ok(tag, "STATUS completed")
        )
    }

    /// CLOSE expunges a read-write mailbox before leaving it
    async fn handle_close(&self, tag: &str, session: &mut ImapSession) -> String {
        let Some(mailbox) = session.selected.clone() else {
            return ImapResponse::no(tag, "No mailbox selected");
        };

        if !session.is_readonly() {
            if let Err(e) = self.store.expunge(&mailbox).await {
                return self.failure(tag, "CLOSE", e);
            }
        }

        session.close_mailbox();
        ImapResponse::ok(tag, "CLOSE completed")
    }

    /// UID to sequence number for everything in the mailbox
    async fn sequence_numbers(&self, session: &ImapSession) -> Result<HashMap<Uid, u64>> {
        let Some(mailbox) = &session.selected else {
            return Ok(HashMap::new());
        };
        let all = SequenceSet(vec![SequenceItem::Range(1, None)]);
        let items = self.store.fetch(mailbox, &all, false).await?;
        Ok(items
            .into_iter()
            .map(|item| (item.uid, item.sequence_number))
            .collect())
    }

    /// Items addressed by a sequence or UID set, each with its sequence number
    async fn resolve(
        &self,
        sequence: &SequenceSet,
        uid_mode: bool,
        session: &ImapSession,
    ) -> Result<Vec<(u64, IndexedItem)>> {
        let Some(mailbox) = &session.selected else {
            return Ok(Vec::new());
        };

        let items = self.store.fetch(mailbox, sequence, uid_mode).await?;
        if !uid_mode {
            return Ok(items
                .into_iter()
                .map(|item| (item.sequence_number, item))
                .collect());
        }

        let numbers = self.sequence_numbers(session).await?;
        Ok(items
            .into_iter()
            .filter_map(|item| numbers.get(&item.uid).map(|&seq| (seq, item)))
            .collect())
    }

    async fn handle_fetch(
        &self,
        tag: &str,
        sequence: &SequenceSet,
        items: &[FetchItem],
        uid_mode: bool,
        session: &ImapSession,
    ) -> String {
        let command = if uid_mode { "UID FETCH" } else { "FETCH" };
        if !session.is_selected() {
            return ImapResponse::no(tag, "No mailbox selected");
        }

        let messages = match self.resolve(sequence, uid_mode, session).await {
            Ok(messages) => messages,
            Err(e) => return self.failure(tag, command, e),
        };

        let mut wanted: Vec<FetchItem> = Vec::new();
        for item in items.iter().flat_map(FetchItem::expand) {
            if !wanted.contains(item) {
                wanted.push(*item);
            }
        }
        if uid_mode && !wanted.contains(&FetchItem::Uid) {
            wanted.push(FetchItem::Uid);
        }

        let mut response = String::new();
        for (seq, message) in messages {
            let mut fetch_items: Vec<(String, String)> = Vec::new();
            for item in &wanted {
                match item {
                    FetchItem::Flags => {
                        let message_flags = match self.store.flags(&message).await {
                            Ok(flags) => flags,
                            Err(e) => return self.failure(tag, command, e),
                        };
                        fetch_items.push((
                            "FLAGS".to_string(),
                            ImapResponse::format_flags(&message_flags),
                        ));
                    }
                    FetchItem::InternalDate => fetch_items.push((
                        "INTERNALDATE".to_string(),
                        ImapResponse::format_internal_date(&message.internal_date),
                    )),
                    FetchItem::Uid => {
                        fetch_items.push(("UID".to_string(), message.uid.to_string()))
                    }
                    FetchItem::All | FetchItem::Fast => {}
                }
            }
            response.push_str(&ImapResponse::fetch(seq, &fetch_items));
        }

        response.push_str(&ImapResponse::ok(tag, &format!("{} completed", command)));
        response
    }

    async fn handle_search(
        &self,
        tag: &str,
        keys: &[SearchKey],
        uid_mode: bool,
        session: &ImapSession,
    ) -> String {
        let command = if uid_mode { "UID SEARCH" } else { "SEARCH" };
        let Some(mailbox) = &session.selected else {
            return ImapResponse::no(tag, "No mailbox selected");
        };

        let uids = match self.store.search(mailbox, keys).await {
            Ok(uids) => uids,
            Err(e) => return self.failure(tag, command, e),
        };

        let results = if uid_mode {
            uids
        } else {
            let numbers = match self.sequence_numbers(session).await {
                Ok(numbers) => numbers,
                Err(e) => return self.failure(tag, command, e),
            };
            let mut results: Vec<u64> = uids
                .iter()
                .filter_map(|uid| numbers.get(uid).copied())
                .collect();
            results.sort_unstable();
            results
        };

        format!(
            "{}{}",
            ImapResponse::search(&results),
            ImapResponse::ok(tag, &format!("{} completed", command))
        )
    }

    async fn handle_store(
        &self,
        tag: &str,
        sequence: &SequenceSet,
        store_flags: &StoreFlags,
        uid_mode: bool,
        session: &ImapSession,
    ) -> String {
        let command = if uid_mode { "UID STORE" } else { "STORE" };
        if !session.is_selected() {
            return ImapResponse::no(tag, "No mailbox selected");
        }
        if session.is_readonly() {
            return ImapResponse::no(tag, "Mailbox is read-only");
        }

        let messages = match self.resolve(sequence, uid_mode, session).await {
            Ok(messages) => messages,
            Err(e) => return self.failure(tag, command, e),
        };

        let mut response = String::new();
        for (seq, message) in messages {
            let current = match self.store.flags(&message).await {
                Ok(flags) => flags,
                Err(e) => return self.failure(tag, command, e),
            };
            let updated = apply_flag_changes(&current, store_flags);

            if let Err(e) = self.store.store_flags(message.uid, &updated).await {
                return self.failure(tag, command, e);
            }

            if !store_flags.silent {
                let mut fetch_items =
                    vec![("FLAGS".to_string(), ImapResponse::format_flags(&updated))];
                if uid_mode {
                    fetch_items.push(("UID".to_string(), message.uid.to_string()));
                }
                response.push_str(&ImapResponse::fetch(seq, &fetch_items));
            }
        }

        response.push_str(&ImapResponse::ok(tag, &format!("{} completed", command)));
        response
    }

    fn failure(&self, tag: &str, command: &str, e: Error) -> String {
        warn!(code = e.code(), "{} failed: {}", command, e);
        match e {
            Error::NotImplemented(_) | Error::InvalidQuery(_) => {
                ImapResponse::bad(tag, &format!("{} failed: {}", command, e))
            }
            _ => ImapResponse::no(tag, &format!("{} failed: {}", command, e)),
        }
    }
}

/// New flag string for a STORE operation
fn apply_flag_changes(current: &str, store_flags: &StoreFlags) -> String {
    let changed = store_flags.flags.iter().map(String::as_str);
    match store_flags.operation {
        StoreOperation::Replace => flags::add("", changed),
        StoreOperation::Add => flags::add(current, changed),
        StoreOperation::Remove => flags::remove(current, changed),
    }
}
