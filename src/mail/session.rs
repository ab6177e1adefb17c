//! IMAP session
//!
//! Wraps a single authenticated connection to one account. SELECT state on
//! an IMAP connection is global and fragile, so every mailbox-scoped
//! operation performs a fresh SELECT before touching the mailbox instead of
//! assuming earlier state survived.
//!
//! Messages are addressed across mailboxes by their Message-Id header: UIDs
//! are mailbox-local and neither COPY nor APPEND reliably report the UID a
//! message ends up with (RFC 4315), so the destination is re-searched after
//! either operation.

use std::collections::HashMap;
use std::io::ErrorKind;
use std::net::TcpStream;
use std::thread;
use std::time::Duration;

use imap::types::{Fetch, Flag, Name, NameAttribute};
use native_tls::{TlsConnector, TlsStream};

use super::message::Mail;
use super::{MailError, MailResult};
use crate::config::SecurityType;

const CONNECT_RETRY_DELAY: Duration = Duration::from_secs(2);

/// Connection parameters for one IMAP account
#[derive(Debug, Clone)]
pub struct SessionConfig {
    pub host: String,
    pub port: u16,
    pub security: SecurityType,
    pub verify_certs: bool,
    pub username: String,
    pub password: String,
    pub timeout: Option<Duration>,
    /// Dry-run mode: mutating operations only log what they would do
    pub test: bool,
}

/// One mailbox as reported by LIST
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MailboxInfo {
    pub name: String,
    pub delimiter: String,
    pub flags: Vec<String>,
}

/// Mailbox metadata reported by SELECT
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MailboxStatus {
    pub flags: Vec<String>,
    pub exists: u32,
    pub recent: u32,
    pub unseen: Option<u32>,
    pub uid_next: Option<u32>,
    pub uid_validity: Option<u32>,
}

/// IMAP session for a single account
pub struct ImapSession {
    config: SessionConfig,
    session: Option<imap::Session<TlsStream<TcpStream>>>,
}

impl ImapSession {
    /// Create an unconnected session with the given configuration
    pub fn new(config: SessionConfig) -> Self {
        Self {
            config,
            session: None,
        }
    }

    /// Connect, login and verify the session with a NOOP probe
    ///
    /// Everything except an authentication failure is retried exactly once
    /// after a short delay.
    pub fn connect(&mut self) -> MailResult<()> {
        match self.connect_once() {
            Ok(()) => Ok(()),
            // credentials and local configuration won't change between
            // attempts, everything else might be transient
            Err(err @ (MailError::Authentication(_) | MailError::Config(_))) => Err(err),
            Err(err) => {
                log::error!(
                    "Connecting to {} failed ({}), trying one more time",
                    self.config.host,
                    err
                );
                thread::sleep(CONNECT_RETRY_DELAY);
                self.connect_once()
            }
        }
    }

    fn connect_once(&mut self) -> MailResult<()> {
        let tls = TlsConnector::builder()
            .danger_accept_invalid_certs(!self.config.verify_certs)
            .build()
            .map_err(|e| MailError::Connection(e.to_string()))?;

        let address = (self.config.host.as_str(), self.config.port);
        let client = match self.config.security {
            SecurityType::Ssl => {
                log::debug!(
                    "Establishing IMAP connection using SSL/{} to {}",
                    self.config.port,
                    self.config.host
                );
                // manual connect so socket timeouts are in place before the
                // TLS handshake
                let stream =
                    TcpStream::connect(address).map_err(|e| connection_error(e.into()))?;
                if let Some(timeout) = self.config.timeout {
                    stream.set_read_timeout(Some(timeout)).ok();
                    stream.set_write_timeout(Some(timeout)).ok();
                }
                let tls_stream = tls
                    .connect(&self.config.host, stream)
                    .map_err(|e| MailError::Connection(e.to_string()))?;
                imap::Client::new(tls_stream)
            }
            SecurityType::Starttls => {
                log::debug!(
                    "Establishing IMAP connection using STARTTLS/{} to {}",
                    self.config.port,
                    self.config.host
                );
                imap::connect_starttls(address, &self.config.host, &tls)
                    .map_err(|e| connection_error(imap_error(e)))?
            }
            SecurityType::None => {
                return Err(MailError::Config(
                    "insecure connections are not supported".to_string(),
                ))
            }
        };

        let session = client
            .login(&self.config.username, &self.config.password)
            .map_err(|e| MailError::Authentication(e.0.to_string()))?;
        self.session = Some(session);

        // the library can report a login without the session actually being
        // usable, so probe it before declaring success
        self.noop()?;
        log::info!(
            "Connected to IMAP server {} as {}",
            self.config.host,
            self.config.username
        );
        Ok(())
    }

    /// Connect and immediately log out again
    pub fn test_connection(&mut self) -> MailResult<()> {
        self.connect()?;
        self.disconnect()
    }

    /// Log out and drop the connection
    pub fn disconnect(&mut self) -> MailResult<()> {
        if let Some(mut session) = self.session.take() {
            session.logout().map_err(imap_error)?;
        }
        Ok(())
    }

    /// NOOP probe against the server
    pub fn noop(&mut self) -> MailResult<()> {
        self.session()?.noop().map_err(imap_error)
    }

    fn session(&mut self) -> MailResult<&mut imap::Session<TlsStream<TcpStream>>> {
        self.session.as_mut().ok_or(MailError::NotConnected)
    }

    /// List mailboxes matching a pattern under a directory prefix
    pub fn list_mailboxes(
        &mut self,
        directory: &str,
        pattern: &str,
    ) -> MailResult<Vec<MailboxInfo>> {
        let names = self
            .session()?
            .list(Some(directory), Some(pattern))
            .map_err(imap_error)?;
        Ok(names.iter().map(mailbox_info).collect())
    }

    /// SELECT a mailbox and return its metadata
    ///
    /// A "mailbox does not exist" server reply maps to [`MailError::NotFound`]
    /// instead of a generic protocol error.
    pub fn select_mailbox(&mut self, mailbox: &str) -> MailResult<MailboxStatus> {
        log::debug!("Switching to mailbox {}", mailbox);
        match self.session()?.select(mailbox) {
            Ok(status) => Ok(MailboxStatus {
                flags: status.flags.iter().map(flag_name).collect(),
                exists: status.exists,
                recent: status.recent,
                unseen: status.unseen,
                uid_next: status.uid_next,
                uid_validity: status.uid_validity,
            }),
            Err(err) => {
                let message = err.to_string();
                if is_missing_mailbox(&message) {
                    Err(MailError::NotFound(format!(
                        "mailbox {}: {}",
                        mailbox, message
                    )))
                } else {
                    Err(imap_error(err))
                }
            }
        }
    }

    /// Search a mailbox, returning matching UIDs in ascending order
    pub fn search_mails(&mut self, mailbox: &str, criteria: &str) -> MailResult<Vec<u32>> {
        self.select_mailbox(mailbox)?;
        log::debug!(
            "Searching for mails in mailbox {} with criteria '{}'",
            mailbox,
            criteria
        );
        let found = self.session()?.uid_search(criteria).map_err(imap_error)?;
        let mut uids: Vec<u32> = found.into_iter().collect();
        uids.sort_unstable();
        Ok(uids)
    }

    /// Fetch mails by UID and parse them
    ///
    /// UIDs without a matching message are simply absent from the result.
    pub fn fetch_mails(&mut self, uids: &[u32], mailbox: &str) -> MailResult<HashMap<u32, Mail>> {
        self.select_mailbox(mailbox)?;
        log::debug!("Fetching mails with uids {:?} from {}", uids, mailbox);

        let mut mails = HashMap::new();
        for uid in uids {
            let messages = self
                .session()?
                .uid_fetch(uid.to_string(), "(UID BODY[])")
                .map_err(imap_error)?;
            for message in messages.iter() {
                let raw = match message.body() {
                    Some(raw) => raw,
                    None => continue,
                };
                mails.insert(message.uid.unwrap_or(*uid), Mail::from_rfc822(raw)?);
            }
        }
        Ok(mails)
    }

    /// Retrieve flags per UID; a UID missing from the server response fails
    /// the whole call
    pub fn get_mailflags(
        &mut self,
        uids: &[u32],
        mailbox: &str,
    ) -> MailResult<HashMap<u32, Vec<String>>> {
        self.select_mailbox(mailbox)?;
        let responses = self
            .session()?
            .uid_fetch(uid_set(uids), "(UID FLAGS)")
            .map_err(imap_error)?;
        flags_by_uid(uids, &responses)
    }

    /// Overwrite flags on mails, returning the resulting flags per UID
    ///
    /// In test mode this only logs the intent and returns no payload.
    pub fn set_mailflags(
        &mut self,
        uids: &[u32],
        mailbox: &str,
        flags: &[String],
    ) -> MailResult<Option<HashMap<u32, Vec<String>>>> {
        if self.config.test {
            log::info!("Would have set flags {:?} on mails with uids {:?}", flags, uids);
            return Ok(None);
        }
        self.select_mailbox(mailbox)?;
        log::debug!("Setting flags {:?} on mails with uids {:?}", flags, uids);
        let responses = self
            .session()?
            .uid_store(uid_set(uids), format!("FLAGS ({})", flags.join(" ")))
            .map_err(imap_error)?;
        Ok(Some(flags_by_uid(uids, &responses)?))
    }

    /// Add flags on mails, returning the resulting flags per UID
    ///
    /// In test mode this only logs the intent and returns no payload.
    pub fn add_mailflags(
        &mut self,
        uids: &[u32],
        mailbox: &str,
        flags: &[String],
    ) -> MailResult<Option<HashMap<u32, Vec<String>>>> {
        if self.config.test {
            log::info!("Would have added flags {:?} on mails with uids {:?}", flags, uids);
            return Ok(None);
        }
        self.select_mailbox(mailbox)?;
        log::debug!("Adding flags {:?} on mails with uids {:?}", flags, uids);
        let responses = self
            .session()?
            .uid_store(uid_set(uids), format!("+FLAGS ({})", flags.join(" ")))
            .map_err(imap_error)?;
        Ok(Some(flags_by_uid(uids, &responses)?))
    }

    /// APPEND a mail and return the UID the server assigned to it
    ///
    /// Per RFC 4315 the append response cannot be trusted to carry the new
    /// UID, so the mailbox is re-searched for the mail's Message-Id.
    pub fn add_mail(&mut self, mailbox: &str, mail: &mut Mail, flags: &[String]) -> MailResult<u32> {
        log::debug!("Adding a mail into mailbox {}", mailbox);
        let message_id = mail.message_id().to_string();
        let content = mail.native()?.to_vec();

        self.session()?
            .append(mailbox, &content)
            .map_err(imap_error)?;

        let uids = self.search_mails(mailbox, &message_id_criteria(&message_id))?;
        let uid = uids.first().copied().ok_or_else(|| {
            MailError::NotFound(format!(
                "appended mail {} not found in {}",
                message_id, mailbox
            ))
        })?;

        if !flags.is_empty() {
            self.add_mailflags(&[uid], mailbox, flags)?;
        }
        Ok(uid)
    }

    /// Move mails between mailboxes; copy plus delete-and-expunge
    pub fn move_mail(
        &mut self,
        source: &str,
        destination: &str,
        message_ids: &[String],
        add_flags: Option<&[String]>,
        set_flags: Option<&[String]>,
    ) -> MailResult<Option<Vec<u32>>> {
        self.copy_mails(source, destination, message_ids, true, true, add_flags, set_flags)
    }

    /// Copy mails identified by Message-Id from one mailbox into another
    ///
    /// The destination is created when missing, so callers never have to
    /// pre-provision mailboxes. Source UIDs are resolved by Message-Id
    /// before the COPY and destination UIDs re-resolved afterwards; any
    /// resolution failure aborts before mail is touched or flags applied.
    /// Returns the destination UIDs, or no payload in test mode.
    #[allow(clippy::too_many_arguments)]
    pub fn copy_mails(
        &mut self,
        source: &str,
        destination: &str,
        message_ids: &[String],
        delete_old: bool,
        expunge: bool,
        add_flags: Option<&[String]>,
        set_flags: Option<&[String]>,
    ) -> MailResult<Option<Vec<u32>>> {
        if self.config.test {
            if delete_old {
                log::info!(
                    "Would have moved mails with Message-Ids {:?} from {} to {}",
                    message_ids,
                    source,
                    destination
                );
            } else {
                log::info!(
                    "Would have copied mails with Message-Ids {:?} from {} to {}",
                    message_ids,
                    source,
                    destination
                );
            }
            return Ok(None);
        }

        if delete_old {
            log::debug!(
                "Moving mails with Message-Ids {:?} from {} to {}",
                message_ids,
                source,
                destination
            );
        } else {
            log::debug!(
                "Copying mails with Message-Ids {:?} from {} to {}",
                message_ids,
                source,
                destination
            );
        }

        if !self.mailbox_exists(destination)? {
            log::info!(
                "Destination mailbox {} does not exist, creating it",
                destination
            );
            self.create_mailbox(destination)?;
        }

        let mut uids = Vec::with_capacity(message_ids.len());
        for message_id in message_ids {
            let found = self.search_mails(source, &message_id_criteria(message_id))?;
            match found.first() {
                Some(uid) => uids.push(*uid),
                None => {
                    log::error!(
                        "Failed to determine uid for mail with Message-Id {} in {}",
                        message_id,
                        source
                    );
                    return Err(MailError::NotFound(format!(
                        "no mail with Message-Id {} in {}",
                        message_id, source
                    )));
                }
            }
        }

        // mailbox state may have changed while resolving uids
        self.select_mailbox(source)?;
        self.session()?
            .uid_copy(uid_set(&uids), destination)
            .map_err(imap_error)?;

        if delete_old {
            self.delete_mails(&uids, source)?;
            if expunge {
                self.expunge(source)?;
            }
        }

        let mut destination_uids = Vec::with_capacity(message_ids.len());
        for message_id in message_ids {
            let found = self.search_mails(destination, &message_id_criteria(message_id))?;
            match found.first() {
                Some(uid) => destination_uids.push(*uid),
                None => {
                    log::error!(
                        "Failed to determine uid for mail with Message-Id {} in {}",
                        message_id,
                        destination
                    );
                    return Err(MailError::NotFound(format!(
                        "no mail with Message-Id {} in {}",
                        message_id, destination
                    )));
                }
            }
        }

        if let Some(flags) = set_flags {
            self.set_mailflags(&destination_uids, destination, flags)?;
        }
        if let Some(flags) = add_flags {
            if !flags.is_empty() {
                self.add_mailflags(&destination_uids, destination, flags)?;
            }
        }

        Ok(Some(destination_uids))
    }

    /// Permanently remove mails flagged deleted from a mailbox
    pub fn expunge(&mut self, mailbox: &str) -> MailResult<()> {
        self.select_mailbox(mailbox)?;
        log::debug!("Expunging mails from mailbox {}", mailbox);
        self.session()?.expunge().map_err(imap_error)?;
        Ok(())
    }

    /// Create a mailbox
    pub fn create_mailbox(&mut self, mailbox: &str) -> MailResult<()> {
        log::debug!("Creating mailbox {}", mailbox);
        self.session()?.create(mailbox).map_err(imap_error)
    }

    /// Whether a mailbox exists on the server
    pub fn mailbox_exists(&mut self, mailbox: &str) -> MailResult<bool> {
        let names = self
            .session()?
            .list(Some(""), Some(mailbox))
            .map_err(imap_error)?;
        Ok(names.iter().any(|name| name.name() == mailbox))
    }

    /// Flag mails deleted, returning the resulting flags per UID
    pub fn delete_mails(
        &mut self,
        uids: &[u32],
        mailbox: &str,
    ) -> MailResult<HashMap<u32, Vec<String>>> {
        self.select_mailbox(mailbox)?;
        log::debug!("Deleting mails with uids {:?}", uids);
        let responses = self
            .session()?
            .uid_store(uid_set(uids), "+FLAGS (\\Deleted)")
            .map_err(imap_error)?;
        flags_by_uid(uids, &responses)
    }
}

/// SEARCH criteria selecting a single mail by Message-Id
fn message_id_criteria(message_id: &str) -> String {
    format!("HEADER Message-Id \"{}\"", message_id)
}

fn uid_set(uids: &[u32]) -> String {
    uids.iter()
        .map(|uid| uid.to_string())
        .collect::<Vec<_>>()
        .join(",")
}

/// Collect per-UID flags out of STORE/FETCH responses, failing when any
/// requested UID is missing from the response
fn flags_by_uid(uids: &[u32], responses: &[Fetch]) -> MailResult<HashMap<u32, Vec<String>>> {
    let mut flags: HashMap<u32, Vec<String>> = HashMap::new();
    for response in responses {
        if let Some(uid) = response.uid {
            flags.insert(uid, response.flags().iter().map(flag_name).collect());
        }
    }
    for uid in uids {
        if !flags.contains_key(uid) {
            log::error!("No flag response for mail with uid={}", uid);
            return Err(MailError::NotFound(format!(
                "no flags returned for uid {}",
                uid
            )));
        }
    }
    Ok(flags)
}

fn flag_name(flag: &Flag) -> String {
    match flag {
        Flag::Seen => "\\Seen".to_string(),
        Flag::Answered => "\\Answered".to_string(),
        Flag::Flagged => "\\Flagged".to_string(),
        Flag::Deleted => "\\Deleted".to_string(),
        Flag::Draft => "\\Draft".to_string(),
        Flag::Recent => "\\Recent".to_string(),
        Flag::MayCreate => "\\*".to_string(),
        Flag::Custom(name) => name.to_string(),
    }
}

fn attribute_name(attribute: &NameAttribute) -> String {
    match attribute {
        NameAttribute::NoInferiors => "\\Noinferiors".to_string(),
        NameAttribute::NoSelect => "\\Noselect".to_string(),
        NameAttribute::Marked => "\\Marked".to_string(),
        NameAttribute::Unmarked => "\\Unmarked".to_string(),
        NameAttribute::Custom(name) => name.to_string(),
    }
}

fn mailbox_info(name: &Name) -> MailboxInfo {
    MailboxInfo {
        name: name.name().to_string(),
        delimiter: name.delimiter().unwrap_or("/").to_string(),
        flags: name.attributes().iter().map(attribute_name).collect(),
    }
}

/// Server replies announcing a missing mailbox, as worded by the common
/// server implementations
fn is_missing_mailbox(message: &str) -> bool {
    let message = message.to_lowercase();
    message.contains("doesn't exist")
        || message.contains("does not exist")
        || message.contains("nonexistent")
        || message.contains("unknown mailbox")
}

fn imap_error(err: imap::Error) -> MailError {
    match err {
        imap::Error::Io(e) if matches!(e.kind(), ErrorKind::TimedOut | ErrorKind::WouldBlock) => {
            log::error!("IMAP I/O timeout: {}", e);
            MailError::Timeout(e.to_string())
        }
        imap::Error::Io(e) => {
            log::error!("IMAP I/O error: {}", e);
            MailError::Io(e)
        }
        other => {
            log::error!("IMAP command failed: {}", other);
            MailError::Imap(other.to_string())
        }
    }
}

fn connection_error(err: MailError) -> MailError {
    match err {
        MailError::Timeout(message) => MailError::Timeout(message),
        other => MailError::Connection(other.to_string()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn test_config() -> SessionConfig {
        SessionConfig {
            host: "imap.example.com".to_string(),
            port: 993,
            security: SecurityType::Ssl,
            verify_certs: true,
            username: "test@example.com".to_string(),
            password: "secret".to_string(),
            timeout: Some(Duration::from_secs(5)),
            test: false,
        }
    }

    #[test]
    fn test_uid_set_formatting() {
        assert_eq!(uid_set(&[7]), "7");
        assert_eq!(uid_set(&[1, 2, 40]), "1,2,40");
        assert_eq!(uid_set(&[]), "");
    }

    #[test]
    fn test_message_id_criteria() {
        assert_eq!(
            message_id_criteria("<a@b>"),
            "HEADER Message-Id \"<a@b>\""
        );
    }

    #[test]
    fn test_missing_mailbox_detection() {
        assert!(is_missing_mailbox("select failed: Mailbox doesn't exist: X"));
        assert!(is_missing_mailbox("NO [NONEXISTENT] Unknown Mailbox: X"));
        assert!(is_missing_mailbox("Mailbox does not exist"));
        assert!(!is_missing_mailbox("invalid messageset"));
    }

    #[test]
    fn test_operations_require_connection() {
        let mut session = ImapSession::new(test_config());
        assert!(matches!(session.noop(), Err(MailError::NotConnected)));
        assert!(matches!(
            session.select_mailbox("INBOX"),
            Err(MailError::NotConnected)
        ));
    }

    #[test]
    fn test_disconnect_without_connection_is_fine() {
        let mut session = ImapSession::new(test_config());
        assert!(session.disconnect().is_ok());
    }

    #[test]
    fn test_insecure_mode_is_refused() {
        let mut config = test_config();
        config.security = SecurityType::None;
        let mut session = ImapSession::new(config);
        assert!(matches!(session.connect(), Err(MailError::Config(_))));
    }

    #[test]
    fn test_mutations_are_noops_in_test_mode() {
        let mut config = test_config();
        config.test = true;
        // never connected: test mode must short-circuit before any I/O
        let mut session = ImapSession::new(config);

        assert_eq!(
            session
                .set_mailflags(&[1], "INBOX", &["\\Seen".to_string()])
                .unwrap(),
            None
        );
        assert_eq!(
            session
                .add_mailflags(&[1], "INBOX", &["\\Seen".to_string()])
                .unwrap(),
            None
        );
        assert_eq!(
            session
                .move_mail("A", "B", &["<x@y>".to_string()], None, None)
                .unwrap(),
            None
        );
        assert_eq!(
            session
                .copy_mails("A", "B", &["<x@y>".to_string()], false, false, None, None)
                .unwrap(),
            None
        );
    }
}
