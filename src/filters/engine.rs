//! Filter engine
//!
//! Binds one filter to an IMAP session and a source mailbox and applies it
//! to staged mail.

use crate::mail::{ImapSession, Mail, MailResult};

use super::{Command, FilterConfig};

/// Applies a single named filter to mail in a staging mailbox
pub struct MailFilter<'a> {
    session: &'a mut ImapSession,
    name: &'a str,
    filter: &'a FilterConfig,
    mailbox: &'a str,
}

impl<'a> MailFilter<'a> {
    pub fn new(
        session: &'a mut ImapSession,
        name: &'a str,
        filter: &'a FilterConfig,
        mailbox: &'a str,
    ) -> Self {
        Self {
            session,
            name,
            filter,
            mailbox,
        }
    }

    /// Check the filter rules against a mail, applying the filter commands
    /// on match
    ///
    /// A command failure after a declared match is an error: mail must never
    /// silently stay unsorted while the filter reports success.
    pub fn check_rules_match(&mut self, mail: &Mail) -> MailResult<bool> {
        log::debug!(
            "Checking whether mail message-id=\"{}\" subject=\"{}\" matches filter {}",
            mail.message_id(),
            mail.get_header("subject").unwrap_or(""),
            self.name
        );

        if !self.filter.matches(mail) {
            return Ok(false);
        }

        log::info!(
            "Filter {} matches mail with Message-Id {}, applying commands",
            self.name,
            mail.message_id()
        );
        self.apply_commands(mail)?;
        Ok(true)
    }

    /// Run the filter commands, in order, against a matched mail
    fn apply_commands(&mut self, mail: &Mail) -> MailResult<()> {
        for command in &self.filter.commands {
            match command {
                Command::Move {
                    target,
                    set_flags,
                    add_flags,
                } => {
                    self.session.move_mail(
                        self.mailbox,
                        target,
                        &[mail.message_id().to_string()],
                        add_flags.as_deref(),
                        Some(set_flags.as_slice()),
                    )?;
                }
            }
        }
        Ok(())
    }
}
