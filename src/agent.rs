//! Account processing loop
//!
//! Sequentially polls every enabled account: staged mail is run through the
//! account's filters in name order until one matches, and whatever is left
//! in the staging mailbox afterwards is moved to the fallback mailbox.

use std::collections::BTreeMap;
use std::thread;
use std::time::Duration;

use crate::config::{natural_sort, AccountConfig, Config};
use crate::filters::{FilterConfig, MailFilter};
use crate::mail::{ImapSession, MailError, MailResult, SessionConfig};

pub struct Agent {
    config: Config,
}

impl Agent {
    pub fn new(config: Config) -> Self {
        Self { config }
    }

    /// Run passes over all accounts until stopped, sleeping the configured
    /// poll interval in between; `once` runs a single pass
    pub fn run(&self, once: bool) -> MailResult<()> {
        let interval = Duration::from_secs(self.config.settings.poll_interval_secs);
        loop {
            self.run_pass()?;
            if once {
                break;
            }
            log::debug!("Sleeping {}s until the next pass", interval.as_secs());
            thread::sleep(interval);
        }
        Ok(())
    }

    /// One pass over all enabled accounts, in natural name order
    ///
    /// An account that cannot be reached is skipped for this pass; a filter
    /// whose commands fail after a match aborts the pass.
    pub fn run_pass(&self) -> MailResult<()> {
        let no_filters = BTreeMap::new();
        for name in natural_sort(self.config.accounts.keys()) {
            let account = match self.config.accounts.get(&name) {
                Some(account) => account,
                None => continue,
            };
            if !account.enabled {
                log::debug!("Account {} is disabled, skipping", name);
                continue;
            }
            let filters = self.config.filters.get(&name).unwrap_or(&no_filters);

            if let Err(err) = self.process_account(&name, account, filters) {
                match err {
                    MailError::Connection(_)
                    | MailError::Authentication(_)
                    | MailError::Timeout(_) => {
                        log::error!("Skipping account {} for this pass: {}", name, err);
                    }
                    err => return Err(err),
                }
            }
        }
        Ok(())
    }

    fn process_account(
        &self,
        name: &str,
        account: &AccountConfig,
        filters: &BTreeMap<String, FilterConfig>,
    ) -> MailResult<()> {
        log::info!("Processing account {}", name);
        let mut session = ImapSession::new(self.session_config(account));
        session.connect()?;

        let staging = account.staging_mailbox.as_str();
        let uids = session.search_mails(staging, &account.staging_search)?;
        log::debug!("Found {} staged mails in {}", uids.len(), staging);

        let mut mails: Vec<_> = session.fetch_mails(&uids, staging)?.into_iter().collect();
        mails.sort_by_key(|(uid, _)| *uid);

        let filter_order = natural_sort(filters.keys());
        for (_uid, mail) in &mails {
            for filter_name in &filter_order {
                let filter = match filters.get(filter_name) {
                    Some(filter) => filter,
                    None => continue,
                };
                let mut mail_filter = MailFilter::new(&mut session, filter_name, filter, staging);
                if mail_filter.check_rules_match(mail)? {
                    break;
                }
            }
        }

        // whatever is still staged did not match any filter
        log::info!(
            "Moving mails that matched no filter from {} to {}",
            staging,
            account.sort_mailbox
        );
        let leftover_uids = session.search_mails(staging, "ALL")?;
        let mut leftover: Vec<_> = session
            .fetch_mails(&leftover_uids, staging)?
            .into_iter()
            .collect();
        leftover.sort_by_key(|(uid, _)| *uid);
        for (_uid, mail) in &leftover {
            session.move_mail(
                staging,
                &account.sort_mailbox,
                &[mail.message_id().to_string()],
                None,
                Some(account.unmatched_flags.as_slice()),
            )?;
        }

        session.disconnect()
    }

    fn session_config(&self, account: &AccountConfig) -> SessionConfig {
        SessionConfig {
            host: account.host.clone(),
            port: account.port(),
            security: account.security,
            verify_certs: account.verify_certs,
            username: account.username.clone(),
            password: account.password.clone(),
            timeout: account.timeout_secs.map(Duration::from_secs),
            test: self.config.settings.test,
        }
    }
}
