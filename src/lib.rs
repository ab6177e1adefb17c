//! # Mailbroom
//!
//! An IMAP mail-sorting agent: fetches mail from a staging mailbox, matches
//! it against user-defined filter rules and moves it where it belongs.

pub mod agent;
pub mod config;
pub mod filters;
pub mod mail;
