//! Inbound mailbox: protocol client, message parsing, RFP matching, polling.

pub mod client;
pub mod matcher;
pub mod parse;
pub mod poller;

pub use client::{ImapMailbox, MailboxClient, MailboxSession, RawMessage};
pub use matcher::{MatchMethod, MatchOutcome, Matcher};
pub use parse::{InboundEmail, parse_message};
pub use poller::{CycleReport, IngestOutcome, IngestProcessor, MailboxPoller, PollerHandle, PollerState};
