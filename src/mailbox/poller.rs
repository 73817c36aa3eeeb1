//! Mailbox poller: connect, fetch unseen, parse, ingest, mark seen, log out.
//!
//! One cycle runs at startup and then one per interval. Cycles never overlap
//! and messages within a cycle are handled one at a time, in fetch order.
//! A message is marked seen once ingestion reaches a terminal outcome
//! (created, duplicate, no vendor, no RFP). Messages that fail to parse or
//! hit a processing error stay unseen and are retried next cycle.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tracing::{debug, error, info, warn};

use crate::config::MailboxConfig;
use crate::error::IngestError;
use crate::mailbox::client::{MailboxClient, MailboxSession};
use crate::mailbox::matcher::{MatchOutcome, Matcher};
use crate::mailbox::parse::{InboundEmail, parse_message};
use crate::model::{NewProposal, Proposal};
use crate::proposals::{CreateOutcome, ProposalManager};
use crate::store::Database;

/// Where the poller is in its cycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PollerState {
    Idle,
    Connecting,
    Fetching,
    Processing,
    Closing,
}

/// Terminal result of ingesting one email.
#[derive(Debug, Clone)]
pub enum IngestOutcome {
    Created(Proposal),
    Duplicate(Proposal),
    NoVendorMatch,
    NoRfpMatch,
}

/// Matches emails and hands them to the proposal manager.
pub struct IngestProcessor {
    matcher: Matcher,
    manager: Arc<ProposalManager>,
}

impl IngestProcessor {
    pub fn new(db: Arc<dyn Database>, manager: Arc<ProposalManager>) -> Self {
        Self {
            matcher: Matcher::new(db),
            manager,
        }
    }

    pub async fn process(&self, email: &InboundEmail) -> Result<IngestOutcome, IngestError> {
        let (vendor, rfp, via) = match self.matcher.resolve(email).await? {
            MatchOutcome::Matched { vendor, rfp, via } => (vendor, rfp, via),
            MatchOutcome::NoVendorMatch => {
                info!(sender = %email.sender, "No vendor for sender, skipping");
                return Ok(IngestOutcome::NoVendorMatch);
            }
            MatchOutcome::NoRfpMatch => {
                info!(sender = %email.sender, subject = %email.subject, "No matching RFP, skipping");
                return Ok(IngestOutcome::NoRfpMatch);
            }
        };

        let mut new = NewProposal::new(rfp.id, vendor.id, email.body.clone())
            .with_received_at(email.received_at);
        if !email.subject.is_empty() {
            new = new.with_subject(email.subject.clone());
        }

        match self.manager.create(new).await? {
            CreateOutcome::Created(p) => {
                info!(
                    proposal_id = %p.id,
                    vendor = %vendor.name,
                    rfp = %rfp.title,
                    via = %via,
                    "Proposal created from email"
                );
                Ok(IngestOutcome::Created(p))
            }
            CreateOutcome::Existing(p) => {
                info!(
                    proposal_id = %p.id,
                    vendor = %vendor.name,
                    rfp = %rfp.title,
                    "Proposal already exists, skipping"
                );
                Ok(IngestOutcome::Duplicate(p))
            }
        }
    }
}

/// Counters for one poll cycle.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CycleReport {
    pub fetched: usize,
    pub created: usize,
    pub duplicates: usize,
    pub no_vendor: usize,
    pub no_rfp: usize,
    pub parse_failures: usize,
    pub errors: usize,
    pub connection_failed: bool,
    /// Stop was requested before every message was handled.
    pub aborted: bool,
}

impl CycleReport {
    /// Messages marked seen this cycle.
    pub fn completed(&self) -> usize {
        self.created + self.duplicates + self.no_vendor + self.no_rfp
    }
}

/// Handle to a running poller.
pub struct PollerHandle {
    stop: watch::Sender<bool>,
    state: watch::Receiver<PollerState>,
    report: watch::Receiver<Option<CycleReport>>,
    task: JoinHandle<()>,
}

impl PollerHandle {
    pub fn state(&self) -> PollerState {
        *self.state.borrow()
    }

    /// Report of the most recently finished cycle.
    pub fn last_report(&self) -> Option<CycleReport> {
        self.report.borrow().clone()
    }

    /// Wait until a cycle finishes and return its report.
    pub async fn next_report(&mut self) -> Option<CycleReport> {
        self.report.changed().await.ok()?;
        self.report.borrow_and_update().clone()
    }

    /// Stop polling and wait for the current session to close.
    pub async fn stop(self) {
        let _ = self.stop.send(true);
        if let Err(e) = self.task.await {
            error!(error = %e, "Mailbox poller task failed");
        }
    }
}

pub struct MailboxPoller {
    client: Arc<dyn MailboxClient>,
    processor: Arc<IngestProcessor>,
    interval: Duration,
    state: watch::Sender<PollerState>,
    report: watch::Sender<Option<CycleReport>>,
}

impl MailboxPoller {
    pub fn spawn(
        config: &MailboxConfig,
        client: Arc<dyn MailboxClient>,
        processor: Arc<IngestProcessor>,
    ) -> PollerHandle {
        let (stop_tx, stop_rx) = watch::channel(false);
        let (state_tx, state_rx) = watch::channel(PollerState::Idle);
        let (report_tx, report_rx) = watch::channel(None);

        let poller = Self {
            client,
            processor,
            interval: config.poll_interval,
            state: state_tx,
            report: report_tx,
        };
        info!(
            host = %config.host,
            folder = %config.folder,
            interval_ms = config.poll_interval.as_millis() as u64,
            "Mailbox poller started"
        );
        let task = tokio::spawn(poller.run(stop_rx));

        PollerHandle {
            stop: stop_tx,
            state: state_rx,
            report: report_rx,
            task,
        }
    }

    async fn run(self, mut stop: watch::Receiver<bool>) {
        let mut tick = tokio::time::interval(self.interval);
        tick.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                biased;
                _ = stop.changed() => break,
                _ = tick.tick() => {}
            }
            if *stop.borrow() {
                break;
            }

            let report = self.poll_once(&stop).await;
            if report.fetched > 0 || report.connection_failed {
                info!(
                    fetched = report.fetched,
                    created = report.created,
                    duplicates = report.duplicates,
                    no_vendor = report.no_vendor,
                    no_rfp = report.no_rfp,
                    parse_failures = report.parse_failures,
                    errors = report.errors,
                    "Mailbox poll cycle finished"
                );
            } else {
                debug!("Mailbox poll cycle finished, nothing new");
            }
            let aborted = report.aborted;
            self.report.send_replace(Some(report));
            if aborted {
                break;
            }
        }

        self.state.send_replace(PollerState::Idle);
        info!("Mailbox poller stopped");
    }

    fn enter(&self, state: PollerState) {
        self.state.send_replace(state);
    }

    async fn poll_once(&self, stop: &watch::Receiver<bool>) -> CycleReport {
        let mut report = CycleReport::default();

        self.enter(PollerState::Connecting);
        let mut session = match self.client.connect().await {
            Ok(session) => session,
            Err(e) => {
                warn!(error = %e, "Mailbox connection failed, skipping cycle");
                report.connection_failed = true;
                self.enter(PollerState::Idle);
                return report;
            }
        };

        self.process_session(session.as_mut(), stop, &mut report).await;

        self.enter(PollerState::Closing);
        if let Err(e) = session.logout().await {
            warn!(error = %e, "Mailbox logout failed");
        }
        drop(session);

        self.enter(PollerState::Idle);
        report
    }

    async fn process_session(
        &self,
        session: &mut dyn MailboxSession,
        stop: &watch::Receiver<bool>,
        report: &mut CycleReport,
    ) {
        self.enter(PollerState::Fetching);
        let messages = match session.fetch_unseen().await {
            Ok(messages) => messages,
            Err(e) => {
                error!(error = %e, "Fetching unseen messages failed");
                report.errors += 1;
                return;
            }
        };
        report.fetched = messages.len();
        if !messages.is_empty() {
            debug!(count = messages.len(), "Fetched unseen messages");
        }

        self.enter(PollerState::Processing);
        for raw in messages {
            if *stop.borrow() {
                info!("Stop requested, abandoning rest of batch");
                report.aborted = true;
                return;
            }

            let email = match parse_message(&raw) {
                Ok(email) => email,
                Err(e) => {
                    warn!(uid = raw.uid, error = %e, "Skipping unparseable message");
                    report.parse_failures += 1;
                    continue;
                }
            };

            match self.processor.process(&email).await {
                Ok(outcome) => {
                    match outcome {
                        IngestOutcome::Created(_) => report.created += 1,
                        IngestOutcome::Duplicate(_) => report.duplicates += 1,
                        IngestOutcome::NoVendorMatch => report.no_vendor += 1,
                        IngestOutcome::NoRfpMatch => report.no_rfp += 1,
                    }
                    if let Err(e) = session.mark_seen(raw.uid).await {
                        warn!(uid = raw.uid, error = %e, "Failed to mark message seen");
                    }
                }
                Err(e) => {
                    error!(uid = raw.uid, sender = %email.sender, error = %e, "Ingesting message failed");
                    report.errors += 1;
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use std::collections::HashSet;
    use std::sync::Mutex;
    use std::sync::atomic::{AtomicUsize, Ordering};

    use async_trait::async_trait;
    use tokio::sync::Notify;

    use super::*;
    use crate::analysis::{ProposalAnalyzer, RfpSummary};
    use crate::error::{LlmError, MailboxError};
    use crate::mailbox::client::RawMessage;
    use crate::model::{NewRfp, NewVendor, ProposalAnalysis, ProposalStatus, RfpStatus};
    use crate::store::LibSqlBackend;

    struct FixedAnalyzer;

    #[async_trait]
    impl ProposalAnalyzer for FixedAnalyzer {
        async fn analyze(&self, _: &RfpSummary, _: &str) -> Result<ProposalAnalysis, LlmError> {
            Ok(ProposalAnalysis {
                proposed_price: Some(500.0),
                delivery_days: Some(7),
                warranty: None,
                payment_terms: None,
                item_pricing: vec![],
                strengths: vec![],
                weaknesses: vec![],
                score: 70.0,
                recommendation: "fine".into(),
            })
        }
    }

    #[derive(Default)]
    struct MailboxState {
        messages: Vec<RawMessage>,
        seen: HashSet<u32>,
        connects: usize,
        logouts: usize,
    }

    /// Parks the session after its first `mark_seen` until released.
    #[derive(Clone, Default)]
    struct Gate {
        marked: Arc<Notify>,
        release: Arc<Notify>,
    }

    #[derive(Clone, Default)]
    struct MockMailbox {
        state: Arc<Mutex<MailboxState>>,
        refuse: Arc<AtomicUsize>,
        gate: Option<Gate>,
    }

    impl MockMailbox {
        fn with_messages(messages: Vec<RawMessage>) -> Self {
            let mock = Self::default();
            mock.state.lock().unwrap().messages = messages;
            mock
        }

        fn seen(&self) -> HashSet<u32> {
            self.state.lock().unwrap().seen.clone()
        }
    }

    struct MockSession {
        state: Arc<Mutex<MailboxState>>,
        gate: Option<Gate>,
    }

    #[async_trait]
    impl MailboxClient for MockMailbox {
        async fn connect(&self) -> Result<Box<dyn MailboxSession>, MailboxError> {
            if self.refuse.load(Ordering::SeqCst) > 0 {
                self.refuse.fetch_sub(1, Ordering::SeqCst);
                return Err(MailboxError::ConnectionFailed {
                    host: "mock".into(),
                    port: 993,
                    reason: "refused".into(),
                });
            }
            self.state.lock().unwrap().connects += 1;
            Ok(Box::new(MockSession {
                state: Arc::clone(&self.state),
                gate: self.gate.clone(),
            }))
        }
    }

    #[async_trait]
    impl MailboxSession for MockSession {
        async fn fetch_unseen(&mut self) -> Result<Vec<RawMessage>, MailboxError> {
            let state = self.state.lock().unwrap();
            Ok(state
                .messages
                .iter()
                .filter(|m| !state.seen.contains(&m.uid))
                .cloned()
                .collect())
        }

        async fn mark_seen(&mut self, uid: u32) -> Result<(), MailboxError> {
            let first = {
                let mut state = self.state.lock().unwrap();
                state.seen.insert(uid);
                state.seen.len() == 1
            };
            if let (true, Some(gate)) = (first, &self.gate) {
                gate.marked.notify_one();
                gate.release.notified().await;
            }
            Ok(())
        }

        async fn logout(&mut self) -> Result<(), MailboxError> {
            self.state.lock().unwrap().logouts += 1;
            Ok(())
        }
    }

    fn message(uid: u32, from: &str, subject: &str, body: &str) -> RawMessage {
        RawMessage {
            uid,
            source: format!("From: {from}\r\nSubject: {subject}\r\n\r\n{body}\r\n").into_bytes(),
        }
    }

    async fn setup() -> (Arc<dyn Database>, Arc<IngestProcessor>, Arc<ProposalManager>) {
        let db: Arc<dyn Database> = Arc::new(LibSqlBackend::new_memory().await.unwrap());
        let category = db.create_category("Office").await.unwrap();
        db.create_vendor(&NewVendor {
            name: "Acme".into(),
            email: "sales@acme.com".into(),
            phone: None,
            category_id: category.id,
        })
        .await
        .unwrap();
        let rfp = db
            .create_rfp(&NewRfp {
                title: "Office Chairs Procurement".into(),
                description: "Chairs".into(),
                ..Default::default()
            })
            .await
            .unwrap();
        db.update_rfp_status(rfp.id, RfpStatus::Sent).await.unwrap();

        let manager = Arc::new(ProposalManager::new(Arc::clone(&db), Arc::new(FixedAnalyzer)));
        let processor = Arc::new(IngestProcessor::new(Arc::clone(&db), Arc::clone(&manager)));
        (db, processor, manager)
    }

    fn config() -> MailboxConfig {
        MailboxConfig::new("imap.example.com", "rfp@buyer.com", "secret")
            .with_poll_interval(Duration::from_secs(3600))
    }

    #[tokio::test]
    async fn cycle_marks_terminal_outcomes_seen_and_skips_bad_messages() {
        let (db, processor, _) = setup().await;
        let mailbox = MockMailbox::with_messages(vec![
            message(1, "sales@acme.com", "Re: Office Chairs Procurement", "50 chairs, $9,000"),
            message(2, "stranger@example.com", "Hello", "spam"),
            RawMessage {
                uid: 3,
                source: b"Subject: no sender\r\n\r\nbody\r\n".to_vec(),
            },
            message(4, "sales@acme.com", "Re: Office Chairs Procurement", "revised offer"),
        ]);

        let mut handle = MailboxPoller::spawn(&config(), Arc::new(mailbox.clone()), processor);
        let report = handle.next_report().await.unwrap();
        handle.stop().await;

        assert_eq!(report.fetched, 4);
        assert_eq!(report.created, 1);
        assert_eq!(report.no_vendor, 1);
        assert_eq!(report.parse_failures, 1);
        assert_eq!(report.duplicates, 1);
        assert_eq!(mailbox.seen(), HashSet::from([1, 2, 4]));

        let state = mailbox.state.lock().unwrap();
        assert_eq!(state.connects, 1);
        assert_eq!(state.logouts, 1);
        drop(state);

        let rfps = db.list_rfps_by_status(RfpStatus::Sent).await.unwrap();
        let proposals = db.list_proposals_for_rfp(rfps[0].id).await.unwrap();
        assert_eq!(proposals.len(), 1);
        assert_eq!(proposals[0].raw_content, "50 chairs, $9,000");
        assert_eq!(
            proposals[0].email_subject.as_deref(),
            Some("Re: Office Chairs Procurement")
        );
    }

    #[tokio::test]
    async fn refused_connection_skips_cycle_without_stopping() {
        let (_, processor, _) = setup().await;
        let mailbox = MockMailbox::default();
        mailbox.refuse.store(1, Ordering::SeqCst);

        let config = config().with_poll_interval(Duration::from_millis(20));
        let mut handle = MailboxPoller::spawn(&config, Arc::new(mailbox.clone()), processor);

        let first = handle.next_report().await.unwrap();
        assert!(first.connection_failed);
        let second = handle.next_report().await.unwrap();
        assert!(!second.connection_failed);
        handle.stop().await;

        assert_eq!(mailbox.state.lock().unwrap().connects, 1);
    }

    #[tokio::test]
    async fn stop_before_first_tick_does_no_work() {
        let (_, processor, _) = setup().await;
        let mailbox = MockMailbox::default();

        let handle = MailboxPoller::spawn(&config(), Arc::new(mailbox.clone()), processor);
        handle.stop().await;

        assert_eq!(mailbox.state.lock().unwrap().connects, 0);
    }

    #[tokio::test]
    async fn stop_mid_batch_leaves_the_rest_unseen_and_logs_out() {
        let (_, processor, _) = setup().await;
        let gate = Gate::default();
        let mut mailbox = MockMailbox::with_messages(vec![
            message(1, "sales@acme.com", "Re: Office Chairs Procurement", "first"),
            message(2, "sales@acme.com", "Re: Office Chairs Procurement", "second"),
            message(3, "stranger@example.com", "Hello", "third"),
        ]);
        mailbox.gate = Some(gate.clone());

        let mut handle =
            MailboxPoller::spawn(&config(), Arc::new(mailbox.clone()), Arc::clone(&processor));
        gate.marked.notified().await;
        assert_eq!(handle.state(), PollerState::Processing);

        handle.stop.send(true).unwrap();
        gate.release.notify_one();

        let report = handle.next_report().await.unwrap();
        handle.stop().await;

        assert!(report.aborted);
        assert_eq!(report.fetched, 3);
        assert_eq!(report.created, 1);
        assert_eq!(report.completed(), 1);
        assert_eq!(mailbox.seen(), HashSet::from([1]));
        {
            let state = mailbox.state.lock().unwrap();
            assert_eq!(state.connects, 1);
            assert_eq!(state.logouts, 1);
        }

        // The abandoned messages are picked up by the next poller.
        mailbox.gate = None;
        let mut handle = MailboxPoller::spawn(&config(), Arc::new(mailbox.clone()), processor);
        let report = handle.next_report().await.unwrap();
        handle.stop().await;
        assert!(!report.aborted);
        assert_eq!(report.fetched, 2);
        assert_eq!(report.duplicates, 1);
        assert_eq!(report.no_vendor, 1);
        assert_eq!(mailbox.seen(), HashSet::from([1, 2, 3]));
    }

    #[tokio::test]
    async fn created_proposal_is_analyzed_in_background() {
        let (db, processor, manager) = setup().await;
        let mailbox = MockMailbox::with_messages(vec![message(
            9,
            "sales@acme.com",
            "Quote for Office Chairs",
            "offer",
        )]);

        let mut handle = MailboxPoller::spawn(&config(), Arc::new(mailbox), processor);
        let report = handle.next_report().await.unwrap();
        handle.stop().await;
        assert_eq!(report.created, 1);

        let rfp_id = db.list_rfps_by_status(RfpStatus::Sent).await.unwrap()[0].id;
        let mut recommended = None;
        for _ in 0..100 {
            recommended = manager.get_recommended(rfp_id).await.unwrap();
            if recommended.is_some() {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        let recommended = recommended.expect("analysis never completed");
        assert_eq!(recommended.status, ProposalStatus::Analyzed);
        assert_eq!(recommended.score, Some(70.0));
    }

    #[test]
    fn completed_counts_terminal_outcomes() {
        let report = CycleReport {
            fetched: 6,
            created: 1,
            duplicates: 1,
            no_vendor: 1,
            no_rfp: 1,
            parse_failures: 1,
            errors: 1,
            ..Default::default()
        };
        assert_eq!(report.completed(), 4);
    }
}
