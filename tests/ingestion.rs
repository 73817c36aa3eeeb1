//! End-to-end ingestion: mailbox → matcher → manager → analysis workers →
//! recommendation, through the public API only.

use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use uuid::Uuid;

use rfp_engine::analysis::{
    AnalysisQueue, AnalysisWorkers, ProposalAnalyzer, RfpSummary, spawn_analysis_workers,
};
use rfp_engine::config::MailboxConfig;
use rfp_engine::error::{LlmError, MailboxError};
use rfp_engine::mailbox::{
    IngestProcessor, MailboxClient, MailboxPoller, MailboxSession, RawMessage,
};
use rfp_engine::model::{
    NewProposal, NewRfp, NewVendor, Proposal, ProposalAnalysis, ProposalStatus, RfpStatus,
};
use rfp_engine::proposals::ProposalManager;
use rfp_engine::store::{Database, LibSqlBackend};

// ── Mocks ───────────────────────────────────────────────────────────

/// Scores come from a `SCORE: <n>` line in the proposal body. A body without
/// one fails analysis.
struct BodyScoreAnalyzer;

#[async_trait]
impl ProposalAnalyzer for BodyScoreAnalyzer {
    async fn analyze(
        &self,
        _rfp: &RfpSummary,
        raw_content: &str,
    ) -> Result<ProposalAnalysis, LlmError> {
        let score = raw_content
            .lines()
            .find_map(|l| l.trim().strip_prefix("SCORE: "))
            .and_then(|s| s.trim().parse::<f64>().ok())
            .ok_or_else(|| LlmError::InvalidResponse {
                provider: "mock".into(),
                reason: "no score".into(),
            })?;
        Ok(ProposalAnalysis {
            proposed_price: Some(10_000.0),
            delivery_days: Some(21),
            warranty: Some("2 years".into()),
            payment_terms: Some("Net 30".into()),
            item_pricing: vec![],
            strengths: vec!["responsive".into()],
            weaknesses: vec![],
            score,
            recommendation: "Consider".into(),
        })
    }
}

#[derive(Default)]
struct Inbox {
    messages: Vec<RawMessage>,
    seen: HashSet<u32>,
}

#[derive(Clone, Default)]
struct MockMailbox {
    inbox: Arc<Mutex<Inbox>>,
}

impl MockMailbox {
    fn deliver(&self, uid: u32, from: &str, subject: &str, body: &str) {
        self.inbox.lock().unwrap().messages.push(RawMessage {
            uid,
            source: format!("From: {from}\r\nSubject: {subject}\r\n\r\n{body}\r\n").into_bytes(),
        });
    }

    fn seen(&self) -> HashSet<u32> {
        self.inbox.lock().unwrap().seen.clone()
    }
}

struct MockSession {
    inbox: Arc<Mutex<Inbox>>,
}

#[async_trait]
impl MailboxClient for MockMailbox {
    async fn connect(&self) -> Result<Box<dyn MailboxSession>, MailboxError> {
        Ok(Box::new(MockSession {
            inbox: Arc::clone(&self.inbox),
        }))
    }
}

#[async_trait]
impl MailboxSession for MockSession {
    async fn fetch_unseen(&mut self) -> Result<Vec<RawMessage>, MailboxError> {
        let inbox = self.inbox.lock().unwrap();
        Ok(inbox
            .messages
            .iter()
            .filter(|m| !inbox.seen.contains(&m.uid))
            .cloned()
            .collect())
    }

    async fn mark_seen(&mut self, uid: u32) -> Result<(), MailboxError> {
        self.inbox.lock().unwrap().seen.insert(uid);
        Ok(())
    }

    async fn logout(&mut self) -> Result<(), MailboxError> {
        Ok(())
    }
}

// ── Fixture ─────────────────────────────────────────────────────────

const ACME: &str = "acme@vendor.com";
const GLOBEX: &str = "globex@vendor.com";
const INITECH: &str = "initech@vendor.com";

struct Engine {
    db: Arc<dyn Database>,
    manager: Arc<ProposalManager>,
    processor: Arc<IngestProcessor>,
    workers: AnalysisWorkers,
    rfp_id: Uuid,
    vendors: HashMap<&'static str, Uuid>,
}

async fn engine(worker_count: usize) -> Engine {
    let db: Arc<dyn Database> = Arc::new(LibSqlBackend::new_memory().await.unwrap());
    let category = db.create_category("Furniture").await.unwrap();

    let mut vendors = HashMap::new();
    for email in [ACME, GLOBEX, INITECH] {
        let vendor = db
            .create_vendor(&NewVendor {
                name: email.split('@').next().unwrap().to_string(),
                email: email.to_string(),
                phone: None,
                category_id: category.id,
            })
            .await
            .unwrap();
        vendors.insert(email, vendor.id);
    }

    let rfp = db
        .create_rfp(&NewRfp {
            title: "Office Chairs Procurement".into(),
            description: "Ergonomic chairs for the new office".into(),
            raw_input: "We need 50 ergonomic chairs within 30 days".into(),
            ..Default::default()
        })
        .await
        .unwrap();
    db.update_rfp_status(rfp.id, RfpStatus::Sent).await.unwrap();

    let (queue, receiver) = AnalysisQueue::bounded(16);
    let manager = Arc::new(
        ProposalManager::new(Arc::clone(&db), Arc::new(BodyScoreAnalyzer)).with_queue(queue),
    );
    let workers = spawn_analysis_workers(Arc::clone(&manager), receiver, worker_count);
    let processor = Arc::new(IngestProcessor::new(Arc::clone(&db), Arc::clone(&manager)));

    Engine {
        db,
        manager,
        processor,
        workers,
        rfp_id: rfp.id,
        vendors,
    }
}

fn mailbox_config() -> MailboxConfig {
    MailboxConfig::new("imap.example.com", "rfp@buyer.com", "secret")
        .with_poll_interval(Duration::from_secs(3600))
}

/// Run one poll cycle against `mailbox`.
async fn poll(engine: &Engine, mailbox: &MockMailbox) -> rfp_engine::mailbox::CycleReport {
    let mut handle = MailboxPoller::spawn(
        &mailbox_config(),
        Arc::new(mailbox.clone()),
        Arc::clone(&engine.processor),
    );
    let report = handle.next_report().await.expect("poller produced no report");
    handle.stop().await;
    report
}

/// Wait until no proposal of the RFP is pending.
async fn settle(engine: &Engine) -> Vec<Proposal> {
    for _ in 0..200 {
        let proposals = engine.manager.get_by_rfp(engine.rfp_id).await.unwrap();
        if proposals.iter().all(|p| p.status != ProposalStatus::Pending) {
            return proposals;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    panic!("analysis did not settle");
}

fn recommended(proposals: &[Proposal]) -> Vec<Uuid> {
    proposals
        .iter()
        .filter(|p| p.is_recommended)
        .map(|p| p.id)
        .collect()
}

// ── Tests ───────────────────────────────────────────────────────────

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn replies_become_ranked_proposals() {
    let engine = engine(3).await;
    let mailbox = MockMailbox::default();
    mailbox.deliver(1, ACME, "Re: Office Chairs Procurement", "SCORE: 78\nWe can do it.");
    mailbox.deliver(2, GLOBEX, "Quote for Office Chairs", "SCORE: 91\nBest price.");
    mailbox.deliver(3, INITECH, "RE: Fwd: office chairs procurement", "SCORE: 64");

    let report = poll(&engine, &mailbox).await;
    assert_eq!(report.created, 3);
    assert_eq!(mailbox.seen(), HashSet::from([1, 2, 3]));

    let proposals = settle(&engine).await;
    assert_eq!(proposals.len(), 3);
    assert!(proposals.iter().all(|p| p.status == ProposalStatus::Analyzed));

    // Recommended first, then by descending score.
    let scores: Vec<_> = proposals.iter().map(|p| p.score.unwrap()).collect();
    assert_eq!(scores, vec![91.0, 78.0, 64.0]);
    assert_eq!(recommended(&proposals), vec![proposals[0].id]);
    assert_eq!(proposals[0].vendor_id, engine.vendors[GLOBEX]);

    engine.workers.shutdown().await;
}

#[tokio::test]
async fn repeated_reply_is_a_duplicate_and_still_marked_seen() {
    let engine = engine(1).await;
    let mailbox = MockMailbox::default();
    mailbox.deliver(1, ACME, "Office Chairs Procurement", "SCORE: 70");
    assert_eq!(poll(&engine, &mailbox).await.created, 1);

    mailbox.deliver(2, ACME, "Re: Office Chairs Procurement", "SCORE: 99\nRevised!");
    let report = poll(&engine, &mailbox).await;
    assert_eq!(report.fetched, 1);
    assert_eq!(report.duplicates, 1);
    assert!(mailbox.seen().contains(&2));

    let proposals = settle(&engine).await;
    assert_eq!(proposals.len(), 1);
    assert_eq!(proposals[0].score, Some(70.0));

    engine.workers.shutdown().await;
}

#[tokio::test]
async fn exact_tie_keeps_the_first_analyzed() {
    // One worker drains the queue in fetch order, so ACME is analyzed first.
    let engine = engine(1).await;
    let mailbox = MockMailbox::default();
    mailbox.deliver(1, ACME, "Office Chairs Procurement", "SCORE: 90");
    mailbox.deliver(2, GLOBEX, "Office Chairs Procurement", "SCORE: 90");
    poll(&engine, &mailbox).await;

    let proposals = settle(&engine).await;
    let winner = recommended(&proposals);
    assert_eq!(winner.len(), 1);
    let winner = engine.manager.get_by_id(winner[0]).await.unwrap();
    assert_eq!(winner.vendor_id, engine.vendors[ACME]);

    // Re-analysis keeps the original order.
    engine.manager.analyze(winner.id).await.unwrap();
    let proposals = engine.manager.get_by_rfp(engine.rfp_id).await.unwrap();
    assert_eq!(recommended(&proposals), vec![winner.id]);

    engine.workers.shutdown().await;
}

#[tokio::test]
async fn unanalyzable_reply_stays_pending_and_out_of_ranking() {
    let engine = engine(1).await;
    let mailbox = MockMailbox::default();
    mailbox.deliver(1, ACME, "Office Chairs Procurement", "No numbers here, call us.");
    mailbox.deliver(2, GLOBEX, "Office Chairs Procurement", "SCORE: 40");
    poll(&engine, &mailbox).await;

    let mut proposals = Vec::new();
    for _ in 0..200 {
        proposals = engine.manager.get_by_rfp(engine.rfp_id).await.unwrap();
        if proposals.iter().any(|p| p.status == ProposalStatus::Analyzed) {
            break;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    let acme = proposals
        .iter()
        .find(|p| p.vendor_id == engine.vendors[ACME])
        .unwrap();
    assert_eq!(acme.status, ProposalStatus::Pending);
    assert!(!acme.is_recommended);

    let globex = engine.manager.get_recommended(engine.rfp_id).await.unwrap().unwrap();
    assert_eq!(globex.vendor_id, engine.vendors[GLOBEX]);

    engine.workers.shutdown().await;
}

#[tokio::test]
async fn deleting_proposals_moves_then_clears_the_recommendation() {
    let engine = engine(2).await;
    let mailbox = MockMailbox::default();
    mailbox.deliver(1, ACME, "Office Chairs Procurement", "SCORE: 88");
    mailbox.deliver(2, GLOBEX, "Office Chairs Procurement", "SCORE: 75");
    poll(&engine, &mailbox).await;
    settle(&engine).await;

    let top = engine.manager.get_recommended(engine.rfp_id).await.unwrap().unwrap();
    assert_eq!(top.vendor_id, engine.vendors[ACME]);

    engine.manager.delete(top.id).await.unwrap();
    let next = engine.manager.get_recommended(engine.rfp_id).await.unwrap().unwrap();
    assert_eq!(next.vendor_id, engine.vendors[GLOBEX]);

    engine.manager.delete(next.id).await.unwrap();
    assert!(engine.manager.get_recommended(engine.rfp_id).await.unwrap().is_none());

    engine.workers.shutdown().await;
}

#[tokio::test]
async fn direct_submission_rejects_duplicates() {
    let engine = engine(1).await;
    let first = engine
        .manager
        .submit(NewProposal::new(engine.rfp_id, engine.vendors[INITECH], "SCORE: 55"))
        .await
        .unwrap();
    assert_eq!(first.status, ProposalStatus::Pending);

    let err = engine
        .manager
        .submit(NewProposal::new(engine.rfp_id, engine.vendors[INITECH], "SCORE: 95"))
        .await
        .unwrap_err();
    assert!(matches!(
        err,
        rfp_engine::error::ProposalError::DuplicateProposal { .. }
    ));

    let proposals = settle(&engine).await;
    assert_eq!(proposals.len(), 1);
    assert!(engine.db.get_proposal(first.id).await.unwrap().is_some());

    engine.workers.shutdown().await;
}
