//! Proposal lifecycle: create, analyze, override, delete.
//!
//! The manager is the only writer of recommendation state outside the store.
//! Every operation that can move the recommendation runs under the owning
//! RFP's lock, and the store applies the change and the recompute in a single
//! transaction, so readers never see two recommended proposals for one RFP.

use std::sync::Arc;

use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::analysis::{AnalysisQueue, ProposalAnalyzer, RfpSummary};
use crate::error::{DatabaseError, ProposalError};
use crate::model::{NewProposal, Proposal, ProposalStatus, StatusUpdate};
use crate::proposals::locks::RecommendationLocks;
use crate::store::Database;

/// Result of [`ProposalManager::create`].
#[derive(Debug, Clone)]
pub enum CreateOutcome {
    /// A new pending proposal was stored and scheduled for analysis.
    Created(Proposal),
    /// The vendor already replied to this RFP; nothing was written.
    Existing(Proposal),
}

impl CreateOutcome {
    pub fn proposal(&self) -> &Proposal {
        match self {
            Self::Created(p) | Self::Existing(p) => p,
        }
    }

    pub fn into_proposal(self) -> Proposal {
        match self {
            Self::Created(p) | Self::Existing(p) => p,
        }
    }

    pub fn is_new(&self) -> bool {
        matches!(self, Self::Created(_))
    }
}

/// Owns proposal state transitions and the recommendation invariant.
#[derive(Clone)]
pub struct ProposalManager {
    db: Arc<dyn Database>,
    analyzer: Arc<dyn ProposalAnalyzer>,
    locks: RecommendationLocks,
    queue: Option<AnalysisQueue>,
}

impl ProposalManager {
    /// Without a queue, each new proposal is analyzed on its own spawned task.
    pub fn new(db: Arc<dyn Database>, analyzer: Arc<dyn ProposalAnalyzer>) -> Self {
        Self {
            db,
            analyzer,
            locks: RecommendationLocks::new(),
            queue: None,
        }
    }

    /// Route new proposals through a bounded analysis queue.
    pub fn with_queue(mut self, queue: AnalysisQueue) -> Self {
        self.queue = Some(queue);
        self
    }

    pub fn database(&self) -> &Arc<dyn Database> {
        &self.db
    }

    /// Store a pending proposal and schedule its analysis.
    ///
    /// Idempotent per (rfp, vendor): a repeat returns the stored proposal as
    /// [`CreateOutcome::Existing`] without scheduling anything.
    pub async fn create(&self, new: NewProposal) -> Result<CreateOutcome, ProposalError> {
        let outcome = self.insert_once(new).await?;
        match &outcome {
            CreateOutcome::Created(p) => {
                info!(
                    proposal_id = %p.id,
                    rfp_id = %p.rfp_id,
                    vendor_id = %p.vendor_id,
                    "Proposal created"
                );
                self.schedule_analysis(p.id);
            }
            CreateOutcome::Existing(p) => {
                debug!(proposal_id = %p.id, "Proposal already on file, skipping");
            }
        }
        Ok(outcome)
    }

    /// Like [`create`](Self::create) but a repeat is an error.
    pub async fn submit(&self, new: NewProposal) -> Result<Proposal, ProposalError> {
        let (rfp_id, vendor_id) = (new.rfp_id, new.vendor_id);
        match self.create(new).await? {
            CreateOutcome::Created(p) => Ok(p),
            CreateOutcome::Existing(_) => {
                Err(ProposalError::DuplicateProposal { rfp_id, vendor_id })
            }
        }
    }

    async fn insert_once(&self, new: NewProposal) -> Result<CreateOutcome, ProposalError> {
        if self.db.get_rfp(new.rfp_id).await?.is_none() {
            return Err(ProposalError::NotFound {
                entity: "RFP",
                id: new.rfp_id,
            });
        }
        if self.db.get_vendor(new.vendor_id).await?.is_none() {
            return Err(ProposalError::NotFound {
                entity: "Vendor",
                id: new.vendor_id,
            });
        }
        if let Some(existing) = self.db.find_proposal(new.rfp_id, new.vendor_id).await? {
            return Ok(CreateOutcome::Existing(existing));
        }

        match self.db.insert_proposal(&new).await {
            Ok(p) => Ok(CreateOutcome::Created(p)),
            // A concurrent create for the same pair won the unique index.
            Err(DatabaseError::Constraint(reason)) => {
                match self.db.find_proposal(new.rfp_id, new.vendor_id).await? {
                    Some(existing) => Ok(CreateOutcome::Existing(existing)),
                    None => Err(DatabaseError::Constraint(reason).into()),
                }
            }
            Err(e) => Err(e.into()),
        }
    }

    fn schedule_analysis(&self, proposal_id: Uuid) {
        if let Some(queue) = &self.queue {
            if let Err(e) = queue.enqueue(proposal_id) {
                warn!(proposal_id = %proposal_id, error = %e, "Analysis not scheduled");
            }
            return;
        }

        let this = self.clone();
        tokio::spawn(async move {
            if let Err(e) = this.analyze(proposal_id).await {
                warn!(proposal_id = %proposal_id, error = %e, "Background analysis failed");
            }
        });
    }

    /// Analyze a proposal against its RFP, persist the result and recompute
    /// the RFP's recommendation.
    ///
    /// Re-running on an analyzed proposal overwrites the previous analysis.
    /// On analyzer failure nothing is written and the proposal keeps its
    /// current status.
    pub async fn analyze(&self, proposal_id: Uuid) -> Result<Proposal, ProposalError> {
        let proposal = self.get_by_id(proposal_id).await?;
        let rfp = self
            .db
            .get_rfp(proposal.rfp_id)
            .await?
            .ok_or(ProposalError::NotFound {
                entity: "RFP",
                id: proposal.rfp_id,
            })?;

        let summary = RfpSummary::from_rfp(&rfp);
        let analysis = self
            .analyzer
            .analyze(&summary, &proposal.raw_content)
            .await
            .map_err(|e| {
                warn!(proposal_id = %proposal_id, error = %e, "Proposal analysis failed");
                ProposalError::AnalysisFailed {
                    proposal_id,
                    reason: e.to_string(),
                }
            })?
            .clamped();

        {
            let _guard = self.locks.acquire(rfp.id).await;
            if !self.db.apply_analysis(proposal_id, &analysis).await? {
                return Err(ProposalError::NotFound {
                    entity: "Proposal",
                    id: proposal_id,
                });
            }
        }

        info!(
            proposal_id = %proposal_id,
            rfp_id = %rfp.id,
            score = analysis.score,
            "Proposal analyzed"
        );
        self.get_by_id(proposal_id).await
    }

    /// Flag the RFP's best analyzed proposal and clear all others.
    pub async fn recompute_recommendation(&self, rfp_id: Uuid) -> Result<Option<Uuid>, ProposalError> {
        let _guard = self.locks.acquire(rfp_id).await;
        let recommended = self.db.recompute_recommendation(rfp_id).await?;
        debug!(rfp_id = %rfp_id, recommended = ?recommended, "Recommendation recomputed");
        Ok(recommended)
    }

    /// Operator override of status and recommendation flag.
    ///
    /// A status change recomputes the recommendation, and leaving `analyzed`
    /// always clears the flag. An explicit `is_recommended = true` makes the
    /// proposal the RFP's only recommendation; `false` clears it and may
    /// leave the RFP with none.
    pub async fn update_status(
        &self,
        proposal_id: Uuid,
        update: StatusUpdate,
    ) -> Result<Proposal, ProposalError> {
        if update.status.is_none() && update.is_recommended.is_none() {
            return Err(ProposalError::InvalidUpdate("nothing to update".into()));
        }

        let rfp_id = self.get_by_id(proposal_id).await?.rfp_id;
        let _guard = self.locks.acquire(rfp_id).await;

        // Validate what is current under the lock, not what was read before it.
        let current = self.get_by_id(proposal_id).await?;
        let next_status = update.status.unwrap_or(current.status);
        if update.is_recommended == Some(true) && next_status != ProposalStatus::Analyzed {
            return Err(ProposalError::InvalidUpdate(format!(
                "a {next_status} proposal cannot be recommended"
            )));
        }

        if let Some(status) = update.status {
            self.db.update_proposal_status(proposal_id, status).await?;
        }
        match update.is_recommended {
            Some(true) => {
                if !self.db.set_recommended_exclusive(rfp_id, proposal_id).await? {
                    return Err(ProposalError::InvalidUpdate(format!(
                        "proposal {proposal_id} is not an analyzed proposal of RFP {rfp_id}"
                    )));
                }
            }
            Some(false) => self.db.clear_recommended(proposal_id).await?,
            None => {}
        }

        info!(
            proposal_id = %proposal_id,
            status = %next_status,
            is_recommended = ?update.is_recommended,
            "Proposal updated"
        );
        self.get_by_id(proposal_id).await
    }

    /// Delete a proposal. If it was recommended, the next best takes over.
    pub async fn delete(&self, proposal_id: Uuid) -> Result<(), ProposalError> {
        let proposal = self.get_by_id(proposal_id).await?;
        let _guard = self.locks.acquire(proposal.rfp_id).await;
        if !self.db.delete_proposal(proposal_id).await? {
            return Err(ProposalError::NotFound {
                entity: "Proposal",
                id: proposal_id,
            });
        }
        info!(proposal_id = %proposal_id, rfp_id = %proposal.rfp_id, "Proposal deleted");
        Ok(())
    }

    /// Delete a vendor along with its proposals.
    pub async fn delete_vendor(&self, vendor_id: Uuid) -> Result<(), ProposalError> {
        if !self.db.delete_vendor(vendor_id).await? {
            return Err(ProposalError::NotFound {
                entity: "Vendor",
                id: vendor_id,
            });
        }
        Ok(())
    }

    pub async fn get_by_id(&self, proposal_id: Uuid) -> Result<Proposal, ProposalError> {
        self.db
            .get_proposal(proposal_id)
            .await?
            .ok_or(ProposalError::NotFound {
                entity: "Proposal",
                id: proposal_id,
            })
    }

    /// Proposals for an RFP, recommended first then by score.
    pub async fn get_by_rfp(&self, rfp_id: Uuid) -> Result<Vec<Proposal>, ProposalError> {
        Ok(self.db.list_proposals_for_rfp(rfp_id).await?)
    }

    pub async fn get_recommended(&self, rfp_id: Uuid) -> Result<Option<Proposal>, ProposalError> {
        Ok(self.db.get_recommended_proposal(rfp_id).await?)
    }
}
