//! `Database` trait: single async interface for all RFP engine persistence.

use async_trait::async_trait;
use uuid::Uuid;

use crate::error::DatabaseError;
use crate::model::{
    NewProposal, NewRfp, NewVendor, Proposal, ProposalAnalysis, ProposalStatus, Rfp, RfpStatus,
    Vendor, VendorCategory, VendorUpdate,
};

/// Backend-agnostic database trait covering categories, vendors, RFPs and proposals.
#[async_trait]
pub trait Database: Send + Sync {
    /// Run all pending schema migrations.
    async fn run_migrations(&self) -> Result<(), DatabaseError>;

    // ── Categories ──────────────────────────────────────────────────

    async fn create_category(&self, name: &str) -> Result<VendorCategory, DatabaseError>;

    async fn list_categories(&self) -> Result<Vec<VendorCategory>, DatabaseError>;

    // ── Vendors ─────────────────────────────────────────────────────

    /// Insert a vendor. The email is trimmed and lowercased before storage.
    async fn create_vendor(&self, vendor: &NewVendor) -> Result<Vendor, DatabaseError>;

    async fn get_vendor(&self, id: Uuid) -> Result<Option<Vendor>, DatabaseError>;

    /// Case-insensitive exact lookup. Inactive vendors are returned too.
    async fn find_vendor_by_email(&self, email: &str) -> Result<Option<Vendor>, DatabaseError>;

    /// All vendors ordered by name.
    async fn list_vendors(&self) -> Result<Vec<Vendor>, DatabaseError>;

    /// Apply a partial update. Returns `None` if the vendor doesn't exist.
    async fn update_vendor(
        &self,
        id: Uuid,
        update: &VendorUpdate,
    ) -> Result<Option<Vendor>, DatabaseError>;

    /// Delete a vendor and, by cascade, its proposals. Recommendations of
    /// every affected RFP are recomputed in the same transaction.
    async fn delete_vendor(&self, id: Uuid) -> Result<bool, DatabaseError>;

    // ── RFPs ────────────────────────────────────────────────────────

    /// Insert an RFP with its items in one transaction. New RFPs start as draft.
    async fn create_rfp(&self, rfp: &NewRfp) -> Result<Rfp, DatabaseError>;

    async fn get_rfp(&self, id: Uuid) -> Result<Option<Rfp>, DatabaseError>;

    /// All RFPs, newest first.
    async fn list_rfps(&self) -> Result<Vec<Rfp>, DatabaseError>;

    /// RFPs in the given status, most recently updated first.
    async fn list_rfps_by_status(&self, status: RfpStatus) -> Result<Vec<Rfp>, DatabaseError>;

    /// Replace an RFP's fields and items in one transaction, keeping its
    /// status. Returns `None` if the RFP doesn't exist.
    async fn update_rfp(&self, id: Uuid, rfp: &NewRfp) -> Result<Option<Rfp>, DatabaseError>;

    async fn update_rfp_status(&self, id: Uuid, status: RfpStatus) -> Result<bool, DatabaseError>;

    /// Delete an RFP and, by cascade, its items and proposals.
    async fn delete_rfp(&self, id: Uuid) -> Result<bool, DatabaseError>;

    // ── Proposals ───────────────────────────────────────────────────

    /// Insert a pending proposal. A second proposal for the same
    /// (rfp, vendor) pair fails with `DatabaseError::Constraint`.
    async fn insert_proposal(&self, proposal: &NewProposal) -> Result<Proposal, DatabaseError>;

    async fn get_proposal(&self, id: Uuid) -> Result<Option<Proposal>, DatabaseError>;

    async fn find_proposal(
        &self,
        rfp_id: Uuid,
        vendor_id: Uuid,
    ) -> Result<Option<Proposal>, DatabaseError>;

    /// Proposals for an RFP: recommended first, then by descending score.
    async fn list_proposals_for_rfp(&self, rfp_id: Uuid) -> Result<Vec<Proposal>, DatabaseError>;

    async fn get_recommended_proposal(
        &self,
        rfp_id: Uuid,
    ) -> Result<Option<Proposal>, DatabaseError>;

    /// Write all analysis fields, mark the proposal analyzed, and recompute
    /// the owning RFP's recommendation, all in one transaction. The first
    /// successful analysis fixes the proposal's position in the tie-break
    /// order. Returns `false` if the proposal doesn't exist.
    async fn apply_analysis(
        &self,
        id: Uuid,
        analysis: &ProposalAnalysis,
    ) -> Result<bool, DatabaseError>;

    /// Set the status and recompute the RFP's recommendation in one
    /// transaction. Any status other than `analyzed` clears the flag.
    async fn update_proposal_status(
        &self,
        id: Uuid,
        status: ProposalStatus,
    ) -> Result<bool, DatabaseError>;

    /// Flag `proposal_id` and clear every other proposal of the RFP, in one
    /// transaction. Changes nothing and returns `false` unless the proposal
    /// belongs to the RFP and is analyzed.
    async fn set_recommended_exclusive(
        &self,
        rfp_id: Uuid,
        proposal_id: Uuid,
    ) -> Result<bool, DatabaseError>;

    /// Clear the flag on a single proposal.
    async fn clear_recommended(&self, id: Uuid) -> Result<(), DatabaseError>;

    /// Atomically flag the top analyzed proposal of an RFP (highest score,
    /// earliest analysis on ties) and clear all others. Returns the
    /// recommended proposal id, if any.
    async fn recompute_recommendation(&self, rfp_id: Uuid) -> Result<Option<Uuid>, DatabaseError>;

    /// Delete a proposal and recompute its RFP's recommendation in one transaction.
    async fn delete_proposal(&self, id: Uuid) -> Result<bool, DatabaseError>;
}
