//! Proposal lifecycle and recommendation ownership.

mod locks;
mod manager;

pub use locks::RecommendationLocks;
pub use manager::{CreateOutcome, ProposalManager};
