//! RFP engine: ingests vendor replies from a mailbox, analyzes them with an
//! LLM, and keeps one recommended proposal per RFP.

pub mod analysis;
pub mod config;
pub mod error;
pub mod llm;
pub mod mailbox;
pub mod model;
pub mod proposals;
pub mod store;
