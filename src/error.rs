//! Error types for the RFP engine.

use std::time::Duration;

use uuid::Uuid;

/// Configuration-related errors.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Missing required environment variable: {0}")]
    MissingEnvVar(String),

    #[error("Invalid configuration value for {key}: {message}")]
    InvalidValue { key: String, message: String },
}

/// Database-related errors.
#[derive(Debug, thiserror::Error)]
pub enum DatabaseError {
    #[error("Connection pool error: {0}")]
    Pool(String),

    #[error("Query failed: {0}")]
    Query(String),

    #[error("Constraint violation: {0}")]
    Constraint(String),

    #[error("Migration failed: {0}")]
    Migration(String),

    #[error("Serialization error: {0}")]
    Serialization(String),
}

impl DatabaseError {
    /// Classify a libSQL error raised by a write, separating constraint
    /// violations from everything else.
    pub fn from_write(op: &str, err: libsql::Error) -> Self {
        let msg = err.to_string();
        if msg.contains("UNIQUE constraint failed")
            || msg.contains("FOREIGN KEY constraint failed")
            || msg.contains("CHECK constraint failed")
        {
            Self::Constraint(format!("{op}: {msg}"))
        } else {
            Self::Query(format!("{op}: {msg}"))
        }
    }
}

/// Mailbox protocol errors.
#[derive(Debug, thiserror::Error)]
pub enum MailboxError {
    #[error("Connection to {host}:{port} failed: {reason}")]
    ConnectionFailed {
        host: String,
        port: u16,
        reason: String,
    },

    #[error("Mailbox authentication failed for {user}")]
    AuthFailed { user: String },

    #[error("TLS error: {0}")]
    Tls(String),

    #[error("IMAP protocol error: {0}")]
    Protocol(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// LLM provider errors.
#[derive(Debug, thiserror::Error)]
pub enum LlmError {
    #[error("Provider {provider} request failed: {reason}")]
    RequestFailed { provider: String, reason: String },

    #[error("Provider {provider} rate limited, retry after {retry_after:?}")]
    RateLimited {
        provider: String,
        retry_after: Option<Duration>,
    },

    #[error("Invalid response from {provider}: {reason}")]
    InvalidResponse { provider: String, reason: String },

    #[error("Authentication failed for provider {provider}")]
    AuthFailed { provider: String },
}

/// Proposal lifecycle errors.
#[derive(Debug, thiserror::Error)]
pub enum ProposalError {
    #[error("{entity} {id} not found")]
    NotFound { entity: &'static str, id: Uuid },

    #[error("Proposal from vendor {vendor_id} for RFP {rfp_id} already exists")]
    DuplicateProposal { rfp_id: Uuid, vendor_id: Uuid },

    #[error("Analysis of proposal {proposal_id} failed: {reason}")]
    AnalysisFailed { proposal_id: Uuid, reason: String },

    #[error("Invalid update: {0}")]
    InvalidUpdate(String),

    #[error("Database error: {0}")]
    Database(#[from] DatabaseError),
}

/// Analysis queue hand-off errors.
#[derive(Debug, thiserror::Error)]
pub enum QueueError {
    #[error("Analysis queue is full, proposal {proposal_id} left pending")]
    Full { proposal_id: Uuid },

    #[error("Analysis queue is closed")]
    Closed,
}

/// Per-message ingestion errors.
#[derive(Debug, thiserror::Error)]
pub enum IngestError {
    #[error("Message could not be parsed: {0}")]
    ParseFailed(String),

    #[error("Proposal error: {0}")]
    Proposal(#[from] ProposalError),

    #[error("Database error: {0}")]
    Database(#[from] DatabaseError),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn not_found_message_names_entity() {
        let id = Uuid::nil();
        let err = ProposalError::NotFound { entity: "RFP", id };
        assert_eq!(err.to_string(), format!("RFP {id} not found"));
    }

    #[test]
    fn ingest_error_wraps_proposal_error() {
        let id = Uuid::nil();
        let err: IngestError = ProposalError::NotFound { entity: "Vendor", id }.into();
        assert!(matches!(err, IngestError::Proposal(ProposalError::NotFound { .. })));
        assert!(err.to_string().contains("Vendor"));
    }

    #[test]
    fn proposal_error_wraps_database_error() {
        let err: ProposalError = DatabaseError::Constraint("dup".into()).into();
        assert!(matches!(
            err,
            ProposalError::Database(DatabaseError::Constraint(_))
        ));
    }
}
