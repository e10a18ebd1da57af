//! Error types for the panel core.

use std::path::PathBuf;

/// Configuration-related errors.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Invalid value for {key}: {message}")]
    InvalidValue { key: String, message: String },
}

/// Persistence errors.
#[derive(Debug, thiserror::Error)]
pub enum DatabaseError {
    #[error("Connection pool error: {0}")]
    Pool(String),

    #[error("Query failed: {0}")]
    Query(String),

    #[error("Migration failed: {0}")]
    Migration(String),

    #[error("Serialization error: {0}")]
    Serialization(String),
}

impl From<deadpool_postgres::PoolError> for DatabaseError {
    fn from(e: deadpool_postgres::PoolError) -> Self {
        DatabaseError::Pool(e.to_string())
    }
}

impl From<tokio_postgres::Error> for DatabaseError {
    fn from(e: tokio_postgres::Error) -> Self {
        DatabaseError::Query(e.to_string())
    }
}

/// Errors raised by a session client or its factory.
#[derive(Debug, thiserror::Error)]
pub enum ClientError {
    #[error("Session {session} could not be created: {reason}")]
    CreationFailed { session: String, reason: String },

    #[error("Session {session} request failed: {reason}")]
    RequestFailed { session: String, reason: String },

    #[error("Session {session} returned an invalid response: {reason}")]
    InvalidResponse { session: String, reason: String },

    #[error("Session {session} is closed")]
    Closed { session: String },

    #[error("Failed to clear credentials at {path}: {source}")]
    CredentialClear {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
}

/// Errors surfaced by the instance lifecycle controller.
#[derive(Debug, thiserror::Error)]
pub enum InstanceError {
    #[error("No instance for agent {agent_id}")]
    NotFound { agent_id: String },

    #[error("Instance for agent {agent_id} is not connected")]
    NotConnected { agent_id: String },

    #[error(transparent)]
    Client(#[from] ClientError),

    #[error("Credentials for agent {agent_id} could not be cleared: {source}")]
    CredentialsNotCleared {
        agent_id: String,
        #[source]
        source: ClientError,
    },

    #[error("Contact {contact_id} is assigned to another agent")]
    ContactAssignedElsewhere { contact_id: String },

    #[error("Media file {path} unusable: {reason}")]
    Media { path: PathBuf, reason: String },

    #[error(transparent)]
    Database(#[from] DatabaseError),
}
