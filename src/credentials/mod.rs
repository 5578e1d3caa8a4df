//! Credential management: the shared rate-limit-aware pool and the
//! team-token service client.

mod pool;
mod service;

pub use pool::{
    Acquired, Credential, CredentialLease, CredentialPool, CredentialStatus, PoolConfig,
};
pub use service::{fetch_team_tokens, TokenServiceConfig, TokenServiceError};
