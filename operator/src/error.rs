//! Reconcile-level error taxonomy.
//!
//! Components return these; only the reconcilers decide what a given error
//! means for the retry interval and the recorded phase.

use crate::models::Phase;
use crate::services::github_service::ProviderError;
use crate::services::identity_service::IdentityError;
use crate::store::StoreError;

#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("object store: {0}")]
    Store(#[from] StoreError),

    #[error("repository provider: {0}")]
    Provider(#[from] ProviderError),

    #[error("identity provider: {0}")]
    Identity(#[from] IdentityError),

    #[error("build job {job} failed")]
    BuildFailed { job: String },

    #[error("build job {job} exceeded {minutes} minutes")]
    BuildTimeout { job: String, minutes: i64 },

    #[error("no environment with uid {uid:?} for owner {owner:?}")]
    EnvironmentNotFound { owner: String, uid: String },

    #[error("illegal phase transition {from} -> {to}")]
    IllegalTransition { from: Phase, to: Phase },

    #[error("invalid instance {name}: {reason}")]
    InvalidInstance { name: String, reason: String },
}

impl Error {
    /// The record disappeared between list and get.
    pub fn is_not_found(&self) -> bool {
        matches!(self, Error::Store(StoreError::NotFound { .. }))
    }

    /// A concurrent writer won; re-fetch and retry.
    pub fn is_conflict(&self) -> bool {
        matches!(self, Error::Store(StoreError::Conflict { .. }))
    }
}

pub type Result<T, E = Error> = std::result::Result<T, E>;
