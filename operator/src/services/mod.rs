//! Operator services: external clients and the orchestrators the
//! reconcilers drive.

pub mod build_service;
pub mod comment_service;
pub mod deploy_service;
pub mod github_service;
pub mod identity_service;
pub mod job_runner;
