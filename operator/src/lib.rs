//! Preview environment operator.
//!
//! Watches repositories for open pull requests and matching branches, and
//! keeps one built, deployed and optionally authenticated preview instance
//! per target.

pub mod config;
pub mod controller;
pub mod error;
pub mod metrics;
pub mod models;
pub mod naming;
pub mod routes;
pub mod schema;
pub mod seeder;
pub mod services;
pub mod store;

#[cfg(test)]
mod testing;
