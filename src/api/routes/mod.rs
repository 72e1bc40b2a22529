//! API Routes Module
//!
//! Route handlers organized by audience:
//! - health: liveness check
//! - transparency: public, unauthenticated aggregates
//! - ingest: scheduled scan trigger and deposit webhook
//! - admin: operator endpoints behind the admin bearer token

pub mod admin;
pub mod health;
pub mod ingest;
pub mod transparency;
