//! Integration test suite for the dispatcher.
//!
//! These tests drive whole batches through the dispatcher with simulated
//! collaborators on an in-memory bus. They verify that scheduling, failure
//! handling, idempotency and crash recovery work together.
//!
//! # Test Categories
//!
//! - `scheduling`: Ordering, concurrency bound and end-to-end scenarios
//! - `failure`: Failure propagation, retries, timeouts and rejection
//! - `idempotency`: Duplicate messages and exactly-once results
//! - `plans`: Phase ordering and unapproved tasks
//! - `recovery`: Restarting a dispatcher from its ledger
//!
//! Every test runs with tokio's paused clock, so timeouts and backoff elapse
//! instantly.


mod failure;
mod plans;
mod recovery;
mod scheduling;
