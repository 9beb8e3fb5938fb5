//! # Butler Registry
//!
//! Core engine of an Infrastructure-as-Code artifact registry and run
//! orchestrator. It stores versioned artifacts (Terraform modules, Helm
//! charts, OPA bundles, OCI artifacts), ingests new versions through signed
//! VCS webhooks, gates promotion through composable policies, and drives
//! plan/apply/destroy runs over a dependency graph of environment modules
//! via an external executor.
//!
//! ## Pipeline
//!
//! A signed push event flows **verify → ingest → approve → cascade →
//! queue → dispatch → callback → DAG progress**:
//!
//! 1. `butler-webhook` verifies the provider signature over the raw body
//!    and parses the push into a common shape.
//! 2. [`ingest::ingest_push`] upserts the version idempotently and
//!    auto-approves patch bumps when the resolved policy allows it.
//! 3. [`cascade::trigger_cascade`] fans the approved version out to every
//!    environment module whose pin matches, as speculative cascade plans.
//! 4. [`dispatch::Dispatcher`] drains per-module queues up to the
//!    concurrency cap and posts `butler-run` repository-dispatch events.
//! 5. Executor callbacks drive the [`runstate`] machine;
//!    [`dag::on_module_run_complete`] admits ready downstreams or
//!    propagates skips.
//!
//! ## Modules
//!
//! - [`types`] — Domain entities: artifacts, versions, modules, runs, policies
//! - [`error`] — Error taxonomy mapped onto HTTP statuses by the adapter
//! - [`config`] — Configuration file (`butler.toml`) loading
//! - [`store`] — The persistence contract ([`store::Store`])
//! - [`sqlite`] — SQLite implementation of the contract
//! - [`policy`] — Policy resolution and evaluation
//! - [`ingest`] — Webhook version ingestion and gated approvals
//! - [`cascade`] — Version fan-out into environment modules
//! - [`queue`] — Per-module run queue entry points
//! - [`runstate`] — Run status transition table
//! - [`runs`] — Run lifecycle choreography
//! - [`dag`] — Topological sort, frontier scheduling, skip propagation
//! - [`outputs`] — Upstream output resolution into downstream variables
//! - [`dispatch`] — Dispatcher loops and repository-dispatch transport
//! - [`ratelimit`] — Token-bucket rate limiting
//! - [`helm_cache`] — Short-TTL Helm index cache
//! - [`cursor`] — Opaque pagination cursors

pub mod cascade;
pub mod config;
pub mod cursor;
pub mod dag;
pub mod dispatch;
pub mod error;
pub mod helm_cache;
pub mod ingest;
pub mod outputs;
pub mod policy;
pub mod queue;
pub mod ratelimit;
pub mod runs;
pub mod runstate;
pub mod sqlite;
pub mod store;
pub mod types;

pub use error::{RegistryError, Result};
pub use sqlite::SqliteStore;
pub use store::Store;
