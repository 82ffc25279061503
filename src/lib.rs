//! Anchorhold - federated anchoring node for a content-addressed DID registry
//!
//! Anchorhold batches DID operations into immutable anchors, has each
//! anchor witnessed by peer nodes, and replicates anchors across the
//! federation over an activity-stream protocol. Remote nodes observe
//! anchor announcements, fetch the referenced content through a
//! multi-tier content-addressable resolver, verify witness proofs and
//! materialise the resulting DID state locally so that any node can
//! resolve any DID in the network.
//!
//! ## Services
//!
//! - **Inbox/Outbox**: the activity protocol engine (follow, witness
//!   invitations, anchor announcements, likes, undo)
//! - **Observer**: consumes anchor announcements, walks the anchor DAG
//!   and materialises operations in order
//! - **Batch writer**: composes anchors from staged operations and
//!   collects witness proofs
//! - **CAS**: local content-addressable store with IPFS and peer WebCAS
//!   fallbacks
//! - **Task manager**: cluster-wide permits for periodic jobs

pub mod activity;
pub mod anchor;
pub mod cas;
pub mod config;
pub mod discovery;
pub mod error;
pub mod hashlink;
pub mod httpsig;
pub mod lifecycle;
pub mod observer;
pub mod operations;
pub mod pubsub;
pub mod retry;
pub mod routes;
pub mod server;
pub mod store;
pub mod task;

pub use config::Args;
pub use error::{Error, ErrorKind, Result};
pub use server::{run, AppState};
