//! Activity protocol engine
//!
//! Vocabulary, persistence, accept lists and the inbox/outbox state
//! machines that replicate anchors between federated nodes.

pub mod acceptlist;
pub mod client;
pub mod inbox;
pub mod outbox;
pub mod store;
pub mod vocab;

pub use acceptlist::AcceptListManager;
pub use client::ActivityClient;
pub use inbox::{Inbox, InboxConfig};
pub use outbox::{Outbox, OutboxConfig};
pub use store::{ActivityStore, Page, PageRequest, ReferenceKind};
pub use vocab::{Activity, ActivityType, Actor, AnchorReference, ObjectProperty, PUBLIC_IRI};
