//! Configuration
//!
//! CLI arguments and environment variable handling using clap.

use clap::Parser;
use std::net::SocketAddr;
use uuid::Uuid;

/// Anchorhold - federated anchoring node for a content-addressed DID registry
#[derive(Parser, Debug, Clone)]
#[command(name = "anchorhold")]
#[command(about = "Federated anchoring node for a content-addressed DID registry")]
pub struct Args {
    /// Unique node identifier for this instance
    #[arg(long, env = "NODE_ID", default_value_t = Uuid::new_v4())]
    pub node_id: Uuid,

    /// Address to listen on
    #[arg(long, env = "LISTEN", default_value = "0.0.0.0:8080")]
    pub listen: SocketAddr,

    /// Public base URL of this node (e.g. "https://node1.example.com")
    #[arg(long, env = "EXTERNAL_URL", default_value = "http://localhost:8080")]
    pub external_url: String,

    /// Service path segment under /services
    #[arg(long, env = "SERVICE_ID", default_value = "anchor")]
    pub service_id: String,

    /// Bearer token for admin endpoints (outbox POST, accept-list
    /// management, inbox reads). Unset disables them.
    #[arg(long, env = "ADMIN_TOKEN")]
    pub admin_token: Option<String>,

    /// Reject inbox activities whose actor differs from the verified
    /// signature principal
    #[arg(long, env = "VERIFY_ACTOR_IN_SIGNATURE", default_value = "true")]
    pub verify_actor_in_signature: bool,

    /// Page size of the collection endpoints
    #[arg(long, env = "PAGE_SIZE", default_value = "50")]
    pub page_size: usize,

    /// Comma-separated actor IRIs allowed to follow this node
    #[arg(long, env = "FOLLOW_ACCEPT_LIST")]
    pub follow_accept_list: Option<String>,

    /// Comma-separated actor IRIs allowed to invite this node as witness
    #[arg(long, env = "INVITE_WITNESS_ACCEPT_LIST")]
    pub invite_witness_accept_list: Option<String>,

    /// Witness policy expression, e.g. "MinPercent(100,batch) AND OutOf(1,system)"
    #[arg(long, env = "WITNESS_POLICY", default_value = "MinPercent(100,batch)")]
    pub witness_policy: String,

    /// Seconds between batch-writer ticks
    #[arg(long, env = "BATCH_INTERVAL_SECONDS", default_value = "10")]
    pub batch_interval_seconds: u64,

    /// Maximum operations per anchor
    #[arg(long, env = "MAX_BATCH_SIZE", default_value = "100")]
    pub max_batch_size: usize,

    /// Seconds to wait for witness proofs before re-offering
    #[arg(long, env = "PROOF_DEADLINE_SECONDS", default_value = "60")]
    pub proof_deadline_seconds: u64,

    /// Seconds an unpublished operation may stay staged
    #[arg(long, env = "UNPUBLISHED_OPERATION_LIFESPAN_SECONDS", default_value = "3600")]
    pub unpublished_operation_lifespan_seconds: u64,

    /// Seconds between expiry sweeps
    #[arg(long, env = "EXPIRY_INTERVAL_SECONDS", default_value = "60")]
    pub expiry_interval_seconds: u64,

    /// Seconds between task-manager permit checks
    #[arg(long, env = "TASK_CHECK_INTERVAL_SECONDS", default_value = "10")]
    pub task_check_interval_seconds: u64,

    /// Observer worker-pool size per subscription
    #[arg(long, env = "OBSERVER_POOL_SIZE", default_value = "4")]
    pub observer_pool_size: usize,

    /// Observer per-message processing budget in seconds
    #[arg(long, env = "OBSERVER_TIMEOUT_SECONDS", default_value = "30")]
    pub observer_timeout_seconds: u64,

    /// Maximum anchor-graph depth before a walk is aborted
    #[arg(long, env = "MAX_GRAPH_DEPTH", default_value = "500")]
    pub max_graph_depth: usize,

    /// Outbound HTTP timeout in milliseconds
    #[arg(long, env = "REQUEST_TIMEOUT_MS", default_value = "10000")]
    pub request_timeout_ms: u64,

    /// IPFS API URL (e.g. "http://localhost:5001"); unset disables IPFS
    #[arg(long, env = "IPFS_URL")]
    pub ipfs_url: Option<String>,

    /// CID version used for IPFS writes (0 or 1)
    #[arg(long, env = "CID_VERSION", default_value = "1")]
    pub cid_version: u8,

    /// NATS configuration
    #[command(flatten)]
    pub nats: NatsArgs,

    /// Log level (trace, debug, info, warn, error)
    #[arg(long, env = "LOG_LEVEL", default_value = "info")]
    pub log_level: String,
}

/// NATS connection configuration; an unset URL selects the in-memory bus
#[derive(Parser, Debug, Clone)]
pub struct NatsArgs {
    /// NATS server URL (e.g. "nats://127.0.0.1:4222")
    #[arg(long, env = "NATS_URL")]
    pub nats_url: Option<String>,

    /// NATS username (optional)
    #[arg(long, env = "NATS_USER")]
    pub nats_user: Option<String>,

    /// NATS password (optional)
    #[arg(long, env = "NATS_PASSWORD")]
    pub nats_password: Option<String>,

    /// Publisher connection pool size
    #[arg(long, env = "NATS_PUBLISHER_POOL", default_value = "1")]
    pub nats_publisher_pool: usize,
}

impl Args {
    /// The IRI of this node's service actor
    pub fn service_iri(&self) -> String {
        format!(
            "{}/services/{}",
            self.external_url.trim_end_matches('/'),
            self.service_id
        )
    }

    /// Split a comma-separated accept list argument
    pub fn accept_list_entries(raw: &Option<String>) -> Vec<String> {
        raw.as_deref()
            .map(|s| {
                s.split(',')
                    .map(str::trim)
                    .filter(|e| !e.is_empty())
                    .map(str::to_string)
                    .collect()
            })
            .unwrap_or_default()
    }

    /// Validate configuration
    pub fn validate(&self) -> Result<(), String> {
        if self.page_size == 0 {
            return Err("PAGE_SIZE must be positive".to_string());
        }

        if self.cid_version != 0 && self.cid_version != 1 {
            return Err("CID_VERSION must be 0 or 1".to_string());
        }

        if !self.external_url.starts_with("http://") && !self.external_url.starts_with("https://") {
            return Err("EXTERNAL_URL must be an http(s) URL".to_string());
        }

        crate::anchor::witness::WitnessPolicy::parse(&self.witness_policy)
            .map_err(|e| format!("invalid WITNESS_POLICY: {e}"))?;

        Ok(())
    }
}
