//! Anchorhold - federated anchoring node for a content-addressed DID registry

use clap::Parser;
use std::sync::Arc;
use std::time::Duration;
use tracing::{error, info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use anchorhold::activity::acceptlist::{TYPE_FOLLOW, TYPE_INVITE_WITNESS};
use anchorhold::activity::{
    AcceptListManager, ActivityClient, ActivityStore, Inbox, InboxConfig, Outbox, OutboxConfig,
};
use anchorhold::anchor::build::{BatchWriter, BatchWriterConfig};
use anchorhold::anchor::graph::AnchorGraph;
use anchorhold::anchor::indexes::{DidAnchorIndex, ProcessedAnchorStore};
use anchorhold::anchor::witness::WitnessPolicy;
use anchorhold::cas::ipfs::{IpfsClient, IpfsConfig};
use anchorhold::cas::resolver::CasResolver;
use anchorhold::cas::{CasConfig, CasStore};
use anchorhold::config::Args;
use anchorhold::discovery::{WebFingerClient, WebFingerConfig};
use anchorhold::httpsig::{HttpKeyResolver, HttpSigner, HttpVerifier, SignedHttpClient};
use anchorhold::observer::{Observer, ObserverConfig, ObserverProviders};
use anchorhold::operations::store::UnpublishedOperationStore;
use anchorhold::operations::{AnchorTransaction, ProtocolClient};
use anchorhold::pubsub::memory::MemPubSub;
use anchorhold::pubsub::nats::{NatsPubSub, NatsPubSubConfig};
use anchorhold::pubsub::PubSub;
use anchorhold::server::{self, AppState};
use anchorhold::store::expiry::ExpiryService;
use anchorhold::store::memory::MemStoreProvider;
use anchorhold::store::StoreProvider;
use anchorhold::task::TaskManager;

/// Placeholder protocol client until an operation protocol is plugged in.
/// It accepts every transaction without materialising operations.
struct NoopProtocolClient;

#[async_trait::async_trait]
impl ProtocolClient for NoopProtocolClient {
    async fn process(&self, txn: AnchorTransaction, suffixes: &[String]) -> anchorhold::Result<usize> {
        tracing::debug!(anchor = %txn.canonical_reference, suffixes = suffixes.len(),
            "protocol client accepted transaction");
        Ok(suffixes.len())
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let _ = dotenvy::dotenv();

    let args = Args::parse();

    let log_level = args.log_level.clone();
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| format!("anchorhold={log_level},info").into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    if let Err(e) = args.validate() {
        error!("configuration error: {}", e);
        std::process::exit(1);
    }

    let service_iri = args.service_iri();

    info!("======================================");
    info!("  Anchorhold - DID anchoring node");
    info!("======================================");
    info!("Node ID: {}", args.node_id);
    info!("Listen: {}", args.listen);
    info!("Service: {}", service_iri);
    info!("Witness policy: {}", args.witness_policy);
    match &args.nats.nats_url {
        Some(url) => info!("Bus: NATS at {}", url),
        None => info!("Bus: in-memory"),
    }
    match &args.ipfs_url {
        Some(url) => info!("IPFS: {} (CID v{})", url, args.cid_version),
        None => info!("IPFS: disabled"),
    }
    info!("======================================");

    // Storage. Every keyspace comes from one provider so back-ends can
    // be swapped in a single place.
    let provider = MemStoreProvider::new();

    // Message bus.
    let pubsub: Arc<dyn PubSub> = match &args.nats.nats_url {
        Some(url) => {
            let nats = NatsPubSub::connect(
                NatsPubSubConfig {
                    url: url.clone(),
                    user: args.nats.nats_user.clone(),
                    password: args.nats.nats_password.clone(),
                    publisher_pool_size: args.nats.nats_publisher_pool,
                    ..NatsPubSubConfig::default()
                },
                "anchorhold",
            )
            .await?;
            Arc::new(nats)
        }
        None => Arc::new(MemPubSub::with_defaults()),
    };

    // Node key and signed transport.
    let signer = Arc::new(HttpSigner::generate(format!("{service_iri}/keys/main-key")));
    let request_timeout = Duration::from_millis(args.request_timeout_ms);
    let http = Arc::new(SignedHttpClient::new(Arc::clone(&signer), request_timeout)?);
    let key_resolver = Arc::new(HttpKeyResolver::new(
        request_timeout,
        Duration::from_secs(300),
    )?);
    let verifier = Arc::new(HttpVerifier::new(key_resolver));

    // CAS and resolution.
    let ipfs = match &args.ipfs_url {
        Some(url) => Some(Arc::new(IpfsClient::new(IpfsConfig {
            url: url.clone(),
            cid_version: args.cid_version,
            ..IpfsConfig::default()
        })?)),
        None => None,
    };

    let cas = Arc::new(CasStore::new(
        provider.open("cas")?,
        CasConfig {
            public_url: Some(args.external_url.trim_end_matches('/').to_string()),
            ..CasConfig::default()
        },
        ipfs.clone(),
    ));

    let webfinger = Arc::new(WebFingerClient::new(WebFingerConfig {
        request_timeout,
        ..WebFingerConfig::default()
    })?);

    let resolver = Arc::new(CasResolver::new(
        Arc::clone(&cas),
        ipfs,
        Arc::clone(&webfinger),
        Arc::clone(&http),
    ));

    // Indexes and staging stores.
    let did_index = Arc::new(DidAnchorIndex::new(provider.open("did-anchor")?));
    let processed = Arc::new(ProcessedAnchorStore::new(provider.open("anchor-status")?));
    let graph = Arc::new(AnchorGraph::new(
        Arc::clone(&resolver),
        Arc::clone(&processed),
        args.max_graph_depth,
    ));

    let expiry = Arc::new(ExpiryService::new());
    let unpublished = Arc::new(
        UnpublishedOperationStore::new(
            provider.open("unpublished-operation")?,
            Duration::from_secs(args.unpublished_operation_lifespan_seconds),
            &expiry,
        )
        .await,
    );

    // Activity protocol.
    let activity_store = Arc::new(ActivityStore::new(
        provider.open("activity")?,
        provider.open("activity-ref")?,
    ));
    let accept_lists = Arc::new(AcceptListManager::new(provider.open("accept-list")?));

    accept_lists
        .update(
            TYPE_FOLLOW,
            &Args::accept_list_entries(&args.follow_accept_list),
            &[],
        )
        .await?;
    accept_lists
        .update(
            TYPE_INVITE_WITNESS,
            &Args::accept_list_entries(&args.invite_witness_accept_list),
            &[],
        )
        .await?;

    let activity_client = Arc::new(ActivityClient::new(
        Arc::clone(&http),
        Duration::from_secs(300),
    ));

    let outbox = Arc::new(Outbox::new(
        OutboxConfig {
            service_iri: service_iri.clone(),
        },
        Arc::clone(&activity_store),
        Arc::clone(&pubsub),
        activity_client,
        Arc::clone(&http),
    ));
    outbox.start().await?;

    let inbox = Arc::new(Inbox::new(
        InboxConfig {
            service_iri: service_iri.clone(),
            verify_actor_in_signature: args.verify_actor_in_signature,
        },
        Arc::clone(&activity_store),
        Arc::clone(&accept_lists),
        Arc::clone(&outbox),
        Arc::clone(&pubsub),
        Arc::clone(&signer),
    ));
    inbox.start();

    // Batch writer.
    let writer = Arc::new(BatchWriter::new(
        BatchWriterConfig {
            service_iri: service_iri.clone(),
            witness_policy: WitnessPolicy::parse(&args.witness_policy)?,
            proof_deadline: Duration::from_secs(args.proof_deadline_seconds),
            max_batch_size: args.max_batch_size,
            protocol_version: 1,
        },
        Arc::clone(&cas),
        Arc::clone(&activity_store),
        Arc::clone(&outbox),
        Arc::clone(&unpublished),
        Arc::clone(&did_index),
        Arc::clone(&pubsub),
        Arc::clone(&signer),
    ));
    writer.start().await?;

    // Observer.
    let observer = Arc::new(Observer::new(
        ObserverConfig {
            service_iri: service_iri.clone(),
            pool_size: args.observer_pool_size,
            process_timeout: Duration::from_secs(args.observer_timeout_seconds),
        },
        ObserverProviders {
            graph,
            did_index,
            processed,
            protocol: Arc::new(NoopProtocolClient),
            outbox: Arc::clone(&outbox),
            webfinger,
            pubsub: Arc::clone(&pubsub),
        },
    ));
    observer.start().await?;

    // Periodic jobs run under the cluster-wide task manager.
    let task_manager = Arc::new(TaskManager::new(
        provider.open("task-permit")?,
        args.node_id.to_string(),
        Duration::from_secs(args.task_check_interval_seconds),
    ));

    {
        let writer = Arc::clone(&writer);
        task_manager
            .register(
                "anchor-batch",
                Duration::from_secs(args.batch_interval_seconds),
                move || {
                    let writer = Arc::clone(&writer);
                    async move {
                        if let Err(e) = writer.run_batch().await {
                            warn!(error = %e, "batch tick failed");
                        }
                    }
                },
            )
            .await;
    }

    {
        let expiry = Arc::clone(&expiry);
        task_manager
            .register(
                "data-expiry",
                Duration::from_secs(args.expiry_interval_seconds),
                move || {
                    let expiry = Arc::clone(&expiry);
                    async move {
                        expiry.sweep().await;
                    }
                },
            )
            .await;
    }

    task_manager.start().await;

    // HTTP surface.
    let state = Arc::new(AppState {
        args: args.clone(),
        service_iri,
        activity_store,
        accept_lists,
        inbox: Arc::clone(&inbox),
        outbox: Arc::clone(&outbox),
        cas,
        verifier,
        signer,
    });

    tokio::select! {
        result = server::run(state) => {
            if let Err(e) = result {
                error!("server terminated: {}", e);
            }
        }
        _ = tokio::signal::ctrl_c() => {
            info!("shutdown signal received");
        }
    }

    observer.stop().await;
    writer.stop().await;
    inbox.stop();
    outbox.stop().await;
    task_manager.stop().await;
    pubsub.close().await?;

    info!("anchorhold stopped");

    Ok(())
}
