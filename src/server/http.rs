//! HTTP server implementation
//!
//! hyper http1 with TokioIo and match-based routing. All write endpoints
//! require a signed request or the configured admin bearer token;
//! unauthenticated reads see only public items.

use bytes::Bytes;
use http_body_util::{BodyExt, Full};
use hyper::body::Incoming;
use hyper::server::conn::http1;
use hyper::service::service_fn;
use hyper::{Method, Request, Response, StatusCode};
use hyper_util::rt::TokioIo;
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::net::TcpListener;
use tracing::{debug, error, info};

use crate::activity::acceptlist::{TYPE_FOLLOW, TYPE_INVITE_WITNESS};
use crate::activity::{
    AcceptListManager, Activity, ActivityStore, Actor, Inbox, Outbox, ReferenceKind,
};
use crate::cas::CasStore;
use crate::config::Args;
use crate::discovery::{Jrd, JrdLink};
use crate::error::Result;
use crate::httpsig::{HttpSigner, HttpVerifier, RequestParts};
use crate::routes::{self, collections};
use crate::store::SortOrder;

/// Shared application state
pub struct AppState {
    pub args: Args,
    pub service_iri: String,
    pub activity_store: Arc<ActivityStore>,
    pub accept_lists: Arc<AcceptListManager>,
    pub inbox: Arc<Inbox>,
    pub outbox: Arc<Outbox>,
    pub cas: Arc<CasStore>,
    pub verifier: Arc<HttpVerifier>,
    pub signer: Arc<HttpSigner>,
}

impl AppState {
    /// The actor document served at the service IRI
    pub fn actor_document(&self) -> Actor {
        Actor::for_service(&self.service_iri, self.signer.public_key_doc(&self.service_iri))
    }

    fn admin_authorized(&self, req: &Request<Incoming>) -> bool {
        let Some(expected) = &self.args.admin_token else {
            return false;
        };

        req.headers()
            .get("Authorization")
            .and_then(|h| h.to_str().ok())
            .and_then(|h| h.strip_prefix("Bearer "))
            .map(|token| token == expected)
            .unwrap_or(false)
    }
}

/// Start the HTTP server
pub async fn run(state: Arc<AppState>) -> Result<()> {
    let listener = TcpListener::bind(state.args.listen)
        .await
        .map_err(|e| crate::error::Error::transient(format!("bind {}: {e}", state.args.listen)))?;

    info!(
        "anchorhold listening on {} as node {}",
        state.args.listen, state.args.node_id
    );

    loop {
        match listener.accept().await {
            Ok((stream, addr)) => {
                let state = Arc::clone(&state);
                tokio::spawn(async move {
                    let io = TokioIo::new(stream);

                    let service = service_fn(move |req| {
                        let state = Arc::clone(&state);
                        async move { handle_request(state, addr, req).await }
                    });

                    if let Err(err) = http1::Builder::new().serve_connection(io, service).await {
                        debug!("error serving connection from {}: {:?}", addr, err);
                    }
                });
            }
            Err(e) => {
                error!("error accepting connection: {:?}", e);
            }
        }
    }
}

type BoxError = std::convert::Infallible;

/// Route incoming HTTP requests
async fn handle_request(
    state: Arc<AppState>,
    addr: SocketAddr,
    req: Request<Incoming>,
) -> std::result::Result<Response<Full<Bytes>>, BoxError> {
    let method = req.method().clone();
    let path = req.uri().path().to_string();
    let query = req.uri().query().map(str::to_string);

    debug!("[{}] {} {}", addr, method, path);

    let service_prefix = format!("/services/{}", state.args.service_id);

    let response = match (method, path.as_str()) {
        // Liveness probe
        (Method::GET, "/health") | (Method::GET, "/healthz") => routes::ok_json(serde_json::json!({
            "status": "ok",
            "service": state.service_iri,
        })),

        // WebCAS content by multihash
        (Method::GET, p) if p.starts_with("/cas/") => {
            let hash = routes::percent_decode(p.strip_prefix("/cas/").unwrap_or(""));
            handle_cas(&state, &hash).await
        }

        // Resource discovery
        (Method::GET, "/.well-known/webfinger") => {
            handle_webfinger(&state, query.as_deref()).await
        }
        (Method::GET, "/.well-known/host-meta.json") => handle_host_meta(&state),

        // The service actor document
        (Method::GET, p) if p == service_prefix => {
            routes::ok_json(serde_json::to_value(state.actor_document()).unwrap_or_default())
        }

        (method, p) if p.starts_with(&service_prefix) => {
            let rest = p[service_prefix.len()..].to_string();
            handle_service_request(state, method, &rest, query.as_deref(), req).await
        }

        _ => routes::not_found(),
    };

    Ok(response)
}

/// Routes under /services/{svc}
async fn handle_service_request(
    state: Arc<AppState>,
    method: Method,
    rest: &str,
    query: Option<&str>,
    req: Request<Incoming>,
) -> Response<Full<Bytes>> {
    match (method, rest) {
        (Method::POST, "/inbox") => handle_inbox_post(&state, req).await,

        (Method::GET, "/inbox") => {
            if !state.admin_authorized(&req) {
                return routes::unauthorized();
            }
            activity_collection(&state, ReferenceKind::Inbox, &state.service_iri, "/inbox", query)
                .await
        }

        (Method::POST, "/outbox") => handle_outbox_post(&state, req).await,

        (Method::GET, "/outbox") => {
            // Unauthenticated readers see only the public outbox.
            let kind = if state.admin_authorized(&req) {
                ReferenceKind::Outbox
            } else {
                ReferenceKind::PublicOutbox
            };
            activity_collection(&state, kind, &state.service_iri, "/outbox", query).await
        }

        (Method::GET, "/followers") => {
            reference_collection(&state, ReferenceKind::Follower, &state.service_iri, "/followers", query).await
        }
        (Method::GET, "/following") => {
            reference_collection(&state, ReferenceKind::Following, &state.service_iri, "/following", query).await
        }
        (Method::GET, "/witnesses") => {
            reference_collection(&state, ReferenceKind::Witness, &state.service_iri, "/witnesses", query).await
        }
        (Method::GET, "/witnessing") => {
            reference_collection(&state, ReferenceKind::Witnessing, &state.service_iri, "/witnessing", query).await
        }

        (Method::GET, "/liked") => {
            activity_collection(&state, ReferenceKind::Liked, &state.service_iri, "/liked", query)
                .await
        }

        (Method::GET, p) if p.starts_with("/shares/") => {
            let object = routes::percent_decode(p.strip_prefix("/shares/").unwrap_or(""));
            reference_collection(&state, ReferenceKind::Share, &object, p, query).await
        }

        (Method::GET, p) if p.starts_with("/likes/") => {
            let object = routes::percent_decode(p.strip_prefix("/likes/").unwrap_or(""));
            reference_collection(&state, ReferenceKind::Like, &object, p, query).await
        }

        (Method::GET, p) if p.starts_with("/activities/") => {
            handle_activity(&state, p, state.admin_authorized(&req)).await
        }

        (Method::GET, p) if p.starts_with("/keys/") => {
            handle_key(&state, p.strip_prefix("/keys/").unwrap_or(""))
        }

        (Method::GET, "/acceptlist") => {
            if !state.admin_authorized(&req) {
                return routes::unauthorized();
            }
            handle_acceptlist_get(&state, query).await
        }

        (Method::POST, "/acceptlist") => {
            if !state.admin_authorized(&req) {
                return routes::unauthorized();
            }
            handle_acceptlist_post(&state, req).await
        }

        _ => routes::not_found(),
    }
}

/// POST /services/{svc}/inbox: verify the HTTP signature, then dispatch
/// the activity to the protocol engine.
async fn handle_inbox_post(state: &AppState, req: Request<Incoming>) -> Response<Full<Bytes>> {
    let (parts, body) = req.into_parts();

    let target = match parts.uri.query() {
        Some(q) => format!("{}?{q}", parts.uri.path()),
        None => parts.uri.path().to_string(),
    };

    let header = |name: &str| {
        parts
            .headers
            .get(name)
            .and_then(|h| h.to_str().ok())
            .unwrap_or_default()
            .to_string()
    };

    let request_parts = RequestParts {
        method: parts.method.as_str().to_string(),
        target,
        host: header("host"),
        date: header("date"),
        digest: header("digest"),
        signature: parts
            .headers
            .get("signature")
            .and_then(|h| h.to_str().ok())
            .map(str::to_string),
    };

    let body = match body.collect().await {
        Ok(collected) => collected.to_bytes(),
        Err(_) => return routes::bad_request(),
    };

    let principal = match state.verifier.verify(&request_parts, &body).await {
        Ok(principal) => principal,
        Err(e) => {
            debug!(error = %e, "inbox signature verification failed");
            return routes::error_response(&e);
        }
    };

    let activity: Activity = match serde_json::from_slice(&body) {
        Ok(a) => a,
        Err(e) => {
            debug!(error = %e, "invalid activity document");
            return routes::bad_request();
        }
    };

    match state.inbox.handle(activity, Some(&principal)).await {
        Ok(()) => Response::builder()
            .status(StatusCode::OK)
            .body(Full::new(Bytes::new()))
            .expect("static response"),
        Err(e) => {
            debug!(error = %e, "inbox handling failed");
            routes::error_response(&e)
        }
    }
}

/// POST /services/{svc}/outbox: admin-posted activity for delivery
async fn handle_outbox_post(state: &AppState, req: Request<Incoming>) -> Response<Full<Bytes>> {
    if !state.admin_authorized(&req) {
        return routes::unauthorized();
    }

    let body = match req.into_body().collect().await {
        Ok(collected) => collected.to_bytes(),
        Err(_) => return routes::bad_request(),
    };

    let activity: Activity = match serde_json::from_slice(&body) {
        Ok(a) => a,
        Err(_) => return routes::bad_request(),
    };

    match state.outbox.post(activity).await {
        Ok(id) => routes::ok_json(serde_json::json!({ "id": id })),
        Err(e) => routes::error_response(&e),
    }
}

/// Paged collection of activities (inbox, outbox, liked)
async fn activity_collection(
    state: &AppState,
    kind: ReferenceKind,
    owner: &str,
    path: &str,
    query: Option<&str>,
) -> Response<Full<Bytes>> {
    let iri = format!("{}{path}", state.service_iri);
    let order = SortOrder::Descending;

    match collections::page_request(query, state.args.page_size, order) {
        None => {
            let total = match state.activity_store.references(kind, owner, order).await {
                Ok(refs) => refs.len(),
                Err(e) => return routes::error_response(&e),
            };

            routes::ok_json(collections::collection_json(
                &iri,
                total,
                state.args.page_size,
                order,
            ))
        }
        Some(request) => {
            let page = match state
                .activity_store
                .query_activities(kind, owner, None, &request)
                .await
            {
                Ok(page) => page,
                Err(e) => return routes::error_response(&e),
            };

            let items: Vec<serde_json::Value> = page
                .items
                .iter()
                .filter_map(|a| serde_json::to_value(a).ok())
                .collect();

            routes::ok_json(collections::page_json(
                &iri,
                &crate::activity::Page {
                    items,
                    total_items: page.total_items,
                    current: page.current,
                    prev: page.prev,
                    next: page.next,
                },
            ))
        }
    }
}

/// Paged collection of IRIs (followers, witnesses, shares, likes, ...)
async fn reference_collection(
    state: &AppState,
    kind: ReferenceKind,
    owner: &str,
    path: &str,
    query: Option<&str>,
) -> Response<Full<Bytes>> {
    let iri = format!("{}{path}", state.service_iri);
    let order = SortOrder::Ascending;

    match collections::page_request(query, state.args.page_size, order) {
        None => {
            let total = match state.activity_store.references(kind, owner, order).await {
                Ok(refs) => refs.len(),
                Err(e) => return routes::error_response(&e),
            };

            routes::ok_json(collections::collection_json(
                &iri,
                total,
                state.args.page_size,
                order,
            ))
        }
        Some(request) => {
            let page = match state
                .activity_store
                .query_references(kind, owner, &request)
                .await
            {
                Ok(page) => page,
                Err(e) => return routes::error_response(&e),
            };

            let items: Vec<serde_json::Value> = page
                .items
                .iter()
                .map(|iri| serde_json::Value::String(iri.clone()))
                .collect();

            routes::ok_json(collections::page_json(
                &iri,
                &crate::activity::Page {
                    items,
                    total_items: page.total_items,
                    current: page.current,
                    prev: page.prev,
                    next: page.next,
                },
            ))
        }
    }
}

/// GET /services/{svc}/activities/{uuid}: non-public activities require
/// authorisation.
async fn handle_activity(state: &AppState, path: &str, authorized: bool) -> Response<Full<Bytes>> {
    let iri = format!("{}{path}", state.service_iri);

    match state.activity_store.get_activity(&iri).await {
        Ok(activity) => {
            if !activity.is_public() && !authorized {
                return routes::unauthorized();
            }
            routes::ok_json(serde_json::to_value(&activity).unwrap_or_default())
        }
        Err(e) if e.is_not_found() => routes::not_found(),
        Err(e) => routes::error_response(&e),
    }
}

/// GET /services/{svc}/keys/{id}
fn handle_key(state: &AppState, id: &str) -> Response<Full<Bytes>> {
    if id != "main-key" {
        return routes::not_found();
    }

    let doc = state.signer.public_key_doc(&state.service_iri);
    routes::ok_json(serde_json::to_value(&doc).unwrap_or_default())
}

/// GET /cas/{hash}
async fn handle_cas(state: &AppState, hash: &str) -> Response<Full<Bytes>> {
    match state.cas.read(hash).await {
        Ok(bytes) => routes::bytes_response("application/octet-stream", bytes),
        Err(e) if e.is_not_found() => routes::not_found(),
        Err(e) => routes::error_response(&e),
    }
}

/// GET /.well-known/webfinger?resource=...
async fn handle_webfinger(state: &AppState, query: Option<&str>) -> Response<Full<Bytes>> {
    let Some(resource) = routes::query_param(query, "resource").map(routes::percent_decode) else {
        return routes::bad_request();
    };

    let external = state.args.external_url.trim_end_matches('/');

    if resource == state.service_iri {
        let jrd = Jrd {
            subject: Some(resource.clone()),
            links: vec![JrdLink {
                rel: "self".to_string(),
                link_type: Some(routes::ACTIVITY_JSON.to_string()),
                href: Some(state.service_iri.clone()),
                template: None,
            }],
        };
        return routes::ok_json(serde_json::to_value(&jrd).unwrap_or_default());
    }

    if let Some(hash) = resource.strip_prefix(&format!("{external}/cas/")) {
        // Only advertise content this node actually holds.
        if state.cas.read(hash).await.is_err() {
            return routes::not_found();
        }

        let jrd = Jrd {
            subject: Some(resource.clone()),
            links: vec![JrdLink {
                rel: "self".to_string(),
                link_type: None,
                href: Some(format!("{external}/cas/{hash}")),
                template: None,
            }],
        };
        return routes::ok_json(serde_json::to_value(&jrd).unwrap_or_default());
    }

    routes::not_found()
}

/// GET /.well-known/host-meta.json
fn handle_host_meta(state: &AppState) -> Response<Full<Bytes>> {
    let external = state.args.external_url.trim_end_matches('/');

    let jrd = Jrd {
        subject: None,
        links: vec![
            JrdLink {
                rel: "self".to_string(),
                link_type: Some(routes::ACTIVITY_JSON.to_string()),
                href: Some(state.service_iri.clone()),
                template: None,
            },
            JrdLink {
                rel: "webcas".to_string(),
                link_type: None,
                href: None,
                template: Some(format!("{external}/cas/{{hash}}")),
            },
        ],
    };

    routes::ok_json(serde_json::to_value(&jrd).unwrap_or_default())
}

/// GET /services/{svc}/acceptlist[?type=follow]
async fn handle_acceptlist_get(state: &AppState, query: Option<&str>) -> Response<Full<Bytes>> {
    let list_types: Vec<&str> = match routes::query_param(query, "type") {
        Some(t) => vec![t],
        None => vec![TYPE_FOLLOW, TYPE_INVITE_WITNESS],
    };

    let mut lists = Vec::new();
    for list_type in list_types {
        match state.accept_lists.get(list_type).await {
            Ok(entries) => lists.push(serde_json::json!({
                "type": list_type,
                "url": entries,
            })),
            Err(e) => return routes::error_response(&e),
        }
    }

    routes::ok_json(serde_json::Value::Array(lists))
}

#[derive(serde::Deserialize)]
struct AcceptListUpdate {
    #[serde(rename = "type")]
    list_type: String,
    #[serde(default)]
    add: Vec<String>,
    #[serde(default)]
    remove: Vec<String>,
}

/// POST /services/{svc}/acceptlist
async fn handle_acceptlist_post(state: &AppState, req: Request<Incoming>) -> Response<Full<Bytes>> {
    let body = match req.into_body().collect().await {
        Ok(collected) => collected.to_bytes(),
        Err(_) => return routes::bad_request(),
    };

    let updates: Vec<AcceptListUpdate> = match serde_json::from_slice(&body) {
        Ok(u) => u,
        Err(_) => return routes::bad_request(),
    };

    for update in updates {
        if let Err(e) = state
            .accept_lists
            .update(&update.list_type, &update.add, &update.remove)
            .await
        {
            return routes::error_response(&e);
        }
    }

    Response::builder()
        .status(StatusCode::OK)
        .body(Full::new(Bytes::new()))
        .expect("static response")
}
