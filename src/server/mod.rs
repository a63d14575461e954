//! Local credential server (C12).
//!
//! Bound to loopback TCP or a Unix domain socket (mode `0600`). Every
//! request passes three authentication layers in order: transport binding,
//! bearer token, then a live policy+revocation recheck (spec §4.11).
//!
//! Grounded on `gateway::auth`'s `ResolvedAuthConfig`/`AuthenticatedClient`
//! shape for the token/auth plumbing and `gateway::server::Gateway::run`
//! for the bind/graceful-shutdown pattern. Unix-socket peer-credential
//! extraction has no teacher precedent; see [`peer_auth`].

pub mod peer_auth;

use std::net::SocketAddr;
use std::os::unix::fs::PermissionsExt;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use axum::extract::{ConnectInfo, Path as AxumPath, State};
use axum::http::{HeaderMap, StatusCode, header};
use axum::response::{IntoResponse, Response};
use axum::routing::get;
use axum::{Json, Router};
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::Serialize;
use serde_json::json;
use tokio::net::{TcpListener, UnixListener};
use tracing::info;

use peer_auth::UdsConnectInfo;

use crate::issuer::{Credentials, Issuer};
use crate::policy::evaluator;
use crate::policy::loader::PolicyLoader;
use crate::policy::{Effect, Request as PolicyRequest};
use crate::revocation;
use crate::store::session::SessionStore;

/// Where the credential server binds (spec §9 Open Question: this spec
/// leaves the choice to the deployer, preferring UDS where `peer_cred` is
/// available and falling back to loopback TCP elsewhere).
pub enum BindTarget {
    Tcp(SocketAddr),
    Unix(PathBuf),
}

/// Shared state for every request handler.
pub struct AppState {
    pub policy_loader: Arc<PolicyLoader>,
    pub policy_key: String,
    pub session_store: Arc<SessionStore>,
    pub issuer: Arc<Issuer>,
    pub tokens: Arc<TokenRegistry>,
    /// `Host` header allowlist, consulted only on the loopback-TCP
    /// transport (spec §4.11 "validates the `Host` header").
    pub allowed_hosts: Vec<String>,
}

/// A single issued bearer token and the peer identity it is bound to.
struct TokenBinding {
    bearer: String,
    user: String,
    profile: String,
    session_id: Option<String>,
    /// `None` on the loopback-TCP transport, where peer uids don't exist.
    bound_uid: Option<u32>,
    /// Filled in on first successful use (spec §9 "pid-bound-on-first-use").
    bound_pid: Option<u32>,
}

/// The identity a successfully authenticated request is acting as.
pub struct TokenContext {
    pub user: String,
    pub profile: String,
    pub session_id: Option<String>,
}

/// Tokens minted by this server instance (spec §5 "map guarded by a mutex;
/// tokens keyed by their bearer string"). Lookups scan linearly and compare
/// every candidate in constant time, rather than keying a `HashMap`
/// directly off the bearer string, since the orchestrator's own invariant
/// is "never string equality" for this comparison and the set of tokens a
/// single consumer holds is always small.
#[derive(Default)]
pub struct TokenRegistry {
    tokens: Mutex<Vec<TokenBinding>>,
}

impl TokenRegistry {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Mint and register a new bearer token for `(user, profile)`,
    /// optionally bound to a session and to a Unix peer uid.
    pub fn issue(&self, user: String, profile: String, session_id: Option<String>, bound_uid: Option<u32>) -> String {
        let bearer = crate::id::generate();
        self.tokens.lock().push(TokenBinding {
            bearer: bearer.clone(),
            user,
            profile,
            session_id,
            bound_uid,
            bound_pid: None,
        });
        bearer
    }

    /// Authenticate over the Unix-socket transport: the bearer must match
    /// and the peer's `uid` must match the token's bound uid. `pid` binds
    /// on first use and is checked strictly afterward.
    pub fn authenticate_unix(&self, provided: &str, peer_uid: u32, peer_pid: Option<u32>) -> Option<TokenContext> {
        let mut tokens = self.tokens.lock();
        for binding in tokens.iter_mut() {
            let matches: bool = subtle::ConstantTimeEq::ct_eq(binding.bearer.as_bytes(), provided.as_bytes()).into();
            if !matches {
                continue;
            }
            if binding.bound_uid != Some(peer_uid) {
                return None;
            }
            match (binding.bound_pid, peer_pid) {
                (Some(bound), Some(actual)) if bound != actual => return None,
                (None, Some(actual)) => binding.bound_pid = Some(actual),
                _ => {}
            }
            return Some(TokenContext {
                user: binding.user.clone(),
                profile: binding.profile.clone(),
                session_id: binding.session_id.clone(),
            });
        }
        None
    }

    /// Authenticate over the loopback-TCP transport: bearer match only, no
    /// uid/pid binding (peer credentials don't exist for TCP peers).
    pub fn authenticate_tcp(&self, provided: &str) -> Option<TokenContext> {
        let tokens = self.tokens.lock();
        for binding in tokens.iter() {
            let matches: bool = subtle::ConstantTimeEq::ct_eq(binding.bearer.as_bytes(), provided.as_bytes()).into();
            if matches {
                return Some(TokenContext {
                    user: binding.user.clone(),
                    profile: binding.profile.clone(),
                    session_id: binding.session_id.clone(),
                });
            }
        }
        None
    }
}

/// The credential response body (spec §6): `{AccessKeyId, SecretAccessKey,
/// Token, Expiration}`.
#[derive(Debug, Serialize)]
#[serde(rename_all = "PascalCase")]
pub struct CredentialsResponse {
    pub access_key_id: String,
    pub secret_access_key: String,
    pub token: String,
    pub expiration: DateTime<Utc>,
}

impl From<Credentials> for CredentialsResponse {
    fn from(credentials: Credentials) -> Self {
        Self {
            access_key_id: credentials.access_key_id,
            secret_access_key: credentials.secret_access_key,
            token: credentials.session_token,
            expiration: credentials.expiration,
        }
    }
}

fn extract_token(headers: &HeaderMap) -> crate::Result<String> {
    headers
        .get(header::AUTHORIZATION)
        .and_then(|value| value.to_str().ok())
        .map(|value| value.trim().to_string())
        .filter(|value| !value.is_empty())
        .ok_or_else(|| crate::Error::Unauthorized("missing Authorization header".to_string()))
}

fn error_response(err: crate::Error) -> Response {
    let status = match err {
        crate::Error::Unauthorized(_) => StatusCode::FORBIDDEN,
        _ => StatusCode::INTERNAL_SERVER_ERROR,
    };
    (status, Json(json!({ "error": err.public_message() }))).into_response()
}

/// Third authentication layer, run after transport binding and bearer
/// match succeed: reload policy, re-evaluate, and consult the revocation
/// engine before ever touching the issuer (spec §4.11 point 3).
async fn live_recheck_and_issue(state: &AppState, ctx: &TokenContext, role_arn: Option<&str>) -> crate::Result<CredentialsResponse> {
    let policy = state.policy_loader.load(&state.policy_key).await?;
    let request = PolicyRequest {
        user: ctx.user.clone(),
        profile: ctx.profile.clone(),
        instant: crate::id::now(),
    };
    let decision = evaluator::evaluate(&policy, &request)?;
    let still_permitted = matches!(decision.effect, Effect::Allow | Effect::RequireServer | Effect::RequireServerSession);
    if !still_permitted {
        return Err(crate::Error::Unauthorized("policy no longer permits this session".to_string()));
    }

    if let Some(session_id) = &ctx.session_id {
        if revocation::is_session_revoked(&state.session_store, session_id)? {
            return Err(crate::Error::Unauthorized("session has been revoked".to_string()));
        }
    }

    let correlation_identity = ctx
        .session_id
        .clone()
        .unwrap_or_else(|| crate::correlation::format(&ctx.user, &crate::id::generate()));

    let credentials = match role_arn {
        Some(arn) => state.issuer.issue(arn, &correlation_identity).await?,
        None => state.issuer.base_credentials().await?,
    };
    Ok(CredentialsResponse::from(credentials))
}

async fn handle_unix(state: &AppState, info: &UdsConnectInfo, headers: &HeaderMap, role_arn: Option<&str>) -> crate::Result<CredentialsResponse> {
    let token = extract_token(headers)?;
    let peer_pid = info.peer_cred.pid().map(|pid| pid as u32);
    let ctx = state
        .tokens
        .authenticate_unix(&token, info.peer_cred.uid(), peer_pid)
        .ok_or_else(|| crate::Error::Unauthorized("peer credentials did not match any issued token".to_string()))?;
    live_recheck_and_issue(state, &ctx, role_arn).await
}

async fn handle_tcp(state: &AppState, peer: SocketAddr, headers: &HeaderMap, role_arn: Option<&str>) -> crate::Result<CredentialsResponse> {
    if !peer_auth::is_loopback(peer) {
        return Err(crate::Error::Unauthorized("non-loopback peer rejected".to_string()));
    }
    let host = headers.get(header::HOST).and_then(|value| value.to_str().ok()).unwrap_or("");
    if !peer_auth::host_header_is_allowed(host, &state.allowed_hosts) {
        return Err(crate::Error::Unauthorized("host header not allowed".to_string()));
    }
    let token = extract_token(headers)?;
    let ctx = state
        .tokens
        .authenticate_tcp(&token)
        .ok_or_else(|| crate::Error::Unauthorized("bearer token not recognized".to_string()))?;
    live_recheck_and_issue(state, &ctx, role_arn).await
}

async fn unix_root(State(state): State<Arc<AppState>>, ConnectInfo(info): ConnectInfo<UdsConnectInfo>, headers: HeaderMap) -> Response {
    match handle_unix(&state, &info, &headers, None).await {
        Ok(body) => (StatusCode::OK, Json(body)).into_response(),
        Err(err) => error_response(err),
    }
}

async fn unix_role_arn(
    State(state): State<Arc<AppState>>,
    ConnectInfo(info): ConnectInfo<UdsConnectInfo>,
    headers: HeaderMap,
    AxumPath(arn): AxumPath<String>,
) -> Response {
    match handle_unix(&state, &info, &headers, Some(&arn)).await {
        Ok(body) => (StatusCode::OK, Json(body)).into_response(),
        Err(err) => error_response(err),
    }
}

async fn tcp_root(State(state): State<Arc<AppState>>, ConnectInfo(peer): ConnectInfo<SocketAddr>, headers: HeaderMap) -> Response {
    match handle_tcp(&state, peer, &headers, None).await {
        Ok(body) => (StatusCode::OK, Json(body)).into_response(),
        Err(err) => error_response(err),
    }
}

async fn tcp_role_arn(
    State(state): State<Arc<AppState>>,
    ConnectInfo(peer): ConnectInfo<SocketAddr>,
    headers: HeaderMap,
    AxumPath(arn): AxumPath<String>,
) -> Response {
    match handle_tcp(&state, peer, &headers, Some(&arn)).await {
        Ok(body) => (StatusCode::OK, Json(body)).into_response(),
        Err(err) => error_response(err),
    }
}

fn base_router() -> Router<Arc<AppState>> {
    Router::new()
        .layer(tower_http::timeout::TimeoutLayer::new(Duration::from_secs(10)))
        .layer(tower_http::catch_panic::CatchPanicLayer::new())
        .layer(tower_http::trace::TraceLayer::new_for_http())
}

fn unix_router(state: Arc<AppState>) -> Router {
    base_router()
        .route("/", get(unix_root))
        .route("/role-arn/{arn}", get(unix_role_arn))
        .with_state(state)
}

fn tcp_router(state: Arc<AppState>) -> Router {
    base_router()
        .route("/", get(tcp_root))
        .route("/role-arn/{arn}", get(tcp_role_arn))
        .with_state(state)
}

/// Run the credential server until a shutdown signal arrives.
pub async fn run(target: BindTarget, state: Arc<AppState>) -> crate::Result<()> {
    match target {
        BindTarget::Tcp(addr) => run_tcp(addr, state).await,
        BindTarget::Unix(path) => run_unix(path, state).await,
    }
}

async fn run_tcp(addr: SocketAddr, state: Arc<AppState>) -> crate::Result<()> {
    let listener = TcpListener::bind(addr).await?;
    info!(%addr, "credential server listening on loopback TCP");
    let app = tcp_router(state).into_make_service_with_connect_info::<SocketAddr>();
    axum::serve(listener, app).with_graceful_shutdown(shutdown_signal()).await?;
    Ok(())
}

async fn run_unix(path: PathBuf, state: Arc<AppState>) -> crate::Result<()> {
    // A process crash can leave a stale socket file behind; the next
    // startup must unlink it before binding (spec §4.11 "Shutdown").
    let _ = std::fs::remove_file(&path);
    let listener = UnixListener::bind(&path)?;
    std::fs::set_permissions(&path, std::fs::Permissions::from_mode(0o600))?;
    info!(path = %path.display(), "credential server listening on unix socket");
    let app = unix_router(state).into_make_service_with_connect_info::<UdsConnectInfo>();
    let result = axum::serve(listener, app).with_graceful_shutdown(shutdown_signal()).await;
    let _ = std::fs::remove_file(&path);
    result?;
    Ok(())
}

async fn shutdown_signal() {
    let ctrl_c = async {
        tokio::signal::ctrl_c().await.expect("failed to install Ctrl+C handler");
    };

    #[cfg(unix)]
    let terminate = async {
        tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())
            .expect("failed to install SIGTERM handler")
            .recv()
            .await;
    };
    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        () = ctrl_c => {},
        () = terminate => {},
    }
    info!("shutdown signal received");
}
