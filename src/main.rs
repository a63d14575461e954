//! Sentinel - policy-enforcing gateway between callers and the cloud STS.

use std::collections::HashMap;
use std::process::ExitCode;
use std::sync::Arc;

use clap::Parser;
use tracing::{error, info};

use sentinel::audit::{AuditLogger, StaticKey};
use sentinel::cli::{Cli, Command};
use sentinel::config::{BindConfig, Config};
use sentinel::issuer::{Issuer, StaticIdentitySource, StaticRoleAssumer};
use sentinel::mfa::MultiVerifier;
use sentinel::mfa::totp::TotpVerifier;
use sentinel::notify::{CompositeNotifier, RecordingNotifier};
use sentinel::orchestrator::{Mode, Orchestrator, Outcome};
use sentinel::policy::loader::{FilePolicySource, PolicyLoader};
use sentinel::server::{self, AppState, BindTarget, CredentialsResponse, TokenRegistry};
use sentinel::setup_tracing;
use sentinel::store::approval::{ApprovalService, ApprovalStore};
use sentinel::store::breakglass::{BreakGlassStore, ReasonCode};
use sentinel::store::session::SessionStore;

/// Base credentials' assumed lifetime when nothing better is known, used by
/// [`StaticRoleAssumer`] to compute an expiration for the minted session.
const ISSUER_SESSION_TTL: std::time::Duration = std::time::Duration::from_secs(3600);

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse();

    if let Err(e) = setup_tracing(&cli.log_level, cli.log_format.as_deref()) {
        eprintln!("failed to set up tracing: {e}");
        return ExitCode::FAILURE;
    }

    let config = match Config::load(cli.config.as_deref()) {
        Ok(config) => config,
        Err(e) => {
            error!("failed to load configuration: {e}");
            return ExitCode::FAILURE;
        }
    };

    info!(version = env!("CARGO_PKG_VERSION"), "starting sentinel");

    let deps = match build_deps(&config) {
        Ok(deps) => deps,
        Err(e) => {
            error!("failed to initialize: {e}");
            return ExitCode::FAILURE;
        }
    };
    let orchestrator = match build_orchestrator(&config, &deps) {
        Ok(o) => o,
        Err(e) => {
            error!("failed to initialize: {e}");
            return ExitCode::FAILURE;
        }
    };

    match cli.command {
        Command::Request { user, profile, role_arn, device_id } => {
            run_request(&orchestrator, &user, &profile, &role_arn, device_id).await
        }
        Command::BreakGlass {
            invoker,
            profile,
            role_arn,
            reason_code,
            justification,
            duration_minutes,
            mfa_challenge_id,
            mfa_code,
        } => {
            run_break_glass(
                &orchestrator,
                &invoker,
                &profile,
                &role_arn,
                &reason_code,
                justification,
                duration_minutes,
                &mfa_challenge_id,
                &mfa_code,
            )
            .await
        }
        Command::Serve { user, profile, role_arn, device_id, token_out } => {
            run_serve(&config, deps, orchestrator, &user, &profile, &role_arn, device_id, token_out.as_deref()).await
        }
    }
}

/// Subsystem instances shared between the orchestrator (bootstrapping a
/// session) and the credential server (re-evaluating and re-deriving on
/// every subsequent request). Keeping one [`SessionStore`]/[`Issuer`]/
/// [`PolicyLoader`] per process, rather than one per consumer, is what
/// makes the server's revocation recheck (spec §4.11 point 3) actually see
/// sessions the orchestrator created.
struct Deps {
    policy_loader: Arc<PolicyLoader>,
    session_store: Arc<SessionStore>,
    issuer: Arc<Issuer>,
}

fn build_deps(config: &Config) -> sentinel::Result<Deps> {
    let public_key = std::fs::read(&config.policy.public_key_path)?;
    let source = Arc::new(FilePolicySource::new(config.policy.source_dir.clone()));
    let policy_loader = Arc::new(PolicyLoader::new(source, public_key));

    let session_store = Arc::new(SessionStore::new());

    let base_credentials = sentinel::issuer::Credentials {
        access_key_id: std::env::var("AWS_ACCESS_KEY_ID").unwrap_or_default(),
        secret_access_key: std::env::var("AWS_SECRET_ACCESS_KEY").unwrap_or_default(),
        session_token: std::env::var("AWS_SESSION_TOKEN").unwrap_or_default(),
        expiration: sentinel::id::now() + chrono::Duration::hours(12),
    };
    let issuer = Arc::new(Issuer::new(
        Arc::new(StaticIdentitySource::new(base_credentials)),
        Arc::new(StaticRoleAssumer::new(ISSUER_SESSION_TTL)),
    ));

    Ok(Deps { policy_loader, session_store, issuer })
}

fn build_orchestrator(config: &Config, deps: &Deps) -> sentinel::Result<Orchestrator<StaticKey>> {
    let approvals = Arc::new(ApprovalService::new(Arc::new(ApprovalStore::new()), config.approval.clone()));
    let breakglass_store = Arc::new(BreakGlassStore::new());

    let audit_key = std::fs::read(&config.audit.key_path)?;
    let audit = Arc::new(AuditLogger::new(StaticKey::new(config.audit.key_id.clone(), audit_key)));

    let notifier = Arc::new(CompositeNotifier::new(vec![Box::new(RecordingNotifier::new())]));

    let mfa = Arc::new(MultiVerifier::new(vec![Box::new(load_totp_verifier(&config.mfa.totp_store_path)?)]));

    Ok(Orchestrator::new(
        Arc::clone(&deps.policy_loader),
        config.policy.source_key.clone(),
        approvals,
        breakglass_store,
        config.breakglass.clone(),
        Arc::clone(&deps.session_store),
        Arc::clone(&deps.issuer),
        audit,
        notifier,
        mfa,
        config.server.server_instance_id.clone(),
    ))
}

/// Load TOTP enrollments from a JSON file of `{"user": "hex-encoded-secret"}`.
/// A missing file yields an empty (deny-all) verifier rather than an error,
/// matching `FilePolicySource`'s fail-closed-but-startable posture.
fn load_totp_verifier(path: &str) -> sentinel::Result<TotpVerifier> {
    let secrets: HashMap<String, String> = match std::fs::read(path) {
        Ok(bytes) => serde_json::from_slice(&bytes)?,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => HashMap::new(),
        Err(e) => return Err(sentinel::Error::Io(e)),
    };
    let secrets = secrets
        .into_iter()
        .map(|(user, hex_secret)| {
            hex::decode(&hex_secret)
                .map(|bytes| (user, bytes))
                .map_err(|e| sentinel::Error::Config(format!("invalid TOTP secret hex: {e}")))
        })
        .collect::<sentinel::Result<HashMap<_, _>>>()?;
    Ok(TotpVerifier::new(secrets, 6, 1))
}

fn parse_reason_code(s: &str) -> sentinel::Result<ReasonCode> {
    match s {
        "incident" => Ok(ReasonCode::Incident),
        "maintenance" => Ok(ReasonCode::Maintenance),
        "security" => Ok(ReasonCode::Security),
        "recovery" => Ok(ReasonCode::Recovery),
        "other" => Ok(ReasonCode::Other),
        other => Err(sentinel::Error::InvalidPolicy(format!("unknown reason code: {other}"))),
    }
}

fn print_outcome(outcome: &Outcome) {
    match outcome {
        Outcome::Issued { credentials, correlation_identity, session_id } => {
            let response = CredentialsResponse::from(credentials.clone());
            info!(%correlation_identity, session_id = session_id.as_deref().unwrap_or(""), "credentials issued");
            println!("{}", serde_json::to_string_pretty(&response).expect("CredentialsResponse always serializes"));
        }
        Outcome::Denied { reason } => {
            println!("{}", serde_json::json!({ "denied": reason }));
        }
    }
}

async fn run_request(orchestrator: &Orchestrator<StaticKey>, user: &str, profile: &str, role_arn: &str, device_id: Option<String>) -> ExitCode {
    match orchestrator.request_credentials(user, profile, Mode::Cli, role_arn, device_id).await {
        Ok(outcome @ Outcome::Issued { .. }) => {
            print_outcome(&outcome);
            ExitCode::SUCCESS
        }
        Ok(outcome @ Outcome::Denied { .. }) => {
            print_outcome(&outcome);
            ExitCode::FAILURE
        }
        Err(e) => {
            error!("credential request failed: {e}");
            ExitCode::FAILURE
        }
    }
}

#[allow(clippy::too_many_arguments)]
async fn run_break_glass(
    orchestrator: &Orchestrator<StaticKey>,
    invoker: &str,
    profile: &str,
    role_arn: &str,
    reason_code: &str,
    justification: String,
    duration_minutes: i64,
    mfa_challenge_id: &str,
    mfa_code: &str,
) -> ExitCode {
    let reason_code = match parse_reason_code(reason_code) {
        Ok(code) => code,
        Err(e) => {
            error!("{e}");
            return ExitCode::FAILURE;
        }
    };
    let duration = chrono::Duration::minutes(duration_minutes);

    match orchestrator
        .activate_break_glass(invoker, profile, role_arn, reason_code, justification, duration, mfa_challenge_id, mfa_code)
        .await
    {
        Ok(outcome @ Outcome::Issued { .. }) => {
            print_outcome(&outcome);
            ExitCode::SUCCESS
        }
        Ok(outcome @ Outcome::Denied { .. }) => {
            print_outcome(&outcome);
            ExitCode::FAILURE
        }
        Err(e) => {
            error!("break-glass activation failed: {e}");
            ExitCode::FAILURE
        }
    }
}

#[allow(clippy::too_many_arguments)]
async fn run_serve(
    config: &Config,
    deps: Deps,
    orchestrator: Orchestrator<StaticKey>,
    user: &str,
    profile: &str,
    role_arn: &str,
    device_id: Option<String>,
    token_out: Option<&std::path::Path>,
) -> ExitCode {
    let outcome = match orchestrator.request_credentials(user, profile, Mode::Server, role_arn, device_id).await {
        Ok(outcome) => outcome,
        Err(e) => {
            error!("initial credential request failed: {e}");
            return ExitCode::FAILURE;
        }
    };

    let Outcome::Issued { session_id, .. } = outcome else {
        error!("initial credential request was denied; refusing to start the server");
        return ExitCode::FAILURE;
    };

    let Deps { policy_loader, session_store, issuer } = deps;
    let tokens = Arc::new(TokenRegistry::new());
    let bind_target = match &config.server.bind {
        BindConfig::Tcp { host, port } => {
            let addr = match format!("{host}:{port}").parse() {
                Ok(addr) => addr,
                Err(e) => {
                    error!("invalid bind address: {e}");
                    return ExitCode::FAILURE;
                }
            };
            let bearer = tokens.issue(user.to_string(), profile.to_string(), session_id, None);
            if let Err(e) = write_token(token_out, &bearer) {
                error!("failed to write token: {e}");
                return ExitCode::FAILURE;
            }
            BindTarget::Tcp(addr)
        }
        BindConfig::Unix { path } => {
            let bound_uid = sentinel::server::peer_auth::own_uid();
            let bearer = tokens.issue(user.to_string(), profile.to_string(), session_id, Some(bound_uid));
            if let Err(e) = write_token(token_out, &bearer) {
                error!("failed to write token: {e}");
                return ExitCode::FAILURE;
            }
            BindTarget::Unix(std::path::PathBuf::from(path))
        }
    };

    let state = Arc::new(AppState {
        policy_loader,
        policy_key: config.policy.source_key.clone(),
        session_store,
        issuer,
        tokens,
        allowed_hosts: config.server.allowed_hosts.clone(),
    });

    if let Err(e) = server::run(bind_target, state).await {
        error!("credential server error: {e}");
        return ExitCode::FAILURE;
    }

    info!("credential server shutdown complete");
    ExitCode::SUCCESS
}

fn write_token(token_out: Option<&std::path::Path>, bearer: &str) -> sentinel::Result<()> {
    match token_out {
        Some(path) => std::fs::write(path, bearer).map_err(sentinel::Error::Io),
        None => {
            println!("{bearer}");
            Ok(())
        }
    }
}
