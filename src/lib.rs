//! Sentinel - a policy-enforcing gateway between developer workstations /
//! automation and the cloud provider's STS.
//!
//! Sentinel decides whether to issue short-lived credentials for a
//! requested `(user, profile)` pair, consulting a signed, centrally-managed
//! policy, optionally routing through a human-approval workflow or a
//! break-glass emergency path, and stamping every issued session with a
//! correlation identity that ties the credential back to the audit trail
//! that authorized it.
//!
//! # Components
//!
//! - [`policy`]: the signed policy loader and evaluator (C2, C3).
//! - [`store`]: durable approval requests, break-glass events, and
//!   server-session tracking (C4, C5, C6).
//! - [`revocation`]: session revocation (C7).
//! - [`audit`]: the HMAC-signed audit log (C8).
//! - [`notify`]: best-effort lifecycle notification fan-out (C9).
//! - [`mfa`]: TOTP and SMS multi-factor verification (C10).
//! - [`issuer`]: the two-hop credential issuer (C11).
//! - [`server`]: the local credential server (C12).
//! - [`orchestrator`]: glues every component into the end-to-end pipeline
//!   (C13).

#![forbid(unsafe_code)]
#![warn(missing_docs)]

pub mod audit;
pub mod cli;
pub mod config;
pub mod correlation;
pub mod error;
pub mod id;
pub mod issuer;
pub mod mfa;
pub mod notify;
pub mod orchestrator;
pub mod policy;
pub mod revocation;
pub mod server;
pub mod store;

pub use error::{Error, Result};

use tracing_subscriber::{EnvFilter, fmt, layer::SubscriberExt, util::SubscriberInitExt};

/// Set up the global tracing subscriber: an `EnvFilter` seeded from `level`
/// (overridden by `RUST_LOG` if set), emitting either human-readable or
/// newline-delimited JSON lines.
pub fn setup_tracing(level: &str, format: Option<&str>) -> Result<()> {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level));

    let subscriber = tracing_subscriber::registry().with(filter);

    match format {
        Some("json") => {
            subscriber.with(fmt::layer().json()).init();
        }
        _ => {
            subscriber.with(fmt::layer()).init();
        }
    }

    Ok(())
}
