//! Black-box end-to-end test: a session revoked mid-flight must be
//! rejected by the credential server on the very next request (spec §8
//! scenario 5 "session revocation during server mode").

use std::sync::Arc;
use std::time::Duration;

use aws_lc_rs::rand::SystemRandom;
use aws_lc_rs::rsa::{KeyPair as RsaKeyPair, PssSigningAlgorithm};
use aws_lc_rs::signature::{KeyPair, RsaKeyPair as SigningKeyPair};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};

use sentinel::issuer::{Credentials, Issuer, StaticIdentitySource, StaticRoleAssumer};
use sentinel::policy::loader::{MemoryPolicySource, PolicyLoader};
use sentinel::revocation;
use sentinel::server::{self, AppState, BindTarget, TokenRegistry};
use sentinel::store::session::{ServerSession, SessionStore};

const ALLOW_PROD: &str = "version: \"1\"\nrules:\n  - name: allow-prod\n    effect: allow\n    conditions: { profiles: [prod] }\n";

fn signed_source(yaml: &str) -> (Arc<MemoryPolicySource>, Vec<u8>) {
    let key_pair = RsaKeyPair::generate(aws_lc_rs::rsa::KeySize::Rsa2048).expect("keygen");
    let public_key = key_pair.public_key().as_ref().to_vec();
    let bytes = yaml.as_bytes().to_vec();

    let rng = SystemRandom::new();
    let mut signature = vec![0u8; key_pair.public_modulus_len()];
    key_pair
        .sign(&PssSigningAlgorithm::PSS_SHA256, &rng, &bytes, &mut signature)
        .expect("sign");

    let source = Arc::new(MemoryPolicySource::new());
    source.put("policy", bytes);
    source.put("policy.sig", signature);
    (source, public_key)
}

/// Send a raw `GET / HTTP/1.1` with the given bearer token and return the
/// numeric status code from the response's status line.
async fn get_root_status(addr: std::net::SocketAddr, bearer: &str) -> u16 {
    let mut stream = TcpStream::connect(addr).await.expect("connect");
    let request = format!(
        "GET / HTTP/1.1\r\nHost: 127.0.0.1\r\nAuthorization: {bearer}\r\nConnection: close\r\n\r\n"
    );
    stream.write_all(request.as_bytes()).await.expect("write");

    let mut response = Vec::new();
    stream.read_to_end(&mut response).await.expect("read");
    let text = String::from_utf8_lossy(&response);
    let status_line = text.lines().next().expect("status line");
    status_line
        .split_whitespace()
        .nth(1)
        .expect("status code")
        .parse()
        .expect("numeric status code")
}

#[tokio::test]
async fn revoked_session_is_rejected_on_the_next_request() {
    let (policy_source, public_key) = signed_source(ALLOW_PROD);
    let policy_loader = Arc::new(PolicyLoader::new(policy_source, public_key));

    let session_store = Arc::new(SessionStore::new());
    let session = session_store
        .create(ServerSession::new(
            "alice".to_string(),
            "prod".to_string(),
            "instance-1".to_string(),
            "sentinel:alice:0123456789abcdef".to_string(),
            chrono::Duration::hours(1),
            None,
        ))
        .unwrap();

    let base = Credentials {
        access_key_id: "BASE".to_string(),
        secret_access_key: "base-secret".to_string(),
        session_token: "base-token".to_string(),
        expiration: chrono::Utc::now() + chrono::Duration::hours(1),
    };
    let issuer = Arc::new(Issuer::new(
        Arc::new(StaticIdentitySource::new(base)),
        Arc::new(StaticRoleAssumer::new(Duration::from_secs(3600))),
    ));

    let tokens = Arc::new(TokenRegistry::new());
    let bearer = tokens.issue("alice".to_string(), "prod".to_string(), Some(session.id.clone()), None);

    let state = Arc::new(AppState {
        policy_loader,
        policy_key: "policy".to_string(),
        session_store: Arc::clone(&session_store),
        issuer,
        tokens,
        allowed_hosts: vec!["127.0.0.1".to_string()],
    });

    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    drop(listener);

    let server_state = Arc::clone(&state);
    let server_task = tokio::spawn(async move {
        server::run(BindTarget::Tcp(addr), server_state).await.unwrap();
    });
    // Give the listener a moment to bind before the client connects.
    tokio::time::sleep(Duration::from_millis(50)).await;

    assert_eq!(get_root_status(addr, &bearer).await, 200, "active session is served");

    revocation::revoke(&session_store, &session.id, "security", "incident").unwrap();

    assert_eq!(get_root_status(addr, &bearer).await, 403, "revoked session is rejected");

    server_task.abort();
}
