//! Signed policy loader (C2).
//!
//! Grounded on the teacher's `key_server::oidc::JwksCache` (a `DashMap`
//! cache entry with a fetch timestamp and TTL, refreshed on miss), adapted
//! from JWKS-over-HTTPS to a detached-signature-over-a-remote-KV-blob
//! fetch, and hardened with a true single-flight guard (the teacher only
//! coalesces on a known-`kid` refresh; every first fetch here must
//! coalesce too).

use std::collections::hash_map::Entry;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use aws_lc_rs::signature::{self, UnparsedPublicKey};
use parking_lot::Mutex;
use tokio::sync::Notify;

use super::Policy;

const CACHE_TTL: Duration = Duration::from_secs(5 * 60);

/// The remote key-value store Sentinel fetches policy blobs and their
/// detached signatures from. Out-of-scope collaborator per spec §1; a
/// production deployment plugs a real KV client in behind this trait.
#[async_trait]
pub trait PolicySource: Send + Sync {
    /// Fetch the raw bytes stored at `key`, or `None` if absent.
    async fn get(&self, key: &str) -> crate::Result<Option<Vec<u8>>>;
}

/// In-memory reference [`PolicySource`] implementation: a `DashMap` keyed
/// by parameter name. Used by tests and suitable as a local/dev backend.
#[derive(Default)]
pub struct MemoryPolicySource {
    blobs: dashmap::DashMap<String, Vec<u8>>,
}

impl MemoryPolicySource {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Store `bytes` at `key`, as a test/operator fixture would.
    pub fn put(&self, key: &str, bytes: Vec<u8>) {
        self.blobs.insert(key.to_string(), bytes);
    }
}

#[async_trait]
impl PolicySource for MemoryPolicySource {
    async fn get(&self, key: &str) -> crate::Result<Option<Vec<u8>>> {
        Ok(self.blobs.get(key).map(|entry| entry.value().clone()))
    }
}

/// A filesystem-backed [`PolicySource`]: `key` resolves to `<dir>/<key>`.
/// Suitable for local/dev deployments or a sidecar that syncs the signed
/// policy blob down from the real remote KV onto local disk.
pub struct FilePolicySource {
    dir: std::path::PathBuf,
}

impl FilePolicySource {
    #[must_use]
    pub fn new(dir: impl Into<std::path::PathBuf>) -> Self {
        Self { dir: dir.into() }
    }
}

#[async_trait]
impl PolicySource for FilePolicySource {
    async fn get(&self, key: &str) -> crate::Result<Option<Vec<u8>>> {
        let path = self.dir.join(key);
        match tokio::fs::read(&path).await {
            Ok(bytes) => Ok(Some(bytes)),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(crate::Error::Io(e)),
        }
    }
}

struct CacheEntry {
    policy: Policy,
    fetched_at: Instant,
}

impl CacheEntry {
    fn is_stale(&self) -> bool {
        self.fetched_at.elapsed() >= CACHE_TTL
    }
}

/// Loads, verifies, and caches signed policy documents fetched from a
/// [`PolicySource`] (spec §4.1).
pub struct PolicyLoader {
    source: Arc<dyn PolicySource>,
    public_key: Vec<u8>,
    cache: dashmap::DashMap<String, CacheEntry>,
    in_flight: Mutex<HashMap<String, Arc<Notify>>>,
}

impl PolicyLoader {
    /// Build a loader fetching from `source`, verifying signatures against
    /// `public_key` (DER-encoded RSA public key, RSASSA-PSS/SHA-256).
    #[must_use]
    pub fn new(source: Arc<dyn PolicySource>, public_key: Vec<u8>) -> Self {
        Self {
            source,
            public_key,
            cache: dashmap::DashMap::new(),
            in_flight: Mutex::new(HashMap::new()),
        }
    }

    /// Load and verify the policy stored at `parameter_name`, serving a
    /// cached copy if fresh. Concurrent misses for the same key collapse
    /// into a single fetch (spec §4.1, §5 "Shared resources").
    ///
    /// Fail-closed: a verification failure never leaves a stale or partial
    /// entry in the cache.
    pub async fn load(&self, parameter_name: &str) -> crate::Result<Policy> {
        if let Some(entry) = self.cache.get(parameter_name)
            && !entry.is_stale()
        {
            return Ok(entry.policy.clone());
        }

        let notify = {
            let mut in_flight = self.in_flight.lock();
            match in_flight.entry(parameter_name.to_string()) {
                Entry::Occupied(existing) => {
                    let notify = existing.get().clone();
                    // Register as a waiter before releasing the lock: if we
                    // dropped the lock first, the leader could finish and
                    // call `notify_waiters()` before our `Notified` future
                    // had registered, and we'd wait forever.
                    let notified = notify.notified();
                    tokio::pin!(notified);
                    notified.as_mut().enable();
                    drop(in_flight);
                    notified.await;
                    return self.load_from_cache_only(parameter_name);
                }
                Entry::Vacant(vacant) => {
                    let notify = Arc::new(Notify::new());
                    vacant.insert(notify.clone());
                    notify
                }
            }
        };

        let result = self.fetch_and_verify(parameter_name).await;

        self.in_flight.lock().remove(parameter_name);
        notify.notify_waiters();

        result
    }

    /// After waiting on another in-flight fetch, re-check the cache; if the
    /// leader's fetch failed the cache still has no entry, so surface that
    /// as an unavailable error for the follower too (fail-closed: never
    /// silently succeed with a stale cache state the leader rejected).
    fn load_from_cache_only(&self, parameter_name: &str) -> crate::Result<Policy> {
        self.cache
            .get(parameter_name)
            .filter(|entry| !entry.is_stale())
            .map(|entry| entry.policy.clone())
            .ok_or_else(|| crate::Error::PolicyUnavailable(parameter_name.to_string()))
    }

    async fn fetch_and_verify(&self, parameter_name: &str) -> crate::Result<Policy> {
        let (bytes, signature) = self.load_raw(parameter_name).await?;
        self.verify_signature(&bytes, &signature)?;
        let policy = Policy::parse(&bytes)?;
        self.cache.insert(
            parameter_name.to_string(),
            CacheEntry {
                policy: policy.clone(),
                fetched_at: Instant::now(),
            },
        );
        Ok(policy)
    }

    /// Fetch the raw policy blob and its detached signature, without
    /// verifying or caching (spec §4.1 `LoadRaw`).
    pub async fn load_raw(&self, parameter_name: &str) -> crate::Result<(Vec<u8>, Vec<u8>)> {
        let bytes = self
            .source
            .get(parameter_name)
            .await?
            .ok_or_else(|| crate::Error::PolicyNotFound(parameter_name.to_string()))?;
        let sig_key = format!("{parameter_name}.sig");
        let signature = self
            .source
            .get(&sig_key)
            .await?
            .ok_or(crate::Error::PolicyUnsigned)?;
        Ok((bytes, signature))
    }

    fn verify_signature(&self, bytes: &[u8], signature: &[u8]) -> crate::Result<()> {
        let key = UnparsedPublicKey::new(&signature::RSA_PSS_2048_8192_SHA256, &self.public_key);
        key.verify(bytes, signature)
            .map_err(|_| crate::Error::PolicyTampered)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use aws_lc_rs::rand::SystemRandom;
    use aws_lc_rs::rsa::{KeyPair as RsaKeyPair, PssSigningAlgorithm};
    use aws_lc_rs::signature::{KeyPair, RsaKeyPair as SigningKeyPair};

    const SAMPLE_POLICY: &str = "version: \"1\"\nrules: []\n";

    fn sample_keypair() -> (SigningKeyPair, Vec<u8>) {
        // Generated once for test fixtures; kept as a checked-in DER blob
        // would be preferable, but aws-lc-rs can synthesize one at test
        // time via its RSA key generation API.
        let key_pair = RsaKeyPair::generate(aws_lc_rs::rsa::KeySize::Rsa2048).expect("keygen");
        let public_key = key_pair.public_key().as_ref().to_vec();
        (key_pair, public_key)
    }

    fn sign(key_pair: &SigningKeyPair, bytes: &[u8]) -> Vec<u8> {
        let rng = SystemRandom::new();
        let mut signature = vec![0u8; key_pair.public_modulus_len()];
        key_pair
            .sign(&PssSigningAlgorithm::PSS_SHA256, &rng, bytes, &mut signature)
            .expect("sign");
        signature
    }

    #[tokio::test]
    async fn load_returns_policy_notfound_when_blob_missing() {
        let source = Arc::new(MemoryPolicySource::new());
        let (_key_pair, public_key) = sample_keypair();
        let loader = PolicyLoader::new(source, public_key);
        let err = loader.load("missing").await.unwrap_err();
        assert!(matches!(err, crate::Error::PolicyNotFound(_)));
    }

    #[tokio::test]
    async fn load_returns_unsigned_when_signature_missing() {
        let source = Arc::new(MemoryPolicySource::new());
        source.put("policy", SAMPLE_POLICY.as_bytes().to_vec());
        let (_key_pair, public_key) = sample_keypair();
        let loader = PolicyLoader::new(source, public_key);
        let err = loader.load("policy").await.unwrap_err();
        assert!(matches!(err, crate::Error::PolicyUnsigned));
    }

    #[tokio::test]
    async fn load_verifies_and_caches_a_valid_signed_policy() {
        let source = Arc::new(MemoryPolicySource::new());
        let (key_pair, public_key) = sample_keypair();
        let bytes = SAMPLE_POLICY.as_bytes().to_vec();
        let signature = sign(&key_pair, &bytes);
        source.put("policy", bytes);
        source.put("policy.sig", signature);

        let loader = PolicyLoader::new(source, public_key);
        let policy = loader.load("policy").await.unwrap();
        assert_eq!(policy.version, "1");
        assert!(loader.cache.get("policy").is_some());
    }

    #[tokio::test]
    async fn tampered_blob_is_rejected_and_never_cached() {
        // scenario 6 from spec §8
        let source = Arc::new(MemoryPolicySource::new());
        let (key_pair, public_key) = sample_keypair();
        let bytes = SAMPLE_POLICY.as_bytes().to_vec();
        let signature = sign(&key_pair, &bytes);
        source.put("policy", bytes);
        source.put("policy.sig", signature);

        let loader = PolicyLoader::new(Arc::clone(&source), public_key);
        loader.load("policy").await.unwrap();

        // Mutate one byte of the stored blob post-signing.
        let mut tampered = SAMPLE_POLICY.as_bytes().to_vec();
        tampered[0] ^= 0xFF;
        source.put("policy", tampered);
        loader.cache.remove("policy");

        let err = loader.load("policy").await.unwrap_err();
        assert!(matches!(err, crate::Error::PolicyTampered));
        assert!(loader.cache.get("policy").is_none());
    }

    #[tokio::test]
    async fn concurrent_misses_collapse_to_one_fetch() {
        let source = Arc::new(MemoryPolicySource::new());
        let (key_pair, public_key) = sample_keypair();
        let bytes = SAMPLE_POLICY.as_bytes().to_vec();
        let signature = sign(&key_pair, &bytes);
        source.put("policy", bytes);
        source.put("policy.sig", signature);

        let loader = Arc::new(PolicyLoader::new(source, public_key));
        let mut handles = Vec::new();
        for _ in 0..8 {
            let loader = Arc::clone(&loader);
            handles.push(tokio::spawn(async move { loader.load("policy").await }));
        }
        for handle in handles {
            assert!(handle.await.unwrap().is_ok());
        }
    }
}
