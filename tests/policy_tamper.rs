//! Black-box test for spec §8 scenario 6: "signed-policy tamper" — a
//! one-byte mutation of a previously-valid signed policy blob is rejected,
//! and the rejection sticks rather than serving a stale cached copy.

use std::sync::Arc;

use aws_lc_rs::rand::SystemRandom;
use aws_lc_rs::rsa::{KeyPair as RsaKeyPair, PssSigningAlgorithm};
use aws_lc_rs::signature::{KeyPair, RsaKeyPair as SigningKeyPair};

use sentinel::policy::loader::{MemoryPolicySource, PolicyLoader};

const SAMPLE_POLICY: &str = "version: \"1\"\nrules: []\n";

fn sign(key_pair: &SigningKeyPair, bytes: &[u8]) -> Vec<u8> {
    let rng = SystemRandom::new();
    let mut signature = vec![0u8; key_pair.public_modulus_len()];
    key_pair
        .sign(&PssSigningAlgorithm::PSS_SHA256, &rng, bytes, &mut signature)
        .expect("sign");
    signature
}

#[tokio::test]
async fn tampered_policy_blob_is_rejected_and_stays_rejected() {
    let source = Arc::new(MemoryPolicySource::new());
    let key_pair = RsaKeyPair::generate(aws_lc_rs::rsa::KeySize::Rsa2048).expect("keygen");
    let public_key = key_pair.public_key().as_ref().to_vec();

    let bytes = SAMPLE_POLICY.as_bytes().to_vec();
    let signature = sign(&key_pair, &bytes);
    source.put("policy", bytes);
    source.put("policy.sig", signature);

    let loader = PolicyLoader::new(Arc::clone(&source), public_key);
    loader.load("policy").await.unwrap();

    // Mutate one byte of the stored blob after it was signed and cached.
    let mut tampered = SAMPLE_POLICY.as_bytes().to_vec();
    tampered[0] ^= 0xFF;
    source.put("policy", tampered);

    let err = loader.load("policy").await.unwrap_err();
    assert!(matches!(err, sentinel::Error::PolicyTampered));

    // The rejection is never cached as a success: loading again still sees
    // the tampered blob and rejects it again, rather than serving a stale
    // entry from before the tamper.
    let err_again = loader.load("policy").await.unwrap_err();
    assert!(matches!(err_again, sentinel::Error::PolicyTampered));
}
