//! Black-box test for spec §8 scenario 3: "approval lifecycle" — two
//! approvers racing to update the same pending request; the one holding a
//! stale snapshot loses with `ConcurrentModification`.

use sentinel::store::approval::{ApprovalRequest, ApprovalStatus, ApprovalStore};

#[test]
fn concurrent_approvers_one_wins_one_gets_concurrent_modification() {
    let store = ApprovalStore::new();
    let now = chrono::Utc::now();
    let request = ApprovalRequest {
        id: "aaaaaaaaaaaaaaaa".to_string(),
        requester: "alice".to_string(),
        profile: "prod".to_string(),
        justification: "deploy hotfix".to_string(),
        duration: chrono::Duration::hours(1),
        status: ApprovalStatus::Pending,
        created_at: now,
        updated_at: now,
        expires_at: now + chrono::Duration::hours(24),
        approver: None,
        approver_comment: None,
    };
    let created = store.create(request).unwrap();

    // Both approvers read the same pending snapshot before either writes.
    let snapshot_a = created.clone();
    let snapshot_b = created.clone();

    // Approver A approves first; their write is against the current
    // (still-fresh) snapshot, so it succeeds.
    let approved = store
        .update(&snapshot_a, |r| {
            r.status = ApprovalStatus::Approved;
            r.approver = Some("ops-lead".to_string());
        })
        .unwrap();
    assert_eq!(approved.status, ApprovalStatus::Approved);

    // Approver B still holds the old (pre-A) snapshot and tries to deny;
    // their `updated_at` no longer matches the stored record.
    let result = store.update(&snapshot_b, |r| {
        r.status = ApprovalStatus::Denied;
        r.approver = Some("other-approver".to_string());
    });
    assert!(matches!(result, Err(sentinel::Error::ConcurrentModification)));

    // The store reflects A's write, not B's.
    let stored = store.require(&created.id).unwrap();
    assert_eq!(stored.status, ApprovalStatus::Approved);
}
