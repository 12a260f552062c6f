//! End-to-end lifecycle scenarios against the in-memory store and the mock
//! provider.

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use sokoni_api::models::SetupPayoutAccountRequest;
use sokoni_api::types::{
    AccountType, Actor, DisputeResolution, Escrow, EscrowStatus,
    MilestoneStatus, PayoutMethod, Role, User,
};
use sokoni_common::hexstr;
use sokoni_common::ids::{EscrowId, SourceId, UserId};
use sokoni_engine::autorelease::AutoReleaser;
use sokoni_engine::manager::{EngineConfig, EscrowManager};
use sokoni_engine::models::{EscrowUpdate, MilestoneSpec, SourceSpec};
use sokoni_engine::payout::PayoutManager;
use sokoni_engine::store::mem::{MemDirectory, MemStore};
use sokoni_engine::store::EscrowStore;
use sokoni_engine::webhook::{WebhookAck, WebhookIngester};
use sokoni_engine::EngineError;
use sokoni_provider::mock::MockProvider;

const WEBHOOK_SECRET: &str = "sk_test_webhook_secret";

const BUYER: UserId = UserId(1);
const SELLER: UserId = UserId(2);
const ADMIN: UserId = UserId(9);

struct Harness {
    store: Arc<MemStore>,
    directory: Arc<MemDirectory>,
    provider: Arc<MockProvider>,
    manager: Arc<EscrowManager>,
    payouts: PayoutManager,
    webhooks: WebhookIngester,
}

fn harness() -> Harness {
    let store = Arc::new(MemStore::new());
    let directory = Arc::new(MemDirectory::new());
    let provider = Arc::new(MockProvider::new());

    directory.add_user(User {
        id: BUYER,
        email: "brand@example.com".to_owned(),
        name: "Acme Brands".to_owned(),
        account_type: AccountType::Brand,
        role: Role::User,
    });
    directory.add_user(User {
        id: SELLER,
        email: "creator@example.com".to_owned(),
        name: "Wanjiku Mwangi".to_owned(),
        account_type: AccountType::Creator,
        role: Role::User,
    });
    directory.add_user(User {
        id: ADMIN,
        email: "admin@example.com".to_owned(),
        name: "Platform Admin".to_owned(),
        account_type: AccountType::Brand,
        role: Role::Admin,
    });

    let manager = Arc::new(EscrowManager::new(
        store.clone(),
        directory.clone(),
        provider.clone(),
        EngineConfig::default(),
    ));
    let payouts = PayoutManager::new(
        store.clone(),
        directory.clone(),
        provider.clone(),
    );
    let webhooks =
        WebhookIngester::new(manager.clone(), WEBHOOK_SECRET.to_owned());

    Harness {
        store,
        directory,
        provider,
        manager,
        payouts,
        webhooks,
    }
}

fn buyer() -> Actor {
    Actor::user(BUYER)
}

fn seller() -> Actor {
    Actor::user(SELLER)
}

fn admin() -> Actor {
    Actor::admin(ADMIN)
}

fn sign(body: &[u8]) -> String {
    let key = ring::hmac::Key::new(
        ring::hmac::HMAC_SHA512,
        WEBHOOK_SECRET.as_bytes(),
    );
    hexstr::encode(ring::hmac::sign(&key, body).as_ref())
}

async fn deliver_webhook(h: &Harness, body: &[u8]) -> WebhookAck {
    let signature = sign(body);
    let ack = h
        .webhooks
        .ingest(body, Some(&signature))
        .await
        .expect("ingest failed");
    if let WebhookAck::Accepted(pending) = &ack {
        h.webhooks.process(pending.clone()).await;
    }
    ack
}

async fn event_types(h: &Harness, id: EscrowId) -> Vec<String> {
    h.store
        .events_for(id)
        .await
        .unwrap()
        .iter()
        .map(|e| e.event_type.clone())
        .collect()
}

/// Seed a job proposal with the given budget and create the escrow.
async fn create_escrow(h: &Harness, budget: &str) -> Escrow {
    let proposal_id = SourceId(10);
    h.directory.add_job_proposal(
        proposal_id,
        SourceSpec::job_proposal(
            proposal_id,
            Some(SourceId(100)),
            "Product launch video",
            BUYER,
            SELLER,
            budget,
        ),
    );
    let (escrow, session) = h
        .manager
        .create_from_job_proposal(&buyer(), proposal_id)
        .await
        .expect("create failed");
    assert!(session.authorization_url.starts_with("https://"));
    escrow
}

async fn create_funded_escrow(h: &Harness, budget: &str) -> Escrow {
    let escrow = create_escrow(h, budget).await;
    h.manager
        .verify_payment(&buyer(), escrow.id)
        .await
        .expect("verify failed")
}

/// An auto-releaser whose ticks the test drives by hand.
fn releaser(h: &Harness) -> AutoReleaser {
    let (_shutdown_tx, shutdown_rx) = tokio::sync::watch::channel(false);
    AutoReleaser::new(h.manager.clone(), Duration::from_secs(1800), shutdown_rx)
}

async fn setup_mobile_money_payout(h: &Harness) {
    h.payouts
        .setup(
            &seller(),
            SetupPayoutAccountRequest {
                payout_method: PayoutMethod::MobileMoney,
                mobile_money_number: Some("+254700000001".to_owned()),
                bank_account_number: None,
                bank_code: None,
            },
        )
        .await
        .expect("payout setup failed");
}

// --- S1: create then fund --- //

#[tokio::test]
async fn create_then_fund() {
    let h = harness();
    let escrow = create_escrow(&h, "5000").await;

    assert_eq!(escrow.status, EscrowStatus::Pending);
    assert_eq!(escrow.total_amount.minor(), 500_000);
    assert_eq!(escrow.fee_amount.minor(), 10_000);
    assert_eq!(escrow.seller_amount.minor(), 490_000);
    assert!(escrow.amounts_consistent());
    assert!(escrow.payment_ref.as_deref().unwrap().starts_with("PAY-"));
    assert_eq!(event_types(&h, escrow.id).await, vec!["created"]);

    let funded = h
        .manager
        .verify_payment(&buyer(), escrow.id)
        .await
        .unwrap();
    assert_eq!(funded.status, EscrowStatus::Funded);
    assert!(funded.payment_confirmed_at.is_some());
    assert_eq!(event_types(&h, escrow.id).await, vec!["created", "funded"]);
}

// --- S2: deliver and release --- //

#[tokio::test]
async fn deliver_and_release() {
    let h = harness();
    setup_mobile_money_payout(&h).await;
    let escrow = create_funded_escrow(&h, "5000").await;

    let delivered = h
        .manager
        .deliver(&seller(), escrow.id, Some("final cut attached".to_owned()))
        .await
        .unwrap();
    assert_eq!(delivered.status, EscrowStatus::Delivered);
    let auto_release_at = delivered.auto_release_at.unwrap();
    let hours = (auto_release_at - Utc::now()).num_hours();
    assert!((6 * 24..=7 * 24).contains(&hours), "window was {hours}h");

    let released = h.manager.release(&buyer(), escrow.id).await.unwrap();
    assert_eq!(released.status, EscrowStatus::Released);
    assert_eq!(
        released.seller_recipient_code.as_deref(),
        Some("RCP_mm0")
    );
    assert_eq!(
        released.seller_payout_method,
        Some(PayoutMethod::MobileMoney)
    );
    assert!(released.funds_released_at.is_some());

    let transfers = h.provider.transfers();
    assert_eq!(transfers.len(), 1);
    let (reference, amount, recipient) = &transfers[0];
    assert!(reference.starts_with("TRF-"));
    assert_eq!(*amount, 490_000);
    assert_eq!(recipient, "RCP_mm0");
}

/// Release idempotency: a second release is a success with no new event
/// and no new transfer.
#[tokio::test]
async fn release_is_idempotent() {
    let h = harness();
    setup_mobile_money_payout(&h).await;
    let escrow = create_funded_escrow(&h, "5000").await;
    h.manager.deliver(&seller(), escrow.id, None).await.unwrap();
    h.manager.release(&buyer(), escrow.id).await.unwrap();

    let events_before = event_types(&h, escrow.id).await;
    let again = h.manager.release(&buyer(), escrow.id).await.unwrap();
    assert_eq!(again.status, EscrowStatus::Released);
    assert_eq!(event_types(&h, escrow.id).await, events_before);
    assert_eq!(h.provider.transfer_count(), 1);
}

// --- S3: transfer reversal --- //

#[tokio::test]
async fn transfer_reversal_reverts_to_funded() {
    let h = harness();
    setup_mobile_money_payout(&h).await;
    let escrow = create_funded_escrow(&h, "5000").await;
    h.manager.deliver(&seller(), escrow.id, None).await.unwrap();
    let released = h.manager.release(&buyer(), escrow.id).await.unwrap();
    let transfer_ref = released.transfer_ref.clone().unwrap();

    let body = serde_json::json!({
        "event": "transfer.reversed",
        "data": { "reference": transfer_ref },
    });
    let ack = deliver_webhook(&h, body.to_string().as_bytes()).await;
    assert!(matches!(ack, WebhookAck::Accepted(_)));

    let escrow = h.store.get_escrow(escrow.id).await.unwrap().unwrap();
    assert_eq!(escrow.status, EscrowStatus::Funded);
    assert!(escrow.transfer_failed_at.is_some());
    assert!(escrow.transfer_fail_reason.is_some());
    assert!(event_types(&h, escrow.id)
        .await
        .contains(&"transfer_failed".to_owned()));

    let seller_notifications =
        h.store.notifications_for(SELLER).await.unwrap();
    assert!(seller_notifications
        .iter()
        .any(|n| n.notification_type == "payout.failed"));
}

// --- S4: dispute with a partial split --- //

#[tokio::test]
async fn dispute_partial_split() {
    let h = harness();
    setup_mobile_money_payout(&h).await;
    let escrow = create_funded_escrow(&h, "1000").await;
    assert_eq!(escrow.total_amount.minor(), 100_000);

    h.manager.deliver(&seller(), escrow.id, None).await.unwrap();
    h.manager
        .dispute(
            &buyer(),
            escrow.id,
            "Deliverable misses half the agreed scope".to_owned(),
        )
        .await
        .unwrap();

    let resolved = h
        .manager
        .resolve_dispute(
            &admin(),
            escrow.id,
            DisputeResolution::PartialSplit,
            Some(40),
        )
        .await
        .unwrap();

    assert_eq!(resolved.status, EscrowStatus::Released);
    assert_eq!(
        resolved.dispute_resolution,
        Some(DisputeResolution::PartialSplit)
    );
    assert_eq!(resolved.split_percent, Some(40));
    assert!(resolved.dispute_resolved_at.is_some());

    // Seller gets 40% of the total less the proportional fee.
    let transfers = h.provider.transfers();
    assert_eq!(transfers.len(), 1);
    assert_eq!(transfers[0].1, 39_200);

    // Buyer is refunded the remainder of the gross split.
    let refunds = h.provider.refunds();
    assert_eq!(refunds.len(), 1);
    assert_eq!(refunds[0].0, resolved.payment_ref.clone().unwrap());
    assert_eq!(refunds[0].1, Some(60_000));
}

// --- S5: concurrent double funding --- //

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn concurrent_verify_funds_once() {
    let h = harness();
    let escrow = create_escrow(&h, "5000").await;

    let buyer = buyer();
    let (a, b) = tokio::join!(
        h.manager.verify_payment(&buyer, escrow.id),
        h.manager.verify_payment(&buyer, escrow.id),
    );
    assert_eq!(a.unwrap().status, EscrowStatus::Funded);
    assert_eq!(b.unwrap().status, EscrowStatus::Funded);

    let funded_events = event_types(&h, escrow.id)
        .await
        .into_iter()
        .filter(|t| t == "funded")
        .count();
    assert_eq!(funded_events, 1);
}

// --- S6: duplicate webhook delivery --- //

#[tokio::test]
async fn duplicate_webhook_is_inert() {
    let h = harness();
    let escrow = create_escrow(&h, "5000").await;
    let body = serde_json::json!({
        "event": "charge.success",
        "data": { "reference": escrow.payment_ref.clone().unwrap() },
    })
    .to_string();

    let first = deliver_webhook(&h, body.as_bytes()).await;
    assert!(matches!(first, WebhookAck::Accepted(_)));
    let escrow_after = h.store.get_escrow(escrow.id).await.unwrap().unwrap();
    assert_eq!(escrow_after.status, EscrowStatus::Funded);

    let second = deliver_webhook(&h, body.as_bytes()).await;
    assert!(matches!(second, WebhookAck::Duplicate));

    let funded_events = event_types(&h, escrow.id)
        .await
        .into_iter()
        .filter(|t| t == "funded")
        .count();
    assert_eq!(funded_events, 1);

    let confirmations = h
        .store
        .notifications_for(BUYER)
        .await
        .unwrap()
        .into_iter()
        .filter(|n| n.notification_type == "payment.confirmed")
        .count();
    assert_eq!(confirmations, 1);
}

/// A bad signature is rejected with no side effects.
#[tokio::test]
async fn webhook_signature_mismatch_is_rejected() {
    let h = harness();
    let escrow = create_escrow(&h, "5000").await;
    let body = serde_json::json!({
        "event": "charge.success",
        "data": { "reference": escrow.payment_ref.clone().unwrap() },
    })
    .to_string();

    let ack = h
        .webhooks
        .ingest(body.as_bytes(), Some("deadbeef"))
        .await
        .unwrap();
    assert!(matches!(ack, WebhookAck::Rejected));
    let ack = h.webhooks.ingest(body.as_bytes(), None).await.unwrap();
    assert!(matches!(ack, WebhookAck::Rejected));

    let escrow = h.store.get_escrow(escrow.id).await.unwrap().unwrap();
    assert_eq!(escrow.status, EscrowStatus::Pending);
}

// --- S7: auto-release --- //

#[tokio::test]
async fn auto_release_past_deadline() {
    let h = harness();
    setup_mobile_money_payout(&h).await;
    let escrow = create_funded_escrow(&h, "5000").await;
    h.manager.deliver(&seller(), escrow.id, None).await.unwrap();

    // Move the deadline into the past.
    h.store
        .update_escrow(
            escrow.id,
            EscrowUpdate {
                auto_release_at: Some(Utc::now() - chrono::Duration::seconds(1)),
                ..Default::default()
            },
            None,
        )
        .await
        .unwrap()
        .unwrap();

    let releaser = releaser(&h);
    releaser.tick().await.unwrap();

    let escrow = h.store.get_escrow(escrow.id).await.unwrap().unwrap();
    assert_eq!(escrow.status, EscrowStatus::Released);
    assert_eq!(h.provider.transfer_count(), 1);

    let events = h.store.events_for(escrow.id).await.unwrap();
    let auto = events
        .iter()
        .find(|e| e.event_type == "auto_released")
        .expect("no auto_released event");
    assert_eq!(auto.actor_id, None);
}

#[tokio::test]
async fn auto_release_warning_sent_once() {
    let h = harness();
    setup_mobile_money_payout(&h).await;
    let escrow = create_funded_escrow(&h, "5000").await;
    h.manager.deliver(&seller(), escrow.id, None).await.unwrap();
    h.store
        .update_escrow(
            escrow.id,
            EscrowUpdate {
                auto_release_at: Some(Utc::now() + chrono::Duration::hours(2)),
                ..Default::default()
            },
            None,
        )
        .await
        .unwrap()
        .unwrap();

    let releaser = releaser(&h);
    releaser.tick().await.unwrap();
    releaser.tick().await.unwrap();

    let warnings = h
        .store
        .notifications_for(BUYER)
        .await
        .unwrap()
        .into_iter()
        .filter(|n| n.notification_type == "escrow.auto_release_warning")
        .count();
    assert_eq!(warnings, 1);

    // Still DELIVERED: the deadline hasn't lapsed.
    let escrow = h.store.get_escrow(escrow.id).await.unwrap().unwrap();
    assert_eq!(escrow.status, EscrowStatus::Delivered);
}

// --- Transition closure --- //

#[tokio::test]
async fn transitions_outside_the_table_are_rejected() {
    let h = harness();
    let escrow = create_escrow(&h, "5000").await;

    // PENDING: no start, deliver, release, dispute, or refund.
    for result in [
        h.manager.start_work(&seller(), escrow.id).await,
        h.manager.deliver(&seller(), escrow.id, None).await,
        h.manager.release(&buyer(), escrow.id).await,
        h.manager.refund(&buyer(), escrow.id).await,
        h.manager
            .dispute(&buyer(), escrow.id, "long enough reason here".to_owned())
            .await,
    ] {
        assert!(
            matches!(result, Err(EngineError::InvalidTransition { .. })),
            "expected invalid transition"
        );
    }

    // Terminal states accept nothing further.
    let cancelled = h
        .manager
        .cancel(&buyer(), escrow.id, "changed plans".to_owned())
        .await
        .unwrap();
    assert_eq!(cancelled.status, EscrowStatus::Cancelled);
    let result = h.manager.verify_payment(&buyer(), escrow.id).await;
    assert!(matches!(result, Err(EngineError::InvalidTransition { .. })));
    let result = h
        .manager
        .cancel(&buyer(), escrow.id, "again".to_owned())
        .await
        .unwrap();
    assert_eq!(result.status, EscrowStatus::Cancelled);
}

#[tokio::test]
async fn cancel_requires_pending() {
    let h = harness();
    let escrow = create_funded_escrow(&h, "5000").await;
    let result = h
        .manager
        .cancel(&buyer(), escrow.id, "too late".to_owned())
        .await;
    assert!(matches!(result, Err(EngineError::InvalidTransition { .. })));
}

// --- Refund, pre-delivery --- //

#[tokio::test]
async fn refund_before_delivery() {
    let h = harness();
    let escrow = create_funded_escrow(&h, "5000").await;
    let refunded = h.manager.refund(&buyer(), escrow.id).await.unwrap();
    assert_eq!(refunded.status, EscrowStatus::Refunded);

    let refunds = h.provider.refunds();
    assert_eq!(refunds.len(), 1);
    assert_eq!(refunds[0].1, None, "pre-delivery refund is in full");

    // The provider's confirmation webhook lands afterwards.
    let body = serde_json::json!({
        "event": "refund.processed",
        "data": {
            "transaction_reference": refunded.payment_ref.clone().unwrap(),
        },
    });
    deliver_webhook(&h, body.to_string().as_bytes()).await;
    let escrow = h.store.get_escrow(escrow.id).await.unwrap().unwrap();
    assert_eq!(escrow.status, EscrowStatus::Refunded);
    assert!(escrow.refund_confirmed_at.is_some());
}

// --- Transfer failure on release --- //

#[tokio::test]
async fn failed_transfer_reverts_release() {
    let h = harness();
    setup_mobile_money_payout(&h).await;
    let escrow = create_funded_escrow(&h, "5000").await;
    h.manager.deliver(&seller(), escrow.id, None).await.unwrap();

    h.provider.fail_transfers(
        sokoni_provider::ProviderError::retryable("provider is down"),
    );
    // The caller still gets a success: the funds are safely held.
    let escrow_after = h.manager.release(&buyer(), escrow.id).await.unwrap();
    assert_eq!(escrow_after.status, EscrowStatus::Funded);
    assert!(escrow_after.transfer_failed_at.is_some());
    let types = event_types(&h, escrow.id).await;
    assert!(types.contains(&"released".to_owned()));
    assert!(types.contains(&"transfer_failed".to_owned()));

    // Once the provider recovers, release works again.
    h.provider.clear_transfer_failure();
    h.manager.deliver(&seller(), escrow.id, None).await.unwrap();
    let released = h.manager.release(&buyer(), escrow.id).await.unwrap();
    assert_eq!(released.status, EscrowStatus::Released);
    assert_eq!(h.provider.transfer_count(), 2);
}

// --- Milestones --- //

fn campaign_spec() -> SourceSpec {
    SourceSpec {
        source: sokoni_api::types::SourceRef::Campaign {
            campaign_id: SourceId(77),
        },
        title: "Spring campaign".to_owned(),
        buyer_id: BUYER,
        seller_id: None,
        amount: "1000".to_owned(),
        terms: None,
        milestones: vec![
            MilestoneSpec {
                source_milestone_id: Some(1),
                title: "Concept".to_owned(),
                amount: "600".to_owned(),
                order_index: 0,
                due_date: None,
            },
            MilestoneSpec {
                source_milestone_id: Some(2),
                title: "Final delivery".to_owned(),
                amount: "400".to_owned(),
                order_index: 1,
                due_date: None,
            },
        ],
    }
}

#[tokio::test]
async fn milestone_release_pays_proportionally_and_completes_parent() {
    let h = harness();
    setup_mobile_money_payout(&h).await;
    h.directory.add_campaign(SourceId(77), campaign_spec());

    let (escrow, _) = h
        .manager
        .create_from_campaign(&buyer(), SourceId(77), SELLER)
        .await
        .unwrap();
    h.manager.verify_payment(&buyer(), escrow.id).await.unwrap();

    let milestones = h.store.milestones_for(escrow.id).await.unwrap();
    assert_eq!(milestones.len(), 2);
    let (first, second) = (&milestones[0], &milestones[1]);

    h.manager
        .deliver_milestone(&seller(), escrow.id, first.id, None)
        .await
        .unwrap();
    let released = h
        .manager
        .release_milestone(&buyer(), escrow.id, first.id)
        .await
        .unwrap();
    assert_eq!(released.status, MilestoneStatus::Released);
    // 60000 minor × 0.98
    assert_eq!(h.provider.transfers()[0].1, 58_800);

    // Parent still holds funds: one milestone remains.
    let parent = h.store.get_escrow(escrow.id).await.unwrap().unwrap();
    assert_eq!(parent.status, EscrowStatus::Funded);

    h.manager
        .deliver_milestone(&seller(), escrow.id, second.id, None)
        .await
        .unwrap();
    h.manager
        .release_milestone(&buyer(), escrow.id, second.id)
        .await
        .unwrap();
    assert_eq!(h.provider.transfers()[1].1, 39_200);

    // Every milestone released => the parent released with it.
    let parent = h.store.get_escrow(escrow.id).await.unwrap().unwrap();
    assert_eq!(parent.status, EscrowStatus::Released);
    let types = event_types(&h, escrow.id).await;
    assert_eq!(
        types.iter().filter(|t| *t == "milestone_released").count(),
        2
    );
    assert!(types.contains(&"released".to_owned()));
}

#[tokio::test]
async fn milestone_schedule_must_cover_the_total() {
    let h = harness();
    let mut spec = campaign_spec();
    spec.milestones[1].amount = "300".to_owned();
    h.directory.add_campaign(SourceId(78), spec);

    let result = h
        .manager
        .create_from_campaign(&buyer(), SourceId(78), SELLER)
        .await;
    assert!(matches!(result, Err(EngineError::Validation(_))));
}

// --- Payout accounts --- //

#[tokio::test]
async fn payout_account_lifecycle() {
    let h = harness();

    // Brands cannot receive payouts.
    let result = h
        .payouts
        .setup(
            &buyer(),
            SetupPayoutAccountRequest {
                payout_method: PayoutMethod::MobileMoney,
                mobile_money_number: Some("+254700000002".to_owned()),
                bank_account_number: None,
                bank_code: None,
            },
        )
        .await;
    assert!(matches!(result, Err(EngineError::Unauthorized(_))));

    setup_mobile_money_payout(&h).await;
    let account = h.payouts.get(&seller()).await.unwrap();
    assert_eq!(account.payout_method, PayoutMethod::MobileMoney);
    assert!(account.is_active);

    // Replacing deactivates the old account but keeps the row.
    h.payouts
        .setup(
            &seller(),
            SetupPayoutAccountRequest {
                payout_method: PayoutMethod::Bank,
                mobile_money_number: None,
                bank_account_number: Some("0123456789".to_owned()),
                bank_code: Some("01".to_owned()),
            },
        )
        .await
        .unwrap();
    let replacement = h.payouts.get(&seller()).await.unwrap();
    assert_eq!(replacement.payout_method, PayoutMethod::Bank);
    assert_eq!(
        replacement.bank_account_name.as_deref(),
        Some("WANJIKU MWANGI")
    );
    assert_ne!(replacement.id, account.id);

    h.payouts.remove(&seller()).await.unwrap();
    assert!(matches!(
        h.payouts.get(&seller()).await,
        Err(EngineError::NotFound(_))
    ));
}

#[tokio::test]
async fn release_requires_a_payout_account() {
    let h = harness();
    let escrow = create_funded_escrow(&h, "5000").await;
    h.manager.deliver(&seller(), escrow.id, None).await.unwrap();

    let result = h.manager.release(&buyer(), escrow.id).await;
    assert!(matches!(result, Err(EngineError::Validation(_))));
    let escrow = h.store.get_escrow(escrow.id).await.unwrap().unwrap();
    assert_eq!(escrow.status, EscrowStatus::Delivered);
}

// --- Authorization --- //

#[tokio::test]
async fn operations_check_the_required_party() {
    let h = harness();
    setup_mobile_money_payout(&h).await;
    let escrow = create_funded_escrow(&h, "5000").await;

    // Only the seller starts or delivers.
    assert!(matches!(
        h.manager.start_work(&buyer(), escrow.id).await,
        Err(EngineError::Unauthorized(_))
    ));
    h.manager.deliver(&seller(), escrow.id, None).await.unwrap();

    // Only the buyer (or an admin) releases.
    assert!(matches!(
        h.manager.release(&seller(), escrow.id).await,
        Err(EngineError::Unauthorized(_))
    ));

    // A stranger is no party at all.
    let stranger = Actor::user(UserId(42));
    assert!(matches!(
        h.manager
            .dispute(&stranger, escrow.id, "not mine but disputing".to_owned())
            .await,
        Err(EngineError::Unauthorized(_))
    ));
    assert!(matches!(
        h.manager.get_escrow(&stranger, escrow.id).await,
        Err(EngineError::Unauthorized(_))
    ));

    // Dispute resolution is admin-only.
    h.manager
        .dispute(&buyer(), escrow.id, "scope was not delivered".to_owned())
        .await
        .unwrap();
    assert!(matches!(
        h.manager
            .resolve_dispute(
                &buyer(),
                escrow.id,
                DisputeResolution::RefundBuyer,
                None,
            )
            .await,
        Err(EngineError::Unauthorized(_))
    ));
}

#[tokio::test]
async fn dispute_reason_must_be_substantive() {
    let h = harness();
    let escrow = create_funded_escrow(&h, "5000").await;
    let result = h
        .manager
        .dispute(&buyer(), escrow.id, "bad".to_owned())
        .await;
    assert!(matches!(result, Err(EngineError::Validation(_))));
}

// --- Dispute resolutions, remaining arms --- //

#[tokio::test]
async fn dispute_release_to_seller() {
    let h = harness();
    setup_mobile_money_payout(&h).await;
    let escrow = create_funded_escrow(&h, "5000").await;
    h.manager.deliver(&seller(), escrow.id, None).await.unwrap();
    h.manager
        .dispute(&seller(), escrow.id, "buyer went unresponsive".to_owned())
        .await
        .unwrap();

    let resolved = h
        .manager
        .resolve_dispute(
            &admin(),
            escrow.id,
            DisputeResolution::ReleaseToSeller,
            None,
        )
        .await
        .unwrap();
    assert_eq!(resolved.status, EscrowStatus::Released);
    assert_eq!(
        resolved.dispute_resolution,
        Some(DisputeResolution::ReleaseToSeller)
    );
    assert_eq!(h.provider.transfers()[0].1, 490_000);
    assert!(h.provider.refunds().is_empty());
}

#[tokio::test]
async fn dispute_refund_buyer() {
    let h = harness();
    let escrow = create_funded_escrow(&h, "5000").await;
    h.manager
        .dispute(&buyer(), escrow.id, "work never started at all".to_owned())
        .await
        .unwrap();

    let resolved = h
        .manager
        .resolve_dispute(
            &admin(),
            escrow.id,
            DisputeResolution::RefundBuyer,
            None,
        )
        .await
        .unwrap();
    assert_eq!(resolved.status, EscrowStatus::Refunded);
    assert_eq!(h.provider.refunds().len(), 1);
    assert_eq!(h.provider.refunds()[0].1, None);
    assert_eq!(h.provider.transfer_count(), 0);
}
