mod common;

use chrono::Utc;
use rust_decimal_macros::dec;
use std::sync::Arc;
use std::time::Duration;

use common::*;
use rent_escrow_api::errors::{PaymentError, ProviderError};
use rent_escrow_api::models::notification::NotificationKind;
use rent_escrow_api::models::provider::{
    OutcomeSource, ProviderAck, ProviderKind, ProviderOutcome, ProviderStatus,
};
use rent_escrow_api::models::transaction::{
    EscrowStatus, PaymentMethod, PaymentStatus, TransactionType,
};
use rent_escrow_api::services::ledger::TransactionLedger;
use rent_escrow_api::services::orchestrator::ApplyResult;
use rent_escrow_api::services::webhook_gateway::Disposition;

#[tokio::test]
async fn rent_is_collected_held_and_released_with_commission() {
    let ctx = TestContext::new();

    let tx = ctx.processing_rent().await;
    assert_eq!(tx.payment_status, PaymentStatus::Processing);
    assert_eq!(tx.escrow_status, None);
    assert!(tx.transaction_reference.starts_with("RENT-"));
    let provider_ref = tx.mobile_money_reference.clone().unwrap();

    let sent = ctx.provider_a.collection_calls.lock().unwrap()[0].clone();
    assert_eq!(sent.amount, RENT);
    assert_eq!(sent.transaction_reference, tx.transaction_reference);

    let body = provider_a_body(&provider_ref, "SUCCESSFUL");
    let headers = signed_a_headers(&body, Utc::now().timestamp());
    let disposition = ctx
        .gateway
        .ingest(ProviderKind::ProviderA, &headers, &body)
        .await
        .unwrap();
    assert_eq!(disposition, Disposition::Processed);

    let held = ctx.reload(&tx).await;
    assert_eq!(held.payment_status, PaymentStatus::Completed);
    assert_eq!(held.escrow_status, Some(EscrowStatus::Held));
    assert!(held.callback_received);
    assert_eq!(held.external_id.as_deref(), Some("FT-9001"));
    assert!(held.completed_at.is_some());

    let receipt = ctx.orchestrator.release_escrow(tx.id).await.unwrap();
    assert_eq!(receipt.landlord_net, 47_500);
    assert_eq!(receipt.commission, 2_500);
    assert_eq!(receipt.commission_rate, dec!(0.05));
    assert_eq!(receipt.transaction.escrow_status, Some(EscrowStatus::Released));

    let commission = receipt.commission_transaction.unwrap();
    assert_eq!(commission.transaction_type, TransactionType::Commission);
    assert_eq!(commission.amount, 2_500);
    assert_eq!(commission.payment_status, PaymentStatus::Completed);
    assert_eq!(commission.transaction_reference, format!("COM-{}", tx.transaction_reference));

    let payouts = ctx.provider_a.disbursements();
    assert_eq!(payouts.len(), 1);
    assert_eq!(payouts[0].amount, 47_500);
    assert_eq!(payouts[0].payee_handle, LANDLORD_PHONE);
    assert_eq!(
        payouts[0].transaction_reference,
        format!("PAY-{}-1", tx.transaction_reference)
    );

    let released = ctx.reload(&tx).await;
    assert_eq!(released.escrow_status, Some(EscrowStatus::Released));
    assert_eq!(released.disbursement_provider_reference, receipt.disbursement_reference);

    let related = ctx.ledger.find_by_source(tx.id).await.unwrap();
    assert_eq!(related.len(), 1);

    assert_eq!(
        ctx.dispatcher.kinds(),
        vec![
            NotificationKind::PaymentCompleted,
            NotificationKind::PaymentReceived,
            NotificationKind::PayoutSent,
            NotificationKind::EscrowReleased,
        ]
    );
}

#[tokio::test]
async fn synchronous_rejection_fails_the_transaction() {
    let ctx = TestContext::new();
    ctx.provider_a
        .script_collection(Err(ProviderError::Rejected("payer not found".to_string())));

    let err = ctx
        .orchestrator
        .request_payment(ctx.rent_request(PaymentMethod::ProviderA))
        .await
        .unwrap_err();
    let (transaction_id, reason) = match err {
        PaymentError::Rejected { transaction_id, reason } => (transaction_id, reason),
        other => panic!("expected rejection, got {other:?}"),
    };
    assert!(reason.contains("payer not found"));

    let tx = ctx.ledger.get(transaction_id).await.unwrap().unwrap();
    assert_eq!(tx.payment_status, PaymentStatus::Failed);
    assert_eq!(tx.escrow_status, None);
    assert_eq!(tx.mobile_money_reference, None);
    assert!(tx.completed_at.is_some());
    assert_eq!(ctx.dispatcher.kinds(), vec![NotificationKind::PaymentFailed]);
}

#[tokio::test]
async fn declined_acknowledgment_fails_the_transaction() {
    let ctx = TestContext::new();
    ctx.provider_b.script_collection(Ok(ProviderAck {
        provider_reference: "MP-declined".to_string(),
        accepted: false,
    }));

    let err = ctx
        .orchestrator
        .request_payment(ctx.rent_request(PaymentMethod::ProviderB))
        .await
        .unwrap_err();
    assert!(matches!(err, PaymentError::Rejected { .. }));
}

#[tokio::test]
async fn unavailable_provider_leaves_transaction_pending_for_retry() {
    let ctx = TestContext::new();
    ctx.provider_a
        .script_collection(Err(ProviderError::Unavailable("HTTP 503".to_string())));

    let err = ctx
        .orchestrator
        .request_payment(ctx.rent_request(PaymentMethod::ProviderA))
        .await
        .unwrap_err();
    let (transaction_id, transaction_reference) = match err {
        PaymentError::RetryLater {
            transaction_id,
            transaction_reference,
            ..
        } => (transaction_id, transaction_reference),
        other => panic!("expected retry-later, got {other:?}"),
    };

    let tx = ctx.ledger.get(transaction_id).await.unwrap().unwrap();
    assert_eq!(tx.payment_status, PaymentStatus::Pending);
    assert_eq!(tx.transaction_reference, transaction_reference);
    assert_eq!(ctx.dispatcher.count(), 0);

    let retried = ctx
        .orchestrator
        .process_payment(transaction_id, RENTER_PHONE)
        .await
        .unwrap();
    assert_eq!(retried.payment_status, PaymentStatus::Processing);
    assert_eq!(ctx.provider_a.collection_count(), 2);

    let calls = ctx.provider_a.collection_calls.lock().unwrap().clone();
    assert_eq!(calls[0].provider_reference, calls[1].provider_reference);
    assert_eq!(retried.mobile_money_reference.as_deref(), Some(calls[0].provider_reference.as_str()));
}

#[tokio::test]
async fn timed_out_collection_is_not_sent_again() {
    let ctx = TestContext::with_call_timeout(Duration::from_millis(50));
    ctx.provider_a.delay_collections(Duration::from_millis(500));

    let err = ctx
        .orchestrator
        .request_payment(ctx.rent_request(PaymentMethod::ProviderA))
        .await
        .unwrap_err();
    let transaction_id = match err {
        PaymentError::RetryLater { transaction_id, .. } => transaction_id,
        other => panic!("expected retry-later, got {other:?}"),
    };

    let tx = ctx.ledger.get(transaction_id).await.unwrap().unwrap();
    assert_eq!(tx.payment_status, PaymentStatus::Pending);
    assert_eq!(tx.mobile_money_reference, None);
    let reserved = tx.reserved_provider_reference.clone().unwrap();

    // The provider got the first request; the retry must find it instead of paying twice.
    let retried = ctx
        .orchestrator
        .process_payment(transaction_id, RENTER_PHONE)
        .await
        .unwrap();
    assert_eq!(retried.payment_status, PaymentStatus::Processing);
    assert_eq!(retried.mobile_money_reference.as_deref(), Some(reserved.as_str()));
    assert_eq!(ctx.provider_a.collection_count(), 1);
}

#[tokio::test]
async fn retry_applies_an_outcome_the_provider_already_has() {
    let ctx = TestContext::with_call_timeout(Duration::from_millis(50));
    ctx.provider_a.delay_collections(Duration::from_millis(500));

    let err = ctx
        .orchestrator
        .request_payment(ctx.rent_request(PaymentMethod::ProviderA))
        .await
        .unwrap_err();
    let transaction_id = match err {
        PaymentError::RetryLater { transaction_id, .. } => transaction_id,
        other => panic!("expected retry-later, got {other:?}"),
    };
    let tx = ctx.ledger.get(transaction_id).await.unwrap().unwrap();
    let reserved = tx.reserved_provider_reference.clone().unwrap();
    ctx.provider_a
        .set_status(&reserved, ProviderStatus::Successful, Some("FT-5"));

    let settled = ctx
        .orchestrator
        .process_payment(transaction_id, RENTER_PHONE)
        .await
        .unwrap();
    assert_eq!(settled.escrow_status, Some(EscrowStatus::Held));
    assert_eq!(settled.external_id.as_deref(), Some("FT-5"));
    assert_eq!(ctx.provider_a.collection_count(), 1);
}

#[tokio::test]
async fn outcome_for_a_reserved_reference_promotes_a_pending_row() {
    let ctx = TestContext::with_call_timeout(Duration::from_millis(50));
    ctx.provider_a.delay_collections(Duration::from_millis(500));

    let err = ctx
        .orchestrator
        .request_payment(ctx.rent_request(PaymentMethod::ProviderA))
        .await
        .unwrap_err();
    let transaction_id = match err {
        PaymentError::RetryLater { transaction_id, .. } => transaction_id,
        other => panic!("expected retry-later, got {other:?}"),
    };
    let pending = ctx.ledger.get(transaction_id).await.unwrap().unwrap();

    let outcome = ProviderOutcome {
        provider: ProviderKind::ProviderA,
        provider_reference: pending.reserved_provider_reference.clone().unwrap(),
        order_reference: Some(pending.transaction_reference.clone()),
        status: ProviderStatus::Successful,
        settlement_id: Some("FT-6".to_string()),
        reason: None,
    };
    let applied = ctx
        .orchestrator
        .apply_provider_outcome(pending, &outcome, OutcomeSource::Webhook)
        .await
        .unwrap();
    assert_eq!(applied.result, ApplyResult::Applied);
    assert_eq!(applied.transaction.escrow_status, Some(EscrowStatus::Held));
    assert_eq!(
        applied.transaction.mobile_money_reference,
        Some(outcome.provider_reference.clone())
    );
}

#[tokio::test]
async fn process_requires_a_pending_transaction() {
    let ctx = TestContext::new();
    let tx = ctx.processing_rent().await;

    let err = ctx
        .orchestrator
        .process_payment(tx.id, RENTER_PHONE)
        .await
        .unwrap_err();
    assert!(matches!(
        err,
        PaymentError::InvalidState { actual: PaymentStatus::Processing, .. }
    ));
    assert_eq!(ctx.provider_a.collection_count(), 1);
}

#[tokio::test]
async fn lost_webhook_is_recovered_by_the_sweep_exactly_once() {
    let ctx = TestContext::new();
    let tx = ctx.processing_rent().await;
    let provider_ref = tx.mobile_money_reference.clone().unwrap();
    let sweep = ctx.sweep();

    let report = sweep.sweep_once().await.unwrap();
    assert_eq!(report.examined, 1);
    assert_eq!(report.still_pending, 1);
    assert_eq!(ctx.reload(&tx).await.payment_status, PaymentStatus::Processing);

    ctx.provider_a
        .set_status(&provider_ref, ProviderStatus::Successful, Some("FT-77"));
    let report = sweep.sweep_once().await.unwrap();
    assert_eq!(report.applied, 1);
    assert_eq!(report.errors, 0);

    let held = ctx.reload(&tx).await;
    assert_eq!(held.escrow_status, Some(EscrowStatus::Held));
    assert_eq!(held.external_id.as_deref(), Some("FT-77"));
    assert!(!held.callback_received);

    let report = sweep.sweep_once().await.unwrap();
    assert_eq!(report.examined, 0);
    assert_eq!(ctx.dispatcher.count(), 2);
}

#[tokio::test]
async fn reconcile_records_provider_failure() {
    let ctx = TestContext::new();
    let tx = ctx.processing_rent().await;
    ctx.provider_a.set_status(
        tx.mobile_money_reference.as_deref().unwrap(),
        ProviderStatus::Failed,
        None,
    );

    let applied = ctx.orchestrator.reconcile(tx.id).await.unwrap();
    assert_eq!(applied.result, ApplyResult::Applied);
    assert_eq!(applied.transaction.payment_status, PaymentStatus::Failed);
    assert_eq!(
        applied.transaction.failure_reason.as_deref(),
        Some("failed at provider")
    );
    assert_eq!(ctx.dispatcher.kinds(), vec![NotificationKind::PaymentFailed]);

    let err = ctx.orchestrator.reconcile(tx.id).await.unwrap_err();
    assert!(matches!(err, PaymentError::InvalidState { .. }));
}

#[tokio::test]
async fn repeated_outcome_is_applied_once() {
    let ctx = TestContext::new();
    let tx = ctx.held_rent().await;
    let provider_ref = tx.mobile_money_reference.clone().unwrap();

    // A late webhook after the poll already settled the row.
    let body = provider_a_body(&provider_ref, "SUCCESSFUL");
    let headers = signed_a_headers(&body, Utc::now().timestamp());
    let disposition = ctx
        .gateway
        .ingest(ProviderKind::ProviderA, &headers, &body)
        .await
        .unwrap();
    assert_eq!(disposition, Disposition::Duplicate);

    ctx.orchestrator.release_escrow(tx.id).await.unwrap();
    let disposition = ctx
        .gateway
        .ingest(ProviderKind::ProviderA, &signed_a_headers(&body, Utc::now().timestamp()), &body)
        .await
        .unwrap();
    assert_eq!(disposition, Disposition::Duplicate);

    let related = ctx.ledger.find_by_source(tx.id).await.unwrap();
    assert_eq!(related.len(), 1);
    assert_eq!(
        ctx.dispatcher
            .kinds()
            .iter()
            .filter(|k| **k == NotificationKind::PaymentCompleted)
            .count(),
        1
    );
}

#[tokio::test]
async fn escrow_operations_require_held_funds() {
    let ctx = TestContext::new();

    let processing = ctx.processing_rent().await;
    let err = ctx.orchestrator.release_escrow(processing.id).await.unwrap_err();
    assert!(matches!(err, PaymentError::EscrowPrecondition { .. }));
    let err = ctx.orchestrator.refund_escrow(processing.id).await.unwrap_err();
    assert!(matches!(err, PaymentError::EscrowPrecondition { .. }));

    let released = ctx.held_rent().await;
    ctx.orchestrator.release_escrow(released.id).await.unwrap();
    let err = ctx.orchestrator.release_escrow(released.id).await.unwrap_err();
    assert!(matches!(err, PaymentError::EscrowPrecondition { .. }));
    let err = ctx.orchestrator.refund_escrow(released.id).await.unwrap_err();
    assert!(matches!(err, PaymentError::EscrowPrecondition { .. }));

    let refunded = ctx.held_rent().await;
    ctx.orchestrator.refund_escrow(refunded.id).await.unwrap();
    let err = ctx.orchestrator.release_escrow(refunded.id).await.unwrap_err();
    assert!(matches!(err, PaymentError::EscrowPrecondition { .. }));

    // Nothing beyond the two successful payouts left the platform.
    assert_eq!(ctx.provider_a.disbursements().len(), 2);
}

#[tokio::test]
async fn deposits_settle_without_escrow() {
    let ctx = TestContext::new();
    let mut request = ctx.rent_request(PaymentMethod::ProviderA);
    request.transaction_type = Some(TransactionType::Deposit);
    request.amount = 120_000;

    let tx = ctx.orchestrator.request_payment(request).await.unwrap();
    assert!(tx.transaction_reference.starts_with("DEP-"));
    ctx.provider_a.set_status(
        tx.mobile_money_reference.as_deref().unwrap(),
        ProviderStatus::Successful,
        None,
    );

    let applied = ctx.orchestrator.reconcile(tx.id).await.unwrap();
    assert_eq!(applied.transaction.payment_status, PaymentStatus::Completed);
    assert_eq!(applied.transaction.escrow_status, None);

    let err = ctx.orchestrator.release_escrow(tx.id).await.unwrap_err();
    assert!(matches!(err, PaymentError::EscrowPrecondition { .. }));
}

#[tokio::test]
async fn refund_returns_the_full_amount_to_the_renter() {
    let ctx = TestContext::new();
    let tx = ctx.held_rent().await;

    let receipt = ctx.orchestrator.refund_escrow(tx.id).await.unwrap();
    assert_eq!(receipt.transaction.payment_status, PaymentStatus::Refunded);
    assert_eq!(receipt.transaction.escrow_status, Some(EscrowStatus::Refunded));
    assert_eq!(receipt.refund_transaction.transaction_type, TransactionType::Refund);
    assert_eq!(receipt.refund_transaction.amount, RENT);
    assert_eq!(
        receipt.refund_transaction.transaction_reference,
        format!("RFD-{}", tx.transaction_reference)
    );

    let payouts = ctx.provider_a.disbursements();
    assert_eq!(payouts.len(), 1);
    assert_eq!(payouts[0].amount, RENT);
    assert_eq!(payouts[0].payee_handle, RENTER_PHONE);

    let refunds = ctx.dispatcher.kinds();
    assert_eq!(
        refunds
            .iter()
            .filter(|k| **k == NotificationKind::EscrowRefunded)
            .count(),
        2
    );
}

#[tokio::test]
async fn rate_change_applies_to_later_releases_only() {
    let ctx = TestContext::new();
    let first = ctx.held_rent().await;
    let second = ctx.held_rent().await;

    let receipt = ctx.orchestrator.release_escrow(first.id).await.unwrap();
    assert_eq!(receipt.commission, 2_500);

    ctx.orchestrator
        .commission_policy()
        .set_rate(dec!(0.10))
        .await
        .unwrap();

    let receipt = ctx.orchestrator.release_escrow(second.id).await.unwrap();
    assert_eq!(receipt.commission, 5_000);
    assert_eq!(receipt.landlord_net, 45_000);

    let earlier = ctx.ledger.find_by_source(first.id).await.unwrap();
    assert_eq!(earlier[0].amount, 2_500);
}

#[tokio::test]
async fn zero_commission_records_no_commission_row() {
    let ctx = TestContext::new();
    ctx.orchestrator
        .commission_policy()
        .set_rate(dec!(0))
        .await
        .unwrap();
    let tx = ctx.held_rent().await;

    let receipt = ctx.orchestrator.release_escrow(tx.id).await.unwrap();
    assert_eq!(receipt.landlord_net, RENT);
    assert_eq!(receipt.commission, 0);
    assert!(receipt.commission_transaction.is_none());
    assert!(ctx.ledger.find_by_source(tx.id).await.unwrap().is_empty());
}

#[tokio::test]
async fn failed_disbursement_keeps_escrow_held_and_can_be_retried() {
    let ctx = TestContext::new();
    let tx = ctx.held_rent().await;
    ctx.provider_a
        .script_disbursement(Err(ProviderError::Unavailable("HTTP 502".to_string())));

    let err = ctx.orchestrator.release_escrow(tx.id).await.unwrap_err();
    assert!(matches!(err, PaymentError::RetryLater { .. }));

    let still_held = ctx.reload(&tx).await;
    assert_eq!(still_held.escrow_status, Some(EscrowStatus::Held));
    assert_eq!(still_held.disbursement_reference, None);
    assert_eq!(still_held.disbursement_attempts, 1);
    assert!(ctx.ledger.find_by_source(tx.id).await.unwrap().is_empty());

    ctx.orchestrator.release_escrow(tx.id).await.unwrap();
    let references: Vec<_> = ctx
        .provider_a
        .disbursements()
        .into_iter()
        .map(|d| d.transaction_reference)
        .collect();
    assert_eq!(
        references,
        vec![
            format!("PAY-{}-1", tx.transaction_reference),
            format!("PAY-{}-2", tx.transaction_reference),
        ]
    );
}

#[tokio::test]
async fn timed_out_disbursement_is_settled_once_its_claim_expires() {
    let ctx = TestContext::with_call_timeout(Duration::from_millis(100));
    let tx = ctx.held_rent().await;
    ctx.provider_a.delay_disbursements(Duration::from_millis(250));

    let err = ctx.orchestrator.release_escrow(tx.id).await.unwrap_err();
    assert!(matches!(err, PaymentError::RetryLater { .. }));
    let claimed = ctx.reload(&tx).await;
    assert_eq!(claimed.escrow_status, Some(EscrowStatus::Held));
    assert!(claimed.disbursement_provider_reference.is_some());

    // The claim still belongs to the call that timed out.
    let err = ctx.orchestrator.release_escrow(tx.id).await.unwrap_err();
    assert!(matches!(err, PaymentError::Conflict(_)));

    tokio::time::sleep(Duration::from_millis(400)).await;
    let receipt = ctx.orchestrator.release_escrow(tx.id).await.unwrap();
    assert_eq!(receipt.landlord_net, 47_500);
    assert_eq!(receipt.commission, 2_500);
    assert_eq!(receipt.disbursement_reference, claimed.disbursement_provider_reference);

    assert_eq!(ctx.provider_a.disbursements().len(), 1);
    let related = ctx.ledger.find_by_source(tx.id).await.unwrap();
    assert_eq!(related.len(), 1);
    assert_eq!(related[0].transaction_type, TransactionType::Commission);
    assert_eq!(ctx.reload(&tx).await.escrow_status, Some(EscrowStatus::Released));
}

#[tokio::test]
async fn expired_claim_the_provider_never_received_is_sent_again() {
    let ctx = TestContext::with_call_timeout(Duration::from_millis(100));
    let tx = ctx.held_rent().await;
    ctx.provider_a.script_disbursement(Err(ProviderError::Timeout));

    let err = ctx.orchestrator.refund_escrow(tx.id).await.unwrap_err();
    assert!(matches!(err, PaymentError::RetryLater { .. }));
    assert!(ctx.reload(&tx).await.disbursement_reference.is_some());

    tokio::time::sleep(Duration::from_millis(400)).await;
    let receipt = ctx.orchestrator.refund_escrow(tx.id).await.unwrap();
    assert_eq!(receipt.refund_transaction.amount, RENT);

    let references: Vec<_> = ctx
        .provider_a
        .disbursements()
        .into_iter()
        .map(|d| d.transaction_reference)
        .collect();
    assert_eq!(
        references,
        vec![
            format!("PAY-{}-1", tx.transaction_reference),
            format!("PAY-{}-2", tx.transaction_reference),
        ]
    );
}

#[tokio::test]
async fn expired_claim_is_finished_for_its_own_purpose() {
    let ctx = TestContext::with_call_timeout(Duration::from_millis(100));
    let tx = ctx.held_rent().await;
    ctx.provider_a.delay_disbursements(Duration::from_millis(250));

    let err = ctx.orchestrator.refund_escrow(tx.id).await.unwrap_err();
    assert!(matches!(err, PaymentError::RetryLater { .. }));

    tokio::time::sleep(Duration::from_millis(400)).await;
    let err = ctx.orchestrator.release_escrow(tx.id).await.unwrap_err();
    assert!(matches!(err, PaymentError::EscrowPrecondition { .. }));

    let settled = ctx.reload(&tx).await;
    assert_eq!(settled.escrow_status, Some(EscrowStatus::Refunded));
    assert_eq!(ctx.provider_a.disbursements().len(), 1);
    let related = ctx.ledger.find_by_source(tx.id).await.unwrap();
    assert_eq!(related[0].transaction_reference, format!("RFD-{}", tx.transaction_reference));
}

#[tokio::test]
async fn failed_commission_write_is_booked_by_the_next_release() {
    let ctx = TestContext::build(Duration::from_millis(100), |ledger| {
        Arc::new(FailingLedger::new(ledger)) as Arc<dyn TransactionLedger>
    });
    let tx = ctx.held_rent().await;

    let err = ctx.orchestrator.release_escrow(tx.id).await.unwrap_err();
    assert!(matches!(err, PaymentError::Ledger(_)));
    let paid = ctx.reload(&tx).await;
    assert_eq!(paid.escrow_status, Some(EscrowStatus::Held));
    assert!(paid.disbursement_provider_reference.is_some());
    assert!(ctx.ledger.find_by_source(tx.id).await.unwrap().is_empty());

    tokio::time::sleep(Duration::from_millis(400)).await;
    let receipt = ctx.orchestrator.release_escrow(tx.id).await.unwrap();
    assert_eq!(receipt.commission, 2_500);
    assert_eq!(receipt.commission_rate, dec!(0.05));

    let related = ctx.ledger.find_by_source(tx.id).await.unwrap();
    assert_eq!(related.len(), 1);
    assert_eq!(related[0].transaction_reference, format!("COM-{}", tx.transaction_reference));
    assert_eq!(ctx.provider_a.disbursements().len(), 1);
    assert_eq!(ctx.reload(&tx).await.escrow_status, Some(EscrowStatus::Released));
}

#[tokio::test]
async fn rejected_disbursement_is_reported_as_rejection() {
    let ctx = TestContext::new();
    let tx = ctx.held_rent().await;
    ctx.provider_a
        .script_disbursement(Err(ProviderError::Rejected("payee barred".to_string())));

    let err = ctx.orchestrator.release_escrow(tx.id).await.unwrap_err();
    assert!(matches!(err, PaymentError::Rejected { .. }));
    assert_eq!(ctx.reload(&tx).await.escrow_status, Some(EscrowStatus::Held));
}

#[tokio::test]
async fn manual_methods_are_not_requested() {
    let ctx = TestContext::new();
    for method in [PaymentMethod::Cash, PaymentMethod::BankTransfer] {
        let err = ctx
            .orchestrator
            .request_payment(ctx.rent_request(method))
            .await
            .unwrap_err();
        assert!(matches!(err, PaymentError::UnsupportedMethod(m) if m == method));
    }
    assert_eq!(ctx.provider_a.collection_count(), 0);
    assert_eq!(ctx.provider_b.collection_count(), 0);
}

#[tokio::test]
async fn rent_must_match_the_listing() {
    let ctx = TestContext::new();

    let mut wrong_amount = ctx.rent_request(PaymentMethod::ProviderA);
    wrong_amount.amount = 49_999;
    let err = ctx.orchestrator.request_payment(wrong_amount).await.unwrap_err();
    assert!(matches!(err, PaymentError::Validation(_)));

    let mut wrong_currency = ctx.rent_request(PaymentMethod::ProviderA);
    wrong_currency.currency = "EUR".to_string();
    let err = ctx.orchestrator.request_payment(wrong_currency).await.unwrap_err();
    assert!(matches!(err, PaymentError::Validation(_)));

    let mut unknown_property = ctx.rent_request(PaymentMethod::ProviderA);
    unknown_property.property_id = "prop-missing".to_string();
    let err = ctx.orchestrator.request_payment(unknown_property).await.unwrap_err();
    assert!(matches!(err, PaymentError::NotFound(_)));

    assert_eq!(ctx.provider_a.collection_count(), 0);
}

#[tokio::test]
async fn repeated_reference_returns_the_recorded_transaction() {
    let ctx = TestContext::new();
    let mut request = ctx.rent_request(PaymentMethod::ProviderA);
    request.transaction_reference = Some("APP-RENT-0001".to_string());

    let first = ctx.orchestrator.request_payment(request.clone()).await.unwrap();
    let again = ctx.orchestrator.request_payment(request.clone()).await.unwrap();
    assert_eq!(first.id, again.id);
    assert_eq!(ctx.provider_a.collection_count(), 1);

    let mut other = request;
    other.property_id = "prop-2".to_string();
    let err = ctx.orchestrator.request_payment(other).await.unwrap_err();
    assert!(matches!(err, PaymentError::Conflict(_)));
}

#[tokio::test]
async fn reserved_reference_prefixes_are_refused() {
    let ctx = TestContext::new();
    let mut request = ctx.rent_request(PaymentMethod::ProviderA);
    request.transaction_reference = Some("COM-RENT-1".to_string());

    let err = ctx.orchestrator.request_payment(request).await.unwrap_err();
    assert!(matches!(err, PaymentError::Validation(_)));
}

#[tokio::test]
async fn status_lookup_includes_related_rows() {
    let ctx = TestContext::new();
    let tx = ctx.held_rent().await;
    ctx.orchestrator.release_escrow(tx.id).await.unwrap();

    let details = ctx
        .orchestrator
        .get_transaction_status(&tx.transaction_reference)
        .await
        .unwrap();
    assert_eq!(details.transaction.id, tx.id);
    assert_eq!(details.related.len(), 1);
    assert_eq!(details.related[0].transaction_type, TransactionType::Commission);

    let err = ctx
        .orchestrator
        .get_transaction_status("RENT-NOPE")
        .await
        .unwrap_err();
    assert!(matches!(err, PaymentError::NotFound(_)));
}
