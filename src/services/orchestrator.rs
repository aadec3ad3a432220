// services/orchestrator.rs
use chrono::Utc;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tracing::{error, info, warn};
use uuid::Uuid;

use crate::errors::{LedgerError, PaymentError, ProviderError};
use crate::models::payment::{
    RefundReceipt, ReleaseReceipt, RequestPayment, TransactionDetails, TransactionStatusView,
};
use crate::models::provider::{
    CollectionRequest, DisbursementRequest, Operation, OutcomeSource, ProviderKind,
    ProviderOutcome, ProviderStatus, StatusReport,
};
use crate::models::transaction::{
    DisbursementClaim, DisbursementPurpose, LedgerState, NewTransaction, PaymentStatus,
    Transaction, TransactionType, TransitionFields,
};
use crate::services::directory::{IdentityDirectory, ListingStore};
use crate::services::escrow::{compute_split, CommissionPolicy, Split};
use crate::services::ledger::TransactionLedger;
use crate::services::notification_emitter::NotificationEmitter;
use crate::services::providers::{PaymentProvider, ProviderRegistry};

const MAX_CAS_ATTEMPTS: usize = 3;
const RESERVED_PREFIXES: [&str; 3] = ["COM-", "RFD-", "PAY-"];

/// What applying a provider outcome did to the row.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ApplyResult {
    /// This call won the transition.
    Applied,
    /// The row already reflects the outcome.
    Duplicate,
    /// The provider has no verdict yet.
    StillPending,
    /// The row is not in a state an outcome can move (e.g. still `pending`).
    Ignored,
    /// The outcome contradicts a terminal state already recorded.
    Conflict,
}

impl ApplyResult {
    pub fn as_str(&self) -> &'static str {
        match self {
            ApplyResult::Applied => "applied",
            ApplyResult::Duplicate => "duplicate",
            ApplyResult::StillPending => "still_pending",
            ApplyResult::Ignored => "ignored",
            ApplyResult::Conflict => "conflict",
        }
    }
}

#[derive(Debug, Clone)]
pub struct Applied {
    pub result: ApplyResult,
    pub transaction: Transaction,
}

/// Drives transactions through their lifecycle. Holds no per-transaction state.
#[derive(Clone)]
pub struct PaymentOrchestrator {
    ledger: Arc<dyn TransactionLedger>,
    providers: ProviderRegistry,
    listings: Arc<dyn ListingStore>,
    directory: Arc<dyn IdentityDirectory>,
    notifier: NotificationEmitter,
    commission: Arc<CommissionPolicy>,
    call_timeout: Duration,
}

impl PaymentOrchestrator {
    pub fn new(
        ledger: Arc<dyn TransactionLedger>,
        providers: ProviderRegistry,
        listings: Arc<dyn ListingStore>,
        directory: Arc<dyn IdentityDirectory>,
        notifier: NotificationEmitter,
        commission: Arc<CommissionPolicy>,
    ) -> Self {
        PaymentOrchestrator {
            ledger,
            providers,
            listings,
            directory,
            notifier,
            commission,
            call_timeout: Duration::from_secs(60),
        }
    }

    /// Upper bound on one adapter call, including its token refresh, status checks and re-sends.
    pub fn with_call_timeout(mut self, call_timeout: Duration) -> Self {
        self.call_timeout = call_timeout;
        self
    }

    pub fn ledger(&self) -> &Arc<dyn TransactionLedger> {
        &self.ledger
    }

    pub fn commission_policy(&self) -> &Arc<CommissionPolicy> {
        &self.commission
    }

    // ----- Collection -----

    /// Validates a renter's request against the listing, records it and starts the collection.
    pub async fn request_payment(&self, request: RequestPayment) -> Result<Transaction, PaymentError> {
        let provider = self.providers.for_method(request.method)?;
        let transaction_type = request.transaction_type.unwrap_or(TransactionType::RentPayment);
        if !matches!(
            transaction_type,
            TransactionType::RentPayment | TransactionType::Deposit
        ) {
            return Err(PaymentError::Validation(format!(
                "{} transactions are recorded by the platform, not requested",
                transaction_type.as_str()
            )));
        }

        let terms = self.listings.rent_terms(&request.property_id).await?;
        let currency = request.currency.to_ascii_uppercase();
        if currency != terms.currency {
            return Err(PaymentError::Validation(format!(
                "property {} is billed in {}, not {}",
                terms.property_id, terms.currency, currency
            )));
        }
        if transaction_type == TransactionType::RentPayment && request.amount != terms.rent_amount {
            return Err(PaymentError::Validation(format!(
                "rent for property {} is {}, got {}",
                terms.property_id, terms.rent_amount, request.amount
            )));
        }

        let transaction_reference = match request.transaction_reference.as_deref() {
            Some(reference) => validate_reference(reference)?,
            None => generate_reference(transaction_type),
        };

        // Advisory only.
        match self
            .call(provider.validate_payer_handle(&request.payer_handle))
            .await
        {
            Ok(check) if !check.valid => {
                warn!(reference = %transaction_reference, "Payer handle did not validate, continuing")
            }
            Ok(check) => info!(
                reference = %transaction_reference,
                display_name = check.display_name.as_deref().unwrap_or("-"),
                "Payer handle validated"
            ),
            Err(e) => warn!(reference = %transaction_reference, "Payer handle check failed: {}", e),
        }

        let new = NewTransaction {
            transaction_reference: transaction_reference.clone(),
            renter_id: request.renter_id.clone(),
            landlord_id: terms.landlord_id.clone(),
            property_id: request.property_id.clone(),
            transaction_type,
            amount: request.amount,
            currency,
            payment_method: request.method,
        };

        let tx = match self.ledger.create(new.clone()).await {
            Ok(tx) => tx,
            Err(LedgerError::DuplicateReference(reference)) => {
                return self.replay_request(&reference, &new).await;
            }
            Err(e) => return Err(e.into()),
        };

        info!(
            transaction_id = %tx.id,
            reference = %tx.transaction_reference,
            amount = tx.amount,
            method = %tx.payment_method,
            "📝 Payment requested"
        );

        self.process_payment(tx.id, &request.payer_handle).await
    }

    /// A repeated request with a known reference returns the recorded row untouched.
    async fn replay_request(
        &self,
        reference: &str,
        new: &NewTransaction,
    ) -> Result<Transaction, PaymentError> {
        let existing = self
            .ledger
            .find_by_reference(reference)
            .await?
            .ok_or_else(|| PaymentError::NotFound(reference.to_string()))?;

        let same_request = existing.renter_id == new.renter_id
            && existing.property_id == new.property_id
            && existing.amount == new.amount
            && existing.payment_method == new.payment_method;

        if same_request {
            info!(reference, state = %existing.state(), "Repeated payment request, returning recorded transaction");
            Ok(existing)
        } else {
            Err(PaymentError::Conflict(format!(
                "transaction reference {} is already used",
                reference
            )))
        }
    }

    /// Sends a `pending` transaction to its provider.
    ///
    /// The provider reference is reserved and written to the row before the
    /// first send. A retry asks the provider about that reference first and
    /// only re-sends when the provider never received it.
    pub async fn process_payment(
        &self,
        transaction_id: Uuid,
        payer_handle: &str,
    ) -> Result<Transaction, PaymentError> {
        let tx = self.load(transaction_id).await?;
        if tx.state() != LedgerState::PENDING {
            return Err(PaymentError::InvalidState {
                id: tx.id,
                expected: PaymentStatus::Pending,
                actual: tx.payment_status,
            });
        }
        let provider = self.providers.for_method(tx.payment_method)?;

        let (tx, provider_reference) = match tx.reserved_provider_reference.clone() {
            Some(reference) => {
                match self
                    .call(provider.find_operation(Operation::Collection, &reference))
                    .await
                {
                    Ok(Some(report)) => {
                        return self.resume_collection(tx, reference, report, provider.kind()).await
                    }
                    Ok(None) => (tx, reference),
                    Err(e) => return Err(retry_later(&tx, e)),
                }
            }
            None => self.reserve_collection(provider, tx).await?,
        };

        let request = CollectionRequest {
            amount: tx.amount,
            currency: tx.currency.clone(),
            payer_handle: payer_handle.to_string(),
            transaction_reference: tx.transaction_reference.clone(),
            provider_reference: provider_reference.clone(),
        };

        match self.call(provider.initiate_collection(&request)).await {
            Ok(ack) if ack.accepted => {
                let processing = self.mark_processing(&tx, &provider_reference).await?;
                info!(
                    transaction_id = %processing.id,
                    provider_reference = %provider_reference,
                    "⏳ Collection accepted, awaiting provider outcome"
                );
                Ok(processing)
            }
            Ok(ack) => {
                let reason = format!("provider declined request {}", ack.provider_reference);
                Err(self.fail_pending(&tx, reason).await)
            }
            Err(ProviderError::Rejected(reason)) => Err(self.fail_pending(&tx, reason).await),
            Err(e) => {
                warn!(
                    transaction_id = %tx.id,
                    reference = %tx.transaction_reference,
                    provider_reference = %provider_reference,
                    "Collection outcome unknown, transaction stays pending: {}",
                    e
                );
                Err(retry_later(&tx, e))
            }
        }
    }

    async fn reserve_collection(
        &self,
        provider: &Arc<dyn PaymentProvider>,
        tx: Transaction,
    ) -> Result<(Transaction, String), PaymentError> {
        let reference = match self
            .call(provider.reserve_reference(Operation::Collection))
            .await
        {
            Ok(reference) => reference,
            Err(ProviderError::Rejected(reason)) => return Err(self.fail_pending(&tx, reason).await),
            Err(e) => return Err(retry_later(&tx, e)),
        };

        match self.ledger.reserve_collection_reference(tx.id, &reference).await {
            Ok(reserved) => Ok((reserved, reference)),
            Err(LedgerError::StaleState { .. } | LedgerError::ClaimUnavailable { .. }) => {
                Err(PaymentError::Conflict(format!(
                    "transaction {} is already being submitted",
                    tx.id
                )))
            }
            Err(e) => Err(e.into()),
        }
    }

    /// The provider already has the collection, so the row catches up instead of re-sending.
    async fn resume_collection(
        &self,
        tx: Transaction,
        provider_reference: String,
        report: StatusReport,
        provider: ProviderKind,
    ) -> Result<Transaction, PaymentError> {
        info!(
            transaction_id = %tx.id,
            provider_reference = %provider_reference,
            status = ?report.status,
            "Collection already reached the provider, not sending again"
        );
        let processing = self.mark_processing(&tx, &provider_reference).await?;
        if report.status == ProviderStatus::Pending {
            return Ok(processing);
        }

        let outcome = ProviderOutcome {
            provider,
            provider_reference,
            order_reference: Some(tx.transaction_reference.clone()),
            status: report.status,
            settlement_id: report.settlement_id,
            reason: report.reason,
        };
        let applied = self
            .apply_provider_outcome(processing, &outcome, OutcomeSource::Poll)
            .await?;
        Ok(applied.transaction)
    }

    async fn mark_processing(
        &self,
        tx: &Transaction,
        provider_reference: &str,
    ) -> Result<Transaction, PaymentError> {
        let fields = TransitionFields {
            mobile_money_reference: Some(provider_reference.to_string()),
            ..Default::default()
        };
        match self
            .ledger
            .transition(tx.id, LedgerState::PENDING, LedgerState::PROCESSING, fields)
            .await
        {
            Ok(processing) => Ok(processing),
            // A callback for the reserved reference got there first.
            Err(LedgerError::StaleState { .. }) => {
                let current = self.load(tx.id).await?;
                if current.payment_status == PaymentStatus::Pending {
                    Err(PaymentError::Conflict(format!(
                        "transaction {} changed while being submitted",
                        tx.id
                    )))
                } else {
                    Ok(current)
                }
            }
            Err(e) => {
                error!(
                    transaction_id = %tx.id,
                    provider_reference,
                    "Provider accepted the collection but the ledger write failed: {}",
                    e
                );
                Err(e.into())
            }
        }
    }

    async fn fail_pending(&self, tx: &Transaction, reason: String) -> PaymentError {
        let fields = TransitionFields {
            failure_reason: Some(reason.clone()),
            ..Default::default()
        };
        let failed = match self
            .ledger
            .transition(tx.id, LedgerState::PENDING, LedgerState::FAILED, fields)
            .await
        {
            Ok(failed) => failed,
            Err(e) => return e.into(),
        };

        warn!(transaction_id = %failed.id, reason = %reason, "❌ Collection rejected");
        self.notifier.payment_failed(&failed).await;

        PaymentError::Rejected {
            transaction_id: failed.id,
            reason,
        }
    }

    // ----- Outcomes -----

    /// Polls the provider for a `processing` transaction.
    pub async fn reconcile(&self, transaction_id: Uuid) -> Result<Applied, PaymentError> {
        let tx = self.load(transaction_id).await?;
        if tx.payment_status != PaymentStatus::Processing {
            return Err(PaymentError::InvalidState {
                id: tx.id,
                expected: PaymentStatus::Processing,
                actual: tx.payment_status,
            });
        }

        let provider_reference = tx.mobile_money_reference.clone().ok_or_else(|| {
            PaymentError::Ledger(LedgerError::InvalidFields(format!(
                "processing transaction {} has no provider reference",
                tx.id
            )))
        })?;
        let provider = self.providers.for_method(tx.payment_method)?;

        let report = self
            .call(provider.check_status(&provider_reference))
            .await
            .map_err(|e| retry_later(&tx, e))?;

        let outcome = ProviderOutcome {
            provider: provider.kind(),
            provider_reference,
            order_reference: Some(tx.transaction_reference.clone()),
            status: report.status,
            settlement_id: report.settlement_id,
            reason: report.reason,
        };

        self.apply_provider_outcome(tx, &outcome, OutcomeSource::Poll)
            .await
    }

    /// The single routine behind webhooks and polling.
    ///
    /// A compare-and-set loser re-reads the row and evaluates again; on the
    /// second pass it sees the winner's terminal state and returns
    /// [`ApplyResult::Duplicate`]. Only the winner notifies.
    pub async fn apply_provider_outcome(
        &self,
        tx: Transaction,
        outcome: &ProviderOutcome,
        source: OutcomeSource,
    ) -> Result<Applied, PaymentError> {
        let mut current = tx;

        for _ in 0..MAX_CAS_ATTEMPTS {
            let state = current.state();
            let target = match outcome.status {
                ProviderStatus::Pending => {
                    return Ok(Applied {
                        result: ApplyResult::StillPending,
                        transaction: current,
                    })
                }
                ProviderStatus::Successful => LedgerState::completed_for(current.transaction_type),
                ProviderStatus::Failed => LedgerState::FAILED,
            };

            match state.payment_status {
                PaymentStatus::Pending
                    if current.reserved_provider_reference.as_deref()
                        == Some(outcome.provider_reference.as_str()) =>
                {
                    info!(
                        transaction_id = %current.id,
                        provider_reference = %outcome.provider_reference,
                        "Outcome arrived before the send was recorded, promoting to processing"
                    );
                    current = self.mark_processing(&current, &outcome.provider_reference).await?;
                    continue;
                }
                PaymentStatus::Pending => {
                    warn!(
                        transaction_id = %current.id,
                        provider_reference = %outcome.provider_reference,
                        "Outcome for a transaction that was never sent, ignoring"
                    );
                    return Ok(Applied {
                        result: ApplyResult::Ignored,
                        transaction: current,
                    });
                }
                PaymentStatus::Processing => {}
                terminal => {
                    let agrees = matches!(
                        (outcome.status, terminal),
                        (
                            ProviderStatus::Successful,
                            PaymentStatus::Completed | PaymentStatus::Refunded
                        ) | (ProviderStatus::Failed, PaymentStatus::Failed)
                    );
                    if !agrees {
                        error!(
                            transaction_id = %current.id,
                            recorded = %state,
                            reported = ?outcome.status,
                            provider = outcome.provider.as_str(),
                            "Provider outcome contradicts recorded terminal state"
                        );
                    }
                    return Ok(Applied {
                        result: if agrees {
                            ApplyResult::Duplicate
                        } else {
                            ApplyResult::Conflict
                        },
                        transaction: current,
                    });
                }
            }

            let fields = match outcome.status {
                ProviderStatus::Successful => TransitionFields {
                    external_id: outcome.settlement_id.clone(),
                    callback_received: source == OutcomeSource::Webhook,
                    ..Default::default()
                },
                _ => TransitionFields {
                    callback_received: source == OutcomeSource::Webhook,
                    failure_reason: Some(
                        outcome
                            .reason
                            .clone()
                            .unwrap_or_else(|| "failed at provider".to_string()),
                    ),
                    ..Default::default()
                },
            };

            match self.ledger.transition(current.id, state, target, fields).await {
                Ok(updated) => {
                    info!(
                        transaction_id = %updated.id,
                        state = %updated.state(),
                        source = ?source,
                        "✅ Provider outcome applied"
                    );
                    if updated.payment_status == PaymentStatus::Completed {
                        self.notifier.payment_completed(&updated).await;
                    } else {
                        self.notifier.payment_failed(&updated).await;
                    }
                    return Ok(Applied {
                        result: ApplyResult::Applied,
                        transaction: updated,
                    });
                }
                Err(LedgerError::StaleState { actual, .. }) => {
                    info!(transaction_id = %current.id, actual = %actual, "Lost transition race, re-reading");
                    current = self.load(current.id).await?;
                }
                Err(e) => return Err(e.into()),
            }
        }

        Err(PaymentError::Conflict(format!(
            "transaction {} kept changing while applying an outcome",
            current.id
        )))
    }

    // ----- Escrow -----

    /// Pays the landlord their net share of a held rent payment and books the commission.
    pub async fn release_escrow(&self, transaction_id: Uuid) -> Result<ReleaseReceipt, PaymentError> {
        let tx = self.load(transaction_id).await?;
        ensure_held(&tx)?;
        let provider = self.providers.for_method(tx.payment_method)?;

        let tx = match self.resolve_open_claim(provider, tx).await? {
            OpenClaim::Free(tx) => tx,
            OpenClaim::Paid(claimed) => {
                let settled = self.settle(claimed).await?;
                return release_receipt(settled);
            }
        };

        let rate = self.commission.current().await;
        let split = compute_split(tx.amount, rate)
            .map_err(|e| PaymentError::Validation(e.to_string()))?;

        let payee = if split.landlord_net > 0 {
            Some(self.directory.resolve_party(&tx.landlord_id).await?.phone_number)
        } else {
            None
        };

        let claim = DisbursementClaim {
            reference: next_claim_reference(&tx),
            purpose: DisbursementPurpose::Release,
            amount: split.landlord_net,
            commission_rate: Some(rate.value()),
        };
        let claimed = self.claim(&tx, &claim).await?;

        let claimed = match payee {
            Some(payee) => self.disburse(provider, claimed, &claim, payee).await?,
            None => {
                info!(transaction_id = %tx.id, "Landlord net is zero, no disbursement sent");
                claimed
            }
        };

        let settled = self.settle(claimed).await?;
        release_receipt(settled)
    }

    /// Returns the full amount of a held payment to the renter.
    pub async fn refund_escrow(&self, transaction_id: Uuid) -> Result<RefundReceipt, PaymentError> {
        let tx = self.load(transaction_id).await?;
        ensure_held(&tx)?;
        let provider = self.providers.for_method(tx.payment_method)?;

        let tx = match self.resolve_open_claim(provider, tx).await? {
            OpenClaim::Free(tx) => tx,
            OpenClaim::Paid(claimed) => {
                let settled = self.settle(claimed).await?;
                return refund_receipt(settled);
            }
        };

        let payee = self.directory.resolve_party(&tx.renter_id).await?.phone_number;
        let claim = DisbursementClaim {
            reference: next_claim_reference(&tx),
            purpose: DisbursementPurpose::Refund,
            amount: tx.amount,
            commission_rate: None,
        };
        let claimed = self.claim(&tx, &claim).await?;
        let claimed = self.disburse(provider, claimed, &claim, payee).await?;

        let settled = self.settle(claimed).await?;
        refund_receipt(settled)
    }

    /// How long a claim belongs to the operation that took it.
    fn claim_expiry(&self) -> Duration {
        self.call_timeout * 3
    }

    /// Decides what a claim left on a held row by an earlier attempt means.
    ///
    /// A fresh claim is still owned by the attempt that took it. An expired
    /// one is settled if the provider paid it and given back otherwise.
    async fn resolve_open_claim(
        &self,
        provider: &Arc<dyn PaymentProvider>,
        tx: Transaction,
    ) -> Result<OpenClaim, PaymentError> {
        let Some(claim_reference) = tx.disbursement_reference.clone() else {
            return Ok(OpenClaim::Free(tx));
        };

        let claimed_at = tx.disbursement_claimed_at.unwrap_or(tx.updated_at);
        let expired = (Utc::now() - claimed_at)
            .to_std()
            .map_or(false, |age| age >= self.claim_expiry());
        if !expired {
            return Err(PaymentError::Conflict(format!(
                "disbursement {} for transaction {} is in progress",
                claim_reference, tx.id
            )));
        }

        let Some(provider_reference) = tx.disbursement_provider_reference.clone() else {
            warn!(transaction_id = %tx.id, claim = %claim_reference, "Expired claim never reached the provider, giving it back");
            return self.give_back(&tx, &claim_reference).await.map(OpenClaim::Free);
        };

        match self
            .call(provider.find_operation(Operation::Disbursement, &provider_reference))
            .await
        {
            Ok(Some(report)) if report.status != ProviderStatus::Failed => {
                info!(
                    transaction_id = %tx.id,
                    claim = %claim_reference,
                    provider_reference = %provider_reference,
                    status = ?report.status,
                    "Expired disbursement was paid, settling it"
                );
                Ok(OpenClaim::Paid(tx))
            }
            Ok(_) => {
                warn!(
                    transaction_id = %tx.id,
                    claim = %claim_reference,
                    provider_reference = %provider_reference,
                    "Expired disbursement was not paid, giving the claim back"
                );
                self.give_back(&tx, &claim_reference).await.map(OpenClaim::Free)
            }
            Err(e) => Err(retry_later(&tx, e)),
        }
    }

    async fn claim(
        &self,
        tx: &Transaction,
        claim: &DisbursementClaim,
    ) -> Result<Transaction, PaymentError> {
        self.ledger
            .claim_disbursement(tx.id, claim)
            .await
            .map_err(|e| claim_error(tx.id, e))
    }

    async fn give_back(&self, tx: &Transaction, claim_reference: &str) -> Result<Transaction, PaymentError> {
        self.ledger
            .release_disbursement_claim(tx.id, claim_reference)
            .await
            .map_err(|e| claim_error(tx.id, e))
    }

    /// Sends a disbursement under a held claim.
    ///
    /// Definite failures give the claim back so the operation can be retried.
    /// A call abandoned at the timeout keeps it until the claim expires; the
    /// provider may still pay.
    async fn disburse(
        &self,
        provider: &Arc<dyn PaymentProvider>,
        claimed: Transaction,
        claim: &DisbursementClaim,
        payee_handle: String,
    ) -> Result<Transaction, PaymentError> {
        let provider_reference = match self
            .call(provider.reserve_reference(Operation::Disbursement))
            .await
        {
            Ok(reference) => reference,
            Err(e) => return Err(self.abandon(&claimed, &claim.reference, e).await),
        };
        let claimed = self
            .ledger
            .record_disbursement_reference(claimed.id, &claim.reference, &provider_reference)
            .await
            .map_err(|e| claim_error(claimed.id, e))?;

        let request = DisbursementRequest {
            amount: claim.amount,
            currency: claimed.currency.clone(),
            payee_handle,
            transaction_reference: claim.reference.clone(),
            provider_reference: provider_reference.clone(),
        };

        let failure = match self.call(provider.initiate_disbursement(&request)).await {
            Ok(ack) if ack.accepted => {
                info!(
                    transaction_id = %claimed.id,
                    claim = %claim.reference,
                    provider_reference = %provider_reference,
                    amount = claim.amount,
                    "Disbursement accepted"
                );
                return Ok(claimed);
            }
            Ok(ack) => ProviderError::Rejected(format!(
                "provider declined disbursement {}",
                ack.provider_reference
            )),
            Err(ProviderError::Timeout) => {
                error!(
                    transaction_id = %claimed.id,
                    claim = %claim.reference,
                    provider_reference = %provider_reference,
                    "Disbursement outcome unknown, claim kept until it expires"
                );
                return Err(PaymentError::RetryLater {
                    transaction_id: claimed.id,
                    transaction_reference: claimed.transaction_reference.clone(),
                    reason: format!(
                        "disbursement {} timed out, retry after {}s",
                        claim.reference,
                        self.claim_expiry().as_secs_f64()
                    ),
                });
            }
            Err(e) if e.is_ambiguous() || matches!(e, ProviderError::Malformed(_)) => {
                match self
                    .call(provider.find_operation(Operation::Disbursement, &provider_reference))
                    .await
                {
                    Ok(Some(report)) if report.status != ProviderStatus::Failed => {
                        info!(
                            transaction_id = %claimed.id,
                            claim = %claim.reference,
                            "Disbursement reached the provider despite the error: {}",
                            e
                        );
                        return Ok(claimed);
                    }
                    Ok(_) => e,
                    Err(lookup) => {
                        error!(
                            transaction_id = %claimed.id,
                            claim = %claim.reference,
                            "Disbursement outcome unknown ({}), lookup failed: {}",
                            e,
                            lookup
                        );
                        return Err(retry_later(&claimed, e));
                    }
                }
            }
            Err(e) => e,
        };

        Err(self.abandon(&claimed, &claim.reference, failure).await)
    }

    /// Gives the claim back after a disbursement that certainly did not happen.
    async fn abandon(
        &self,
        claimed: &Transaction,
        claim_reference: &str,
        failure: ProviderError,
    ) -> PaymentError {
        if let Err(e) = self
            .ledger
            .release_disbursement_claim(claimed.id, claim_reference)
            .await
        {
            error!(transaction_id = %claimed.id, claim = claim_reference, "Could not release disbursement claim: {}", e);
        }
        warn!(transaction_id = %claimed.id, claim = claim_reference, "Disbursement failed, escrow stays held: {}", failure);

        match failure {
            ProviderError::Rejected(reason) => PaymentError::Rejected {
                transaction_id: claimed.id,
                reason,
            },
            other => retry_later(claimed, other),
        }
    }

    /// Books the settled entry of a paid claim, then moves the row out of `held`.
    ///
    /// The entry goes first so a failed write leaves the claim open for the
    /// next attempt to finish. Booking is idempotent on the entry reference.
    async fn settle(&self, claimed: Transaction) -> Result<Settlement, PaymentError> {
        let purpose = claimed.disbursement_purpose.ok_or_else(|| {
            PaymentError::Ledger(LedgerError::InvalidFields(format!(
                "claim on transaction {} has no purpose",
                claimed.id
            )))
        })?;

        let (target, entry) = match purpose {
            DisbursementPurpose::Release => {
                let commission = claimed.released_commission().unwrap_or(0);
                let entry = if commission > 0 {
                    Some(
                        self.book_entry(
                            &claimed,
                            TransactionType::Commission,
                            commission,
                            claimed.commission_reference(),
                        )
                        .await?,
                    )
                } else {
                    None
                };
                (LedgerState::RELEASED, entry)
            }
            DisbursementPurpose::Refund => {
                let entry = self
                    .book_entry(
                        &claimed,
                        TransactionType::Refund,
                        claimed.amount,
                        claimed.refund_reference(),
                    )
                    .await?;
                (LedgerState::REFUNDED, Some(entry))
            }
        };

        let settled = self
            .ledger
            .transition(claimed.id, LedgerState::HELD, target, TransitionFields::default())
            .await
            .map_err(|e| {
                error!(
                    transaction_id = %claimed.id,
                    claim = claimed.disbursement_reference.as_deref().unwrap_or("-"),
                    "Disbursement paid but escrow was not settled: {}",
                    e
                );
                claim_error(claimed.id, e)
            })?;

        let split = Split {
            landlord_net: settled.disbursement_amount.unwrap_or(0),
            commission: settled.released_commission().unwrap_or(0),
        };
        match purpose {
            DisbursementPurpose::Release => {
                info!(
                    transaction_id = %settled.id,
                    landlord_net = split.landlord_net,
                    commission = split.commission,
                    rate = %settled.disbursement_rate.unwrap_or_default(),
                    "💸 Escrow released"
                );
                self.notifier.escrow_released(&settled, &split).await;
            }
            DisbursementPurpose::Refund => {
                info!(transaction_id = %settled.id, amount = settled.amount, "↩️ Escrow refunded");
                self.notifier.escrow_refunded(&settled).await;
            }
        }

        Ok(Settlement {
            purpose,
            transaction: settled,
            entry,
            split,
        })
    }

    async fn book_entry(
        &self,
        source: &Transaction,
        transaction_type: TransactionType,
        amount: i64,
        reference: String,
    ) -> Result<Transaction, PaymentError> {
        let entry = NewTransaction {
            transaction_reference: reference.clone(),
            renter_id: source.renter_id.clone(),
            landlord_id: source.landlord_id.clone(),
            property_id: source.property_id.clone(),
            transaction_type,
            amount,
            currency: source.currency.clone(),
            payment_method: source.payment_method,
        };

        match self.ledger.insert_settled_entry(entry, source.id).await {
            Ok(booked) => Ok(booked),
            Err(LedgerError::DuplicateReference(_)) => self
                .ledger
                .find_by_reference(&reference)
                .await?
                .ok_or_else(|| PaymentError::NotFound(reference)),
            Err(e) => {
                error!(
                    source_id = %source.id,
                    entry = transaction_type.as_str(),
                    "Settled entry was not recorded: {}",
                    e
                );
                Err(e.into())
            }
        }
    }

    // ----- Queries -----

    pub async fn get_transaction_status(
        &self,
        transaction_reference: &str,
    ) -> Result<TransactionDetails, PaymentError> {
        let tx = self
            .ledger
            .find_by_reference(transaction_reference)
            .await?
            .ok_or_else(|| PaymentError::NotFound(transaction_reference.to_string()))?;
        let related = self.ledger.find_by_source(tx.id).await?;

        Ok(TransactionDetails {
            transaction: TransactionStatusView::from(&tx),
            related: related.iter().map(TransactionStatusView::from).collect(),
        })
    }

    /// Resolves a webhook's references to a row: provider reference first, then order reference.
    pub async fn find_for_outcome(
        &self,
        outcome: &ProviderOutcome,
    ) -> Result<Option<Transaction>, PaymentError> {
        if let Some(tx) = self
            .ledger
            .find_by_provider_reference(&outcome.provider_reference)
            .await?
        {
            return Ok(Some(tx));
        }

        let Some(order_reference) = outcome.order_reference.as_deref() else {
            return Ok(None);
        };
        let found = self.ledger.find_by_reference(order_reference).await?;
        // The order id must belong to the same provider as the callback.
        Ok(found.filter(|tx| ProviderKind::from_method(tx.payment_method) == Some(outcome.provider)))
    }

    async fn load(&self, id: Uuid) -> Result<Transaction, PaymentError> {
        self.ledger
            .get(id)
            .await?
            .ok_or_else(|| PaymentError::NotFound(id.to_string()))
    }

    async fn call<T, F>(&self, call: F) -> Result<T, ProviderError>
    where
        F: Future<Output = Result<T, ProviderError>>,
    {
        match tokio::time::timeout(self.call_timeout, call).await {
            Ok(result) => result,
            Err(_) => Err(ProviderError::Timeout),
        }
    }
}

/// A held row's disbursement slot as seen by a new release or refund.
enum OpenClaim {
    Free(Transaction),
    Paid(Transaction),
}

struct Settlement {
    purpose: DisbursementPurpose,
    transaction: Transaction,
    entry: Option<Transaction>,
    split: Split,
}

fn release_receipt(settled: Settlement) -> Result<ReleaseReceipt, PaymentError> {
    // An expired refund claim was finished instead.
    if settled.purpose != DisbursementPurpose::Release {
        return Err(PaymentError::EscrowPrecondition {
            id: settled.transaction.id,
            state: settled.transaction.state(),
        });
    }
    let tx = &settled.transaction;
    Ok(ReleaseReceipt {
        transaction: TransactionStatusView::from(tx),
        commission_transaction: settled.entry.as_ref().map(TransactionStatusView::from),
        landlord_net: settled.split.landlord_net,
        commission: settled.split.commission,
        commission_rate: tx.disbursement_rate.unwrap_or_default(),
        disbursement_reference: tx.disbursement_provider_reference.clone(),
    })
}

fn refund_receipt(settled: Settlement) -> Result<RefundReceipt, PaymentError> {
    let tx = &settled.transaction;
    match (settled.purpose, settled.entry.as_ref()) {
        (DisbursementPurpose::Refund, Some(entry)) => Ok(RefundReceipt {
            transaction: TransactionStatusView::from(tx),
            refund_transaction: TransactionStatusView::from(entry),
            disbursement_reference: tx.disbursement_provider_reference.clone().unwrap_or_default(),
        }),
        _ => Err(PaymentError::EscrowPrecondition {
            id: tx.id,
            state: tx.state(),
        }),
    }
}

fn next_claim_reference(tx: &Transaction) -> String {
    format!(
        "PAY-{}-{}",
        tx.transaction_reference,
        tx.disbursement_attempts + 1
    )
}

fn claim_error(id: Uuid, err: LedgerError) -> PaymentError {
    match err {
        LedgerError::StaleState { actual, .. } => PaymentError::EscrowPrecondition { id, state: actual },
        e => e.into(),
    }
}

fn retry_later(tx: &Transaction, err: ProviderError) -> PaymentError {
    PaymentError::RetryLater {
        transaction_id: tx.id,
        transaction_reference: tx.transaction_reference.clone(),
        reason: err.to_string(),
    }
}

fn ensure_held(tx: &Transaction) -> Result<(), PaymentError> {
    if tx.state() == LedgerState::HELD {
        Ok(())
    } else {
        Err(PaymentError::EscrowPrecondition {
            id: tx.id,
            state: tx.state(),
        })
    }
}

fn validate_reference(reference: &str) -> Result<String, PaymentError> {
    let reference = reference.trim();
    if reference.is_empty() || reference.len() > 64 {
        return Err(PaymentError::Validation(
            "transaction_reference must be 1 to 64 characters".to_string(),
        ));
    }
    if RESERVED_PREFIXES.iter().any(|p| reference.starts_with(p)) {
        return Err(PaymentError::Validation(format!(
            "transaction_reference may not start with {}",
            RESERVED_PREFIXES.join(", ")
        )));
    }
    Ok(reference.to_string())
}

fn generate_reference(transaction_type: TransactionType) -> String {
    let prefix = match transaction_type {
        TransactionType::Deposit => "DEP",
        _ => "RENT",
    };
    let suffix = Uuid::new_v4().simple().to_string();
    format!(
        "{}-{}-{}",
        prefix,
        Utc::now().format("%Y%m%d"),
        suffix[..10].to_ascii_uppercase()
    )
}
