#![allow(dead_code)]

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use axum::http::{HeaderMap, HeaderValue};
use axum::Router;
use hmac::{Hmac, Mac};
use rust_decimal::Decimal;
use sha2::Sha256;
use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use uuid::Uuid;

use rent_escrow_api::build_router;
use rent_escrow_api::config::ReconciliationConfig;
use rent_escrow_api::database::InMemoryLedger;
use rent_escrow_api::errors::{LedgerError, PaymentError, ProviderError};
use rent_escrow_api::models::notification::{Notification, NotificationKind};
use rent_escrow_api::models::party::{PartyProfile, PartyRole, RentTerms};
use rent_escrow_api::models::payment::RequestPayment;
use rent_escrow_api::models::provider::{
    CollectionRequest, DisbursementRequest, HandleCheck, Operation, ProviderAck, ProviderKind,
    ProviderStatus, StatusReport,
};
use rent_escrow_api::models::transaction::{
    DisbursementClaim, LedgerState, NewTransaction, PaymentMethod, Transaction, TransitionFields,
};
use rent_escrow_api::services::directory::{IdentityDirectory, ListingStore};
use rent_escrow_api::services::escrow::{CommissionPolicy, CommissionRate};
use rent_escrow_api::services::ledger::TransactionLedger;
use rent_escrow_api::services::notification_emitter::{NotificationDispatcher, NotificationEmitter};
use rent_escrow_api::services::orchestrator::PaymentOrchestrator;
use rent_escrow_api::services::providers::{PaymentProvider, ProviderRegistry};
use rent_escrow_api::services::reconciliation::ReconciliationSweep;
use rent_escrow_api::services::webhook_gateway::{
    WebhookGateway, WebhookSecrets, NONCE_HEADER, SIGNATURE_HEADER, TIMESTAMP_HEADER,
};
use rent_escrow_api::state::AppState;

pub const PROPERTY: &str = "prop-1";
pub const RENTER: &str = "renter-1";
pub const LANDLORD: &str = "landlord-1";
pub const RENT: i64 = 50_000;
pub const RENTER_PHONE: &str = "+237670000001";
pub const LANDLORD_PHONE: &str = "237690000002";
pub const SECRET_A: &str = "momo-webhook-secret";
pub const SECRET_B: &str = "orange-webhook-secret";

// ----- Scripted provider -----

/// Records every call. A request counts as received when it is not scripted
/// to fail, even if the caller gives up on it before the reply.
pub struct FakeProvider {
    kind: ProviderKind,
    counter: AtomicUsize,
    collections: Mutex<VecDeque<Result<ProviderAck, ProviderError>>>,
    disbursements: Mutex<VecDeque<Result<ProviderAck, ProviderError>>>,
    statuses: Mutex<HashMap<String, StatusReport>>,
    received: Mutex<HashSet<String>>,
    collection_delay: Mutex<Option<Duration>>,
    disbursement_delay: Mutex<Option<Duration>>,
    pub collection_calls: Mutex<Vec<CollectionRequest>>,
    pub disbursement_calls: Mutex<Vec<DisbursementRequest>>,
    pub status_calls: AtomicUsize,
    pub lookup_calls: AtomicUsize,
}

impl FakeProvider {
    pub fn new(kind: ProviderKind) -> Self {
        FakeProvider {
            kind,
            counter: AtomicUsize::new(0),
            collections: Mutex::new(VecDeque::new()),
            disbursements: Mutex::new(VecDeque::new()),
            statuses: Mutex::new(HashMap::new()),
            received: Mutex::new(HashSet::new()),
            collection_delay: Mutex::new(None),
            disbursement_delay: Mutex::new(None),
            collection_calls: Mutex::new(Vec::new()),
            disbursement_calls: Mutex::new(Vec::new()),
            status_calls: AtomicUsize::new(0),
            lookup_calls: AtomicUsize::new(0),
        }
    }

    fn next_reference(&self, what: &str) -> String {
        let n = self.counter.fetch_add(1, Ordering::SeqCst) + 1;
        format!("{}-{}-{}", self.kind.as_str(), what, n)
    }

    pub fn script_collection(&self, result: Result<ProviderAck, ProviderError>) {
        self.collections.lock().unwrap().push_back(result);
    }

    pub fn script_disbursement(&self, result: Result<ProviderAck, ProviderError>) {
        self.disbursements.lock().unwrap().push_back(result);
    }

    pub fn delay_collections(&self, delay: Duration) {
        *self.collection_delay.lock().unwrap() = Some(delay);
    }

    pub fn delay_disbursements(&self, delay: Duration) {
        *self.disbursement_delay.lock().unwrap() = Some(delay);
    }

    pub fn set_status(&self, provider_reference: &str, status: ProviderStatus, settlement_id: Option<&str>) {
        self.statuses.lock().unwrap().insert(
            provider_reference.to_string(),
            StatusReport {
                status,
                settlement_id: settlement_id.map(str::to_string),
                reason: None,
            },
        );
    }

    pub fn collection_count(&self) -> usize {
        self.collection_calls.lock().unwrap().len()
    }

    pub fn disbursements(&self) -> Vec<DisbursementRequest> {
        self.disbursement_calls.lock().unwrap().clone()
    }

    async fn answer(
        &self,
        provider_reference: &str,
        scripted: Option<Result<ProviderAck, ProviderError>>,
        delay: Option<Duration>,
    ) -> Result<ProviderAck, ProviderError> {
        if matches!(scripted, None | Some(Ok(ProviderAck { accepted: true, .. }))) {
            self.received
                .lock()
                .unwrap()
                .insert(provider_reference.to_string());
        }
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }
        scripted.unwrap_or_else(|| {
            Ok(ProviderAck {
                provider_reference: provider_reference.to_string(),
                accepted: true,
            })
        })
    }
}

#[async_trait]
impl PaymentProvider for FakeProvider {
    fn kind(&self) -> ProviderKind {
        self.kind
    }

    async fn reserve_reference(&self, operation: Operation) -> Result<String, ProviderError> {
        Ok(match operation {
            Operation::Collection => self.next_reference("col"),
            Operation::Disbursement => self.next_reference("dis"),
        })
    }

    async fn initiate_collection(&self, request: &CollectionRequest) -> Result<ProviderAck, ProviderError> {
        self.collection_calls.lock().unwrap().push(request.clone());
        let scripted = self.collections.lock().unwrap().pop_front();
        let delay = *self.collection_delay.lock().unwrap();
        self.answer(&request.provider_reference, scripted, delay).await
    }

    async fn check_status(&self, provider_reference: &str) -> Result<StatusReport, ProviderError> {
        self.status_calls.fetch_add(1, Ordering::SeqCst);
        Ok(self
            .statuses
            .lock()
            .unwrap()
            .get(provider_reference)
            .cloned()
            .unwrap_or(StatusReport {
                status: ProviderStatus::Pending,
                settlement_id: None,
                reason: None,
            }))
    }

    async fn find_operation(
        &self,
        _operation: Operation,
        provider_reference: &str,
    ) -> Result<Option<StatusReport>, ProviderError> {
        self.lookup_calls.fetch_add(1, Ordering::SeqCst);
        if let Some(report) = self.statuses.lock().unwrap().get(provider_reference) {
            return Ok(Some(report.clone()));
        }
        let received = self.received.lock().unwrap().contains(provider_reference);
        Ok(received.then(|| StatusReport {
            status: ProviderStatus::Pending,
            settlement_id: None,
            reason: None,
        }))
    }

    async fn initiate_disbursement(&self, request: &DisbursementRequest) -> Result<ProviderAck, ProviderError> {
        self.disbursement_calls.lock().unwrap().push(request.clone());
        let scripted = self.disbursements.lock().unwrap().pop_front();
        let delay = *self.disbursement_delay.lock().unwrap();
        self.answer(&request.provider_reference, scripted, delay).await
    }

    async fn validate_payer_handle(&self, _handle: &str) -> Result<HandleCheck, ProviderError> {
        Ok(HandleCheck {
            valid: true,
            display_name: Some("Test Renter".to_string()),
        })
    }
}

/// Fails the first settled-entry insert, then behaves like the ledger it wraps.
pub struct FailingLedger {
    inner: InMemoryLedger,
    armed: std::sync::atomic::AtomicBool,
}

impl FailingLedger {
    pub fn new(inner: InMemoryLedger) -> Self {
        FailingLedger {
            inner,
            armed: std::sync::atomic::AtomicBool::new(true),
        }
    }
}

#[async_trait]
impl TransactionLedger for FailingLedger {
    async fn create(&self, new: NewTransaction) -> Result<Transaction, LedgerError> {
        self.inner.create(new).await
    }

    async fn insert_settled_entry(
        &self,
        entry: NewTransaction,
        source_id: Uuid,
    ) -> Result<Transaction, LedgerError> {
        if self.armed.swap(false, Ordering::SeqCst) {
            return Err(LedgerError::Storage("write concern timeout".to_string()));
        }
        self.inner.insert_settled_entry(entry, source_id).await
    }

    async fn get(&self, id: Uuid) -> Result<Option<Transaction>, LedgerError> {
        self.inner.get(id).await
    }

    async fn find_by_reference(&self, reference: &str) -> Result<Option<Transaction>, LedgerError> {
        self.inner.find_by_reference(reference).await
    }

    async fn find_by_provider_reference(
        &self,
        mobile_money_reference: &str,
    ) -> Result<Option<Transaction>, LedgerError> {
        self.inner.find_by_provider_reference(mobile_money_reference).await
    }

    async fn find_by_source(&self, source_id: Uuid) -> Result<Vec<Transaction>, LedgerError> {
        self.inner.find_by_source(source_id).await
    }

    async fn transition(
        &self,
        id: Uuid,
        expected: LedgerState,
        next: LedgerState,
        fields: TransitionFields,
    ) -> Result<Transaction, LedgerError> {
        self.inner.transition(id, expected, next, fields).await
    }

    async fn reserve_collection_reference(
        &self,
        id: Uuid,
        provider_reference: &str,
    ) -> Result<Transaction, LedgerError> {
        self.inner.reserve_collection_reference(id, provider_reference).await
    }

    async fn claim_disbursement(
        &self,
        id: Uuid,
        claim: &DisbursementClaim,
    ) -> Result<Transaction, LedgerError> {
        self.inner.claim_disbursement(id, claim).await
    }

    async fn record_disbursement_reference(
        &self,
        id: Uuid,
        claim_reference: &str,
        provider_reference: &str,
    ) -> Result<Transaction, LedgerError> {
        self.inner
            .record_disbursement_reference(id, claim_reference, provider_reference)
            .await
    }

    async fn release_disbursement_claim(
        &self,
        id: Uuid,
        reference: &str,
    ) -> Result<Transaction, LedgerError> {
        self.inner.release_disbursement_claim(id, reference).await
    }

    async fn find_stale_processing(
        &self,
        older_than: DateTime<Utc>,
        limit: usize,
    ) -> Result<Vec<Transaction>, LedgerError> {
        self.inner.find_stale_processing(older_than, limit).await
    }
}

// ----- Collaborators -----

#[derive(Default)]
pub struct RecordingDispatcher {
    pub sent: Mutex<Vec<Notification>>,
}

impl RecordingDispatcher {
    pub fn kinds(&self) -> Vec<NotificationKind> {
        self.sent
            .lock()
            .unwrap()
            .iter()
            .map(|n| n.notification_type)
            .collect()
    }

    pub fn count(&self) -> usize {
        self.sent.lock().unwrap().len()
    }
}

#[async_trait]
impl NotificationDispatcher for RecordingDispatcher {
    async fn dispatch(&self, notification: &Notification) -> anyhow::Result<()> {
        self.sent.lock().unwrap().push(notification.clone());
        Ok(())
    }
}

pub struct StaticDirectory {
    parties: HashMap<String, PartyProfile>,
}

impl StaticDirectory {
    pub fn standard() -> Self {
        let parties = [
            (RENTER, RENTER_PHONE, PartyRole::Renter),
            (LANDLORD, LANDLORD_PHONE, PartyRole::Landlord),
        ]
        .into_iter()
        .map(|(id, phone, role)| {
            (
                id.to_string(),
                PartyProfile {
                    party_id: id.to_string(),
                    phone_number: phone.to_string(),
                    role,
                    notification_target: format!("device-{}", id),
                },
            )
        })
        .collect();
        StaticDirectory { parties }
    }
}

#[async_trait]
impl IdentityDirectory for StaticDirectory {
    async fn resolve_party(&self, party_id: &str) -> Result<PartyProfile, PaymentError> {
        self.parties
            .get(party_id)
            .cloned()
            .ok_or_else(|| PaymentError::NotFound(format!("party {}", party_id)))
    }
}

pub struct StaticListings {
    terms: HashMap<String, RentTerms>,
}

impl StaticListings {
    pub fn standard() -> Self {
        let mut terms = HashMap::new();
        for property in [PROPERTY, "prop-2"] {
            terms.insert(
                property.to_string(),
                RentTerms {
                    property_id: property.to_string(),
                    landlord_id: LANDLORD.to_string(),
                    rent_amount: RENT,
                    currency: "XAF".to_string(),
                },
            );
        }
        StaticListings { terms }
    }
}

#[async_trait]
impl ListingStore for StaticListings {
    async fn rent_terms(&self, property_id: &str) -> Result<RentTerms, PaymentError> {
        self.terms
            .get(property_id)
            .cloned()
            .ok_or_else(|| PaymentError::NotFound(format!("property {}", property_id)))
    }
}

// ----- Context -----

/// An orchestrator over real adapters, with the standard listings and parties.
pub fn orchestrator_over(
    provider_a: Arc<dyn PaymentProvider>,
    provider_b: Arc<dyn PaymentProvider>,
    call_timeout: Duration,
) -> (InMemoryLedger, PaymentOrchestrator) {
    let ledger = InMemoryLedger::new();
    let directory: Arc<dyn IdentityDirectory> = Arc::new(StaticDirectory::standard());
    let rate = CommissionRate::new(Decimal::new(5, 2)).unwrap();
    let orchestrator = PaymentOrchestrator::new(
        Arc::new(ledger.clone()),
        ProviderRegistry::new(provider_a, provider_b),
        Arc::new(StaticListings::standard()),
        directory.clone(),
        NotificationEmitter::new(Arc::new(RecordingDispatcher::default()), directory),
        Arc::new(CommissionPolicy::new(rate)),
    )
    .with_call_timeout(call_timeout);
    (ledger, orchestrator)
}

pub struct TestContext {
    pub ledger: InMemoryLedger,
    pub provider_a: Arc<FakeProvider>,
    pub provider_b: Arc<FakeProvider>,
    pub dispatcher: Arc<RecordingDispatcher>,
    pub orchestrator: PaymentOrchestrator,
    pub gateway: WebhookGateway,
    pub state: AppState,
}

impl TestContext {
    pub fn new() -> Self {
        Self::with_call_timeout(Duration::from_secs(2))
    }

    pub fn with_call_timeout(call_timeout: Duration) -> Self {
        Self::build(call_timeout, |ledger| Arc::new(ledger) as Arc<dyn TransactionLedger>)
    }

    /// The orchestrator writes through whatever `wrap` puts around the in-memory ledger.
    pub fn build(
        call_timeout: Duration,
        wrap: impl FnOnce(InMemoryLedger) -> Arc<dyn TransactionLedger>,
    ) -> Self {
        let ledger = InMemoryLedger::new();
        let provider_a = Arc::new(FakeProvider::new(ProviderKind::ProviderA));
        let provider_b = Arc::new(FakeProvider::new(ProviderKind::ProviderB));
        let dispatcher = Arc::new(RecordingDispatcher::default());
        let directory: Arc<dyn IdentityDirectory> = Arc::new(StaticDirectory::standard());

        let rate = CommissionRate::new(Decimal::new(5, 2)).unwrap();
        let orchestrator = PaymentOrchestrator::new(
            wrap(ledger.clone()),
            ProviderRegistry::new(provider_a.clone(), provider_b.clone()),
            Arc::new(StaticListings::standard()),
            directory.clone(),
            NotificationEmitter::new(dispatcher.clone(), directory),
            Arc::new(CommissionPolicy::new(rate)),
        )
        .with_call_timeout(call_timeout);

        let gateway = WebhookGateway::new(
            orchestrator.clone(),
            WebhookSecrets {
                provider_a: SECRET_A.to_string(),
                provider_b: SECRET_B.to_string(),
            },
            Duration::from_secs(300),
        );
        let state = AppState::new(orchestrator.clone(), gateway.clone());

        TestContext {
            ledger,
            provider_a,
            provider_b,
            dispatcher,
            orchestrator,
            gateway,
            state,
        }
    }

    pub fn router(&self) -> Router {
        build_router(self.state.clone())
    }

    /// Every `processing` row counts as stale.
    pub fn sweep(&self) -> ReconciliationSweep {
        ReconciliationSweep::new(
            self.orchestrator.clone(),
            &ReconciliationConfig {
                staleness_threshold: Duration::ZERO,
                interval: Duration::from_secs(1),
                batch_size: 50,
            },
        )
    }

    pub fn rent_request(&self, method: PaymentMethod) -> RequestPayment {
        RequestPayment {
            property_id: PROPERTY.to_string(),
            renter_id: RENTER.to_string(),
            amount: RENT,
            currency: "XAF".to_string(),
            payer_handle: RENTER_PHONE.to_string(),
            method,
            transaction_type: None,
            transaction_reference: None,
        }
    }

    /// A rent payment accepted by provider_a, waiting for its outcome.
    pub async fn processing_rent(&self) -> Transaction {
        self.orchestrator
            .request_payment(self.rent_request(PaymentMethod::ProviderA))
            .await
            .unwrap()
    }

    /// A rent payment whose collection succeeded, funds held.
    pub async fn held_rent(&self) -> Transaction {
        let tx = self.processing_rent().await;
        let reference = tx.mobile_money_reference.clone().unwrap();
        self.provider_a
            .set_status(&reference, ProviderStatus::Successful, Some("FT-1"));
        self.orchestrator.reconcile(tx.id).await.unwrap().transaction
    }

    pub async fn reload(&self, tx: &Transaction) -> Transaction {
        self.ledger.get(tx.id).await.unwrap().unwrap()
    }
}

// ----- Webhook signing -----

fn hmac_hex(secret: &str, parts: &[&[u8]]) -> String {
    let mut mac = Hmac::<Sha256>::new_from_slice(secret.as_bytes()).unwrap();
    for part in parts {
        mac.update(part);
    }
    hex::encode(mac.finalize().into_bytes())
}

pub fn signed_a_headers(body: &[u8], timestamp: i64) -> HeaderMap {
    let nonce = uuid::Uuid::new_v4().to_string();
    let ts = timestamp.to_string();
    let signature = hmac_hex(SECRET_A, &[ts.as_bytes(), b".", nonce.as_bytes(), b".", body]);

    let mut headers = HeaderMap::new();
    headers.insert(TIMESTAMP_HEADER, HeaderValue::from_str(&ts).unwrap());
    headers.insert(NONCE_HEADER, HeaderValue::from_str(&nonce).unwrap());
    headers.insert(SIGNATURE_HEADER, HeaderValue::from_str(&signature).unwrap());
    headers
}

pub fn signed_b_headers(body: &[u8]) -> HeaderMap {
    let mut headers = HeaderMap::new();
    headers.insert(
        SIGNATURE_HEADER,
        HeaderValue::from_str(&hmac_hex(SECRET_B, &[body])).unwrap(),
    );
    headers
}

pub fn provider_a_body(reference_id: &str, status: &str) -> Vec<u8> {
    serde_json::json!({
        "referenceId": reference_id,
        "financialTransactionId": "FT-9001",
        "amount": RENT.to_string(),
        "currency": "XAF",
        "status": status,
    })
    .to_string()
    .into_bytes()
}

pub fn provider_b_body(pay_token: &str, status: &str) -> Vec<u8> {
    serde_json::json!({
        "payToken": pay_token,
        "status": status,
        "txnid": "MP241014.0001",
    })
    .to_string()
    .into_bytes()
}
