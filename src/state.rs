use std::sync::Arc;

use crate::services::escrow::CommissionPolicy;
use crate::services::orchestrator::PaymentOrchestrator;
use crate::services::webhook_gateway::WebhookGateway;

#[derive(Clone)]
pub struct AppState {
    pub orchestrator: PaymentOrchestrator,
    pub gateway: WebhookGateway,
    pub commission: Arc<CommissionPolicy>,
}

impl AppState {
    pub fn new(orchestrator: PaymentOrchestrator, gateway: WebhookGateway) -> Self {
        AppState {
            commission: orchestrator.commission_policy().clone(),
            orchestrator,
            gateway,
        }
    }
}
