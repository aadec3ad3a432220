pub mod directory;
pub mod escrow;
pub mod ledger;
pub mod notification_emitter;
pub mod orchestrator;
pub mod providers;
pub mod reconciliation;
pub mod webhook_gateway;
