pub mod notification;
pub mod party;
pub mod payment;
pub mod provider;
pub mod transaction;
