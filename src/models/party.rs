// models/party.rs
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PartyRole {
    Renter,
    Landlord,
    Admin,
}

/// A party as resolved by the identity service.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PartyProfile {
    pub party_id: String,
    pub phone_number: String,
    pub role: PartyRole,
    pub notification_target: String,
}

/// Rent terms as published by the listing store.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RentTerms {
    pub property_id: String,
    pub landlord_id: String,
    pub rent_amount: i64,
    pub currency: String,
}
