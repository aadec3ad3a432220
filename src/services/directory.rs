// services/directory.rs
use async_trait::async_trait;
use reqwest::{Client, StatusCode};
use std::time::Duration;
use tracing::error;

use crate::errors::{AppError, PaymentError};
use crate::models::party::{PartyProfile, RentTerms};

/// Read-only view of the identity service.
#[async_trait]
pub trait IdentityDirectory: Send + Sync {
    async fn resolve_party(&self, party_id: &str) -> Result<PartyProfile, PaymentError>;
}

/// Read-only view of the listing store.
#[async_trait]
pub trait ListingStore: Send + Sync {
    async fn rent_terms(&self, property_id: &str) -> Result<RentTerms, PaymentError>;
}

#[derive(Clone)]
pub struct HttpDirectory {
    client: Client,
    base_url: String,
}

impl HttpDirectory {
    pub fn new(base_url: &str, timeout: Duration) -> Result<Self, AppError> {
        Ok(HttpDirectory {
            client: Client::builder().timeout(timeout).build()?,
            base_url: base_url.trim_end_matches('/').to_string(),
        })
    }
}

#[async_trait]
impl IdentityDirectory for HttpDirectory {
    async fn resolve_party(&self, party_id: &str) -> Result<PartyProfile, PaymentError> {
        let url = format!("{}/parties/{}", self.base_url, party_id);
        fetch_json(&self.client, &url, || format!("party {}", party_id)).await
    }
}

#[derive(Clone)]
pub struct HttpListingStore {
    client: Client,
    base_url: String,
}

impl HttpListingStore {
    pub fn new(base_url: &str, timeout: Duration) -> Result<Self, AppError> {
        Ok(HttpListingStore {
            client: Client::builder().timeout(timeout).build()?,
            base_url: base_url.trim_end_matches('/').to_string(),
        })
    }
}

#[async_trait]
impl ListingStore for HttpListingStore {
    async fn rent_terms(&self, property_id: &str) -> Result<RentTerms, PaymentError> {
        let url = format!("{}/properties/{}/rent-terms", self.base_url, property_id);
        fetch_json(&self.client, &url, || format!("property {}", property_id)).await
    }
}

async fn fetch_json<T, F>(client: &Client, url: &str, what: F) -> Result<T, PaymentError>
where
    T: serde::de::DeserializeOwned,
    F: Fn() -> String,
{
    let response = client.get(url).send().await.map_err(|e| {
        error!(url, "Collaborator request failed: {}", e);
        PaymentError::Upstream(format!("{} lookup failed: {}", what(), e))
    })?;

    match response.status() {
        StatusCode::NOT_FOUND => Err(PaymentError::NotFound(what())),
        status if status.is_success() => response
            .json()
            .await
            .map_err(|e| PaymentError::Upstream(format!("{} response unreadable: {}", what(), e))),
        status => {
            error!(url, %status, "Collaborator returned an error");
            Err(PaymentError::Upstream(format!("{} lookup returned {}", what(), status)))
        }
    }
}
