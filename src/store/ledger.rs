//! Token ledger REST client using the service key

use std::time::Duration;

use reqwest::Client;
use serde::Serialize;
use uuid::Uuid;

use crate::config::Config;

/// Timeout for ledger calls; an expired call is a transient failure,
/// never retried here
const LEDGER_TIMEOUT: Duration = Duration::from_secs(5);

/// Server-side client for the token ledger
/// Uses the service key which bypasses user-level checks - handle with care!
#[derive(Clone)]
pub struct LedgerClient {
    client: Client,
    base_url: String,
    service_key: String,
}

#[derive(Serialize)]
struct CreditRequest<'a> {
    player_id: Uuid,
    amount: i64,
    reason: &'a str,
}

impl LedgerClient {
    pub fn new(config: &Config) -> Self {
        Self {
            client: Client::new(),
            base_url: config.ledger_url.clone(),
            service_key: config.ledger_service_key.clone(),
        }
    }

    /// Credit a player's token balance by `amount`, recording `reason`
    pub async fn credit_player(
        &self,
        player_id: Uuid,
        amount: i64,
        reason: &str,
    ) -> Result<(), LedgerError> {
        let url = format!("{}/rest/v1/rpc/credit_player", self.base_url);

        let response = self
            .client
            .post(&url)
            .header("apikey", &self.service_key)
            .header("Authorization", format!("Bearer {}", self.service_key))
            .header("Content-Type", "application/json")
            .timeout(LEDGER_TIMEOUT)
            .json(&CreditRequest {
                player_id,
                amount,
                reason,
            })
            .send()
            .await
            .map_err(LedgerError::Request)?;

        if !response.status().is_success() {
            let status = response.status();
            let body = response.text().await.unwrap_or_default();
            return Err(LedgerError::Api {
                status: status.as_u16(),
                body,
            });
        }

        Ok(())
    }
}

/// Ledger errors
#[derive(Debug, thiserror::Error)]
pub enum LedgerError {
    #[error("HTTP request failed: {0}")]
    Request(#[from] reqwest::Error),

    #[error("API error (status {status}): {body}")]
    Api { status: u16, body: String },
}
