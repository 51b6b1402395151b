//! HTTP chain reader for a Blockfrost-compatible Cardano indexer.

use std::time::Duration;

use async_trait::async_trait;
use reqwest::{Client, StatusCode};
use secrecy::{ExposeSecret, SecretString};
use serde::Deserialize;
use serde::de::DeserializeOwned;
use tracing::{debug, instrument, warn};

use super::datum::decode_datum;
use crate::domain::{
    AppError, ChainError, ChainLookup, ChainReader, ChainSnapshot, TxInfo, TxMetadata, Utxo,
};

/// Indexer client configuration
#[derive(Debug, Clone)]
pub struct IndexerConfig {
    pub base_url: String,
    /// Sent as the `project_id` header
    pub api_key: Option<SecretString>,
    pub timeout: Duration,
}

impl IndexerConfig {
    pub fn new(base_url: impl Into<String>) -> Self {
        Self {
            base_url: base_url.into(),
            api_key: None,
            timeout: Duration::from_secs(10),
        }
    }
}

#[derive(Debug, Deserialize)]
struct AssetAddress {
    address: String,
    quantity: String,
}

#[derive(Debug, Deserialize)]
struct AddressUtxo {
    tx_hash: String,
    output_index: u32,
    #[serde(default)]
    data_hash: Option<String>,
}

#[derive(Debug, Deserialize)]
struct TxResponse {
    hash: String,
    block: String,
    block_height: i64,
    block_time: i64,
}

#[derive(Debug, Deserialize)]
struct DatumResponse {
    json_value: serde_json::Value,
}

#[derive(Debug, Deserialize)]
struct IndexerHealth {
    is_healthy: bool,
}

/// Read-only chain reader backed by the indexer's REST API
#[derive(Debug, Clone)]
pub struct IndexerClient {
    http_client: Client,
    base_url: String,
    api_key: Option<SecretString>,
}

impl IndexerClient {
    pub fn new(config: IndexerConfig) -> Result<Self, AppError> {
        let http_client = Client::builder()
            .timeout(config.timeout)
            .build()
            .map_err(|e| AppError::Chain(ChainError::Request(e.to_string())))?;

        Ok(Self {
            http_client,
            base_url: config.base_url.trim_end_matches('/').to_string(),
            api_key: config.api_key,
        })
    }

    /// GET a JSON resource. A 404 is `Ok(None)`; any other failure is transient.
    async fn get_json<T: DeserializeOwned>(&self, path: &str) -> Result<Option<T>, ChainError> {
        let url = format!("{}{}", self.base_url, path);
        debug!(url = %url, "Indexer request");

        let mut request = self.http_client.get(&url);
        if let Some(key) = &self.api_key {
            request = request.header("project_id", key.expose_secret());
        }

        let response = request.send().await.map_err(|e| {
            if e.is_timeout() {
                ChainError::Timeout(path.to_string())
            } else {
                ChainError::Request(e.to_string())
            }
        })?;

        let status = response.status();
        if status == StatusCode::NOT_FOUND {
            return Ok(None);
        }
        if !status.is_success() {
            warn!(endpoint = %path, status = %status, "Indexer returned error status");
            return Err(ChainError::Status {
                endpoint: path.to_string(),
                status: status.as_u16(),
            });
        }

        let body = response.json::<T>().await.map_err(|e| {
            if e.is_timeout() {
                ChainError::Timeout(path.to_string())
            } else {
                ChainError::Schema(format!("{path}: {e}"))
            }
        })?;
        Ok(Some(body))
    }

    /// Like `get_json`, but a 404 is an error: the resource must exist.
    async fn get_required<T: DeserializeOwned>(&self, path: &str) -> Result<T, ChainError> {
        self.get_json(path).await?.ok_or_else(|| ChainError::Status {
            endpoint: path.to_string(),
            status: StatusCode::NOT_FOUND.as_u16(),
        })
    }

    async fn find_utxo(&self, thread_token: &str) -> Result<Option<Utxo>, ChainError> {
        let holders: Vec<AssetAddress> = self
            .get_json(&format!("/assets/{thread_token}/addresses"))
            .await?
            .unwrap_or_default();

        let Some(holder) = holders.into_iter().find(|h| h.quantity != "0") else {
            return Ok(None);
        };

        // A holder without a matching UTXO means the indexer is mid-sync; never report NotFound.
        let utxos: Vec<AddressUtxo> = self
            .get_required(&format!("/addresses/{}/utxos/{thread_token}", holder.address))
            .await?;
        let utxo = utxos.into_iter().next().ok_or_else(|| {
            ChainError::Inconsistent(format!(
                "{} holds {thread_token} but lists no UTXO for it",
                holder.address
            ))
        })?;

        Ok(Some(Utxo {
            tx_hash: utxo.tx_hash,
            output_index: utxo.output_index,
            address: holder.address,
            data_hash: utxo.data_hash,
        }))
    }
}

#[async_trait]
impl ChainReader for IndexerClient {
    async fn health_check(&self) -> Result<(), AppError> {
        let health: IndexerHealth = self.get_required("/health").await?;
        if health.is_healthy {
            Ok(())
        } else {
            Err(AppError::Chain(ChainError::Request(
                "indexer reports unhealthy".to_string(),
            )))
        }
    }

    #[instrument(skip(self))]
    async fn resolve(&self, thread_token: &str) -> Result<ChainLookup, AppError> {
        let Some(utxo) = self.find_utxo(thread_token).await? else {
            debug!(thread_token = %thread_token, "No UTXO holds the thread token");
            return Ok(ChainLookup::NotFound);
        };

        let tx: TxResponse = self
            .get_required(&format!("/txs/{}", utxo.tx_hash))
            .await?;
        let metadata: Vec<TxMetadata> = self
            .get_required(&format!("/txs/{}/metadata", utxo.tx_hash))
            .await?;

        let data_hash = utxo.data_hash.as_deref().ok_or_else(|| {
            ChainError::Decode(format!("UTXO {}#{} carries no datum", utxo.tx_hash, utxo.output_index))
        })?;
        let datum: DatumResponse = self
            .get_required(&format!("/scripts/datum/{data_hash}"))
            .await?;
        let datum = decode_datum(&datum.json_value)?;

        debug!(
            thread_token = %thread_token,
            tx_hash = %tx.hash,
            state = datum.state,
            "Resolved thread token"
        );

        Ok(ChainLookup::Found(Box::new(ChainSnapshot {
            utxo,
            tx: TxInfo {
                hash: tx.hash,
                block: tx.block,
                block_height: tx.block_height,
                block_time: tx.block_time,
            },
            metadata,
            datum,
        })))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_base_url_trailing_slash_is_trimmed() {
        let client = IndexerClient::new(IndexerConfig::new("http://localhost:3000/api/v0/")).unwrap();
        assert_eq!(client.base_url, "http://localhost:3000/api/v0");
    }

    #[test]
    fn test_tx_response_ignores_extra_fields() {
        let tx: TxResponse = serde_json::from_value(serde_json::json!({
            "hash": "abc",
            "block": "blk",
            "block_height": 10,
            "block_time": 1_700_000_000,
            "slot": 123,
            "fees": "170000"
        }))
        .unwrap();
        assert_eq!(tx.block_height, 10);
    }
}
