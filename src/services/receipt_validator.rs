use base64::{engine::general_purpose::STANDARD, Engine};
use jsonwebtoken::{errors::ErrorKind, Algorithm, DecodingKey, Validation};
use serde::{de::DeserializeOwned, Deserialize};
use sha2::{Digest, Sha256};
use std::{collections::HashMap, str::FromStr, time::Duration};
use time::OffsetDateTime;
use tracing::{debug, info, instrument, warn};

use crate::{
    config::VerificationConfig,
    error::{Result, StoreError},
    models::{RawReceipt, ReceiptFormat, ValidatedTransaction},
};

/// Status the endpoint returns for a sandbox receipt sent to production
const STATUS_SANDBOX_RECEIPT: i32 = 21007;

/// Public key plus the algorithm it verifies
#[derive(Clone)]
pub struct TrustAnchor {
    key: DecodingKey,
    algorithm: Algorithm,
}

impl TrustAnchor {
    pub fn new(key: DecodingKey, algorithm: Algorithm) -> Self {
        Self { key, algorithm }
    }

    /// Build from configuration: PEM text, base64 DER, or a shared secret for HMAC algorithms
    pub fn from_encoded(encoded: &str, algorithm: &str) -> Result<Self> {
        let algorithm = Algorithm::from_str(algorithm).map_err(|e| {
            config_error(format!("Unsupported signature algorithm {}: {}", algorithm, e))
        })?;
        let encoded = encoded.trim();
        let is_pem = encoded.starts_with("-----BEGIN");

        let der = || {
            STANDARD
                .decode(encoded)
                .map_err(|e| config_error(format!("Public key is not valid base64: {}", e)))
        };
        let pem_error = |e: jsonwebtoken::errors::Error| config_error(format!("Invalid PEM key: {}", e));

        let key = match algorithm {
            Algorithm::HS256 | Algorithm::HS384 | Algorithm::HS512 => {
                DecodingKey::from_secret(encoded.as_bytes())
            }
            Algorithm::RS256
            | Algorithm::RS384
            | Algorithm::RS512
            | Algorithm::PS256
            | Algorithm::PS384
            | Algorithm::PS512 => {
                if is_pem {
                    DecodingKey::from_rsa_pem(encoded.as_bytes()).map_err(pem_error)?
                } else {
                    DecodingKey::from_rsa_der(&der()?)
                }
            }
            Algorithm::ES256 | Algorithm::ES384 => {
                if is_pem {
                    DecodingKey::from_ec_pem(encoded.as_bytes()).map_err(pem_error)?
                } else {
                    DecodingKey::from_ec_der(&der()?)
                }
            }
            Algorithm::EdDSA => {
                if is_pem {
                    DecodingKey::from_ed_pem(encoded.as_bytes()).map_err(pem_error)?
                } else {
                    DecodingKey::from_ed_der(&der()?)
                }
            }
        };

        Ok(Self { key, algorithm })
    }
}

impl std::fmt::Debug for TrustAnchor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TrustAnchor")
            .field("algorithm", &self.algorithm)
            .finish_non_exhaustive()
    }
}

fn config_error(message: String) -> StoreError {
    StoreError::Config(config::ConfigError::Message(message))
}

pub struct ReceiptValidator {
    config: VerificationConfig,
    http_client: reqwest::Client,
    local_anchor: Option<TrustAnchor>,
    response_anchor: Option<TrustAnchor>,
}

/// Payload of a locally verified signed receipt
#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct SignedReceiptClaims {
    #[serde(default)]
    environment: Option<String>,
    transactions: Vec<serde_json::Value>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct SignedTransactionEntry {
    transaction_id: String,
    #[serde(default)]
    original_transaction_id: Option<String>,
    product_id: String,
    #[serde(default)]
    quantity: Option<u32>,
    /// Milliseconds since epoch
    purchase_date: i64,
    #[serde(default, rename = "type")]
    kind: Option<String>,
}

#[derive(Debug, Deserialize)]
struct VerificationResponse {
    status: i32,
    #[serde(default)]
    environment: Option<String>,
    #[serde(default)]
    receipt: Option<VerifiedReceipt>,
    #[serde(default)]
    latest_receipt_info: Option<Vec<serde_json::Value>>,
    #[serde(default)]
    latest_receipt: Option<String>,
}

#[derive(Debug, Deserialize)]
struct VerifiedReceipt {
    #[serde(default)]
    bundle_id: Option<String>,
    #[serde(default)]
    in_app: Vec<serde_json::Value>,
}

#[derive(Debug, Deserialize)]
struct InAppEntry {
    product_id: String,
    transaction_id: String,
    #[serde(default)]
    original_transaction_id: Option<String>,
    #[serde(default)]
    quantity: Option<NumberField>,
    purchase_date_ms: NumberField,
}

/// The endpoint encodes numbers as strings; accept either
#[derive(Debug, Deserialize)]
#[serde(untagged)]
enum NumberField {
    Number(i64),
    Text(String),
}

impl NumberField {
    fn as_i64(&self) -> std::result::Result<i64, String> {
        match self {
            NumberField::Number(n) => Ok(*n),
            NumberField::Text(s) => s
                .trim()
                .parse()
                .map_err(|e| format!("invalid number {:?}: {}", s, e)),
        }
    }
}

impl SignedTransactionEntry {
    fn into_transaction(self) -> std::result::Result<ValidatedTransaction, String> {
        build_transaction(
            self.transaction_id,
            self.original_transaction_id,
            self.product_id,
            i64::from(self.quantity.unwrap_or(1)),
            self.purchase_date,
            self.kind,
        )
    }
}

impl InAppEntry {
    fn into_transaction(self) -> std::result::Result<ValidatedTransaction, String> {
        let quantity = match &self.quantity {
            Some(q) => q.as_i64()?,
            None => 1,
        };
        build_transaction(
            self.transaction_id,
            self.original_transaction_id,
            self.product_id,
            quantity,
            self.purchase_date_ms.as_i64()?,
            None,
        )
    }
}

fn build_transaction(
    transaction_id: String,
    original_transaction_id: Option<String>,
    product_id: String,
    quantity: i64,
    purchase_date_ms: i64,
    kind: Option<String>,
) -> std::result::Result<ValidatedTransaction, String> {
    if transaction_id.trim().is_empty() {
        return Err("empty transaction id".to_string());
    }
    if product_id.trim().is_empty() {
        return Err(format!("transaction {} has an empty product id", transaction_id));
    }

    let quantity = u32::try_from(quantity)
        .ok()
        .filter(|q| *q > 0)
        .ok_or_else(|| format!("transaction {} has quantity {}", transaction_id, quantity))?;

    let purchase_date =
        OffsetDateTime::from_unix_timestamp_nanos(i128::from(purchase_date_ms) * 1_000_000)
            .map_err(|e| format!("transaction {} purchase date: {}", transaction_id, e))?;

    let original_transaction_id = original_transaction_id
        .filter(|id| !id.trim().is_empty())
        .unwrap_or_else(|| transaction_id.clone());

    Ok(ValidatedTransaction {
        transaction_id,
        product_id,
        kind,
        quantity,
        purchase_date,
        original_transaction_id,
        signature_valid: true,
    })
}

/// Decode each entry on its own; a bad entry is dropped, not fatal
fn decode_entries<T, F>(entries: Vec<serde_json::Value>, convert: F) -> Vec<ValidatedTransaction>
where
    T: DeserializeOwned,
    F: Fn(T) -> std::result::Result<ValidatedTransaction, String>,
{
    entries
        .into_iter()
        .enumerate()
        .filter_map(|(position, entry)| {
            let decoded = serde_json::from_value::<T>(entry)
                .map_err(|e| e.to_string())
                .and_then(&convert);
            match decoded {
                Ok(transaction) => Some(transaction),
                Err(error) => {
                    warn!(position, %error, "Dropping malformed receipt entry");
                    None
                }
            }
        })
        .collect()
}

/// Merge entry lists, later lists overriding earlier ones per transaction id
fn merge_transactions(lists: Vec<Vec<ValidatedTransaction>>) -> Vec<ValidatedTransaction> {
    let mut merged: Vec<ValidatedTransaction> = Vec::new();
    let mut positions: HashMap<String, usize> = HashMap::new();

    for transaction in lists.into_iter().flatten() {
        match positions.get(&transaction.transaction_id) {
            Some(&i) => merged[i] = transaction,
            None => {
                positions.insert(transaction.transaction_id.clone(), merged.len());
                merged.push(transaction);
            }
        }
    }

    merged
}

fn classify_jwt_error(error: jsonwebtoken::errors::Error) -> StoreError {
    match error.kind() {
        ErrorKind::InvalidToken
        | ErrorKind::Base64(_)
        | ErrorKind::Json(_)
        | ErrorKind::Utf8(_) => {
            StoreError::MalformedReceipt(format!("Undecodable signed transaction: {}", error))
        }
        _ => StoreError::Authenticity(format!("Signed transaction rejected: {}", error)),
    }
}

impl ReceiptValidator {
    pub fn new(config: &VerificationConfig) -> Result<Self> {
        let local_anchor = config
            .local_public_key
            .as_deref()
            .map(|key| TrustAnchor::from_encoded(key, &config.local_algorithm))
            .transpose()?;
        let response_anchor = config
            .response_public_key
            .as_deref()
            .map(|key| TrustAnchor::from_encoded(key, &config.response_algorithm))
            .transpose()?;

        Ok(Self {
            config: config.clone(),
            http_client: reqwest::Client::new(),
            local_anchor,
            response_anchor,
        })
    }

    /// Replace the trust anchor for signed transactions
    pub fn with_local_anchor(mut self, anchor: TrustAnchor) -> Self {
        self.local_anchor = Some(anchor);
        self
    }

    /// Replace the key that signs verification endpoint responses
    pub fn with_response_anchor(mut self, anchor: TrustAnchor) -> Self {
        self.response_anchor = Some(anchor);
        self
    }

    /// Authenticate a receipt and decode its transactions
    #[instrument(skip(self, raw), fields(format = ?raw.format))]
    pub async fn validate(&self, raw: &RawReceipt) -> Result<Vec<ValidatedTransaction>> {
        let fingerprint = Self::hash_receipt(&raw.data);

        let transactions = match raw.format {
            ReceiptFormat::SignedTransaction => self.validate_local(raw)?,
            ReceiptFormat::AppReceipt => self.validate_remote(raw).await?,
        };

        info!(
            receipt = %&fingerprint[..12],
            transactions = transactions.len(),
            "Receipt validated"
        );

        Ok(transactions)
    }

    /// Verify a platform-signed receipt against the embedded trust anchor
    fn validate_local(&self, raw: &RawReceipt) -> Result<Vec<ValidatedTransaction>> {
        let anchor = self.local_anchor.as_ref().ok_or_else(|| {
            StoreError::Authenticity("No trust anchor configured for signed transactions".into())
        })?;

        let mut validation = Validation::new(anchor.algorithm);
        validation.required_spec_claims.clear();
        validation.validate_exp = false;
        validation.validate_aud = false;

        let token =
            jsonwebtoken::decode::<SignedReceiptClaims>(raw.data.trim(), &anchor.key, &validation)
                .map_err(classify_jwt_error)?;

        debug!(environment = ?token.claims.environment, "Signed receipt verified locally");

        let transactions = decode_entries(
            token.claims.transactions,
            SignedTransactionEntry::into_transaction,
        );
        Ok(merge_transactions(vec![transactions]))
    }

    /// Verify an app receipt through the remote verification endpoint
    async fn validate_remote(&self, raw: &RawReceipt) -> Result<Vec<ValidatedTransaction>> {
        let endpoint = self.config.endpoint_url.as_deref().ok_or_else(|| {
            StoreError::Config(config::ConfigError::NotFound(
                "verification.endpoint_url".to_string(),
            ))
        })?;

        let mut response = self.post_receipt(endpoint, raw).await?;

        if response.status == STATUS_SANDBOX_RECEIPT {
            if let Some(sandbox) = self.config.sandbox_endpoint_url.as_deref() {
                info!("Sandbox receipt sent to production endpoint, retrying against sandbox");
                response = self.post_receipt(sandbox, raw).await?;
            }
        }

        // Non-zero status is an authentication failure, never a partial success
        if response.status != 0 {
            return Err(StoreError::Authenticity(format!(
                "Invalid receipt status: {}",
                response.status
            )));
        }

        debug!(
            environment = ?response.environment,
            bundle_id = ?response.receipt.as_ref().and_then(|r| r.bundle_id.as_deref()),
            has_latest_receipt = response.latest_receipt.is_some(),
            "Verification endpoint accepted receipt"
        );

        let in_app = response.receipt.map(|r| r.in_app).unwrap_or_default();
        let latest = response.latest_receipt_info.unwrap_or_default();

        Ok(merge_transactions(vec![
            decode_entries(in_app, InAppEntry::into_transaction),
            decode_entries(latest, InAppEntry::into_transaction),
        ]))
    }

    async fn post_receipt(&self, endpoint: &str, raw: &RawReceipt) -> Result<VerificationResponse> {
        let mut request_body = serde_json::json!({
            "receipt-data": raw.data,
            "exclude-old-transactions": false,
        });
        if let Some(secret) = &self.config.shared_secret {
            request_body["password"] = serde_json::json!(secret);
        }

        let timeout = Duration::from_millis(self.config.request_timeout_ms);
        let header = self.config.response_signature_header.as_str();

        let exchange = async {
            let response = self
                .http_client
                .post(endpoint)
                .json(&request_body)
                .send()
                .await
                .map_err(|e| StoreError::Network(format!("Failed to verify receipt: {}", e)))?;

            let status = response.status();
            let signature = response
                .headers()
                .get(header)
                .and_then(|value| value.to_str().ok())
                .map(str::to_string);
            let body = response
                .bytes()
                .await
                .map_err(|e| StoreError::Network(format!("Failed to read response: {}", e)))?;

            Ok::<_, StoreError>((status, signature, body))
        };

        let (status, signature, body) = tokio::time::timeout(timeout, exchange)
            .await
            .map_err(|_| {
                StoreError::Network(format!(
                    "Verification timed out after {}ms",
                    self.config.request_timeout_ms
                ))
            })??;

        if status.is_server_error() || status == reqwest::StatusCode::TOO_MANY_REQUESTS {
            return Err(StoreError::Network(format!(
                "Verification endpoint unavailable: HTTP {}",
                status
            )));
        }
        if !status.is_success() {
            return Err(StoreError::Authenticity(format!(
                "Verification endpoint refused receipt: HTTP {}",
                status
            )));
        }

        self.verify_response_signature(signature.as_deref(), &body)?;

        serde_json::from_slice(&body)
            .map_err(|e| StoreError::MalformedReceipt(format!("Invalid response format: {}", e)))
    }

    fn verify_response_signature(&self, signature: Option<&str>, body: &[u8]) -> Result<()> {
        let Some(anchor) = self.response_anchor.as_ref() else {
            return Ok(());
        };

        let signature = signature.ok_or_else(|| {
            StoreError::Authenticity("Verification response is not signed".to_string())
        })?;

        match jsonwebtoken::crypto::verify(signature, body, &anchor.key, anchor.algorithm) {
            Ok(true) => Ok(()),
            Ok(false) => Err(StoreError::Authenticity(
                "Verification response signature mismatch".to_string(),
            )),
            Err(e) => Err(StoreError::Authenticity(format!(
                "Verification response signature unreadable: {}",
                e
            ))),
        }
    }

    /// Generate hash for receipt correlation in logs
    pub fn hash_receipt(receipt: &str) -> String {
        let mut hasher = Sha256::new();
        hasher.update(receipt.as_bytes());
        format!("{:x}", hasher.finalize())
    }
}
