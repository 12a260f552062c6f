//! Live HTTP implementation of [`ProviderApi`] against a Paystack-style API.
//!
//! All responses share the `{status, message, data}` envelope. Failures are
//! classified as retryable (timeouts, connection errors, 429, 5xx) or
//! permanent (everything the provider understood and rejected); only
//! idempotent GETs are retried here, with exponential backoff.

use std::cmp::min;
use std::time::Duration;

use async_trait::async_trait;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use tokio::time;
use tracing::{debug, warn};

use crate::error::ProviderError;
use crate::types::*;
use crate::ProviderApi;

/// Bounded deadline for any single provider round-trip.
const DEFAULT_REQUEST_TIMEOUT: Duration = Duration::from_secs(30);

/// Retries for idempotent GETs.
const GET_RETRIES: usize = 2;

// Exponential backoff
const INITIAL_WAIT_MS: u64 = 250;
const MAXIMUM_WAIT_MS: u64 = 8_000;
const EXP_BASE: u64 = 2;

const DEFAULT_BASE_URL: &str = "https://api.paystack.co";

pub struct PaystackClient {
    client: reqwest::Client,
    base_url: String,
    secret_key: String,
    currency: String,
}

/// The response envelope wrapping every endpoint's payload.
#[derive(Deserialize)]
struct Envelope<T> {
    status: bool,
    message: Option<String>,
    data: Option<T>,
}

impl PaystackClient {
    pub fn new(secret_key: String, currency: String) -> Self {
        Self::with_config(
            secret_key,
            currency,
            DEFAULT_BASE_URL.to_owned(),
            DEFAULT_REQUEST_TIMEOUT,
        )
    }

    /// Full configuration; used by tests to point at a local stub.
    pub fn with_config(
        secret_key: String,
        currency: String,
        base_url: String,
        timeout: Duration,
    ) -> Self {
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .expect("Failed to build reqwest Client");
        Self {
            client,
            base_url,
            secret_key,
            currency,
        }
    }

    /// GET with retries; only used for idempotent endpoints.
    async fn get<T: DeserializeOwned>(
        &self,
        path: &str,
    ) -> Result<T, ProviderError> {
        let mut backoff = (0..)
            .map(|i| INITIAL_WAIT_MS * EXP_BASE.pow(i))
            .map(|wait| min(wait, MAXIMUM_WAIT_MS))
            .map(Duration::from_millis);

        for _ in 0..GET_RETRIES {
            match self.send(reqwest::Method::GET, path, None::<&()>).await {
                Ok(data) => return Ok(data),
                Err(e) if e.is_retryable() => {
                    warn!("GET {path} failed, retrying: {e}");
                    time::sleep(backoff.next().unwrap()).await;
                }
                Err(e) => return Err(e),
            }
        }
        self.send(reqwest::Method::GET, path, None::<&()>).await
    }

    async fn post<B: Serialize, T: DeserializeOwned>(
        &self,
        path: &str,
        body: &B,
    ) -> Result<T, ProviderError> {
        self.send(reqwest::Method::POST, path, Some(body)).await
    }

    async fn send<B: Serialize, T: DeserializeOwned>(
        &self,
        method: reqwest::Method,
        path: &str,
        body: Option<&B>,
    ) -> Result<T, ProviderError> {
        let url = format!("{}{}", self.base_url, path);
        debug!(%method, %url, "sending provider request");

        let mut builder = self
            .client
            .request(method, &url)
            .bearer_auth(&self.secret_key);
        if let Some(body) = body {
            builder = builder.json(body);
        }

        let response = builder.send().await.map_err(classify_send_error)?;
        let http_status = response.status();

        if !http_status.is_success() {
            let msg = response
                .text()
                .await
                .unwrap_or_else(|_| "<unreadable body>".to_owned());
            let err = if http_status.is_server_error()
                || http_status == reqwest::StatusCode::TOO_MANY_REQUESTS
            {
                ProviderError::retryable(msg)
            } else {
                ProviderError::permanent(msg)
            };
            return Err(err.with_status(http_status.as_u16()));
        }

        let envelope = response
            .json::<Envelope<T>>()
            .await
            .map_err(|e| ProviderError::permanent(format!("bad body: {e}")))?;

        if !envelope.status {
            let msg = envelope
                .message
                .unwrap_or_else(|| "provider rejected request".to_owned());
            return Err(ProviderError::permanent(msg)
                .with_status(http_status.as_u16()));
        }
        envelope.data.ok_or_else(|| {
            ProviderError::permanent("provider response missing data")
        })
    }

    /// Like [`send`](Self::send) for endpoints whose envelope carries no
    /// payload worth decoding.
    async fn send_no_data(
        &self,
        method: reqwest::Method,
        path: &str,
    ) -> Result<(), ProviderError> {
        let url = format!("{}{}", self.base_url, path);
        debug!(%method, %url, "sending provider request");

        let response = self
            .client
            .request(method, &url)
            .bearer_auth(&self.secret_key)
            .send()
            .await
            .map_err(classify_send_error)?;
        let http_status = response.status();

        if !http_status.is_success() {
            let msg = response
                .text()
                .await
                .unwrap_or_else(|_| "<unreadable body>".to_owned());
            let err = if http_status.is_server_error() {
                ProviderError::retryable(msg)
            } else {
                ProviderError::permanent(msg)
            };
            return Err(err.with_status(http_status.as_u16()));
        }

        let envelope = response
            .json::<Envelope<serde_json::Value>>()
            .await
            .map_err(|e| ProviderError::permanent(format!("bad body: {e}")))?;
        if !envelope.status {
            let msg = envelope
                .message
                .unwrap_or_else(|| "provider rejected request".to_owned());
            return Err(ProviderError::permanent(msg)
                .with_status(http_status.as_u16()));
        }
        Ok(())
    }
}

fn classify_send_error(e: reqwest::Error) -> ProviderError {
    if e.is_timeout() || e.is_connect() {
        ProviderError::retryable(e.to_string())
    } else {
        ProviderError::permanent(e.to_string())
    }
}

// --- Endpoint payloads --- //

#[derive(Serialize)]
struct InitBody<'a> {
    email: &'a str,
    amount: i64,
    reference: &'a str,
    #[serde(skip_serializing_if = "Option::is_none")]
    metadata: Option<&'a serde_json::Value>,
}

#[derive(Deserialize)]
struct VerifyData {
    id: Option<u64>,
    status: String,
    amount: Option<i64>,
}

#[derive(Serialize)]
struct RecipientBody<'a> {
    #[serde(rename = "type")]
    kind: &'a str,
    name: &'a str,
    account_number: &'a str,
    #[serde(skip_serializing_if = "Option::is_none")]
    bank_code: Option<&'a str>,
    currency: &'a str,
}

#[derive(Deserialize)]
struct ResolveData {
    account_name: String,
}

#[derive(Serialize)]
struct TransferBody<'a> {
    source: &'a str,
    amount: i64,
    recipient: &'a str,
    reference: &'a str,
    reason: &'a str,
}

#[derive(Deserialize)]
struct TransferData {
    transfer_code: String,
    status: String,
}

#[derive(Serialize)]
struct RefundBody<'a> {
    transaction: &'a str,
    #[serde(skip_serializing_if = "Option::is_none")]
    amount: Option<i64>,
}

#[derive(Deserialize)]
struct RefundData {
    status: String,
}

#[async_trait]
impl ProviderApi for PaystackClient {
    async fn initialize_payment(
        &self,
        req: InitializePayment,
    ) -> Result<PaymentSession, ProviderError> {
        let body = InitBody {
            email: &req.email,
            amount: req.amount.minor(),
            reference: &req.reference,
            metadata: req.metadata.as_ref(),
        };
        self.post("/transaction/initialize", &body).await
    }

    async fn verify_payment(
        &self,
        reference: &str,
    ) -> Result<PaymentVerification, ProviderError> {
        let data: VerifyData =
            self.get(&format!("/transaction/verify/{reference}")).await?;
        let status = match data.status.as_str() {
            "success" => PaymentStatus::Success,
            "failed" | "reversed" | "abandoned" => PaymentStatus::Failed,
            _ => PaymentStatus::Pending,
        };
        let amount = match data.amount {
            Some(minor) => Some(
                sokoni_common::money::Amount::from_minor(minor).map_err(
                    |_| ProviderError::permanent("negative verify amount"),
                )?,
            ),
            None => None,
        };
        Ok(PaymentVerification {
            status,
            id: data.id.map(|id| id.to_string()),
            amount,
        })
    }

    async fn create_mobile_money_recipient(
        &self,
        req: NewMobileMoneyRecipient,
    ) -> Result<Recipient, ProviderError> {
        let body = RecipientBody {
            kind: "mobile_money",
            name: &req.name,
            account_number: &req.phone_number,
            bank_code: None,
            currency: &self.currency,
        };
        self.post("/transferrecipient", &body).await
    }

    async fn create_bank_recipient(
        &self,
        req: NewBankRecipient,
    ) -> Result<Recipient, ProviderError> {
        let body = RecipientBody {
            kind: "nuban",
            name: &req.name,
            account_number: &req.account_number,
            bank_code: Some(&req.bank_code),
            currency: &self.currency,
        };
        self.post("/transferrecipient", &body).await
    }

    async fn list_banks(&self) -> Result<Vec<Bank>, ProviderError> {
        self.get(&format!("/bank?currency={}", self.currency)).await
    }

    async fn resolve_account(
        &self,
        req: ResolveAccount,
    ) -> Result<ResolvedAccount, ProviderError> {
        let data: ResolveData = self
            .get(&format!(
                "/bank/resolve?account_number={}&bank_code={}",
                req.account_number, req.bank_code
            ))
            .await?;
        Ok(ResolvedAccount {
            account_name: data.account_name,
        })
    }

    async fn initiate_transfer(
        &self,
        req: InitiateTransfer,
    ) -> Result<TransferReceipt, ProviderError> {
        let body = TransferBody {
            source: "balance",
            amount: req.amount.minor(),
            recipient: &req.recipient_code,
            reference: &req.reference,
            reason: &req.reason,
        };
        let data: TransferData = self.post("/transfer", &body).await?;
        let status = match data.status.as_str() {
            "success" => TransferStatus::Success,
            "failed" | "reversed" => TransferStatus::Failed,
            // "pending", "queued", "otp", ...
            _ => TransferStatus::Pending,
        };
        Ok(TransferReceipt {
            transfer_code: data.transfer_code,
            status,
        })
    }

    async fn refund_transaction(
        &self,
        req: RefundTransaction,
    ) -> Result<RefundReceipt, ProviderError> {
        let body = RefundBody {
            transaction: &req.payment_reference,
            amount: req.amount.map(|a| a.minor()),
        };
        let data: RefundData = self.post("/refund", &body).await?;
        Ok(RefundReceipt {
            status: data.status,
        })
    }

    async fn delete_recipient(
        &self,
        recipient_code: &str,
    ) -> Result<(), ProviderError> {
        self.send_no_data(
            reqwest::Method::DELETE,
            &format!("/transferrecipient/{recipient_code}"),
        )
        .await
    }
}
