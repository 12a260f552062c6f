//! Wire types of the adapter contract.

use serde::{Deserialize, Serialize};
use sokoni_common::money::Amount;

// --- Payments --- //

#[derive(Clone, Debug, Serialize)]
pub struct InitializePayment {
    /// Buyer's email; the provider keys checkout sessions on it.
    pub email: String,
    pub amount: Amount,
    /// Engine-generated `PAY-` reference.
    pub reference: String,
    pub metadata: Option<serde_json::Value>,
}

/// A hosted checkout session.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct PaymentSession {
    pub authorization_url: String,
    pub access_code: String,
    pub reference: String,
}

#[derive(Copy, Clone, Debug, Eq, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PaymentStatus {
    Success,
    Pending,
    Failed,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct PaymentVerification {
    pub status: PaymentStatus,
    /// Provider-side transaction id.
    pub id: Option<String>,
    pub amount: Option<Amount>,
}

// --- Recipients --- //

#[derive(Clone, Debug, Serialize)]
pub struct NewMobileMoneyRecipient {
    pub name: String,
    pub phone_number: String,
}

#[derive(Clone, Debug, Serialize)]
pub struct NewBankRecipient {
    pub name: String,
    pub account_number: String,
    pub bank_code: String,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct Recipient {
    pub recipient_code: String,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct Bank {
    pub code: String,
    pub name: String,
}

#[derive(Clone, Debug, Serialize)]
pub struct ResolveAccount {
    pub account_number: String,
    pub bank_code: String,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct ResolvedAccount {
    pub account_name: String,
}

// --- Transfers & refunds --- //

#[derive(Clone, Debug, Serialize)]
pub struct InitiateTransfer {
    pub amount: Amount,
    pub recipient_code: String,
    /// Engine-generated `TRF-` / `MTRF-` reference; the provider treats a
    /// repeated reference as the same transfer.
    pub reference: String,
    pub reason: String,
}

#[derive(Copy, Clone, Debug, Eq, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TransferStatus {
    Pending,
    Success,
    Failed,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct TransferReceipt {
    pub transfer_code: String,
    pub status: TransferStatus,
}

#[derive(Clone, Debug, Serialize)]
pub struct RefundTransaction {
    /// The `PAY-` reference of the original payment.
    pub payment_reference: String,
    /// Partial refund amount; full refund when absent.
    pub amount: Option<Amount>,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct RefundReceipt {
    pub status: String,
}
