//! Payment-provider adapter.
//!
//! The engine never talks HTTP to the provider directly; it goes through the
//! [`ProviderApi`] trait so implementations are swappable (live HTTP client,
//! mock in tests). Implementations must be `Send + Sync` and stateless
//! enough to share behind an [`std::sync::Arc`] across request handlers and
//! the scheduler.
//!
//! Idempotency contract: `verify_payment` is always safe to repeat, and
//! `initiate_transfer` never re-initiates for a reference it has already
//! seen; the engine relies on both when retrying after partial failures.

use async_trait::async_trait;

pub use crate::error::{ProviderError, ProviderErrorKind};
pub use crate::types::*;

/// Provider error types.
pub mod error;
/// A scriptable in-memory provider for tests.
pub mod mock;
/// The live Paystack-style HTTP implementation.
pub mod paystack;
/// Wire types of the adapter contract.
pub mod types;

/// The outbound contract with the payment provider. Amounts are integer
/// minor units everywhere.
#[async_trait]
pub trait ProviderApi: Send + Sync {
    /// Create a hosted checkout session for an inbound payment.
    async fn initialize_payment(
        &self,
        req: InitializePayment,
    ) -> Result<PaymentSession, ProviderError>;

    /// Look up the terminal status of a payment. Safe to call repeatedly.
    async fn verify_payment(
        &self,
        reference: &str,
    ) -> Result<PaymentVerification, ProviderError>;

    /// Register a mobile-money payout destination.
    async fn create_mobile_money_recipient(
        &self,
        req: NewMobileMoneyRecipient,
    ) -> Result<Recipient, ProviderError>;

    /// Register a bank-account payout destination.
    async fn create_bank_recipient(
        &self,
        req: NewBankRecipient,
    ) -> Result<Recipient, ProviderError>;

    /// Banks supported for payouts in the configured currency.
    async fn list_banks(&self) -> Result<Vec<Bank>, ProviderError>;

    /// Resolve an account number to the registered account name.
    async fn resolve_account(
        &self,
        req: ResolveAccount,
    ) -> Result<ResolvedAccount, ProviderError>;

    /// Send funds from the platform balance to a recipient. Never
    /// re-initiates for a duplicate reference.
    async fn initiate_transfer(
        &self,
        req: InitiateTransfer,
    ) -> Result<TransferReceipt, ProviderError>;

    /// Refund an inbound payment, in full or (when `amount` is set) in part.
    async fn refund_transaction(
        &self,
        req: RefundTransaction,
    ) -> Result<RefundReceipt, ProviderError>;

    /// Remove a payout destination. Best-effort on the caller's side.
    async fn delete_recipient(
        &self,
        recipient_code: &str,
    ) -> Result<(), ProviderError>;
}
