//! A scriptable in-memory [`ProviderApi`] for tests.
//!
//! Records every call and lets tests script verify statuses and transfer /
//! refund outcomes. State lives behind plain [`std::sync::Mutex`]es; no lock
//! is held across an await point.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Mutex;

use async_trait::async_trait;

use crate::error::ProviderError;
use crate::types::*;
use crate::ProviderApi;

/// A record of one outbound call.
#[derive(Clone, Debug)]
pub enum ProviderCall {
    InitializePayment { reference: String, amount: i64 },
    VerifyPayment { reference: String },
    CreateMobileMoneyRecipient { phone_number: String },
    CreateBankRecipient { account_number: String },
    ListBanks,
    ResolveAccount { account_number: String },
    InitiateTransfer { reference: String, amount: i64, recipient_code: String },
    RefundTransaction { payment_reference: String, amount: Option<i64> },
    DeleteRecipient { recipient_code: String },
}

pub struct MockProvider {
    calls: Mutex<Vec<ProviderCall>>,
    verify_status: Mutex<PaymentStatus>,
    /// Scripted failure for the next transfer(s); `None` means success.
    transfer_error: Mutex<Option<ProviderError>>,
    refund_error: Mutex<Option<ProviderError>>,
    recipient_seq: AtomicU64,
    transfer_seq: AtomicU64,
}

impl Default for MockProvider {
    fn default() -> Self {
        Self::new()
    }
}

impl MockProvider {
    pub fn new() -> Self {
        Self {
            calls: Mutex::new(Vec::new()),
            verify_status: Mutex::new(PaymentStatus::Success),
            transfer_error: Mutex::new(None),
            refund_error: Mutex::new(None),
            recipient_seq: AtomicU64::new(0),
            transfer_seq: AtomicU64::new(0),
        }
    }

    // --- Scripting --- //

    /// Make subsequent `verify_payment` calls report this status.
    pub fn set_verify_status(&self, status: PaymentStatus) {
        *self.verify_status.lock().unwrap() = status;
    }

    /// Make subsequent transfers fail with this error until cleared.
    pub fn fail_transfers(&self, err: ProviderError) {
        *self.transfer_error.lock().unwrap() = Some(err);
    }

    pub fn clear_transfer_failure(&self) {
        *self.transfer_error.lock().unwrap() = None;
    }

    pub fn fail_refunds(&self, err: ProviderError) {
        *self.refund_error.lock().unwrap() = Some(err);
    }

    // --- Inspection --- //

    pub fn calls(&self) -> Vec<ProviderCall> {
        self.calls.lock().unwrap().clone()
    }

    pub fn transfer_count(&self) -> usize {
        self.count(|c| matches!(c, ProviderCall::InitiateTransfer { .. }))
    }

    pub fn refund_count(&self) -> usize {
        self.count(|c| matches!(c, ProviderCall::RefundTransaction { .. }))
    }

    /// Transfers initiated, in call order.
    pub fn transfers(&self) -> Vec<(String, i64, String)> {
        self.calls
            .lock()
            .unwrap()
            .iter()
            .filter_map(|c| match c {
                ProviderCall::InitiateTransfer {
                    reference,
                    amount,
                    recipient_code,
                } => Some((reference.clone(), *amount, recipient_code.clone())),
                _ => None,
            })
            .collect()
    }

    /// Refunds requested, in call order.
    pub fn refunds(&self) -> Vec<(String, Option<i64>)> {
        self.calls
            .lock()
            .unwrap()
            .iter()
            .filter_map(|c| match c {
                ProviderCall::RefundTransaction {
                    payment_reference,
                    amount,
                } => Some((payment_reference.clone(), *amount)),
                _ => None,
            })
            .collect()
    }

    fn count(&self, pred: impl Fn(&ProviderCall) -> bool) -> usize {
        self.calls.lock().unwrap().iter().filter(|c| pred(c)).count()
    }

    fn record(&self, call: ProviderCall) {
        self.calls.lock().unwrap().push(call);
    }
}

#[async_trait]
impl ProviderApi for MockProvider {
    async fn initialize_payment(
        &self,
        req: InitializePayment,
    ) -> Result<PaymentSession, ProviderError> {
        self.record(ProviderCall::InitializePayment {
            reference: req.reference.clone(),
            amount: req.amount.minor(),
        });
        Ok(PaymentSession {
            authorization_url: format!(
                "https://checkout.example.com/{}",
                req.reference
            ),
            access_code: format!("AC_{}", req.reference),
            reference: req.reference,
        })
    }

    async fn verify_payment(
        &self,
        reference: &str,
    ) -> Result<PaymentVerification, ProviderError> {
        self.record(ProviderCall::VerifyPayment {
            reference: reference.to_owned(),
        });
        let status = *self.verify_status.lock().unwrap();
        Ok(PaymentVerification {
            status,
            id: Some("1234567890".to_owned()),
            amount: None,
        })
    }

    async fn create_mobile_money_recipient(
        &self,
        req: NewMobileMoneyRecipient,
    ) -> Result<Recipient, ProviderError> {
        self.record(ProviderCall::CreateMobileMoneyRecipient {
            phone_number: req.phone_number,
        });
        let n = self.recipient_seq.fetch_add(1, Ordering::Relaxed);
        Ok(Recipient {
            recipient_code: format!("RCP_mm{n}"),
        })
    }

    async fn create_bank_recipient(
        &self,
        req: NewBankRecipient,
    ) -> Result<Recipient, ProviderError> {
        self.record(ProviderCall::CreateBankRecipient {
            account_number: req.account_number,
        });
        let n = self.recipient_seq.fetch_add(1, Ordering::Relaxed);
        Ok(Recipient {
            recipient_code: format!("RCP_bank{n}"),
        })
    }

    async fn list_banks(&self) -> Result<Vec<Bank>, ProviderError> {
        self.record(ProviderCall::ListBanks);
        Ok(vec![
            Bank {
                code: "01".to_owned(),
                name: "Equity Bank".to_owned(),
            },
            Bank {
                code: "02".to_owned(),
                name: "KCB Bank".to_owned(),
            },
        ])
    }

    async fn resolve_account(
        &self,
        req: ResolveAccount,
    ) -> Result<ResolvedAccount, ProviderError> {
        self.record(ProviderCall::ResolveAccount {
            account_number: req.account_number,
        });
        Ok(ResolvedAccount {
            account_name: "WANJIKU MWANGI".to_owned(),
        })
    }

    async fn initiate_transfer(
        &self,
        req: InitiateTransfer,
    ) -> Result<TransferReceipt, ProviderError> {
        self.record(ProviderCall::InitiateTransfer {
            reference: req.reference,
            amount: req.amount.minor(),
            recipient_code: req.recipient_code,
        });
        if let Some(err) = self.transfer_error.lock().unwrap().clone() {
            return Err(err);
        }
        let n = self.transfer_seq.fetch_add(1, Ordering::Relaxed);
        Ok(TransferReceipt {
            transfer_code: format!("TRF_code{n}"),
            status: TransferStatus::Pending,
        })
    }

    async fn refund_transaction(
        &self,
        req: RefundTransaction,
    ) -> Result<RefundReceipt, ProviderError> {
        self.record(ProviderCall::RefundTransaction {
            payment_reference: req.payment_reference,
            amount: req.amount.map(|a| a.minor()),
        });
        if let Some(err) = self.refund_error.lock().unwrap().clone() {
            return Err(err);
        }
        Ok(RefundReceipt {
            status: "pending".to_owned(),
        })
    }

    async fn delete_recipient(
        &self,
        recipient_code: &str,
    ) -> Result<(), ProviderError> {
        self.record(ProviderCall::DeleteRecipient {
            recipient_code: recipient_code.to_owned(),
        });
        Ok(())
    }
}
