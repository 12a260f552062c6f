//! Seller payout account lifecycle.
//!
//! Creators register where their money goes (mobile money or a bank
//! account); the provider issues a recipient code per destination. At most
//! one account is active per user; setup deactivates any previous account
//! but keeps its row for the audit trail. Escrow releases snapshot the
//! recipient code, so later changes never retroactively affect a release.

use std::sync::Arc;

use sokoni_api::types::{
    AccountType, Actor, PayoutMethod, SellerPayoutAccount,
};
use sokoni_provider::{
    Bank, NewBankRecipient, NewMobileMoneyRecipient, ProviderApi,
    ResolveAccount, ResolvedAccount,
};
use sokoni_api::models::SetupPayoutAccountRequest;
use tracing::{info, instrument, warn};

use crate::error::{EngineError, EngineResult};
use crate::models::NewPayoutAccount;
use crate::store::{Directory, EscrowStore};

pub struct PayoutManager {
    store: Arc<dyn EscrowStore>,
    directory: Arc<dyn Directory>,
    provider: Arc<dyn ProviderApi>,
}

impl PayoutManager {
    pub fn new(
        store: Arc<dyn EscrowStore>,
        directory: Arc<dyn Directory>,
        provider: Arc<dyn ProviderApi>,
    ) -> Self {
        Self {
            store,
            directory,
            provider,
        }
    }

    /// Register (or replace) the caller's payout destination.
    #[instrument(skip_all, name = "(payout-setup)")]
    pub async fn setup(
        &self,
        actor: &Actor,
        req: SetupPayoutAccountRequest,
    ) -> EngineResult<SellerPayoutAccount> {
        let user = self
            .directory
            .user(actor.user_id)
            .await?
            .ok_or(EngineError::NotFound("user"))?;
        if user.account_type != AccountType::Creator {
            return Err(EngineError::Unauthorized(
                "only creator accounts can receive payouts".to_owned(),
            ));
        }

        // Register the destination with the provider first; nothing is
        // deactivated if this fails.
        let new = match req.payout_method {
            PayoutMethod::MobileMoney => {
                let phone_number = required_field(
                    req.mobile_money_number,
                    "mobile_money_number",
                )?;
                let recipient = self
                    .provider
                    .create_mobile_money_recipient(NewMobileMoneyRecipient {
                        name: user.name.clone(),
                        phone_number: phone_number.clone(),
                    })
                    .await?;
                NewPayoutAccount {
                    user_id: user.id,
                    payout_method: PayoutMethod::MobileMoney,
                    mobile_money_number: Some(phone_number),
                    bank_account_number: None,
                    bank_code: None,
                    bank_account_name: None,
                    provider_recipient_code: recipient.recipient_code,
                }
            }
            PayoutMethod::Bank => {
                let account_number = required_field(
                    req.bank_account_number,
                    "bank_account_number",
                )?;
                let bank_code = required_field(req.bank_code, "bank_code")?;
                // Resolve the registered holder name before creating the
                // recipient, so mistyped accounts fail here.
                let resolved = self
                    .provider
                    .resolve_account(ResolveAccount {
                        account_number: account_number.clone(),
                        bank_code: bank_code.clone(),
                    })
                    .await?;
                let recipient = self
                    .provider
                    .create_bank_recipient(NewBankRecipient {
                        name: user.name.clone(),
                        account_number: account_number.clone(),
                        bank_code: bank_code.clone(),
                    })
                    .await?;
                NewPayoutAccount {
                    user_id: user.id,
                    payout_method: PayoutMethod::Bank,
                    mobile_money_number: None,
                    bank_account_number: Some(account_number),
                    bank_code: Some(bank_code),
                    bank_account_name: Some(resolved.account_name),
                    provider_recipient_code: recipient.recipient_code,
                }
            }
        };

        let replaced =
            self.store.deactivate_payout_accounts(user.id).await?;
        if !replaced.is_empty() {
            info!(user_id = %user.id, "replaced existing payout account");
        }
        let account = self.store.insert_payout_account(new).await?;
        Ok(account)
    }

    /// The caller's active payout account.
    pub async fn get(
        &self,
        actor: &Actor,
    ) -> EngineResult<SellerPayoutAccount> {
        self.store
            .active_payout_account(actor.user_id)
            .await?
            .ok_or(EngineError::NotFound("payout account"))
    }

    /// Deactivate the caller's payout account. The provider-side recipient
    /// delete is best-effort; a failure there never blocks the removal.
    #[instrument(skip_all, name = "(payout-remove)")]
    pub async fn remove(&self, actor: &Actor) -> EngineResult<()> {
        let removed =
            self.store.deactivate_payout_accounts(actor.user_id).await?;
        if removed.is_empty() {
            return Err(EngineError::NotFound("payout account"));
        }
        for account in &removed {
            if let Err(e) = self
                .provider
                .delete_recipient(&account.provider_recipient_code)
                .await
            {
                warn!(
                    user_id = %actor.user_id,
                    "provider recipient delete failed: {e}"
                );
            }
        }
        Ok(())
    }

    /// Banks available for payouts.
    pub async fn list_banks(&self) -> EngineResult<Vec<Bank>> {
        Ok(self.provider.list_banks().await?)
    }

    /// Resolve a bank account to its registered holder name.
    pub async fn verify_account(
        &self,
        account_number: String,
        bank_code: String,
    ) -> EngineResult<ResolvedAccount> {
        if account_number.trim().is_empty() || bank_code.trim().is_empty() {
            return Err(EngineError::Validation(
                "account_number and bank_code are required".to_owned(),
            ));
        }
        Ok(self
            .provider
            .resolve_account(ResolveAccount {
                account_number,
                bank_code,
            })
            .await?)
    }
}

fn required_field(
    value: Option<String>,
    name: &str,
) -> EngineResult<String> {
    match value {
        Some(v) if !v.trim().is_empty() => Ok(v),
        _ => Err(EngineError::Validation(format!("{name} is required"))),
    }
}
