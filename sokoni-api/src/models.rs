//! Request and response models, one set per endpoint group.

use serde::{Deserialize, Serialize};
use sokoni_common::ids::UserId;
use sokoni_common::money::Amount;

use crate::types::{DisputeResolution, EscrowStatus, PayoutMethod};

// --- Escrow lifecycle requests --- //

/// Body of `POST /escrow/from-campaign/{id}` and
/// `POST /escrow/from-service-request/{id}`.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct CreateWithSeller {
    pub seller_id: UserId,
}

/// Body of `POST /escrow/{id}/deliver`.
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct DeliverRequest {
    #[serde(default)]
    pub delivery_note: Option<String>,
}

/// Body of `POST /escrow/{id}/dispute`.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct DisputeRequest {
    pub reason: String,
}

/// Body of `POST /escrow/{id}/cancel`.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct CancelRequest {
    pub reason: String,
}

/// Body of `POST /admin/escrow/{id}/resolve`.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct ResolveDisputeRequest {
    pub resolution: DisputeResolution,
    /// Required iff `resolution` is `PARTIAL_SPLIT`; percent of the total
    /// awarded to the seller, within [0, 100].
    #[serde(default)]
    pub split_percent: Option<i32>,
}

// --- Escrow queries --- //

/// Which side of an escrow the caller is asking about.
#[derive(Copy, Clone, Debug, Eq, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PartyRole {
    Buyer,
    Seller,
}

/// Query string of `GET /escrow` and `GET /admin/escrow`.
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct ListEscrowsQuery {
    #[serde(default)]
    pub status: Option<EscrowStatus>,
    #[serde(default)]
    pub role: Option<PartyRole>,
    #[serde(default)]
    pub page: Option<u32>,
    #[serde(default)]
    pub limit: Option<u32>,
}

/// A page of results plus enough to iterate.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct Paginated<T> {
    pub items: Vec<T>,
    pub page: u32,
    pub limit: u32,
    pub total: u64,
}

/// Dashboard numbers for `GET /escrow/stats` and `GET /admin/escrow/stats`.
#[derive(Clone, Debug, Default, Eq, PartialEq, Serialize, Deserialize)]
pub struct EscrowStats {
    pub total: u64,
    pub pending: u64,
    pub funded: u64,
    pub in_progress: u64,
    pub delivered: u64,
    pub released: u64,
    pub disputed: u64,
    pub refunded: u64,
    pub cancelled: u64,
    /// Sum of `total_amount` over all escrows in scope.
    pub total_amount: Amount,
    /// Sum of `total_amount` over released escrows.
    pub released_amount: Amount,
    /// Sum over escrows currently holding funds
    /// (FUNDED, IN_PROGRESS, DELIVERED, DISPUTED).
    pub in_escrow_amount: Amount,
}

// --- Payout accounts --- //

/// Body of `POST /seller/payout-account`.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct SetupPayoutAccountRequest {
    pub payout_method: PayoutMethod,
    /// Required for `MOBILE_MONEY`.
    #[serde(default)]
    pub mobile_money_number: Option<String>,
    /// Required for `BANK`.
    #[serde(default)]
    pub bank_account_number: Option<String>,
    /// Required for `BANK`.
    #[serde(default)]
    pub bank_code: Option<String>,
}

/// Body of `POST /seller/verify-account`.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct VerifyBankAccountRequest {
    pub account_number: String,
    pub bank_code: String,
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn list_query_tolerates_missing_fields() {
        let q: ListEscrowsQuery = serde_json::from_str("{}").unwrap();
        assert!(q.status.is_none());
        assert!(q.role.is_none());

        let q: ListEscrowsQuery = serde_json::from_str(
            r#"{"status": "DELIVERED", "role": "seller", "page": 2}"#,
        )
        .unwrap();
        assert_eq!(q.status, Some(EscrowStatus::Delivered));
        assert_eq!(q.role, Some(PartyRole::Seller));
        assert_eq!(q.page, Some(2));
    }

    #[test]
    fn resolve_request_wire_shape() {
        let req: ResolveDisputeRequest = serde_json::from_str(
            r#"{"resolution": "PARTIAL_SPLIT", "split_percent": 40}"#,
        )
        .unwrap();
        assert_eq!(req.resolution, DisputeResolution::PartialSplit);
        assert_eq!(req.split_percent, Some(40));
    }
}
