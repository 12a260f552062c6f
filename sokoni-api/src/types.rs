//! Entity views and shared domain enums.
//!
//! These are the "simple" serializable types shared by the engine, the HTTP
//! surface, and tests. Store-internal shapes (inserts, updates, filters)
//! live in `sokoni-engine`.

use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::ser::SerializeStruct;
use serde::{Deserialize, Serialize, Serializer};
use sokoni_common::ids::{
    EscrowId, EventId, MilestoneId, NotificationId, PayoutAccountId, SourceId,
    UserId, WebhookLogId,
};
use sokoni_common::money::{Amount, Currency};

/// Error returned when parsing one of the status enums from its column text.
#[derive(Debug, thiserror::Error)]
#[error("unrecognized {what}: {text}")]
pub struct ParseEnumError {
    what: &'static str,
    text: String,
}

macro_rules! impl_enum_text {
    ($ty:ident, $what:literal, { $($variant:ident => $text:literal),* $(,)? }) => {
        impl $ty {
            pub fn as_str(self) -> &'static str {
                match self {
                    $( Self::$variant => $text, )*
                }
            }
        }

        impl fmt::Display for $ty {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                f.write_str(self.as_str())
            }
        }

        impl FromStr for $ty {
            type Err = ParseEnumError;
            fn from_str(s: &str) -> Result<Self, Self::Err> {
                match s {
                    $( $text => Ok(Self::$variant), )*
                    _ => Err(ParseEnumError {
                        what: $what,
                        text: s.to_owned(),
                    }),
                }
            }
        }
    };
}

// --- Escrow --- //

/// The single monotonic state machine per escrow.
#[derive(
    Copy, Clone, Debug, Eq, PartialEq, Hash, Serialize, Deserialize,
    strum::VariantArray,
)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum EscrowStatus {
    Pending,
    Funded,
    InProgress,
    Delivered,
    Released,
    Disputed,
    Refunded,
    Cancelled,
}

impl_enum_text!(EscrowStatus, "escrow status", {
    Pending => "PENDING",
    Funded => "FUNDED",
    InProgress => "IN_PROGRESS",
    Delivered => "DELIVERED",
    Released => "RELEASED",
    Disputed => "DISPUTED",
    Refunded => "REFUNDED",
    Cancelled => "CANCELLED",
});

impl EscrowStatus {
    /// Terminal states never transition again.
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Released | Self::Refunded | Self::Cancelled)
    }

    /// Whether the buyer's payment has been confirmed at some point.
    pub fn is_funded_or_later(self) -> bool {
        !matches!(self, Self::Pending | Self::Cancelled)
    }
}

/// The source object an escrow was created from. Exactly one source is
/// populated per escrow.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum SourceRef {
    /// A job proposal, with its parent job when known.
    JobProposal {
        proposal_id: SourceId,
        job_id: Option<SourceId>,
    },
    Campaign { campaign_id: SourceId },
    ServiceRequest { request_id: SourceId },
}

impl SourceRef {
    /// Flatten into the four nullable reference columns
    /// `(job_proposal_id, job_id, campaign_id, service_request_id)`.
    pub fn columns(
        &self,
    ) -> (Option<i64>, Option<i64>, Option<i64>, Option<i64>) {
        match *self {
            Self::JobProposal {
                proposal_id,
                job_id,
            } => (
                Some(proposal_id.to_i64()),
                job_id.map(SourceId::to_i64),
                None,
                None,
            ),
            Self::Campaign { campaign_id } =>
                (None, None, Some(campaign_id.to_i64()), None),
            Self::ServiceRequest { request_id } =>
                (None, None, None, Some(request_id.to_i64())),
        }
    }

    /// Rebuild from the four nullable reference columns; `None` when zero or
    /// more than one source is populated.
    pub fn from_columns(
        job_proposal_id: Option<i64>,
        job_id: Option<i64>,
        campaign_id: Option<i64>,
        service_request_id: Option<i64>,
    ) -> Option<Self> {
        match (job_proposal_id, campaign_id, service_request_id) {
            (Some(p), None, None) => Some(Self::JobProposal {
                proposal_id: SourceId(p),
                job_id: job_id.map(SourceId),
            }),
            (None, Some(c), None) => Some(Self::Campaign {
                campaign_id: SourceId(c),
            }),
            (None, None, Some(r)) => Some(Self::ServiceRequest {
                request_id: SourceId(r),
            }),
            _ => None,
        }
    }
}

/// Serialize as the flat four-field object clients expect.
impl Serialize for SourceRef {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        let (proposal, job, campaign, request) = self.columns();
        let mut s = serializer.serialize_struct("SourceRef", 4)?;
        s.serialize_field("job_proposal_id", &proposal)?;
        s.serialize_field("job_id", &job)?;
        s.serialize_field("campaign_id", &campaign)?;
        s.serialize_field("service_request_id", &request)?;
        s.end()
    }
}

/// An admin's verdict on a disputed escrow.
#[derive(Copy, Clone, Debug, Eq, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum DisputeResolution {
    ReleaseToSeller,
    RefundBuyer,
    PartialSplit,
}

impl_enum_text!(DisputeResolution, "dispute resolution", {
    ReleaseToSeller => "RELEASE_TO_SELLER",
    RefundBuyer => "REFUND_BUYER",
    PartialSplit => "PARTIAL_SPLIT",
});

/// A single hold of funds for a unit of work. Never hard-deleted.
#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct Escrow {
    pub id: EscrowId,
    pub buyer_id: UserId,
    pub seller_id: UserId,
    pub source: SourceRef,
    /// Snapshotted from the source at creation.
    pub title: String,
    pub currency: Currency,
    pub total_amount: Amount,
    pub fee_amount: Amount,
    pub seller_amount: Amount,
    pub status: EscrowStatus,
    pub inspection_period_days: i32,
    pub payment_ref: Option<String>,
    pub payment_access_code: Option<String>,
    pub transfer_ref: Option<String>,
    /// Payout destination snapshot captured at release time.
    pub seller_recipient_code: Option<String>,
    pub seller_payout_method: Option<PayoutMethod>,
    pub delivery_note: Option<String>,
    pub terms: Option<String>,
    pub metadata: Option<serde_json::Value>,
    pub dispute_reason: Option<String>,
    pub dispute_raised_by: Option<UserId>,
    pub dispute_resolution: Option<DisputeResolution>,
    pub split_percent: Option<i32>,
    pub cancelled_by: Option<UserId>,
    pub cancellation_reason: Option<String>,
    pub transfer_fail_reason: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub payment_confirmed_at: Option<DateTime<Utc>>,
    pub delivery_confirmed_at: Option<DateTime<Utc>>,
    pub auto_release_at: Option<DateTime<Utc>>,
    pub funds_released_at: Option<DateTime<Utc>>,
    pub transfer_confirmed_at: Option<DateTime<Utc>>,
    pub transfer_failed_at: Option<DateTime<Utc>>,
    pub refund_confirmed_at: Option<DateTime<Utc>>,
    pub cancelled_at: Option<DateTime<Utc>>,
    pub dispute_resolved_at: Option<DateTime<Utc>>,
}

impl Escrow {
    /// `fee + seller = total`, all non-negative. Holds by construction; used
    /// as a debug assertion by stores.
    pub fn amounts_consistent(&self) -> bool {
        self.fee_amount.minor() + self.seller_amount.minor()
            == self.total_amount.minor()
    }
}

// --- Milestones --- //

/// Per-milestone state, independent of the parent escrow except that the
/// parent releases when every milestone has released.
#[derive(
    Copy, Clone, Debug, Eq, PartialEq, Hash, Serialize, Deserialize,
    strum::VariantArray,
)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum MilestoneStatus {
    Pending,
    InProgress,
    Delivered,
    Released,
    Disputed,
    Refunded,
}

impl_enum_text!(MilestoneStatus, "milestone status", {
    Pending => "PENDING",
    InProgress => "IN_PROGRESS",
    Delivered => "DELIVERED",
    Released => "RELEASED",
    Disputed => "DISPUTED",
    Refunded => "REFUNDED",
});

/// A sub-ledger entry for one milestone of a campaign escrow.
#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct MilestonePayment {
    pub id: MilestoneId,
    pub escrow_id: EscrowId,
    /// Loose reference into the campaign's milestone schedule; no FK.
    pub source_milestone_id: Option<i64>,
    pub title: String,
    pub amount: Amount,
    pub order_index: i32,
    pub status: MilestoneStatus,
    pub transfer_ref: Option<String>,
    pub delivery_note: Option<String>,
    pub rejection_reason: Option<String>,
    pub due_date: Option<DateTime<Utc>>,
    pub delivered_at: Option<DateTime<Utc>>,
    pub released_at: Option<DateTime<Utc>>,
}

// --- Audit events --- //

/// Append-only record of a single state change or external confirmation.
#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct EscrowEvent {
    pub id: EventId,
    pub escrow_id: EscrowId,
    pub milestone_payment_id: Option<MilestoneId>,
    /// `None` for system events (auto-release, webhooks).
    pub actor_id: Option<UserId>,
    pub event_type: String,
    pub description: String,
    pub metadata: Option<serde_json::Value>,
    pub ip_address: Option<String>,
    pub created_at: DateTime<Utc>,
}

// --- Payout accounts --- //

#[derive(Copy, Clone, Debug, Eq, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum PayoutMethod {
    MobileMoney,
    Bank,
}

impl_enum_text!(PayoutMethod, "payout method", {
    MobileMoney => "MOBILE_MONEY",
    Bank => "BANK",
});

/// A seller's payout destination. At most one active row per user.
#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct SellerPayoutAccount {
    pub id: PayoutAccountId,
    pub user_id: UserId,
    pub payout_method: PayoutMethod,
    pub mobile_money_number: Option<String>,
    pub bank_account_number: Option<String>,
    pub bank_code: Option<String>,
    /// Account name as resolved by the provider at setup time.
    pub bank_account_name: Option<String>,
    pub provider_recipient_code: String,
    pub is_active: bool,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

// --- Notifications --- //

#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct Notification {
    pub id: NotificationId,
    pub user_id: UserId,
    /// Dot-delimited category, e.g. `escrow.delivered`.
    pub notification_type: String,
    pub title: String,
    pub message: String,
    pub escrow_id: Option<EscrowId>,
    pub metadata: Option<serde_json::Value>,
    pub is_read: bool,
    pub created_at: DateTime<Utc>,
}

// --- Webhook logs --- //

#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct WebhookLog {
    pub id: WebhookLogId,
    pub provider: String,
    pub event_type: String,
    pub reference: String,
    pub payload: String,
    pub processed: bool,
    pub error: Option<String>,
    pub created_at: DateTime<Utc>,
}

// --- Users --- //

/// Platform account classes. Only creators may own payout accounts.
#[derive(Copy, Clone, Debug, Eq, PartialEq, Serialize, Deserialize)]
pub enum AccountType {
    Creator,
    Brand,
}

impl_enum_text!(AccountType, "account type", {
    Creator => "Creator",
    Brand => "Brand",
});

#[derive(Copy, Clone, Debug, Eq, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Role {
    User,
    Admin,
}

impl_enum_text!(Role, "role", {
    User => "user",
    Admin => "admin",
});

/// The engine's view of a platform user; profile CRUD lives elsewhere.
#[derive(Clone, Debug, Eq, PartialEq, Serialize, Deserialize)]
pub struct User {
    pub id: UserId,
    pub email: String,
    pub name: String,
    pub account_type: AccountType,
    pub role: Role,
}

/// The authenticated requester, as established by the upstream gateway.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct Actor {
    pub user_id: UserId,
    pub role: Role,
    pub ip: Option<String>,
}

impl Actor {
    pub fn user(user_id: UserId) -> Self {
        Self {
            user_id,
            role: Role::User,
            ip: None,
        }
    }

    pub fn admin(user_id: UserId) -> Self {
        Self {
            user_id,
            role: Role::Admin,
            ip: None,
        }
    }

    pub fn is_admin(&self) -> bool {
        self.role == Role::Admin
    }
}

#[cfg(test)]
mod test {
    use strum::VariantArray;

    use super::*;

    #[test]
    fn escrow_status_text_roundtrips() {
        for status in EscrowStatus::VARIANTS {
            let text = status.as_str();
            assert_eq!(text.parse::<EscrowStatus>().unwrap(), *status);
            let json = serde_json::to_string(status).unwrap();
            assert_eq!(json, format!("\"{text}\""));
        }
        assert!("STARTED".parse::<EscrowStatus>().is_err());
    }

    #[test]
    fn milestone_status_text_roundtrips() {
        for status in MilestoneStatus::VARIANTS {
            assert_eq!(
                status.as_str().parse::<MilestoneStatus>().unwrap(),
                *status
            );
        }
    }

    #[test]
    fn terminal_states() {
        assert!(EscrowStatus::Released.is_terminal());
        assert!(EscrowStatus::Refunded.is_terminal());
        assert!(EscrowStatus::Cancelled.is_terminal());
        assert!(!EscrowStatus::Disputed.is_terminal());
    }

    #[test]
    fn source_ref_columns_roundtrip() {
        let source = SourceRef::JobProposal {
            proposal_id: SourceId(5),
            job_id: Some(SourceId(9)),
        };
        let (p, j, c, r) = source.columns();
        assert_eq!(SourceRef::from_columns(p, j, c, r), Some(source));

        // Zero or two sources populated is rejected.
        assert_eq!(SourceRef::from_columns(None, None, None, None), None);
        assert_eq!(
            SourceRef::from_columns(Some(1), None, Some(2), None),
            None
        );
    }

    #[test]
    fn source_ref_serializes_flat() {
        let source = SourceRef::Campaign {
            campaign_id: SourceId(3),
        };
        let json = serde_json::to_value(&source).unwrap();
        assert_eq!(
            json,
            serde_json::json!({
                "job_proposal_id": null,
                "job_id": null,
                "campaign_id": 3,
                "service_request_id": null,
            })
        );
    }
}
