//! Integer id newtypes.
//!
//! Ids are opaque to the engine; they originate from the platform database
//! (BIGSERIAL columns) and are only ever compared, displayed, and embedded in
//! external references.

use std::fmt::{self, Display};
use std::num::ParseIntError;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

macro_rules! define_id {
    ($(#[doc = $doc:literal] $name:ident),* $(,)?) => {
        $(
            #[doc = $doc]
            #[derive(
                Copy, Clone, Debug, Eq, PartialEq, Ord, PartialOrd, Hash,
                Serialize, Deserialize,
            )]
            #[serde(transparent)]
            pub struct $name(pub i64);

            impl $name {
                #[inline]
                pub fn to_i64(self) -> i64 {
                    self.0
                }
            }

            impl From<i64> for $name {
                #[inline]
                fn from(id: i64) -> Self {
                    Self(id)
                }
            }

            impl Display for $name {
                fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                    Display::fmt(&self.0, f)
                }
            }

            impl FromStr for $name {
                type Err = ParseIntError;
                fn from_str(s: &str) -> Result<Self, Self::Err> {
                    i64::from_str(s).map(Self)
                }
            }
        )*
    };
}

define_id! {
    /// A platform user (brand or creator account).
    UserId,
    /// An escrow row.
    EscrowId,
    /// A milestone payment row.
    MilestoneId,
    /// A source object (job proposal, campaign, or service request).
    SourceId,
    /// An audit event row.
    EventId,
    /// A webhook log row.
    WebhookLogId,
    /// A notification row.
    NotificationId,
    /// A seller payout account row.
    PayoutAccountId,
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn display_and_parse() {
        let id = EscrowId(42);
        assert_eq!(id.to_string(), "42");
        assert_eq!("42".parse::<EscrowId>().unwrap(), id);
        assert!("4x".parse::<EscrowId>().is_err());
    }

    #[test]
    fn serde_is_transparent() {
        let id = UserId(7);
        assert_eq!(serde_json::to_string(&id).unwrap(), "7");
        assert_eq!(serde_json::from_str::<UserId>("7").unwrap(), id);
    }
}
