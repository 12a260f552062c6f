//! The sokoni escrow & payout engine.
//!
//! Buyers fund work, sellers deliver it; the engine holds value on the
//! payment-provider balance, guarantees a single monotonic state machine per
//! escrow, pays sellers out on release, and drives disputes, refunds,
//! cancellations, milestone settlement, and time-based auto-release. An
//! immutable audit log records every transition.
//!
//! Every state update follows the same discipline:
//!
//! 1) Check: read-only validation of the proposed transition (status allows
//!    it, caller is the required party, payout account present when needed).
//! 2) Persist: one store call acquires the row lock, re-reads the status,
//!    applies the update, and appends the audit event in the same
//!    transaction. If the destination state already holds, the call reports
//!    [`Transition::AlreadyDone`] and the operation is a no-op.
//! 3) Effects: provider transfers / refunds and notifications run strictly
//!    after commit. A failed transfer never rolls anything back; it appends
//!    a `transfer_failed` event, reverts the status in a new transaction,
//!    and leaves the funds on the provider balance for a retry.
//!
//! Provider round-trips never happen inside a held row lock.
//!
//! [`Transition::AlreadyDone`]: crate::store::Transition::AlreadyDone

/// The auto-release background actor.
pub mod autorelease;
/// Engine error type.
pub mod error;
/// `EscrowManager`: the state machine and lifecycle operations.
pub mod manager;
/// Milestone deliver / release operations.
pub mod milestones;
/// Engine-side data shapes: inserts, updates, filters, audit event types.
pub mod models;
/// Best-effort notification sink.
pub mod notify;
/// Seller payout account lifecycle.
pub mod payout;
/// List / detail / events / stats queries.
pub mod queries;
/// Storage traits and implementations.
pub mod store;
/// Webhook ingestion and provider-event handlers.
pub mod webhook;

pub use crate::error::{EngineError, EngineResult};
pub use crate::manager::{EngineConfig, EscrowManager};
