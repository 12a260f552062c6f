//! The auto-release background actor.
//!
//! Every tick it releases DELIVERED escrows whose inspection window has
//! lapsed, then warns buyers whose windows close within the next day. Safe
//! to run alongside other instances: each candidate goes through the same
//! row-locked release path as a user call, so double processing is a no-op.

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use tokio::sync::watch;
use tokio::time::{self, MissedTickBehavior};
use tracing::{debug, info, warn};

use crate::error::EngineResult;
use crate::manager::EscrowManager;
use crate::notify::kinds;

/// Default scan interval; overridden by `SCHEDULER_INTERVAL_SECS`.
pub const DEFAULT_INTERVAL: Duration = Duration::from_secs(30 * 60);

/// Escrows released per tick; the remainder is picked up next tick.
const RELEASE_BATCH: i64 = 50;

/// How far ahead of the deadline the warning goes out.
const WARNING_WINDOW: chrono::Duration = chrono::Duration::hours(24);

pub struct AutoReleaser {
    manager: Arc<EscrowManager>,
    interval: Duration,
    /// Flipped to `true` by the server when it is going down.
    shutdown: watch::Receiver<bool>,
}

impl AutoReleaser {
    pub fn new(
        manager: Arc<EscrowManager>,
        interval: Duration,
        shutdown: watch::Receiver<bool>,
    ) -> Self {
        Self {
            manager,
            interval,
            shutdown,
        }
    }

    /// Run until shutdown. Tick errors are logged and swallowed; the actor
    /// never exits on its own.
    pub async fn run(mut self) {
        info!(interval_secs = self.interval.as_secs(), "auto-releaser up");
        let mut ticker = time::interval(self.interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        // The first interval tick fires immediately; skip it so startup
        // doesn't race the migrations.
        ticker.tick().await;

        loop {
            tokio::select! {
                changed = self.shutdown.changed() => {
                    // A dropped sender counts as a shutdown too.
                    if changed.is_err() || *self.shutdown.borrow() {
                        info!("auto-releaser received shutdown signal");
                        break;
                    }
                }
                _ = ticker.tick() => {
                    if let Err(e) = self.tick().await {
                        warn!("auto-release tick failed: {e}");
                    }
                }
            }
        }
    }

    /// One scan: release everything due, then send pre-deadline warnings.
    pub async fn tick(&self) -> EngineResult<()> {
        let now = Utc::now();

        let due = self
            .manager
            .store
            .due_for_auto_release(now, RELEASE_BATCH)
            .await?;
        if !due.is_empty() {
            info!(count = due.len(), "auto-releasing overdue escrows");
        }
        for escrow_id in due {
            // Per-escrow failures (no payout account, provider down) must
            // not starve the rest of the batch.
            if let Err(e) = self.manager.auto_release(escrow_id).await {
                warn!(%escrow_id, "auto-release failed: {e}");
            }
        }

        self.send_warnings().await?;
        Ok(())
    }

    /// Best-effort warnings to buyers whose inspection window closes within
    /// [`WARNING_WINDOW`]. Duplicates are suppressed by checking for an
    /// existing warning notification in the window.
    async fn send_warnings(&self) -> EngineResult<()> {
        let now = Utc::now();
        let soon = self
            .manager
            .store
            .releasing_soon(now, now + WARNING_WINDOW)
            .await?;

        for escrow in soon {
            let already_warned = self
                .manager
                .store
                .notification_exists_since(
                    escrow.buyer_id,
                    escrow.id,
                    kinds::AUTO_RELEASE_WARNING,
                    now - WARNING_WINDOW,
                )
                .await
                .unwrap_or(true);
            if already_warned {
                debug!(escrow_id = %escrow.id, "warning already sent");
                continue;
            }
            self.manager
                .notifier()
                .notify(
                    escrow.buyer_id,
                    kinds::AUTO_RELEASE_WARNING,
                    "Funds release soon",
                    &format!(
                        "Funds for \"{}\" will be released to the seller \
                         within 24 hours unless you raise a dispute.",
                        escrow.title
                    ),
                    Some(escrow.id),
                    None,
                )
                .await;
        }
        Ok(())
    }
}
