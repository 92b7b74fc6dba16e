//! The long-running polling loop.

use super::DeliveryPipeline;
use crate::config::RelayConfig;
use crate::dedup::MembershipFilter;
use std::future::Future;
use std::time::Duration;
use tracing::{info, warn};

/// Extra pause after a cycle that reported feed errors.
pub const ERROR_BACKOFF: Duration = Duration::from_secs(5);

impl<F: MembershipFilter + 'static> DeliveryPipeline<F> {
    /// Runs polling cycles until `shutdown` resolves.
    ///
    /// `reload` is called before every cycle; a returned configuration
    /// replaces the feed list and delivery settings. `shutdown` is polled
    /// between cycles only, so a running cycle always completes and a
    /// shutdown that fired during it ends the loop before the next one.
    pub async fn run_until<R, S>(&mut self, mut config: RelayConfig, mut reload: R, shutdown: S)
    where
        R: FnMut() -> Option<RelayConfig>,
        S: Future<Output = ()>,
    {
        tokio::pin!(shutdown);
        info!(
            feeds = config.feeds.len(),
            interval_secs = config.telegram.check_interval,
            "Starting relay"
        );

        loop {
            if let Some(reloaded) = reload() {
                self.set_settings(reloaded.delivery);
                info!("Storage and bot settings take effect on restart");
                config = reloaded;
            }

            let mut pause = config.telegram.check_interval();
            if let Err(e) = self.run_cycle(&config.feeds).await {
                warn!(error = %e, "Cycle finished with errors");
                pause += ERROR_BACKOFF;
            }

            tokio::select! {
                biased;
                () = &mut shutdown => {
                    info!("Shutdown requested, exiting");
                    return;
                },
                () = tokio::time::sleep(pause) => {},
            }
        }
    }
}
