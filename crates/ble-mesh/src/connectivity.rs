//! Shared connectivity signal
//!
//! Sampled by the engine when a request completes to decide between acting as
//! a gateway and relaying the request onwards.

use blockchain::TransferLedger;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

#[derive(Debug, Clone, Default)]
pub struct ConnectivityFlag(Arc<AtomicBool>);

impl ConnectivityFlag {
    pub fn new(online: bool) -> Self {
        Self(Arc::new(AtomicBool::new(online)))
    }

    pub fn is_online(&self) -> bool {
        self.0.load(Ordering::Acquire)
    }

    /// Update the flag, returning the previous value
    pub fn set(&self, online: bool) -> bool {
        self.0.swap(online, Ordering::AcqRel)
    }
}

/// Keep `flag` in step with the ledger's reachability
///
/// Probes immediately, then every `interval`, until `cancel` fires.
pub fn spawn_probe(
    ledger: Arc<dyn TransferLedger>,
    flag: ConnectivityFlag,
    interval: Duration,
    timeout: Duration,
    cancel: CancellationToken,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = ticker.tick() => {}
            }

            let online = match tokio::time::timeout(timeout, ledger.check_connection()).await {
                Ok(Ok(())) => true,
                Ok(Err(e)) => {
                    debug!("Connectivity probe failed: {}", e);
                    false
                }
                Err(_) => {
                    debug!("Connectivity probe timed out after {:?}", timeout);
                    false
                }
            };

            if flag.set(online) != online {
                info!(
                    "Ledger connectivity changed: {}",
                    if online { "online" } else { "offline" }
                );
            }
        }

        debug!("Connectivity probe stopped");
    })
}
