//! Online/offline signal.
//!
//! The host reports transitions with [`ConnectivityMonitor::report`] (or runs
//! the TCP probe); consumers subscribe to a `watch` channel and only see a
//! change when the value actually flips.

use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpStream;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;

/// Shared connectivity state.
#[derive(Clone)]
pub struct ConnectivityMonitor {
    tx: Arc<watch::Sender<bool>>,
}

impl ConnectivityMonitor {
    pub fn new(initially_online: bool) -> Self {
        let (tx, _rx) = watch::channel(initially_online);
        Self { tx: Arc::new(tx) }
    }

    /// Record the current connectivity. Returns `true` on a transition.
    pub fn report(&self, online: bool) -> bool {
        let changed = self.tx.send_if_modified(|current| {
            if *current == online {
                false
            } else {
                *current = online;
                true
            }
        });
        if changed {
            log::info!("Connectivity {}", if online { "regained" } else { "lost" });
        }
        changed
    }

    pub fn is_online(&self) -> bool {
        *self.tx.borrow()
    }

    pub fn subscribe(&self) -> watch::Receiver<bool> {
        self.tx.subscribe()
    }

    /// Periodically try a TCP connect to `target` and report the result.
    ///
    /// Runs until the returned handle is aborted.
    pub fn spawn_probe(
        &self,
        target: impl Into<String>,
        interval: Duration,
        connect_timeout: Duration,
    ) -> JoinHandle<()> {
        let monitor = self.clone();
        let target = target.into();
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            loop {
                ticker.tick().await;
                let online = matches!(
                    tokio::time::timeout(connect_timeout, TcpStream::connect(&target)).await,
                    Ok(Ok(_))
                );
                log::trace!("Connectivity probe to {target}: {online}");
                monitor.report(online);
            }
        })
    }
}

impl Default for ConnectivityMonitor {
    fn default() -> Self {
        Self::new(true)
    }
}
