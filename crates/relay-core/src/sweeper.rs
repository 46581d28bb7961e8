//! Periodic background sweeps
//!
//! Each sweep is its own task on its own interval so a slow health check never delays
//! device or cache cleanup. All tasks stop when the shared token is cancelled.

use crate::relay::Relay;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;

pub struct Sweeper {
    cancel: CancellationToken,
    handles: Vec<JoinHandle<()>>,
}

impl Sweeper {
    pub fn start(relay: Arc<Relay>) -> Self {
        Self::start_with_token(relay, CancellationToken::new())
    }

    pub fn start_with_token(relay: Arc<Relay>, cancel: CancellationToken) -> Self {
        let config = relay.config().clone();
        let mut handles = Vec::new();

        let r = relay.clone();
        handles.push(spawn_periodic(
            "idle-sessions",
            config.sessions.sweep_interval(),
            cancel.clone(),
            move || {
                let r = r.clone();
                async move {
                    r.sessions().sweep_idle().await;
                }
            },
        ));

        let r = relay.clone();
        handles.push(spawn_periodic(
            "worker-health",
            config.sessions.health_interval(),
            cancel.clone(),
            move || {
                let r = r.clone();
                async move {
                    let report = r.sessions().check_health().await;
                    if report.stalled > 0 || report.terminated > 0 {
                        log::info!("Health sweep: {:?}", report);
                    }
                }
            },
        ));

        let r = relay.clone();
        handles.push(spawn_periodic(
            "devices",
            config.devices.sweep_interval(),
            cancel.clone(),
            move || {
                let r = r.clone();
                async move {
                    r.devices().sweep();
                }
            },
        ));

        let r = relay.clone();
        handles.push(spawn_periodic(
            "dedup",
            config.dedup.sweep_interval(),
            cancel.clone(),
            move || {
                let r = r.clone();
                async move {
                    r.dedup().sweep();
                }
            },
        ));

        let r = relay;
        handles.push(spawn_periodic(
            "message-bodies",
            config.sessions.sweep_interval(),
            cancel.clone(),
            move || {
                let r = r.clone();
                async move {
                    let purged = r.delivery().body_store().purge_expired().await;
                    if purged > 0 {
                        log::debug!("Purged {} expired message bodies", purged);
                    }
                }
            },
        ));

        Self { cancel, handles }
    }

    pub fn cancel_token(&self) -> CancellationToken {
        self.cancel.clone()
    }

    /// Cancel every sweep and wait for the tasks to finish.
    pub async fn stop(self) {
        self.cancel.cancel();
        for handle in self.handles {
            if let Err(e) = handle.await {
                log::warn!("Sweep task ended abnormally: {}", e);
            }
        }
    }
}

fn spawn_periodic<F, Fut>(
    name: &'static str,
    period: Duration,
    cancel: CancellationToken,
    mut tick: F,
) -> JoinHandle<()>
where
    F: FnMut() -> Fut + Send + 'static,
    Fut: Future<Output = ()> + Send + 'static,
{
    tokio::spawn(async move {
        let mut interval = tokio::time::interval(period);
        interval.set_missed_tick_behavior(MissedTickBehavior::Delay);
        // The first tick fires immediately.
        interval.tick().await;
        log::debug!("Sweep '{}' running every {:?}", name, period);

        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = interval.tick() => tick().await,
            }
        }
        log::debug!("Sweep '{}' stopped", name);
    })
}
