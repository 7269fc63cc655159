//! Periodic fan-out over every registered server, plus on-demand refresh.
//!
//! The poller is the only writer of [`ServerState`]. Records come from the
//! credential store; states are keyed by record id and merged by identity.

use crate::error::{MonitorError, Result};
use crate::models::metrics::{
    ConnectionStatus, MonitorResponse, OfflineReason, ServerState, ServerStatus,
};
use crate::models::server::ServerView;
use crate::services::executor::Executor;
use crate::services::store::CredentialStore;
use chrono::{DateTime, Utc};
use futures::future::join_all;
use parking_lot::RwLock;
use serde::Serialize;
use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::time::MissedTickBehavior;
use tracing::{debug, error, info, warn};

/// Aggregate view served by the status endpoint.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct DashboardStatus {
    pub total: usize,
    pub online: usize,
    pub warning: usize,
    pub offline: usize,
    pub unknown: usize,
    pub poll_in_flight: bool,
    pub last_refresh: Option<DateTime<Utc>>,
}

/// Clears the in-flight flag however the poll ends.
struct InFlightGuard<'a>(&'a AtomicBool);

impl Drop for InFlightGuard<'_> {
    fn drop(&mut self) {
        self.0.store(false, Ordering::Release);
    }
}

pub struct Poller {
    store: Arc<dyn CredentialStore>,
    executor: Arc<Executor>,
    states: RwLock<HashMap<String, ServerState>>,
    in_flight: AtomicBool,
    last_refresh: RwLock<Option<DateTime<Utc>>>,
    warning_threshold: f64,
}

impl Poller {
    pub fn new(
        store: Arc<dyn CredentialStore>,
        executor: Arc<Executor>,
        warning_threshold: f64,
    ) -> Self {
        Self {
            store,
            executor,
            states: RwLock::new(HashMap::new()),
            in_flight: AtomicBool::new(false),
            last_refresh: RwLock::new(None),
            warning_threshold,
        }
    }

    /// Polls every known server concurrently. Returns `false` without doing
    /// anything when a previous poll is still running.
    pub async fn poll_all(&self) -> Result<bool> {
        if self
            .in_flight
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_err()
        {
            debug!("Previous poll still in flight, skipping tick");
            return Ok(false);
        }
        let _guard = InFlightGuard(&self.in_flight);

        let targets = self.store.targets().await?;
        {
            let mut states = self.states.write();
            for (id, _) in &targets {
                states.entry(id.clone()).or_insert_with(ServerState::unknown);
            }
        }

        let results = join_all(targets.iter().map(|(id, target)| async move {
            (id, self.executor.collect(target).await)
        }))
        .await;

        let mut online = 0;
        for (id, result) in results {
            match result {
                Ok(response) => {
                    online += usize::from(response.is_online());
                    self.merge(id, response);
                }
                Err(e) => self.mark_failed(id, &e),
            }
        }

        self.prune().await?;
        *self.last_refresh.write() = Some(Utc::now());
        debug!("Poll complete: {}/{} online", online, targets.len());
        Ok(true)
    }

    /// Resets the server to the resyncing placeholder, then collects once.
    pub async fn refresh(&self, id: &str) -> Result<MonitorResponse> {
        let target = self.store.resolve(id).await?;
        self.states.write().insert(id.to_string(), ServerState::resyncing());
        self.confirm_tracked(id).await?;

        match self.executor.collect(&target).await {
            Ok(response) => {
                self.merge(id, response.clone());
                Ok(response)
            }
            Err(e) => {
                self.mark_failed(id, &e);
                Err(e)
            }
        }
    }

    /// One-off poll after a record is created or edited. Prior metrics stay
    /// visible until the result arrives.
    pub async fn poll_one(&self, id: &str) -> Result<()> {
        let target = self.store.resolve(id).await?;
        self.states
            .write()
            .entry(id.to_string())
            .or_insert_with(ServerState::unknown)
            .connection_status = Some(ConnectionStatus::Attempting);
        self.confirm_tracked(id).await?;

        match self.executor.collect(&target).await {
            Ok(response) => self.merge(id, response),
            Err(e) => self.mark_failed(id, &e),
        }
        Ok(())
    }

    pub fn forget(&self, id: &str) {
        self.states.write().remove(id);
    }

    /// Drops a freshly inserted state if its record was deleted meanwhile.
    /// A delete landing after this check is followed by its own `forget`.
    async fn confirm_tracked(&self, id: &str) -> Result<()> {
        if let Err(e) = self.store.get(id).await {
            self.forget(id);
            return Err(e);
        }
        Ok(())
    }

    /// Keeps only states whose record still exists.
    async fn prune(&self) -> Result<()> {
        let live: HashSet<String> = self.store.list().await?.into_iter().map(|s| s.id).collect();
        self.states.write().retain(|id, _| live.contains(id));
        Ok(())
    }

    fn merge(&self, id: &str, response: MonitorResponse) {
        let mut states = self.states.write();
        // Deleted while the poll was running
        let Some(state) = states.get_mut(id) else {
            return;
        };

        match response {
            MonitorResponse::Online(snapshot) => {
                let status = if snapshot.metrics.peak_percentage() >= self.warning_threshold {
                    ServerStatus::Warning
                } else {
                    ServerStatus::Online
                };
                *state = ServerState {
                    status,
                    connection_status: Some(ConnectionStatus::Success),
                    connection_error: None,
                    os: snapshot.os,
                    kernel: snapshot.kernel,
                    metrics: snapshot.metrics,
                    security_events: snapshot.security_events,
                    processes: snapshot.processes,
                    command_logs: snapshot.command_logs,
                    last_updated: Utc::now(),
                };
            }
            MonitorResponse::Offline { error, reason } => {
                state.status = ServerStatus::Offline;
                state.connection_status = Some(match reason {
                    OfflineReason::Handshake => ConnectionStatus::HandshakeFailed,
                    OfflineReason::Unreachable => ConnectionStatus::Error,
                });
                state.connection_error = Some(error);
                state.last_updated = Utc::now();
            }
        }
    }

    fn mark_failed(&self, id: &str, err: &MonitorError) {
        warn!("Poll of {} rejected: {}", id, err);
        if let Some(state) = self.states.write().get_mut(id) {
            state.status = ServerStatus::Offline;
            state.connection_status = Some(ConnectionStatus::Error);
            state.connection_error = Some(err.to_string());
            state.last_updated = Utc::now();
        }
    }

    fn state_of(&self, id: &str) -> ServerState {
        self.states.read().get(id).cloned().unwrap_or_default()
    }

    pub async fn view(&self, id: &str) -> Result<ServerView> {
        let server = self.store.get(id).await?;
        let state = self.state_of(id);
        Ok(ServerView { server, state })
    }

    /// Every server merged with its latest state, newest record first.
    pub async fn snapshot(&self) -> Result<Vec<ServerView>> {
        let servers = self.store.list().await?;
        let states = self.states.read();
        Ok(servers
            .into_iter()
            .map(|server| {
                let state = states.get(&server.id).cloned().unwrap_or_default();
                ServerView { server, state }
            })
            .collect())
    }

    pub async fn status(&self) -> Result<DashboardStatus> {
        let views = self.snapshot().await?;
        let mut status = DashboardStatus {
            total: views.len(),
            poll_in_flight: self.in_flight.load(Ordering::Acquire),
            last_refresh: *self.last_refresh.read(),
            ..Default::default()
        };
        for view in &views {
            match view.state.status {
                ServerStatus::Online => status.online += 1,
                ServerStatus::Warning => status.warning += 1,
                ServerStatus::Offline => status.offline += 1,
                ServerStatus::Unknown => status.unknown += 1,
            }
        }
        Ok(status)
    }

    /// Timer loop. Each tick spawns its poll so a slow cycle cannot delay
    /// the timer; overlapping ticks are dropped by the in-flight guard.
    pub async fn run(self: Arc<Self>, period: Duration) {
        info!("Polling every {}s", period.as_secs());
        let mut interval = tokio::time::interval(period);
        interval.set_missed_tick_behavior(MissedTickBehavior::Skip);

        loop {
            interval.tick().await;

            let poller = Arc::clone(&self);
            tokio::spawn(async move {
                if let Err(e) = poller.poll_all().await {
                    error!("Poll cycle failed: {}", e);
                }
            });
        }
    }
}
