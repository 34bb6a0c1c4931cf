//! Host and container telemetry for the browser dashboard.
//!
//! While monitoring is on, one task per socket runs a fixed-interval tick:
//! sample the host counters, wait the sample gap, sample again, diff, and
//! push a single `monitor_update`.

pub mod parser;

use crate::config::MonitorSettings;
use crate::session::RemoteHost;
use sshgate_core::{ContainerStats, MonitorPayload, ServerMessage, SystemStats};
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior};
use tracing::{debug, info, warn};

/// Collects one snapshot per tick from a remote host.
pub struct TelemetryPoller {
    host: Arc<dyn RemoteHost>,
    settings: MonitorSettings,
    /// Docker availability, probed once per monitoring run.
    docker: Option<bool>,
}

impl TelemetryPoller {
    pub fn new(host: Arc<dyn RemoteHost>, settings: MonitorSettings) -> Self {
        Self {
            host,
            settings,
            docker: None,
        }
    }

    /// Run one tick. Never fails; unreadable metrics come back as
    /// placeholders.
    pub async fn tick(&mut self) -> MonitorPayload {
        let system_stats = self.host_stats().await;
        let docker_containers = self.containers().await;
        MonitorPayload {
            system_stats,
            docker_containers,
        }
    }

    async fn host_stats(&self) -> SystemStats {
        let first = self.run(parser::FULL_SAMPLE_COMMAND).await;
        let sampled_at = Instant::now();
        tokio::time::sleep(self.settings.sample_gap).await;
        let second = self.run(parser::RATE_SAMPLE_COMMAND).await;
        let elapsed = sampled_at.elapsed().max(self.settings.sample_gap);
        parser::system_stats(&first, &second, elapsed)
    }

    async fn containers(&mut self) -> Vec<ContainerStats> {
        let available = match self.docker {
            Some(known) => known,
            None => {
                let found = parser::docker_detected(&self.run(parser::DOCKER_DETECT_COMMAND).await);
                debug!(docker = found, "container runtime probe");
                self.docker = Some(found);
                found
            }
        };
        if !available {
            return Vec::new();
        }
        parser::parse_containers(&self.run(parser::DOCKER_COMMAND).await)
    }

    /// Command stdout, or empty output when the command could not run.
    async fn run(&self, command: &str) -> String {
        match self.host.exec(command).await {
            Ok(out) => out,
            Err(e) => {
                debug!(error = %e, "telemetry command failed");
                String::new()
            }
        }
    }
}

/// Start/stop control for one socket's telemetry task.
pub struct MonitorHandle {
    host: Arc<dyn RemoteHost>,
    settings: MonitorSettings,
    events: mpsc::Sender<ServerMessage>,
    task: Option<JoinHandle<()>>,
}

impl MonitorHandle {
    pub fn new(
        host: Arc<dyn RemoteHost>,
        settings: MonitorSettings,
        events: mpsc::Sender<ServerMessage>,
    ) -> Self {
        Self {
            host,
            settings,
            events,
            task: None,
        }
    }

    pub fn is_running(&self) -> bool {
        self.task.as_ref().is_some_and(|t| !t.is_finished())
    }

    /// Begin ticking. Returns `false` if a tick task is already running.
    pub fn start(&mut self) -> bool {
        if self.is_running() {
            debug!("monitor already running");
            return false;
        }
        let poller = TelemetryPoller::new(self.host.clone(), self.settings);
        let events = self.events.clone();
        let interval = self.settings.interval;
        self.task = Some(tokio::spawn(run_ticks(poller, interval, events)));
        info!(interval_secs = interval.as_secs(), "monitor started");
        true
    }

    /// Cancel the tick task and wait until it is gone, so nothing more is
    /// sent after this returns. Returns `false` if nothing was running.
    pub async fn stop(&mut self) -> bool {
        let Some(task) = self.task.take() else {
            return false;
        };
        task.abort();
        if let Err(e) = task.await {
            if e.is_panic() {
                warn!("monitor task panicked");
            }
        }
        info!("monitor stopped");
        true
    }
}

impl Drop for MonitorHandle {
    fn drop(&mut self) {
        if let Some(task) = self.task.take() {
            task.abort();
        }
    }
}

async fn run_ticks(
    mut poller: TelemetryPoller,
    interval: std::time::Duration,
    events: mpsc::Sender<ServerMessage>,
) {
    let mut ticker = tokio::time::interval(interval);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

    loop {
        ticker.tick().await;
        if events.is_closed() {
            break;
        }
        let payload = poller.tick().await;
        if events
            .send(ServerMessage::MonitorUpdate { payload })
            .await
            .is_err()
        {
            debug!("socket gone, monitor exiting");
            break;
        }
    }
}
