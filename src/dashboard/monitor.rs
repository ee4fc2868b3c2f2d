use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use serde::Serialize;
use serde_json::Value;

use super::{CameraEndpoint, DashboardConfig};

const STATS_TIMEOUT: Duration = Duration::from_secs(5);
const RESTART_TIMEOUT: Duration = Duration::from_secs(10);

/// Per-camera liveness bookkeeping. Timestamps are seconds on the
/// monitor's own clock so the decision logic stays testable.
#[derive(Debug, Default)]
pub struct CameraMonitorState {
    pub last_stats: Option<Value>,
    pub stop_reason: Option<&'static str>,
    pub restart_count: u32,
    pub last_restart_secs: Option<f64>,
    pub auto_restart_disabled: bool,
    /// One restart per detected outage; reset when the camera recovers.
    outage_restarted: bool,
}

/// What the monitor should do for a camera after one poll.
#[derive(Debug, PartialEq, Eq)]
pub(crate) enum MonitorAction {
    None,
    Restart,
}

/// Pure decision step, shared by the loop and the tests. `healthy` means
/// `/stats` answered and the camera saw a frame within the timeout.
pub(crate) fn decide(
    state: &mut CameraMonitorState,
    healthy: bool,
    now_secs: f64,
    cooldown_secs: f64,
    max_count: u32,
) -> MonitorAction {
    if healthy {
        state.stop_reason = None;
        state.outage_restarted = false;
        return MonitorAction::None;
    }

    state.stop_reason = Some("no_frame");

    if state.auto_restart_disabled || state.outage_restarted {
        return MonitorAction::None;
    }
    if state.restart_count >= max_count {
        state.auto_restart_disabled = true;
        return MonitorAction::None;
    }
    if let Some(last) = state.last_restart_secs {
        if now_secs - last < cooldown_secs {
            // Cooldown still running; try again on a later poll.
            return MonitorAction::None;
        }
    }

    state.restart_count += 1;
    state.last_restart_secs = Some(now_secs);
    state.outage_restarted = true;
    MonitorAction::Restart
}

#[derive(Serialize)]
pub struct MonitorSnapshot {
    pub camera: String,
    pub url: String,
    pub stats: Option<Value>,
    pub monitor_stop_reason: Option<&'static str>,
    pub monitor_restart_count: u32,
    pub monitor_last_restart_age_secs: Option<f64>,
    pub monitor_auto_restart_disabled: bool,
}

/// Polls each camera's `/stats` on an interval, caches the response, and
/// drives auto-restarts under the cooldown and budget rules.
pub struct Monitor {
    config: Arc<DashboardConfig>,
    client: reqwest::Client,
    epoch: Instant,
    states: Vec<Mutex<CameraMonitorState>>,
}

impl Monitor {
    pub fn new(config: Arc<DashboardConfig>, client: reqwest::Client) -> Arc<Self> {
        let states = config
            .cameras
            .iter()
            .map(|_| Mutex::new(CameraMonitorState::default()))
            .collect();
        Arc::new(Self {
            config,
            client,
            epoch: Instant::now(),
            states,
        })
    }

    fn now_secs(&self) -> f64 {
        self.epoch.elapsed().as_secs_f64()
    }

    /// Cached view for `/camera_stats/{i}`; never a live proxy.
    pub fn snapshot(&self, index: usize) -> Option<MonitorSnapshot> {
        let endpoint = self.config.cameras.get(index)?;
        let state = self.states.get(index)?.lock().expect("monitor lock");
        Some(MonitorSnapshot {
            camera: endpoint.name.clone(),
            url: endpoint.url.clone(),
            stats: state.last_stats.clone(),
            monitor_stop_reason: state.stop_reason,
            monitor_restart_count: state.restart_count,
            monitor_last_restart_age_secs: state
                .last_restart_secs
                .map(|t| self.now_secs() - t),
            monitor_auto_restart_disabled: state.auto_restart_disabled,
        })
    }

    pub fn spawn(self: &Arc<Self>, shutdown: Arc<AtomicBool>) -> tokio::task::JoinHandle<()> {
        let monitor = Arc::clone(self);
        tokio::spawn(async move {
            if !monitor.config.monitor_enabled {
                tracing::info!("camera monitor disabled");
                return;
            }
            let mut interval = tokio::time::interval(monitor.config.monitor_interval);
            interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            while !shutdown.load(Ordering::Relaxed) {
                interval.tick().await;
                for (i, endpoint) in monitor.config.cameras.iter().enumerate() {
                    monitor.poll_camera(i, endpoint).await;
                }
            }
            tracing::debug!("camera monitor stopped");
        })
    }

    async fn poll_camera(&self, index: usize, endpoint: &CameraEndpoint) {
        let stats = self.fetch_stats(endpoint).await;

        let healthy = match &stats {
            None => false,
            Some(value) => {
                let age = value.get("time_since_last_frame").and_then(Value::as_f64);
                !matches!(age, Some(age) if age > self.config.monitor_timeout)
            }
        };

        let action = {
            let mut state = self.states[index].lock().expect("monitor lock");
            if let Some(stats) = stats {
                state.last_stats = Some(stats);
            }
            let action = decide(
                &mut state,
                healthy,
                self.now_secs(),
                self.config.restart_cooldown.as_secs_f64(),
                self.config.restart_max_count,
            );
            if state.auto_restart_disabled && action == MonitorAction::None && !healthy {
                tracing::warn!(
                    camera = %endpoint.name,
                    restarts = state.restart_count,
                    "restart budget exhausted, auto-restart disabled"
                );
            }
            action
        };

        if action == MonitorAction::Restart {
            tracing::warn!(
                camera = %endpoint.name,
                delay_secs = self.config.restart_delay.as_secs(),
                "camera stopped, scheduling restart"
            );
            tokio::time::sleep(self.config.restart_delay).await;
            self.issue_restart(endpoint).await;
        }
    }

    async fn fetch_stats(&self, endpoint: &CameraEndpoint) -> Option<Value> {
        let url = format!("{}/stats", endpoint.url);
        let response = self
            .client
            .get(&url)
            .timeout(STATS_TIMEOUT)
            .send()
            .await
            .ok()?;
        if !response.status().is_success() {
            return None;
        }
        response.json().await.ok()
    }

    async fn issue_restart(&self, endpoint: &CameraEndpoint) {
        let url = format!("{}/restart", endpoint.url);
        match self
            .client
            .post(&url)
            .timeout(RESTART_TIMEOUT)
            .send()
            .await
        {
            Ok(response) => {
                tracing::info!(
                    camera = %endpoint.name,
                    status = %response.status(),
                    "restart issued"
                );
            }
            Err(e) => {
                tracing::error!(camera = %endpoint.name, error = %e, "restart request failed");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn tick(
        state: &mut CameraMonitorState,
        healthy: bool,
        now: f64,
    ) -> MonitorAction {
        // cooldown 10 s, budget 2, mirroring the documented scenario.
        decide(state, healthy, now, 10.0, 2)
    }

    #[test]
    fn healthy_camera_never_restarts() {
        let mut state = CameraMonitorState::default();
        for i in 0..10 {
            assert_eq!(tick(&mut state, true, i as f64), MonitorAction::None);
        }
        assert_eq!(state.restart_count, 0);
        assert!(state.stop_reason.is_none());
    }

    #[test]
    fn one_restart_per_outage() {
        let mut state = CameraMonitorState::default();
        // A continuous outage polled three times issues one restart.
        assert_eq!(tick(&mut state, false, 0.0), MonitorAction::Restart);
        assert_eq!(tick(&mut state, false, 1.0), MonitorAction::None);
        assert_eq!(tick(&mut state, false, 2.0), MonitorAction::None);
        assert_eq!(state.restart_count, 1);
        assert_eq!(state.stop_reason, Some("no_frame"));
    }

    #[test]
    fn budget_exhausts_after_max_restarts() {
        let mut state = CameraMonitorState::default();
        // Outage 1.
        assert_eq!(tick(&mut state, false, 0.0), MonitorAction::Restart);
        // Recovery.
        assert_eq!(tick(&mut state, true, 5.0), MonitorAction::None);
        // Outage 2, after the cooldown.
        assert_eq!(tick(&mut state, false, 15.0), MonitorAction::Restart);
        // Recovery.
        assert_eq!(tick(&mut state, true, 20.0), MonitorAction::None);
        // Outage 3: budget of 2 spent, no restart, condition surfaced.
        assert_eq!(tick(&mut state, false, 30.0), MonitorAction::None);
        assert!(state.auto_restart_disabled);
        assert_eq!(state.restart_count, 2);
        assert_eq!(state.stop_reason, Some("no_frame"));
    }

    #[test]
    fn cooldown_defers_restart() {
        let mut state = CameraMonitorState::default();
        assert_eq!(tick(&mut state, false, 0.0), MonitorAction::Restart);
        assert_eq!(tick(&mut state, true, 2.0), MonitorAction::None);
        // New outage but inside the 10 s cooldown: deferred.
        assert_eq!(tick(&mut state, false, 5.0), MonitorAction::None);
        assert_eq!(state.restart_count, 1);
        // Cooldown over: the pending outage now restarts.
        assert_eq!(tick(&mut state, false, 11.0), MonitorAction::Restart);
        assert_eq!(state.restart_count, 2);
    }

    #[test]
    fn recovery_clears_stop_reason() {
        let mut state = CameraMonitorState::default();
        tick(&mut state, false, 0.0);
        assert!(state.stop_reason.is_some());
        tick(&mut state, true, 1.0);
        assert!(state.stop_reason.is_none());
    }
}
