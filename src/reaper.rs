//! Background loop that stops sandboxes whose containers sit idle.
//!
//! Each tick samples CPU counters for a snapshot of the registry. A sandbox
//! at or below the idle threshold becomes a suspect; once it has been a
//! suspect for the grace period it is evicted and stopped. Any busy sample,
//! any request activity on the handle, or a request still in flight clears
//! the suspicion.

use crate::config::ReaperConfig;
use crate::engine::{cpu_percent, ContainerEngine, CpuCounters};
use crate::state::SessionRegistry;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::task::JoinHandle;
use tokio::time::{interval, Instant, MissedTickBehavior};
use tracing::{debug, info, warn};

#[derive(Debug, Clone, Copy, PartialEq)]
pub enum IdleState {
    Active,
    Suspect { since: Instant },
}

#[derive(Debug, Clone)]
struct Tracked {
    state: IdleState,
    last_sample: CpuCounters,
    last_activity: u64,
}

pub struct IdleReaper {
    registry: Arc<SessionRegistry>,
    engine: Arc<dyn ContainerEngine>,
    config: ReaperConfig,
    tracked: HashMap<String, Tracked>,
}

impl IdleReaper {
    pub fn new(registry: Arc<SessionRegistry>, config: ReaperConfig) -> Self {
        let engine = registry.engine().clone();
        Self {
            registry,
            engine,
            config,
            tracked: HashMap::new(),
        }
    }

    /// Spawn the loop. Runs until the runtime shuts down.
    pub fn spawn(mut self) -> JoinHandle<()> {
        tokio::spawn(async move {
            let mut ticker = interval(self.config.interval());
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            info!(
                interval_secs = self.config.interval_secs,
                grace_secs = self.config.idle_grace_secs,
                threshold = self.config.idle_threshold,
                "Idle reaper started"
            );
            loop {
                ticker.tick().await;
                self.tick(Instant::now()).await;
            }
        })
    }

    pub fn state(&self, session_id: &str) -> Option<IdleState> {
        self.tracked.get(session_id).map(|t| t.state)
    }

    /// One sampling round. Returns the sessions reaped in this round.
    pub async fn tick(&mut self, now: Instant) -> Vec<String> {
        let snapshot = self.registry.list().await;
        self.tracked
            .retain(|session, _| snapshot.iter().any(|e| &e.session_id == session));

        let mut reaped = Vec::new();
        for entry in snapshot {
            let sample = match self.engine.stats(&entry.container_name).await {
                Ok(sample) => sample,
                Err(e) if e.is_not_found() => {
                    warn!(session = %entry.session_id, "Container vanished; evicting");
                    self.tracked.remove(&entry.session_id);
                    self.reap(&entry.session_id).await;
                    reaped.push(entry.session_id);
                    continue;
                }
                Err(e) => {
                    warn!(session = %entry.session_id, error = %e, "Stats sampling failed; skipping");
                    continue;
                }
            };

            let Some(tracked) = self.tracked.get_mut(&entry.session_id) else {
                self.tracked.insert(
                    entry.session_id.clone(),
                    Tracked {
                        state: IdleState::Active,
                        last_sample: sample,
                        last_activity: entry.activity,
                    },
                );
                continue;
            };

            let usage = cpu_percent(&tracked.last_sample, &sample);
            tracked.last_sample = sample;
            let touched = tracked.last_activity != entry.activity;
            tracked.last_activity = entry.activity;
            debug!(session = %entry.session_id, usage, touched, busy = entry.busy, "sampled");

            if entry.busy || touched || usage > self.config.idle_threshold {
                tracked.state = IdleState::Active;
                continue;
            }

            let state = tracked.state;
            match state {
                IdleState::Active => {
                    tracked.state = IdleState::Suspect { since: now };
                }
                IdleState::Suspect { since } if now.duration_since(since) >= self.config.grace() => {
                    info!(session = %entry.session_id, usage, "Reaping idle sandbox");
                    self.tracked.remove(&entry.session_id);
                    self.reap(&entry.session_id).await;
                    reaped.push(entry.session_id);
                }
                IdleState::Suspect { .. } => {}
            }
        }
        reaped
    }

    async fn reap(&self, session_id: &str) {
        // Nothing to stop if a kill request won the race.
        if let Err(e) = self.registry.evict_and_stop(session_id).await {
            warn!(session = session_id, error = %e, "Failed to stop reaped sandbox");
        }
    }
}
