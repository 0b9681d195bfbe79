use std::{
    sync::{
        Arc, Mutex,
        atomic::{AtomicBool, AtomicU64, Ordering},
    },
    thread,
    time::{Duration, SystemTime, UNIX_EPOCH},
};

use tracing::error;

use crate::vision::telemetry;

pub(crate) const WATCHDOG_POLL_INTERVAL_MS: u64 = 500;
/// Longer than the capture timeout so a dead source reports its own error first.
pub(crate) const WATCHDOG_STALE_THRESHOLD_MS: u64 = 10_000;
pub(crate) const WATCHDOG_STARTUP_GRACE_MS: u64 = 15_000;

#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub(crate) enum HealthComponent {
    Capture,
    PostProcess,
}

impl HealthComponent {
    pub(crate) fn label(self) -> &'static str {
        match self {
            HealthComponent::Capture => "capture",
            HealthComponent::PostProcess => "post-processing",
        }
    }
}

/// Last heartbeat per stage, in unix milliseconds.
pub(crate) struct PipelineHealth {
    capture: AtomicU64,
    postprocess: AtomicU64,
}

impl PipelineHealth {
    pub(crate) fn new() -> Self {
        Self::with_grace(WATCHDOG_STARTUP_GRACE_MS)
    }

    fn with_grace(grace_ms: u64) -> Self {
        let grace_deadline = current_millis().saturating_add(grace_ms);
        Self {
            capture: AtomicU64::new(grace_deadline),
            postprocess: AtomicU64::new(grace_deadline),
        }
    }

    pub(crate) fn beat(&self, component: HealthComponent) {
        self.slot(component).store(current_millis(), Ordering::Relaxed);
    }

    fn slot(&self, component: HealthComponent) -> &AtomicU64 {
        match component {
            HealthComponent::Capture => &self.capture,
            HealthComponent::PostProcess => &self.postprocess,
        }
    }

    pub(crate) fn stale_component(&self, now: u64, threshold_ms: u64) -> Option<HealthComponent> {
        [HealthComponent::Capture, HealthComponent::PostProcess]
            .into_iter()
            .find(|component| {
                now.saturating_sub(self.slot(*component).load(Ordering::Relaxed)) > threshold_ms
            })
    }
}

pub(crate) struct WatchdogState {
    triggered: AtomicBool,
    reason: Mutex<Option<HealthComponent>>,
}

impl WatchdogState {
    pub(crate) fn new() -> Self {
        Self {
            triggered: AtomicBool::new(false),
            reason: Mutex::new(None),
        }
    }

    pub(crate) fn arm(&self, component: HealthComponent) {
        if let Ok(mut guard) = self.reason.lock() {
            *guard = Some(component);
        }
        self.triggered.store(true, Ordering::SeqCst);
    }

    pub(crate) fn is_triggered(&self) -> bool {
        self.triggered.load(Ordering::SeqCst)
    }

    pub(crate) fn reason(&self) -> Option<HealthComponent> {
        match self.reason.lock() {
            Ok(guard) => *guard,
            Err(_) => None,
        }
    }
}

pub(crate) fn spawn_watchdog(
    health: Arc<PipelineHealth>,
    running: Arc<AtomicBool>,
    state: Arc<WatchdogState>,
) -> thread::JoinHandle<()> {
    spawn_watchdog_with(
        health,
        running,
        state,
        Duration::from_millis(WATCHDOG_POLL_INTERVAL_MS),
        WATCHDOG_STALE_THRESHOLD_MS,
    )
}

fn spawn_watchdog_with(
    health: Arc<PipelineHealth>,
    running: Arc<AtomicBool>,
    state: Arc<WatchdogState>,
    poll: Duration,
    threshold_ms: u64,
) -> thread::JoinHandle<()> {
    telemetry::spawn_thread("linecam-watchdog", move || {
        while running.load(Ordering::Relaxed) {
            thread::sleep(poll);
            if let Some(component) = health.stale_component(current_millis(), threshold_ms) {
                error!(
                    "Watchdog detected stalled {} stage; stopping pipeline",
                    component.label()
                );
                state.arm(component);
                running.store(false, Ordering::SeqCst);
                break;
            }
        }
    })
    .expect("failed to spawn watchdog thread")
}

fn current_millis() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or_default()
}
