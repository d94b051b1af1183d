// CPU throttle governor
//
// Gates schema mutations behind two safety checks: a pacing floor between
// mutations and a CPU busy threshold (instantaneous and averaged over a
// rolling window). Background work samples CPU on a fixed cadence so the
// window is populated even when no requests arrive.
//
// The governor never cancels running work. During a build it only watches for
// a hard ceiling breach and reports it.

use std::collections::VecDeque;
use std::fmt;
use std::sync::Arc;
use std::sync::Mutex;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};
use serde::Serialize;
use sysinfo::System;
use tokio::sync::Notify;
use tracing::{debug, info, warn};

use crate::config::ThrottleConfig;
use crate::metrics::SafeguardMetrics;

/// Source of CPU busy percentages. Swappable so tests can drive the governor
/// without touching the host.
pub trait CpuProbe: Send {
    /// Current CPU busy percentage in `0.0..=100.0`.
    fn sample(&mut self) -> f64;
}

/// Probe backed by sysinfo's global CPU accounting.
pub struct SysinfoProbe {
    system: System,
}

impl SysinfoProbe {
    pub fn new() -> Self {
        let mut system = System::new();
        // First refresh establishes the baseline; usage readings need two.
        system.refresh_cpu_all();
        Self { system }
    }
}

impl Default for SysinfoProbe {
    fn default() -> Self {
        Self::new()
    }
}

impl CpuProbe for SysinfoProbe {
    fn sample(&mut self) -> f64 {
        self.system.refresh_cpu_all();
        f64::from(self.system.global_cpu_usage())
    }
}

/// One CPU reading in the rolling window.
#[derive(Debug, Clone, Copy)]
pub struct CpuSample {
    pub taken_at: DateTime<Utc>,
    pub percent_busy: f64,
}

/// Why a mutation was declined.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub enum ThrottleReason {
    TooSoon {
        remaining_seconds: u64,
        min_interval_seconds: u64,
    },
    CpuHigh {
        current: f64,
        threshold: f64,
    },
    CpuAverageHigh {
        average: f64,
        threshold: f64,
        window_seconds: u64,
    },
}

impl fmt::Display for ThrottleReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ThrottleReason::TooSoon {
                remaining_seconds,
                min_interval_seconds,
            } => write!(
                f,
                "too soon after last mutation: {}s of {}s pacing interval remaining",
                remaining_seconds, min_interval_seconds
            ),
            ThrottleReason::CpuHigh { current, threshold } => write!(
                f,
                "CPU usage too high: {:.1}% exceeds {:.1}% threshold",
                current, threshold
            ),
            ThrottleReason::CpuAverageHigh {
                average,
                threshold,
                window_seconds,
            } => write!(
                f,
                "CPU usage too high: {:.1}% average over {}s exceeds {:.1}% threshold",
                average, window_seconds, threshold
            ),
        }
    }
}

/// Outcome of a throttle check.
#[derive(Debug, Clone)]
pub struct ThrottleDecision {
    pub reason: Option<ThrottleReason>,
    wait: Duration,
}

impl ThrottleDecision {
    fn allow() -> Self {
        Self {
            reason: None,
            wait: Duration::ZERO,
        }
    }

    fn deny(reason: ThrottleReason, wait: Duration) -> Self {
        Self {
            reason: Some(reason),
            wait,
        }
    }

    pub fn throttled(&self) -> bool {
        self.reason.is_some()
    }

    /// Exact wait before the next attempt can pass the same check.
    pub fn wait(&self) -> Duration {
        self.wait
    }

    /// Wait rounded up to whole seconds for operator-facing messages. Rounding
    /// up keeps "wait this long, then retry" honest.
    pub fn wait_seconds(&self) -> u64 {
        self.wait.as_secs_f64().ceil() as u64
    }
}

/// Result of waiting for CPU pressure to subside.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CooldownOutcome {
    Cooled { waited: Duration },
    TimedOut { waited: Duration },
}

impl CooldownOutcome {
    pub fn is_cooled(&self) -> bool {
        matches!(self, CooldownOutcome::Cooled { .. })
    }
}

/// Status view for operator tooling.
#[derive(Debug, Clone, Serialize)]
pub struct ThrottleStatus {
    pub throttled: bool,
    pub reason: Option<String>,
    pub wait_seconds: u64,
    pub current_cpu_percent: f64,
    pub average_cpu_percent: f64,
    pub cpu_threshold_percent: f64,
    pub hard_ceiling_percent: f64,
    pub samples_in_window: usize,
    pub seconds_since_last_mutation: Option<u64>,
}

struct GovernorState {
    probe: Box<dyn CpuProbe>,
    samples: VecDeque<CpuSample>,
    last_mutation: Option<Instant>,
}

pub struct ThrottleGovernor {
    state: Mutex<GovernorState>,
    metrics: Arc<SafeguardMetrics>,
    cpu_threshold: f64,
    hard_ceiling: f64,
    min_between: Duration,
    cooldown: Duration,
    window: Duration,
    sample_interval: Duration,
    cooldown_poll: Duration,
}

impl ThrottleGovernor {
    pub fn new(config: &ThrottleConfig, metrics: Arc<SafeguardMetrics>) -> Self {
        Self::with_probe(config, metrics, Box::new(SysinfoProbe::new()))
    }

    pub fn with_probe(
        config: &ThrottleConfig,
        metrics: Arc<SafeguardMetrics>,
        probe: Box<dyn CpuProbe>,
    ) -> Self {
        Self {
            state: Mutex::new(GovernorState {
                probe,
                samples: VecDeque::new(),
                last_mutation: None,
            }),
            metrics,
            cpu_threshold: config.cpu_threshold_percent,
            hard_ceiling: config.hard_ceiling_percent,
            min_between: config.min_between_mutations(),
            cooldown: config.cooldown(),
            window: config.window(),
            sample_interval: config.sample_interval(),
            cooldown_poll: config.cooldown_poll(),
        }
    }

    pub fn sample_interval(&self) -> Duration {
        self.sample_interval
    }

    /// Take one CPU reading into the rolling window and return it.
    pub fn sample_now(&self) -> f64 {
        let mut state = self.state.lock().unwrap();
        self.push_sample(&mut state)
    }

    fn push_sample(&self, state: &mut GovernorState) -> f64 {
        let percent_busy = state.probe.sample().clamp(0.0, 100.0);
        state.samples.push_back(CpuSample {
            taken_at: Utc::now(),
            percent_busy,
        });
        self.trim_window(state);
        percent_busy
    }

    fn trim_window(&self, state: &mut GovernorState) {
        let cutoff = Utc::now()
            - chrono::Duration::from_std(self.window).unwrap_or(chrono::Duration::seconds(60));
        while let Some(front) = state.samples.front() {
            if front.taken_at < cutoff {
                state.samples.pop_front();
            } else {
                break;
            }
        }
    }

    fn window_average(state: &GovernorState) -> Option<f64> {
        if state.samples.is_empty() {
            return None;
        }
        let sum: f64 = state.samples.iter().map(|s| s.percent_busy).sum();
        Some(sum / state.samples.len() as f64)
    }

    fn evaluate(&self, state: &mut GovernorState, record: bool) -> ThrottleDecision {
        // Pacing floor first; it needs no fresh sample.
        if let Some(last) = state.last_mutation {
            let elapsed = last.elapsed();
            if elapsed < self.min_between {
                let wait = self.min_between - elapsed;
                if record {
                    self.metrics.record_rate_limit_trigger();
                }
                return ThrottleDecision::deny(
                    ThrottleReason::TooSoon {
                        remaining_seconds: wait.as_secs_f64().ceil() as u64,
                        min_interval_seconds: self.min_between.as_secs(),
                    },
                    wait,
                );
            }
        }

        let current = self.push_sample(state);
        if current > self.cpu_threshold {
            if record {
                self.metrics.record_cpu_throttle_trigger();
            }
            return ThrottleDecision::deny(
                ThrottleReason::CpuHigh {
                    current,
                    threshold: self.cpu_threshold,
                },
                self.cooldown,
            );
        }

        if let Some(average) = Self::window_average(state) {
            if average > self.cpu_threshold {
                if record {
                    self.metrics.record_cpu_throttle_trigger();
                }
                return ThrottleDecision::deny(
                    ThrottleReason::CpuAverageHigh {
                        average,
                        threshold: self.cpu_threshold,
                        window_seconds: self.window.as_secs(),
                    },
                    self.cooldown,
                );
            }
        }

        ThrottleDecision::allow()
    }

    /// Gate check for a schema mutation. Records safeguard metrics on denial.
    pub fn should_throttle(&self) -> ThrottleDecision {
        let mut state = self.state.lock().unwrap();
        let decision = self.evaluate(&mut state, true);
        if let Some(reason) = &decision.reason {
            debug!("⏳ Throttling mutation: {}", reason);
        }
        decision
    }

    /// Record that a mutation finished, starting the pacing interval.
    pub fn mark_mutation_complete(&self) {
        let mut state = self.state.lock().unwrap();
        state.last_mutation = Some(Instant::now());
    }

    /// Block (async) until CPU drops under the threshold or `max_wait` passes.
    /// Background maintenance uses this instead of failing fast.
    pub async fn wait_for_cooldown(&self, max_wait: Duration) -> CooldownOutcome {
        let started = Instant::now();
        loop {
            let calm = {
                let mut state = self.state.lock().unwrap();
                let current = self.push_sample(&mut state);
                let average = Self::window_average(&state).unwrap_or(current);
                current <= self.cpu_threshold && average <= self.cpu_threshold
            };
            let waited = started.elapsed();
            if calm {
                if waited > Duration::ZERO {
                    debug!("CPU settled after {:.1}s of cooldown", waited.as_secs_f64());
                }
                return CooldownOutcome::Cooled { waited };
            }
            if waited >= max_wait {
                warn!(
                    "CPU did not settle within {:.0}s cooldown budget",
                    max_wait.as_secs_f64()
                );
                return CooldownOutcome::TimedOut { waited };
            }
            tokio::time::sleep(self.cooldown_poll).await;
        }
    }

    /// Run `operation` while watching for hard-ceiling breaches. The watcher
    /// never cancels the operation; on breach it records a warning metric,
    /// logs once, and stands down. Returns the operation result and whether
    /// the ceiling was breached.
    pub async fn monitor_during_operation<F, T>(self: Arc<Self>, name: &str, operation: F) -> (T, bool)
    where
        F: Future<Output = T>,
    {
        let breached = Arc::new(AtomicBool::new(false));
        let stop = Arc::new(Notify::new());

        let watcher = {
            let governor = Arc::clone(&self);
            let breached = Arc::clone(&breached);
            let stop = Arc::clone(&stop);
            let name = name.to_string();
            tokio::spawn(async move {
                let mut ticker = tokio::time::interval(governor.sample_interval);
                loop {
                    tokio::select! {
                        _ = stop.notified() => break,
                        _ = ticker.tick() => {
                            let current = governor.sample_now();
                            if current > governor.hard_ceiling {
                                breached.store(true, Ordering::SeqCst);
                                governor.metrics.record_cpu_ceiling_warning();
                                warn!(
                                    "🔥 CPU at {:.1}% breached hard ceiling {:.1}% during '{}' (letting it finish)",
                                    current, governor.hard_ceiling, name
                                );
                                break;
                            }
                        }
                    }
                }
            })
        };

        let result = operation.await;
        stop.notify_one();
        let _ = watcher.await;

        (result, breached.load(Ordering::SeqCst))
    }

    /// Side-effect-free status view; never bumps safeguard counters.
    pub fn status(&self) -> ThrottleStatus {
        let mut state = self.state.lock().unwrap();
        let seconds_since_last_mutation = state.last_mutation.map(|t| t.elapsed().as_secs());
        let decision = self.evaluate(&mut state, false);
        let current = state
            .samples
            .back()
            .map(|s| s.percent_busy)
            .unwrap_or_default();
        let average = Self::window_average(&state).unwrap_or(current);

        ThrottleStatus {
            throttled: decision.throttled(),
            reason: decision.reason.as_ref().map(|r| r.to_string()),
            wait_seconds: decision.wait_seconds(),
            current_cpu_percent: current,
            average_cpu_percent: average,
            cpu_threshold_percent: self.cpu_threshold,
            hard_ceiling_percent: self.hard_ceiling,
            samples_in_window: state.samples.len(),
            seconds_since_last_mutation,
        }
    }

    /// Announce the governor in the startup log.
    pub fn log_startup(&self) {
        info!(
            "🌡️ Throttle governor ready: threshold {:.0}%, ceiling {:.0}%, pacing {}s",
            self.cpu_threshold,
            self.hard_ceiling,
            self.min_between.as_secs()
        );
    }
}
