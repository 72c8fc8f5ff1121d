use super::cycle::{CycleMode, MonitorCycle};
use crate::settings::MonitorSettings;
use std::time::Duration;
use tokio::sync::watch;
use tokio::time::{Instant, MissedTickBehavior};

/// Totals over the lifetime of a loop
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct LoopStats {
    pub cycles: u64,
    pub calc_passes: u64,
    pub failed_cycles: u64,
    pub symbol_failures: u64,
    pub events: u64,
}

/// Runs a [`MonitorCycle`] on a fixed interval until shutdown.
///
/// Cycles are awaited inline, so at most one is ever in flight. Ticks missed while a cycle
/// overruns are skipped rather than queued: the next cycle waits for the next aligned tick.
pub struct MonitorLoop {
    cycle: MonitorCycle,
    interval: Duration,
    recalc_every: u32,
}

impl MonitorLoop {
    pub fn new(cycle: MonitorCycle, settings: &MonitorSettings) -> Self {
        Self {
            cycle,
            interval: settings.interval(),
            recalc_every: settings.recalc_every_cycles,
        }
    }

    /// Calc on the first tick and every `recalc_every` ticks after it; monitor otherwise
    pub fn mode_for_tick(&self, tick: u64) -> CycleMode {
        if self.recalc_every > 0 && tick % self.recalc_every as u64 == 0 {
            CycleMode::Calc
        } else {
            CycleMode::Monitor
        }
    }

    /// First aligned tick after a cycle that ran for `elapsed`, or `None` if it fit the interval
    fn next_tick_after_overrun(&self, started: Instant, elapsed: Duration) -> Option<Instant> {
        if self.interval.is_zero() || elapsed <= self.interval {
            return None;
        }

        let periods = elapsed.as_nanos().div_ceil(self.interval.as_nanos());
        let periods = u32::try_from(periods).unwrap_or(u32::MAX);
        Some(started + self.interval.saturating_mul(periods))
    }

    pub async fn run(&self, mut shutdown: watch::Receiver<bool>) -> LoopStats {
        let mut ticker = tokio::time::interval(self.interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);

        let mut stats = LoopStats::default();
        let mut tick: u64 = 0;

        tracing::info!(
            "Monitor loop started (interval {}s, recalc every {} cycles)",
            self.interval.as_secs(),
            self.recalc_every
        );

        loop {
            tokio::select! {
                _ = ticker.tick() => {}
                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        break;
                    }
                    continue;
                }
            }

            if *shutdown.borrow() {
                break;
            }

            let mode = self.mode_for_tick(tick);
            tick += 1;
            let started = Instant::now();

            match self.cycle.run(mode, &shutdown).await {
                Ok(report) => {
                    stats.cycles += 1;
                    if mode == CycleMode::Calc {
                        stats.calc_passes += 1;
                    }
                    stats.symbol_failures += report.failures.len() as u64;
                    stats.events += report.events.len() as u64;
                }
                Err(e) => {
                    stats.cycles += 1;
                    stats.failed_cycles += 1;
                    tracing::error!("Cycle {} failed: {}", tick, e);
                }
            }

            if let Some(next) = self.next_tick_after_overrun(started, started.elapsed()) {
                tracing::warn!(
                    "Cycle {} took {}s, longer than the {}s interval; skipping missed ticks",
                    tick,
                    started.elapsed().as_secs(),
                    self.interval.as_secs()
                );
                ticker.reset_at(next);
            }
        }

        tracing::info!(
            "Monitor loop stopped after {} cycles ({} failed, {} crossings)",
            stats.cycles,
            stats.failed_cycles,
            stats.events
        );

        stats
    }
}
