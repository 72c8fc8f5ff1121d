use crate::settings::ExchangeSettings;
use std::collections::VecDeque;
use std::sync::{Mutex, MutexGuard};
use std::time::Duration;
use tokio::time::Instant;

/// Sliding-log accounting of request weight against the exchange's per-window ceiling.
///
/// Shared by every concurrent fetch task, so all state sits behind one mutex that is
/// never held across an await.
pub struct RateBudget {
    limit: u32,
    window: Duration,
    state: Mutex<BudgetState>,
}

#[derive(Debug, Default)]
struct BudgetState {
    /// (reserved_at, weight), oldest first
    log: VecDeque<(Instant, u32)>,
    consumed: u32,
    /// Last authoritative weight reported by the exchange
    reported: Option<(Instant, u32)>,
    blocked_until: Option<Instant>,
}

impl RateBudget {
    /// `ceiling * safety_margin` (rounded down) is the weight we allow ourselves per window
    pub fn new(ceiling: u32, safety_margin: f64, window: Duration) -> Self {
        let limit = (ceiling as f64 * safety_margin).floor().max(1.0) as u32;
        Self {
            limit,
            window,
            state: Mutex::new(BudgetState::default()),
        }
    }

    pub fn from_settings(settings: &ExchangeSettings) -> Self {
        Self::new(
            settings.weight_limit,
            settings.safety_margin,
            settings.weight_window(),
        )
    }

    pub fn effective_limit(&self) -> u32 {
        self.limit
    }

    /// Weight currently attributed to the window, local log or exchange report, whichever is larger
    pub fn consumed(&self) -> u32 {
        let mut state = self.lock();
        let now = Instant::now();
        self.evict(&mut state, now);
        let reported = state.reported.map(|(_, w)| w).unwrap_or(0);
        state.consumed.max(reported)
    }

    /// Try to reserve `cost`. Zero means the reservation was recorded; anything else is
    /// how long the caller must sleep before trying again.
    pub fn reserve(&self, cost: u32) -> Duration {
        let now = Instant::now();
        let mut state = self.lock();
        self.evict(&mut state, now);

        if let Some(until) = state.blocked_until {
            if until > now {
                return until - now;
            }
            state.blocked_until = None;
        }

        // A single request heavier than the whole budget still has to go through eventually
        let cost = cost.min(self.limit);

        if state.consumed + cost > self.limit {
            if let Some(&(oldest, _)) = state.log.front() {
                return (oldest + self.window).saturating_duration_since(now);
            }
        }

        if let Some((reported_at, weight)) = state.reported {
            if weight + cost > self.limit {
                return (reported_at + self.window).saturating_duration_since(now);
            }
        }

        state.log.push_back((now, cost));
        state.consumed += cost;
        if let Some((_, weight)) = state.reported.as_mut() {
            *weight += cost;
        }

        Duration::ZERO
    }

    /// Reserve `cost`, sleeping as long as the budget demands
    pub async fn acquire(&self, cost: u32) {
        loop {
            let wait = self.reserve(cost);
            if wait.is_zero() {
                return;
            }
            tracing::warn!(
                "Request budget exhausted ({}/{}), waiting {:.1}s",
                self.consumed(),
                self.limit,
                wait.as_secs_f64()
            );
            tokio::time::sleep(wait).await;
        }
    }

    /// Fold in what the exchange told us about a response.
    ///
    /// `weight_used` replaces our estimate with the authoritative count; `retry_after`
    /// blocks all reservations for that long, overriding the locally computed wait.
    pub fn record_response(&self, weight_used: Option<u32>, retry_after: Option<Duration>) {
        let now = Instant::now();
        let mut state = self.lock();

        if let Some(weight) = weight_used {
            state.reported = Some((now, weight));
        }
        if let Some(wait) = retry_after {
            Self::block(&mut state, now + wait);
        }
    }

    /// Mandated backoff, e.g. after an IP ban. Never shortens an existing block.
    pub fn penalize(&self, duration: Duration) {
        let now = Instant::now();
        let mut state = self.lock();
        Self::block(&mut state, now + duration);
    }

    /// Remaining mandated backoff, if any
    pub fn blocked_for(&self) -> Option<Duration> {
        let now = Instant::now();
        let state = self.lock();
        state
            .blocked_until
            .filter(|until| *until > now)
            .map(|until| until - now)
    }

    fn block(state: &mut BudgetState, until: Instant) {
        state.blocked_until = Some(match state.blocked_until {
            Some(existing) if existing > until => existing,
            _ => until,
        });
    }

    fn evict(&self, state: &mut BudgetState, now: Instant) {
        while let Some(&(at, weight)) = state.log.front() {
            if at + self.window > now {
                break;
            }
            state.log.pop_front();
            state.consumed -= weight;
        }

        if let Some((reported_at, _)) = state.reported {
            if reported_at + self.window <= now {
                state.reported = None;
            }
        }
    }

    fn lock(&self) -> MutexGuard<'_, BudgetState> {
        self.state.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}
