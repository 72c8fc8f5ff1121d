use super::{PocStore, PriceStore, StorageError};
use crate::models::{CrossoverEvent, PocLevelSet, PriceSnapshot};
use async_trait::async_trait;
use std::collections::{HashMap, HashSet};
use std::sync::{Mutex, MutexGuard};
use uuid::Uuid;

#[derive(Debug, Default)]
struct MemoryState {
    levels: HashMap<String, PocLevelSet>,
    prices: HashMap<String, PriceSnapshot>,
    events: Vec<CrossoverEvent>,
    notified: HashSet<Uuid>,
    passing_event_appends: usize,
    failing_event_appends: usize,
}

/// In-process store implementing both storage traits.
///
/// Backs the monitor in tests; nothing survives the process.
#[derive(Debug, Default)]
pub struct MemoryStore {
    state: Mutex<MemoryState>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Make the next `count` event appends fail with a transient error
    pub fn fail_next_event_appends(&self, count: usize) {
        self.fail_event_appends_after(0, count);
    }

    /// Let `after` event appends through, then fail the following `count`
    pub fn fail_event_appends_after(&self, after: usize, count: usize) {
        let mut state = self.lock();
        state.passing_event_appends = after;
        state.failing_event_appends = count;
    }

    pub fn events(&self) -> Vec<CrossoverEvent> {
        self.lock().events.clone()
    }

    pub fn is_notified(&self, id: Uuid) -> bool {
        self.lock().notified.contains(&id)
    }

    pub fn poc_levels(&self) -> Vec<PocLevelSet> {
        let mut all: Vec<PocLevelSet> = self.lock().levels.values().cloned().collect();
        all.sort_by(|a, b| a.symbol.cmp(&b.symbol));
        all
    }

    fn lock(&self) -> MutexGuard<'_, MemoryState> {
        self.state.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

#[async_trait]
impl PocStore for MemoryStore {
    async fn load_poc_levels(&self, symbol: &str) -> Result<Option<PocLevelSet>, StorageError> {
        Ok(self.lock().levels.get(symbol).cloned())
    }

    async fn save_poc_levels(&self, levels: &PocLevelSet) -> Result<(), StorageError> {
        self.lock()
            .levels
            .insert(levels.symbol.clone(), levels.clone());
        Ok(())
    }

    async fn append_crossover_event(&self, event: &CrossoverEvent) -> Result<(), StorageError> {
        let mut state = self.lock();

        if state.passing_event_appends > 0 {
            state.passing_event_appends -= 1;
        } else if state.failing_event_appends > 0 {
            state.failing_event_appends -= 1;
            return Err(StorageError::Unavailable("injected failure".to_string()));
        }

        if !state.events.iter().any(|e| e.id == event.id) {
            state.events.push(event.clone());
        }
        Ok(())
    }

    async fn mark_event_notified(&self, id: Uuid) -> Result<(), StorageError> {
        self.lock().notified.insert(id);
        Ok(())
    }
}

#[async_trait]
impl PriceStore for MemoryStore {
    async fn load_last_price(&self, symbol: &str) -> Result<Option<PriceSnapshot>, StorageError> {
        Ok(self.lock().prices.get(symbol).cloned())
    }

    async fn save_last_price(&self, snapshot: &PriceSnapshot) -> Result<(), StorageError> {
        self.lock()
            .prices
            .insert(snapshot.symbol.clone(), snapshot.clone());
        Ok(())
    }
}
