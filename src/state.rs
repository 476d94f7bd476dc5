//! In-memory tumbling window of the latest value per station and parameter.
//!
//! The store is owned by the engine and shared via `Arc`; every operation is
//! one short critical section and the lock is never held across I/O.

use std::collections::HashMap;
use std::sync::{Mutex, MutexGuard};

/// Latest known value for each parameter of one station.
///
/// A parameter that has not been observed is absent from `parameters`, which
/// is distinct from an observed value of `0.0`.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct StationState {
    pub station_id: String,
    pub parameters: HashMap<String, f64>,
}

impl StationState {
    pub fn new(station_id: &str) -> Self {
        Self {
            station_id: station_id.to_string(),
            parameters: HashMap::new(),
        }
    }

    pub fn get(&self, parameter: &str) -> Option<f64> {
        self.parameters.get(parameter).copied()
    }

    pub fn len(&self) -> usize {
        self.parameters.len()
    }

    pub fn is_empty(&self) -> bool {
        self.parameters.is_empty()
    }
}

#[derive(Debug, Default)]
pub struct StationStateStore {
    stations: Mutex<HashMap<String, StationState>>,
}

impl StationStateStore {
    pub fn new() -> Self {
        Self::default()
    }

    // Every critical section is a single insert or swap, so a poisoned map
    // is still consistent.
    fn lock(&self) -> MutexGuard<'_, HashMap<String, StationState>> {
        self.stations
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Records `value` for `parameter` at `station_id`, creating the station
    /// entry on first sight. Last write wins.
    pub fn upsert(&self, station_id: &str, parameter: &str, value: f64) {
        let mut stations = self.lock();
        stations
            .entry(station_id.to_string())
            .or_insert_with(|| StationState::new(station_id))
            .parameters
            .insert(parameter.to_string(), value);
    }

    /// Atomically takes the whole window and leaves the store empty.
    ///
    /// An `upsert` that acquires the lock after this returns lands in the
    /// next window.
    pub fn snapshot_and_clear(&self) -> HashMap<String, StationState> {
        std::mem::take(&mut *self.lock())
    }

    pub fn station_count(&self) -> usize {
        self.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.lock().is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::thread;

    #[test]
    fn test_upsert_creates_station_lazily() {
        let store = StationStateStore::new();
        assert!(store.is_empty());

        store.upsert("BREPON", "ph", 7.0);

        let snapshot = store.snapshot_and_clear();
        assert_eq!(snapshot.len(), 1);
        assert_eq!(snapshot["BREPON"].station_id, "BREPON");
        assert_eq!(snapshot["BREPON"].get("ph"), Some(7.0));
    }

    #[test]
    fn test_last_write_wins() {
        let store = StationStateStore::new();
        store.upsert("BREPON", "ph", 7.0);
        store.upsert("BREPON", "ph", 8.1);

        let snapshot = store.snapshot_and_clear();
        assert_eq!(snapshot["BREPON"].len(), 1);
        assert_eq!(snapshot["BREPON"].get("ph"), Some(8.1));
    }

    #[test]
    fn test_absent_differs_from_zero() {
        let store = StationStateStore::new();
        store.upsert("BREPON", "amonio", 0.0);

        let snapshot = store.snapshot_and_clear();
        assert_eq!(snapshot["BREPON"].get("amonio"), Some(0.0));
        assert_eq!(snapshot["BREPON"].get("ph"), None);
    }

    #[test]
    fn test_snapshot_clears_store() {
        let store = StationStateStore::new();
        store.upsert("BREPON", "ph", 7.0);
        store.upsert("KEWPON", "ph", 7.4);

        assert_eq!(store.snapshot_and_clear().len(), 2);
        assert!(store.is_empty());
        assert!(store.snapshot_and_clear().is_empty());
    }

    #[test]
    fn test_upsert_after_snapshot_lands_in_next_window() {
        let store = StationStateStore::new();
        store.upsert("BREPON", "ph", 7.0);

        let first = store.snapshot_and_clear();
        store.upsert("BREPON", "temperatura", 12.0);

        assert_eq!(first["BREPON"].get("temperatura"), None);
        let second = store.snapshot_and_clear();
        assert_eq!(second["BREPON"].get("temperatura"), Some(12.0));
        assert_eq!(second["BREPON"].get("ph"), None);
    }

    #[test]
    fn test_concurrent_upserts_are_not_lost() {
        let store = Arc::new(StationStateStore::new());
        let n = 64;

        let handles: Vec<_> = (0..n)
            .map(|i| {
                let store = store.clone();
                thread::spawn(move || store.upsert("BREPON", &format!("p{i}"), i as f64))
            })
            .collect();
        for h in handles {
            h.join().unwrap();
        }

        let snapshot = store.snapshot_and_clear();
        let station = &snapshot["BREPON"];
        assert_eq!(station.len(), n);
        for i in 0..n {
            assert_eq!(station.get(&format!("p{i}")), Some(i as f64));
        }
        assert!(store.is_empty());
    }

    #[test]
    fn test_concurrent_drain_never_loses_or_duplicates() {
        let store = Arc::new(StationStateStore::new());
        let writers = 4;
        let per_writer = 250;

        let handles: Vec<_> = (0..writers)
            .map(|w| {
                let store = store.clone();
                thread::spawn(move || {
                    for i in 0..per_writer {
                        store.upsert(&format!("S{w}"), &format!("p{i}"), i as f64);
                    }
                })
            })
            .collect();

        let mut collected = 0;
        while handles.iter().any(|h| !h.is_finished()) {
            collected += store
                .snapshot_and_clear()
                .values()
                .map(StationState::len)
                .sum::<usize>();
        }
        for h in handles {
            h.join().unwrap();
        }
        collected += store
            .snapshot_and_clear()
            .values()
            .map(StationState::len)
            .sum::<usize>();

        // Parameter names are unique per writer, so every update is counted
        // exactly once across all windows.
        assert_eq!(collected, writers * per_writer);
    }
}
