use chrono::{DateTime, Utc};
use std::collections::HashMap;
use std::sync::{Arc, Mutex, PoisonError, RwLock};

use crate::measurement::{ConnectionStatus, DeviceSnapshot, Measurement};

/// What one tick learned about one device across all of its sources.
#[derive(Debug, Clone, Default)]
pub struct DeviceUpdate {
    pub measurements: Vec<Measurement>,
    pub succeeded: usize,
    pub failed: usize,
}

/// One device's current snapshot. The lock is held for the whole merge, so
/// merges into the same device never interleave; readers only clone the `Arc`.
struct Slot {
    current: Mutex<Arc<DeviceSnapshot>>,
}

/// Last-known-good snapshot per device.
#[derive(Default)]
pub struct SnapshotCache {
    slots: RwLock<HashMap<String, Arc<Slot>>>,
}

impl SnapshotCache {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self, serial_number: &str) -> Option<Arc<DeviceSnapshot>> {
        let slots = self.slots.read().unwrap_or_else(PoisonError::into_inner);
        let slot = slots.get(serial_number)?;
        let current = slot.current.lock().unwrap_or_else(PoisonError::into_inner);
        Some(current.clone())
    }

    fn slot(&self, serial_number: &str) -> Arc<Slot> {
        if let Some(slot) = self
            .slots
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(serial_number)
        {
            return slot.clone();
        }
        self.slots
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .entry(serial_number.to_string())
            .or_insert_with(|| {
                Arc::new(Slot {
                    current: Mutex::new(Arc::new(DeviceSnapshot::empty(serial_number))),
                })
            })
            .clone()
    }

    /// Folds a tick's results into the device's snapshot and returns the new one.
    ///
    /// Metrics from failed sources are left as they were, and a metric is never
    /// replaced by one with an older timestamp.
    pub fn merge(
        &self,
        serial_number: &str,
        update: DeviceUpdate,
        failure_threshold: u32,
        now: DateTime<Utc>,
    ) -> Arc<DeviceSnapshot> {
        let slot = self.slot(serial_number);
        let mut current = slot.current.lock().unwrap_or_else(PoisonError::into_inner);

        let mut next = DeviceSnapshot::clone(&current);
        for measurement in update.measurements {
            let newer = next
                .metrics
                .get(&measurement.metric_code)
                .map_or(true, |known| measurement.timestamp >= known.timestamp);
            if newer {
                next.metrics
                    .insert(measurement.metric_code.clone(), measurement);
            }
        }

        if update.succeeded > 0 {
            next.consecutive_failures = 0;
            next.last_success_timestamp = Some(now);
            next.connection_status = if update.failed == 0 {
                ConnectionStatus::Connected
            } else {
                ConnectionStatus::Degraded
            };
        } else if update.failed > 0 {
            next.consecutive_failures = next.consecutive_failures.saturating_add(1);
            next.connection_status = if next.consecutive_failures >= failure_threshold {
                ConnectionStatus::Disconnected
            } else {
                ConnectionStatus::Degraded
            };
        }

        let next = Arc::new(next);
        *current = next.clone();
        next
    }

    pub fn remove(&self, serial_number: &str) -> bool {
        self.slots
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(serial_number)
            .is_some()
    }

    pub fn len(&self) -> usize {
        self.slots
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::measurement::MetricKind;
    use chrono::Duration;

    fn reading(code: &str, value: f64, at: DateTime<Utc>) -> Measurement {
        Measurement::new(code, value, "W", MetricKind::Power, at)
    }

    fn success(measurements: Vec<Measurement>) -> DeviceUpdate {
        DeviceUpdate {
            measurements,
            succeeded: 1,
            failed: 0,
        }
    }

    fn failure() -> DeviceUpdate {
        DeviceUpdate {
            measurements: Vec::new(),
            succeeded: 0,
            failed: 1,
        }
    }

    #[test]
    fn test_unknown_device_is_none() {
        let cache = SnapshotCache::new();
        assert!(cache.get("nope").is_none());
        assert!(cache.is_empty());
    }

    #[test]
    fn test_success_sets_connected() {
        let cache = SnapshotCache::new();
        let now = Utc::now();
        let snapshot = cache.merge("zap", success(vec![reading("power", 10.0, now)]), 3, now);

        assert_eq!(snapshot.connection_status, ConnectionStatus::Connected);
        assert_eq!(snapshot.value("power"), Some(10.0));
        assert_eq!(snapshot.last_success_timestamp, Some(now));
        assert_eq!(cache.get("zap").unwrap(), snapshot);
    }

    #[test]
    fn test_failure_keeps_cached_metrics() {
        let cache = SnapshotCache::new();
        let now = Utc::now();
        cache.merge("zap", success(vec![reading("power", 10.0, now)]), 3, now);
        let snapshot = cache.merge("zap", failure(), 3, now + Duration::seconds(10));

        assert_eq!(snapshot.value("power"), Some(10.0));
        assert_eq!(snapshot.connection_status, ConnectionStatus::Degraded);
        assert_eq!(snapshot.consecutive_failures, 1);
        assert_eq!(snapshot.last_success_timestamp, Some(now));
    }

    #[test]
    fn test_partial_failure_is_degraded() {
        let cache = SnapshotCache::new();
        let now = Utc::now();
        let update = DeviceUpdate {
            measurements: vec![reading("power", 5.0, now)],
            succeeded: 1,
            failed: 1,
        };
        let snapshot = cache.merge("zap", update, 3, now);

        assert_eq!(snapshot.connection_status, ConnectionStatus::Degraded);
        assert_eq!(snapshot.consecutive_failures, 0);
    }

    #[test]
    fn test_threshold_then_immediate_recovery() {
        let cache = SnapshotCache::new();
        let now = Utc::now();
        cache.merge("zap", success(vec![reading("power", 1.0, now)]), 3, now);

        let statuses: Vec<ConnectionStatus> = (0..3)
            .map(|_| cache.merge("zap", failure(), 3, now).connection_status)
            .collect();
        assert_eq!(
            statuses,
            vec![
                ConnectionStatus::Degraded,
                ConnectionStatus::Degraded,
                ConnectionStatus::Disconnected
            ]
        );

        let later = now + Duration::seconds(30);
        let recovered = cache.merge("zap", success(vec![reading("power", 2.0, later)]), 3, later);
        assert_eq!(recovered.connection_status, ConnectionStatus::Connected);
        assert_eq!(recovered.consecutive_failures, 0);
        assert_eq!(recovered.value("power"), Some(2.0));
    }

    #[test]
    fn test_older_metric_never_replaces_newer() {
        let cache = SnapshotCache::new();
        let now = Utc::now();
        cache.merge("zap", success(vec![reading("power", 20.0, now)]), 3, now);
        let snapshot = cache.merge(
            "zap",
            success(vec![reading("power", 10.0, now - Duration::seconds(5))]),
            3,
            now,
        );

        assert_eq!(snapshot.value("power"), Some(20.0));
    }

    #[test]
    fn test_readers_keep_their_snapshot() {
        let cache = SnapshotCache::new();
        let now = Utc::now();
        cache.merge("zap", success(vec![reading("power", 1.0, now)]), 3, now);
        let held = cache.get("zap").unwrap();
        cache.merge("zap", success(vec![reading("power", 2.0, now)]), 3, now);

        assert_eq!(held.value("power"), Some(1.0));
        assert_eq!(cache.get("zap").unwrap().value("power"), Some(2.0));
    }

    #[test]
    fn test_concurrent_merges_lose_nothing() {
        let cache = Arc::new(SnapshotCache::new());
        let now = Utc::now();

        std::thread::scope(|scope| {
            for worker in 0..8 {
                let cache = cache.clone();
                scope.spawn(move || {
                    for i in 0..50 {
                        let code = format!("metric_{worker}_{i}");
                        cache.merge("zap", success(vec![reading(&code, i as f64, now)]), 3, now);
                    }
                });
            }
        });

        let snapshot = cache.get("zap").unwrap();
        assert_eq!(snapshot.metrics.len(), 8 * 50);
        assert_eq!(cache.len(), 1);
    }

    #[test]
    fn test_remove() {
        let cache = SnapshotCache::new();
        let now = Utc::now();
        cache.merge("zap", success(Vec::new()), 3, now);

        assert!(cache.remove("zap"));
        assert!(!cache.remove("zap"));
        assert!(cache.get("zap").is_none());
    }
}
