// Copyright Amazon.com, Inc. or its affiliates. All Rights Reserved.
// SPDX-License-Identifier: Apache-2.0

//! A pull-based registry of per-plugin counters.
//!
//! Outputs register probes at configure time; monitoring code reads them with
//! [`StatusRegistry::get`] and [`StatusRegistry::snapshot`], or pushes them as gauges into a
//! [`MetricRecorder`] with [`StatusRegistry::publish`].

use std::{
    collections::BTreeMap,
    fmt,
    sync::{Mutex, PoisonError},
};

/// A probe reading one current value.
pub type Probe = Box<dyn Fn() -> u64 + Send + Sync>;

/// One value read from the registry.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StatusEntry {
    /// The plugin the value belongs to.
    pub plugin_id: String,
    /// The name of the value, e.g. `queue_size`.
    pub key: String,
    /// The value at the time of the read.
    pub value: u64,
}

/// Registry of status probes keyed by `(plugin_id, key)`.
#[derive(Default)]
pub struct StatusRegistry {
    probes: Mutex<BTreeMap<(String, String), Probe>>,
}

impl fmt::Debug for StatusRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let probes = self.probes.lock().unwrap_or_else(PoisonError::into_inner);
        f.debug_struct("StatusRegistry")
            .field("probes", &probes.keys().collect::<Vec<_>>())
            .finish()
    }
}

impl StatusRegistry {
    /// Register a probe, replacing any probe already registered under the same name.
    pub fn register(
        &self,
        plugin_id: impl Into<String>,
        key: impl Into<String>,
        probe: impl Fn() -> u64 + Send + Sync + 'static,
    ) {
        self.probes
            .lock()
            .unwrap()
            .insert((plugin_id.into(), key.into()), Box::new(probe));
    }

    /// Remove every probe registered for `plugin_id`.
    pub fn unregister(&self, plugin_id: &str) {
        self.probes
            .lock()
            .unwrap()
            .retain(|(id, _), _| id != plugin_id);
    }

    /// Read a single value.
    pub fn get(&self, plugin_id: &str, key: &str) -> Option<u64> {
        let probes = self.probes.lock().unwrap();
        probes
            .iter()
            .find(|((id, k), _)| id == plugin_id && k == key)
            .map(|(_, probe)| probe())
    }

    /// Read every registered value, ordered by plugin id and key.
    pub fn snapshot(&self) -> Vec<StatusEntry> {
        let probes = self.probes.lock().unwrap();
        probes
            .iter()
            .map(|((plugin_id, key), probe)| StatusEntry {
                plugin_id: plugin_id.clone(),
                key: key.clone(),
                value: probe(),
            })
            .collect()
    }

    /// Push the current snapshot into `recorder`, one gauge per entry.
    pub fn publish(&self, recorder: &dyn MetricRecorder) {
        for entry in self.snapshot() {
            recorder.set_gauge(&entry.key, &entry.plugin_id, entry.value as f64);
        }
    }
}

/// Defines callbacks for recording status values as metrics
pub trait MetricRecorder: Send + Sync {
    /// Sets a gauge. `metric` names the value, `plugin_id` the plugin it belongs to.
    fn set_gauge(&self, metric: &str, plugin_id: &str, value: f64);
}

/// Implements [`MetricRecorder`] for the global metrics-rs 0.24 recorder.
///
/// Gauges are named `outflow.<key>` and labeled with `plugin_id`.
#[cfg(feature = "metrics-rs-024")]
#[derive(Debug, Copy, Clone, Default)]
pub struct GlobalMetricsRs024Bridge;

#[cfg(feature = "metrics-rs-024")]
impl MetricRecorder for GlobalMetricsRs024Bridge {
    fn set_gauge(&self, metric: &str, plugin_id: &str, value: f64) {
        metrics_024::gauge!(format!("outflow.{metric}"), "plugin_id" => plugin_id.to_owned())
            .set(value);
    }
}

#[cfg(test)]
mod tests {
    use std::sync::{
        Arc,
        atomic::{AtomicU64, Ordering},
    };

    use super::*;

    #[derive(Default)]
    struct Recorded(Mutex<Vec<(String, String, f64)>>);

    impl MetricRecorder for Recorded {
        fn set_gauge(&self, metric: &str, plugin_id: &str, value: f64) {
            self.0
                .lock()
                .unwrap()
                .push((metric.to_owned(), plugin_id.to_owned(), value));
        }
    }

    #[test]
    fn probes_are_read_on_demand() {
        let registry = StatusRegistry::default();
        let counter = Arc::new(AtomicU64::new(0));
        let probe = counter.clone();
        registry.register("out", "emit_count", move || probe.load(Ordering::Relaxed));
        assert_eq!(registry.get("out", "emit_count"), Some(0));
        counter.store(7, Ordering::Relaxed);
        assert_eq!(registry.get("out", "emit_count"), Some(7));
        assert_eq!(registry.get("out", "queue_size"), None);
        assert_eq!(registry.get("other", "emit_count"), None);
    }

    #[test]
    fn snapshot_and_publish() {
        let registry = StatusRegistry::default();
        registry.register("b", "queue_size", || 2);
        registry.register("a", "queue_size", || 1);
        registry.register("a", "emit_count", || 10);

        let keys: Vec<_> = registry
            .snapshot()
            .into_iter()
            .map(|e| (e.plugin_id, e.key, e.value))
            .collect();
        assert_eq!(
            keys,
            vec![
                ("a".into(), "emit_count".into(), 10),
                ("a".into(), "queue_size".into(), 1),
                ("b".into(), "queue_size".into(), 2),
            ]
        );

        let recorded = Recorded::default();
        registry.publish(&recorded);
        assert_eq!(recorded.0.lock().unwrap().len(), 3);

        registry.unregister("a");
        assert_eq!(registry.snapshot().len(), 1);
    }

    #[cfg(feature = "metrics-rs-024")]
    #[test]
    fn publish_to_metrics_rs() {
        use metrics_util_020::debugging::{DebugValue, DebuggingRecorder};

        let registry = StatusRegistry::default();
        registry.register("forward.0", "queue_size", || 3);

        let recorder = DebuggingRecorder::new();
        let snapshotter = recorder.snapshotter();
        metrics_024::with_local_recorder(&recorder, || {
            registry.publish(&GlobalMetricsRs024Bridge);
        });

        let snapshot = snapshotter.snapshot().into_vec();
        assert_eq!(snapshot.len(), 1);
        let (key, _, _, value) = &snapshot[0];
        assert_eq!(key.key().name(), "outflow.queue_size");
        assert!(matches!(value, DebugValue::Gauge(v) if v.into_inner() == 3.0));
    }
}
