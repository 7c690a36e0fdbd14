//! Metrics store used by the coordinator and host workers
//!
//! Each host worker keeps a local store that buffers system metrics produced
//! by its nodes. The buffer travels to the coordinator inside the
//! benchmark-stopped / nodes-stopped replies, where it is merged into the
//! run-wide store with [`MetricsStore::bulk_add`].

use std::collections::BTreeMap;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Context a metrics store is opened with
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MetricsContext {
    /// Start of the race this run belongs to
    pub race_timestamp: DateTime<Utc>,
    /// Workload name
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub track: Option<String>,
    /// Challenge name
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub challenge: Option<String>,
    /// Car name
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub car: Option<String>,
}

impl MetricsContext {
    /// Create a context for a race started at the given time
    pub fn new(race_timestamp: DateTime<Utc>) -> Self {
        Self {
            race_timestamp,
            track: None,
            challenge: None,
            car: None,
        }
    }

    /// Set the workload name
    pub fn with_track(mut self, track: impl Into<String>) -> Self {
        self.track = Some(track.into());
        self
    }

    /// Set the challenge name
    pub fn with_challenge(mut self, challenge: impl Into<String>) -> Self {
        self.challenge = Some(challenge.into());
        self
    }

    /// Set the car name
    pub fn with_car(mut self, car: impl Into<String>) -> Self {
        self.car = Some(car.into());
        self
    }
}

/// Where a piece of meta-information applies
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MetaScope {
    /// Applies to the whole cluster
    Cluster,
    /// Applies to a single node
    Node(String),
}

/// Meta-information attached to every metric record
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct MetaInfo {
    /// Cluster-level entries
    #[serde(default)]
    pub cluster: BTreeMap<String, Value>,
    /// Node-level entries keyed by node name
    #[serde(default)]
    pub nodes: BTreeMap<String, BTreeMap<String, Value>>,
}

impl MetaInfo {
    /// Add a single entry
    pub fn add(&mut self, scope: MetaScope, key: impl Into<String>, value: impl Into<Value>) {
        match scope {
            MetaScope::Cluster => {
                self.cluster.insert(key.into(), value.into());
            }
            MetaScope::Node(node) => {
                self.nodes
                    .entry(node)
                    .or_default()
                    .insert(key.into(), value.into());
            }
        }
    }

    /// Merge another meta-info into this one; entries of `other` win
    pub fn merge(&mut self, other: &MetaInfo) {
        for (key, value) in &other.cluster {
            self.cluster.insert(key.clone(), value.clone());
        }
        for (node, entries) in &other.nodes {
            let target = self.nodes.entry(node.clone()).or_default();
            for (key, value) in entries {
                target.insert(key.clone(), value.clone());
            }
        }
    }

    /// Meta-information that applies to a record of the given node
    pub fn for_node(&self, node: Option<&str>) -> BTreeMap<String, Value> {
        let mut meta = self.cluster.clone();
        if let Some(entries) = node.and_then(|n| self.nodes.get(n)) {
            for (key, value) in entries {
                meta.insert(key.clone(), value.clone());
            }
        }
        meta
    }

    /// Whether no meta-information is present
    pub fn is_empty(&self) -> bool {
        self.cluster.is_empty() && self.nodes.is_empty()
    }
}

/// A single system metric sample
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MetricRecord {
    /// Metric name
    pub name: String,
    /// Sampled value
    pub value: f64,
    /// Unit of `value`
    pub unit: String,
    /// Lap the sample was taken in
    pub lap: u32,
    /// Node the sample belongs to (`None` for cluster-level metrics)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub node_name: Option<String>,
    /// When the sample was recorded
    pub timestamp: DateTime<Utc>,
    /// Race the sample belongs to
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub race_timestamp: Option<DateTime<Utc>>,
    /// Meta-information at recording time
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub meta: BTreeMap<String, Value>,
}

/// Externalized system metrics snapshot
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct SystemMetrics {
    /// Contained records
    pub records: Vec<MetricRecord>,
}

impl SystemMetrics {
    /// Number of records
    pub fn len(&self) -> usize {
        self.records.len()
    }

    /// Whether the snapshot holds no records
    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    /// Iterate over the records
    pub fn iter(&self) -> impl Iterator<Item = &MetricRecord> {
        self.records.iter()
    }

    /// Distinct laps present in this snapshot, ascending
    pub fn laps(&self) -> Vec<u32> {
        let mut laps: Vec<u32> = self.records.iter().map(|r| r.lap).collect();
        laps.sort_unstable();
        laps.dedup();
        laps
    }
}

/// Metrics store contract
pub trait MetricsStore: Send {
    /// Open the store for the given race context
    fn open(&mut self, ctx: &MetricsContext);

    /// Current meta-information
    fn meta_info(&self) -> &MetaInfo;

    /// Add a single meta-information entry
    fn add_meta_info(&mut self, scope: MetaScope, key: &str, value: Value);

    /// Merge externally supplied meta-information
    fn merge_meta_info(&mut self, meta: &MetaInfo);

    /// Record a system metric in the current lap
    fn put_value(&mut self, name: &str, value: f64, unit: &str, node_name: Option<&str>);

    /// Add externalized records as they are (their lap is kept)
    fn bulk_add(&mut self, metrics: SystemMetrics);

    /// Snapshot the buffered records, optionally clearing the buffer
    fn to_externalizable(&mut self, clear: bool) -> SystemMetrics;

    /// Current lap
    fn lap(&self) -> u32;

    /// Set the current lap
    fn set_lap(&mut self, lap: u32);
}

/// Metrics store handle shared between a worker and its pipeline
pub type SharedMetricsStore = Arc<Mutex<dyn MetricsStore>>;

/// Wrap a store into a shared handle
pub fn shared(store: impl MetricsStore + 'static) -> SharedMetricsStore {
    Arc::new(Mutex::new(store))
}

/// Metrics store that keeps all records in memory
#[derive(Debug, Default)]
pub struct InMemoryMetricsStore {
    context: Option<MetricsContext>,
    meta_info: MetaInfo,
    records: Vec<MetricRecord>,
    lap: u32,
}

impl InMemoryMetricsStore {
    /// Create a closed, empty store
    pub fn new() -> Self {
        Self::default()
    }

    /// Create a store already opened with the given context
    pub fn opened(ctx: &MetricsContext) -> Self {
        let mut store = Self::new();
        store.open(ctx);
        store
    }

    /// Context the store was opened with
    pub fn context(&self) -> Option<&MetricsContext> {
        self.context.as_ref()
    }
}

impl MetricsStore for InMemoryMetricsStore {
    fn open(&mut self, ctx: &MetricsContext) {
        self.context = Some(ctx.clone());
    }

    fn meta_info(&self) -> &MetaInfo {
        &self.meta_info
    }

    fn add_meta_info(&mut self, scope: MetaScope, key: &str, value: Value) {
        self.meta_info.add(scope, key, value);
    }

    fn merge_meta_info(&mut self, meta: &MetaInfo) {
        self.meta_info.merge(meta);
    }

    fn put_value(&mut self, name: &str, value: f64, unit: &str, node_name: Option<&str>) {
        self.records.push(MetricRecord {
            name: name.to_string(),
            value,
            unit: unit.to_string(),
            lap: self.lap,
            node_name: node_name.map(str::to_string),
            timestamp: Utc::now(),
            race_timestamp: self.context.as_ref().map(|c| c.race_timestamp),
            meta: self.meta_info.for_node(node_name),
        });
    }

    fn bulk_add(&mut self, metrics: SystemMetrics) {
        self.records.extend(metrics.records);
    }

    fn to_externalizable(&mut self, clear: bool) -> SystemMetrics {
        let records = if clear {
            std::mem::take(&mut self.records)
        } else {
            self.records.clone()
        };
        SystemMetrics { records }
    }

    fn lap(&self) -> u32 {
        self.lap
    }

    fn set_lap(&mut self, lap: u32) {
        self.lap = lap;
    }
}
