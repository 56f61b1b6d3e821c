// ── Device hub ──
//
// Orchestrates the whole cycle: refresh every source in parallel, rebuild
// the master map, merge, correct, re-register and realign every map, then
// release buffered messages. Also the entry point for inbound messages
// and lookups against the merged view.

use std::sync::{Arc, Mutex};

use chrono::{DateTime, Utc};
use serde_json::Value;
use tracing::{debug, info, warn};

use crate::config::HubConfig;
use crate::error::CoreError;
use crate::fixes::apply_fixes;
use crate::merge::merge_all;
use crate::model::{DeviceRecord, DeviceUpdate};
use crate::router::{Dispatch, EventRouter, RouterPhase, SourceTable};
use crate::runner::JobRunner;
use crate::source::{SourceAdapter, StatusAggregator};
use crate::store::{DeviceMap, MapRegistry};
use crate::sync::lock;
use crate::watcher::DeviceWatcher;

const MASTER_LABEL: &str = "master";

// ── Builder ──────────────────────────────────────────────────────

/// Collects sources and collaborators for a [`DeviceHub`].
pub struct HubBuilder {
    config: HubConfig,
    sources: Vec<Arc<dyn SourceAdapter>>,
    aggregator: Option<Arc<dyn StatusAggregator>>,
}

impl HubBuilder {
    pub fn new(config: HubConfig) -> Self {
        Self {
            config,
            sources: Vec::new(),
            aggregator: None,
        }
    }

    /// Add a source. Sources are refreshed and merged in the order added.
    pub fn source(mut self, adapter: Arc<dyn SourceAdapter>) -> Self {
        self.sources.push(adapter);
        self
    }

    pub fn aggregator(mut self, aggregator: Arc<dyn StatusAggregator>) -> Self {
        self.aggregator = Some(aggregator);
        self
    }

    pub fn build(self) -> Result<DeviceHub, CoreError> {
        if self.config.correction_passes == 0 {
            return Err(CoreError::Config {
                message: "correction_passes must be at least 1".into(),
            });
        }

        let mut sources = SourceTable::new();
        for adapter in self.sources {
            let name = adapter.name().to_owned();
            if sources.insert(name.clone(), adapter).is_some() {
                return Err(CoreError::Config {
                    message: format!("duplicate source name '{name}'"),
                });
            }
        }
        let sources = Arc::new(sources);

        let master = DeviceMap::new(MASTER_LABEL, None);
        let watcher = DeviceWatcher::new(self.config.watched_devices.iter().cloned());
        let router = EventRouter::new(
            master.clone(),
            Arc::clone(&sources),
            self.aggregator,
            watcher,
        );

        Ok(DeviceHub {
            inner: Arc::new(HubInner {
                config: self.config,
                registry: MapRegistry::new(),
                master,
                sources,
                router,
                runner: JobRunner::new()?,
                cycle: Mutex::new(()),
                last_refresh: Mutex::new(None),
            }),
        })
    }
}

// ── DeviceHub ────────────────────────────────────────────────────

/// The unified view over every source. Cheaply cloneable.
///
/// [`refresh_all`](Self::refresh_all) blocks the calling thread; dropping
/// the last clone is fine anywhere, including inside an async task.
#[derive(Clone)]
pub struct DeviceHub {
    inner: Arc<HubInner>,
}

struct HubInner {
    config: HubConfig,
    registry: MapRegistry,
    master: DeviceMap,
    sources: Arc<SourceTable>,
    router: EventRouter,
    runner: JobRunner,
    /// Held for the whole of `refresh_all`.
    cycle: Mutex<()>,
    last_refresh: Mutex<Option<DateTime<Utc>>>,
}

impl std::fmt::Debug for DeviceHub {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DeviceHub")
            .field("sources", &self.source_names())
            .field("devices", &self.inner.master.len())
            .field("phase", &self.inner.router.phase())
            .finish_non_exhaustive()
    }
}

impl DeviceHub {
    pub fn builder(config: HubConfig) -> HubBuilder {
        HubBuilder::new(config)
    }

    pub fn config(&self) -> &HubConfig {
        &self.inner.config
    }

    /// The merged view.
    pub fn master(&self) -> &DeviceMap {
        &self.inner.master
    }

    pub fn registry(&self) -> &MapRegistry {
        &self.inner.registry
    }

    pub fn is_ready(&self) -> bool {
        self.inner.router.phase() == RouterPhase::Live
    }

    pub fn last_refresh(&self) -> Option<DateTime<Utc>> {
        *lock(&self.inner.last_refresh)
    }

    // ── Refresh cycle ────────────────────────────────────────────────

    /// Refresh every source and rebuild the merged view.
    ///
    /// Source failures do not stop the cycle: the master map is rebuilt
    /// from whatever succeeded, and the failures are returned at the end.
    /// Concurrent calls are serialized.
    pub fn refresh_all(&self) -> Result<(), CoreError> {
        let inner = &self.inner;
        let _cycle = lock(&inner.cycle);

        inner.router.begin_buffering();
        inner.registry.clear_all();
        inner.master.clear();

        for adapter in inner.sources.values() {
            let adapter = Arc::clone(adapter);
            inner
                .runner
                .submit(adapter.name().to_owned(), move || refresh_source(adapter.as_ref()));
        }
        info!(sources = inner.sources.len(), "refreshing sources");
        let outcome = inner.runner.run_and_wait(inner.config.max_concurrency);
        if let Err(e) = &outcome {
            warn!(error = %e, "source refresh incomplete, merging what succeeded");
        }

        let maps = self.available_device_maps();
        for map in &maps {
            for record in map.records() {
                if !inner.master.contains(record.id()) {
                    inner.master.insert(record);
                }
            }
        }

        merge_all(&inner.master, &maps);
        for record in inner.master.records() {
            for _ in 0..inner.config.correction_passes {
                apply_fixes(&record);
            }
        }

        for map in &maps {
            inner.registry.register(map);
        }
        inner.registry.register(&inner.master);
        inner.registry.realign(&inner.master);

        let replayed = inner.router.go_live();
        *lock(&inner.last_refresh) = Some(Utc::now());
        info!(
            devices = inner.master.len(),
            maps = inner.registry.len(),
            replayed,
            "refresh cycle complete"
        );
        outcome
    }

    /// Every map of every source, in source order.
    pub fn available_device_maps(&self) -> Vec<DeviceMap> {
        self.inner
            .sources
            .values()
            .flat_map(|adapter| adapter.available_device_maps())
            .collect()
    }

    // ── Messages ─────────────────────────────────────────────────────

    pub fn on_message(&self, source: &str, payload: Value) -> Dispatch {
        self.inner.router.on_message(source, payload)
    }

    pub fn router(&self) -> &EventRouter {
        &self.inner.router
    }

    /// Resolve a batch of raw status items with the configured required flags.
    pub fn resolve_status_list(&self, device_id: &str, items: &[Value]) -> Vec<Value> {
        self.inner.router.resolve_status_list(
            device_id,
            items,
            self.inner.config.require_code,
            self.inner.config.require_id,
        )
    }

    // ── Lookups ──────────────────────────────────────────────────────

    pub fn query(&self, device_id: &str) -> Option<Arc<DeviceRecord>> {
        self.inner.master.get(device_id)
    }

    pub fn resolve_code(&self, device_id: &str, dp_id: u32) -> Option<String> {
        self.query(device_id)?.code_for(dp_id)
    }

    pub fn resolve_id(&self, device_id: &str, code: &str) -> Option<u32> {
        self.query(device_id)?.resolve_id(code)
    }

    /// Recompute `online` from the per-source states: online if any source
    /// says so. Returns whether the value changed.
    pub fn update_online_status(&self, device_id: &str) -> Result<bool, CoreError> {
        let record = self.query(device_id).ok_or_else(|| CoreError::DeviceNotFound {
            identifier: device_id.to_owned(),
        })?;
        let states = record.online_states();
        if states.is_empty() {
            return Ok(false);
        }
        let online = states.values().any(|&up| up);
        if online == record.online() {
            return Ok(false);
        }
        record.set(DeviceUpdate::Online(online));
        info!(device_id, online, "device online status changed");
        Ok(true)
    }

    // ── Sources ──────────────────────────────────────────────────────

    pub fn source(&self, name: &str) -> Result<Arc<dyn SourceAdapter>, CoreError> {
        self.inner
            .sources
            .get(name)
            .cloned()
            .ok_or_else(|| CoreError::UnknownSource {
                name: name.to_owned(),
            })
    }

    pub fn source_names(&self) -> Vec<String> {
        self.inner.sources.keys().cloned().collect()
    }

    /// Unload every source and detach all maps from propagation.
    pub fn unload(&self) {
        for adapter in self.inner.sources.values() {
            debug!(source = %adapter.name(), "unloading source");
            adapter.unload();
        }
        self.inner.registry.clear_all();
        info!("hub unloaded");
    }
}

/// One refresh job: refresh, then bring every record into unified shape.
fn refresh_source(adapter: &dyn SourceAdapter) -> Result<(), CoreError> {
    let name = adapter.name();
    adapter.refresh().map_err(|e| CoreError::SourceFailed {
        source_name: name.to_owned(),
        message: e.to_string(),
    })?;

    let mut devices = 0usize;
    for map in adapter.available_device_maps() {
        for record in map.records() {
            let unified = adapter.to_unified_record(Arc::clone(&record), map.priority());
            if !Arc::ptr_eq(&unified, &record) {
                map.insert(unified);
            }
            devices += 1;
        }
    }
    debug!(source = %name, devices, "source refreshed");
    Ok(())
}
