pub mod server;

use prometheus::{Encoder, HistogramOpts, HistogramVec, IntCounterVec, IntGauge, Opts, Registry, TextEncoder};
use std::sync::Arc;

#[derive(Clone)]
pub struct Metrics {
    registry: Registry,
    peers: IntGauge,
    peer_disconnection_events: IntCounterVec,
    // Sync
    head_slot: IntGauge,
    sync_active: IntGauge,
    sync_sessions: IntCounterVec,
    sync_peers_excluded: IntGauge,
    common_ancestor_mismatches: IntCounterVec,
    blocks_imported: IntCounterVec,
    batch_download_time: HistogramVec,
}

impl Metrics {
    pub fn new() -> Self {
        let registry = Registry::new();

        let peers = IntGauge::with_opts(Opts::new("network_peers_connected", "Number of connected peers")).unwrap();
        registry.register(Box::new(peers.clone())).unwrap();

        let peer_disconnection_events = IntCounterVec::new(
            Opts::new("lean_peer_disconnection_events_total", "Total number of peer disconnection events"),
            &["reason"],
        ).unwrap();
        registry.register(Box::new(peer_disconnection_events.clone())).unwrap();

        // Sync
        let head_slot = IntGauge::with_opts(Opts::new("lean_head_slot", "Slot of the local chain head")).unwrap();
        registry.register(Box::new(head_slot.clone())).unwrap();

        let sync_active = IntGauge::with_opts(Opts::new("lean_sync_active", "Whether a forward sync is running (0 or 1)")).unwrap();
        registry.register(Box::new(sync_active.clone())).unwrap();

        let sync_sessions = IntCounterVec::new(
            Opts::new("lean_sync_sessions_total", "Total number of single-peer sync sessions by outcome"),
            &["result"],
        ).unwrap();
        registry.register(Box::new(sync_sessions.clone())).unwrap();

        let sync_peers_excluded = IntGauge::with_opts(Opts::new(
            "lean_sync_peers_excluded",
            "Number of peers excluded from sync selection after an error",
        )).unwrap();
        registry.register(Box::new(sync_peers_excluded.clone())).unwrap();

        let common_ancestor_mismatches = IntCounterVec::new(
            Opts::new(
                "lean_sync_common_ancestor_mismatches_total",
                "Total number of times two peers reported different common ancestors",
            ),
            &[],
        ).unwrap();
        registry.register(Box::new(common_ancestor_mismatches.clone())).unwrap();

        let blocks_imported = IntCounterVec::new(
            Opts::new("lean_sync_blocks_imported_total", "Total number of blocks imported by forward sync"),
            &[],
        ).unwrap();
        registry.register(Box::new(blocks_imported.clone())).unwrap();

        let batch_download_time = HistogramVec::new(
            HistogramOpts::new("lean_sync_batch_download_time_seconds", "Time taken to download a batch")
                .buckets(vec![0.05, 0.1, 0.25, 0.5, 1.0, 2.5, 5.0, 10.0]),
            &[],
        ).unwrap();
        registry.register(Box::new(batch_download_time.clone())).unwrap();

        Self {
            registry,
            peers,
            peer_disconnection_events,
            head_slot,
            sync_active,
            sync_sessions,
            sync_peers_excluded,
            common_ancestor_mismatches,
            blocks_imported,
            batch_download_time,
        }
    }

    pub fn gather(&self) -> String {
        let metric_families = self.registry.gather();
        let mut buffer = Vec::<u8>::new();
        let encoder = TextEncoder::new();
        encoder.encode(&metric_families, &mut buffer).expect("failed to encode metrics");
        String::from_utf8(buffer).expect("metrics not utf8")
    }

    // Network
    pub fn set_peers(&self, v: i64) {
        self.peers.set(v);
    }

    pub fn inc_peer_disconnection(&self, reason: &str) {
        self.peer_disconnection_events.with_label_values(&[reason]).inc();
    }

    // Sync
    pub fn set_head_slot(&self, v: i64) {
        self.head_slot.set(v);
    }

    pub fn set_sync_active(&self, active: bool) {
        self.sync_active.set(i64::from(active));
    }

    pub fn inc_sync_session(&self, result: &str) {
        self.sync_sessions.with_label_values(&[result]).inc();
    }

    pub fn set_sync_peers_excluded(&self, v: i64) {
        self.sync_peers_excluded.set(v);
    }

    pub fn inc_common_ancestor_mismatches(&self) {
        self.common_ancestor_mismatches.with_label_values::<&str>(&[]).inc();
    }

    pub fn inc_blocks_imported(&self, count: u64) {
        self.blocks_imported.with_label_values::<&str>(&[]).inc_by(count);
    }

    pub fn observe_batch_download_time(&self, duration: f64) {
        self.batch_download_time.with_label_values::<&str>(&[]).observe(duration);
    }
}

impl Default for Metrics {
    fn default() -> Self {
        Self::new()
    }
}

pub type SharedMetrics = Arc<Metrics>;
