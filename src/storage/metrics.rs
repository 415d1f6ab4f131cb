//! Storage Metrics
//!
//! Lock-free counters for per-tier hits, tier movements and latencies, plus a
//! Prometheus text exporter.

use prometheus::{Encoder, Gauge, IntGauge, Opts, Registry, TextEncoder};
use serde::Serialize;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant};

use super::types::TierKind;
use crate::error::{Error, Result};

/// Counters shared by the orchestrator and its background workers
#[derive(Debug, Default)]
pub struct StorageMetrics {
    hbm_hits: AtomicU64,
    dram_hits: AtomicU64,
    ssd_hits: AtomicU64,
    misses: AtomicU64,
    creations: AtomicU64,
    lost_races: AtomicU64,

    promotions_dram_to_hbm: AtomicU64,
    promotions_ssd_to_hbm: AtomicU64,
    demotions_hbm_to_dram: AtomicU64,
    demotions_dram_to_ssd: AtomicU64,
    eviction_passes: AtomicU64,
    eviction_failures: AtomicU64,

    // Microseconds, exponential moving average
    lookup_latency_us: AtomicU64,
    eviction_latency_us: AtomicU64,

    hbm_keys: AtomicU64,
    dram_keys: AtomicU64,
    ssd_keys: AtomicU64,
}

impl StorageMetrics {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record_hit(&self, tier: TierKind) {
        let counter = match tier {
            TierKind::Hbm => &self.hbm_hits,
            TierKind::Dram => &self.dram_hits,
            TierKind::Ssd => &self.ssd_hits,
        };
        counter.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_miss(&self) {
        self.misses.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_creations(&self, n: u64) {
        self.creations.fetch_add(n, Ordering::Relaxed);
    }

    /// A concurrent insert of the same key won
    pub fn record_lost_race(&self) {
        self.lost_races.fetch_add(1, Ordering::Relaxed);
    }

    /// Keys moved into HBM from `from`
    pub fn record_promotions(&self, from: TierKind, n: u64) {
        match from {
            TierKind::Dram => self.promotions_dram_to_hbm.fetch_add(n, Ordering::Relaxed),
            TierKind::Ssd => self.promotions_ssd_to_hbm.fetch_add(n, Ordering::Relaxed),
            TierKind::Hbm => 0,
        };
    }

    pub fn record_demotions_to_dram(&self, n: u64) {
        self.demotions_hbm_to_dram.fetch_add(n, Ordering::Relaxed);
    }

    pub fn record_demotions_to_ssd(&self, n: u64) {
        self.demotions_dram_to_ssd.fetch_add(n, Ordering::Relaxed);
    }

    pub fn record_eviction_pass(&self, duration: Duration) {
        self.eviction_passes.fetch_add(1, Ordering::Relaxed);
        update_latency_ema(&self.eviction_latency_us, duration);
    }

    pub fn record_eviction_failure(&self) {
        self.eviction_failures.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_lookup_latency(&self, duration: Duration) {
        update_latency_ema(&self.lookup_latency_us, duration);
    }

    pub fn update_tier_sizes(&self, hbm: usize, dram: usize, ssd: usize) {
        self.hbm_keys.store(hbm as u64, Ordering::Relaxed);
        self.dram_keys.store(dram as u64, Ordering::Relaxed);
        self.ssd_keys.store(ssd as u64, Ordering::Relaxed);
    }

    pub fn hits(&self, tier: TierKind) -> u64 {
        match tier {
            TierKind::Hbm => self.hbm_hits.load(Ordering::Relaxed),
            TierKind::Dram => self.dram_hits.load(Ordering::Relaxed),
            TierKind::Ssd => self.ssd_hits.load(Ordering::Relaxed),
        }
    }

    pub fn misses(&self) -> u64 {
        self.misses.load(Ordering::Relaxed)
    }

    /// Fraction of lookups served from HBM
    pub fn hbm_hit_ratio(&self) -> f64 {
        let hbm = self.hits(TierKind::Hbm) as f64;
        let total = hbm
            + self.hits(TierKind::Dram) as f64
            + self.hits(TierKind::Ssd) as f64
            + self.misses() as f64;
        if total == 0.0 {
            0.0
        } else {
            hbm / total
        }
    }

    /// Get snapshot of all metrics
    pub fn snapshot(&self) -> MetricsSnapshot {
        MetricsSnapshot {
            hbm_hits: self.hits(TierKind::Hbm),
            dram_hits: self.hits(TierKind::Dram),
            ssd_hits: self.hits(TierKind::Ssd),
            misses: self.misses(),
            hbm_hit_ratio: self.hbm_hit_ratio(),
            creations: self.creations.load(Ordering::Relaxed),
            lost_races: self.lost_races.load(Ordering::Relaxed),
            promotions_dram_to_hbm: self.promotions_dram_to_hbm.load(Ordering::Relaxed),
            promotions_ssd_to_hbm: self.promotions_ssd_to_hbm.load(Ordering::Relaxed),
            demotions_hbm_to_dram: self.demotions_hbm_to_dram.load(Ordering::Relaxed),
            demotions_dram_to_ssd: self.demotions_dram_to_ssd.load(Ordering::Relaxed),
            eviction_passes: self.eviction_passes.load(Ordering::Relaxed),
            eviction_failures: self.eviction_failures.load(Ordering::Relaxed),
            lookup_latency_us: self.lookup_latency_us.load(Ordering::Relaxed),
            eviction_latency_us: self.eviction_latency_us.load(Ordering::Relaxed),
            hbm_keys: self.hbm_keys.load(Ordering::Relaxed),
            dram_keys: self.dram_keys.load(Ordering::Relaxed),
            ssd_keys: self.ssd_keys.load(Ordering::Relaxed),
        }
    }
}

fn update_latency_ema(target: &AtomicU64, duration: Duration) {
    let new_us = duration.as_micros() as u64;
    let alpha = 0.1;

    loop {
        let current = target.load(Ordering::Relaxed);
        let updated = if current == 0 {
            new_us
        } else {
            ((1.0 - alpha) * current as f64 + alpha * new_us as f64) as u64
        };

        if target
            .compare_exchange_weak(current, updated, Ordering::Relaxed, Ordering::Relaxed)
            .is_ok()
        {
            break;
        }
    }
}

/// Point-in-time copy of [`StorageMetrics`]
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct MetricsSnapshot {
    pub hbm_hits: u64,
    pub dram_hits: u64,
    pub ssd_hits: u64,
    pub misses: u64,
    pub hbm_hit_ratio: f64,
    pub creations: u64,
    pub lost_races: u64,

    pub promotions_dram_to_hbm: u64,
    pub promotions_ssd_to_hbm: u64,
    pub demotions_hbm_to_dram: u64,
    pub demotions_dram_to_ssd: u64,
    pub eviction_passes: u64,
    pub eviction_failures: u64,

    pub lookup_latency_us: u64,
    pub eviction_latency_us: u64,

    pub hbm_keys: u64,
    pub dram_keys: u64,
    pub ssd_keys: u64,
}

/// Latency tracker helper
pub struct LatencyTracker {
    start: Instant,
}

impl LatencyTracker {
    /// Start tracking latency
    pub fn start() -> Self {
        Self {
            start: Instant::now(),
        }
    }

    /// Get elapsed duration
    pub fn elapsed(&self) -> Duration {
        self.start.elapsed()
    }
}

/// Render a snapshot in the Prometheus text exposition format
pub fn export_prometheus(prefix: &str, snapshot: &MetricsSnapshot) -> Result<String> {
    let registry = Registry::new();
    let prom = |e: prometheus::Error| Error::Internal(format!("prometheus: {}", e));

    let counters: [(&str, &str, u64); 17] = [
        ("hbm_hits", "Lookups served from HBM", snapshot.hbm_hits),
        ("dram_hits", "Lookups served from DRAM", snapshot.dram_hits),
        ("ssd_hits", "Lookups served from SSD", snapshot.ssd_hits),
        ("misses", "Lookups that found no tier", snapshot.misses),
        ("creations", "Slots created for new keys", snapshot.creations),
        ("lost_races", "Inserts that lost to a concurrent insert", snapshot.lost_races),
        ("promotions_dram_to_hbm", "Keys promoted from DRAM", snapshot.promotions_dram_to_hbm),
        ("promotions_ssd_to_hbm", "Keys promoted from SSD", snapshot.promotions_ssd_to_hbm),
        ("demotions_hbm_to_dram", "Keys evicted from HBM", snapshot.demotions_hbm_to_dram),
        ("demotions_dram_to_ssd", "Keys evicted from DRAM", snapshot.demotions_dram_to_ssd),
        ("eviction_passes", "Completed eviction passes", snapshot.eviction_passes),
        ("eviction_failures", "Failed eviction passes", snapshot.eviction_failures),
        ("lookup_latency_us", "Lookup latency EMA in microseconds", snapshot.lookup_latency_us),
        ("eviction_latency_us", "Eviction pass latency EMA in microseconds", snapshot.eviction_latency_us),
        ("hbm_keys", "Keys resident in HBM", snapshot.hbm_keys),
        ("dram_keys", "Keys resident in DRAM", snapshot.dram_keys),
        ("ssd_keys", "Keys resident on SSD", snapshot.ssd_keys),
    ];
    for (name, help, value) in counters {
        let gauge = IntGauge::with_opts(Opts::new(format!("{}_{}", prefix, name), help))
            .map_err(prom)?;
        gauge.set(value as i64);
        registry.register(Box::new(gauge)).map_err(prom)?;
    }

    let ratio = Gauge::with_opts(Opts::new(
        format!("{}_hbm_hit_ratio", prefix),
        "Fraction of lookups served from HBM",
    ))
    .map_err(prom)?;
    ratio.set(snapshot.hbm_hit_ratio);
    registry.register(Box::new(ratio)).map_err(prom)?;

    let mut buffer = Vec::new();
    TextEncoder::new()
        .encode(&registry.gather(), &mut buffer)
        .map_err(prom)?;
    String::from_utf8(buffer).map_err(|e| Error::Internal(e.to_string()))
}

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_hit_tracking() {
        let metrics = StorageMetrics::new();
        metrics.record_hit(TierKind::Hbm);
        metrics.record_hit(TierKind::Hbm);
        metrics.record_hit(TierKind::Ssd);
        metrics.record_miss();

        assert_eq!(metrics.hits(TierKind::Hbm), 2);
        assert_eq!(metrics.hits(TierKind::Dram), 0);
        assert!((metrics.hbm_hit_ratio() - 0.5).abs() < 1e-9);
    }

    #[test]
    fn test_latency_ema() {
        let metrics = StorageMetrics::new();
        metrics.record_lookup_latency(Duration::from_micros(100));
        assert_eq!(metrics.snapshot().lookup_latency_us, 100);

        metrics.record_lookup_latency(Duration::from_micros(200));
        let latency = metrics.snapshot().lookup_latency_us;
        assert!(latency > 100 && latency < 200);
    }

    #[test]
    fn test_promotions_by_source() {
        let metrics = StorageMetrics::new();
        metrics.record_promotions(TierKind::Dram, 3);
        metrics.record_promotions(TierKind::Ssd, 2);
        metrics.record_promotions(TierKind::Hbm, 9);

        let snapshot = metrics.snapshot();
        assert_eq!(snapshot.promotions_dram_to_hbm, 3);
        assert_eq!(snapshot.promotions_ssd_to_hbm, 2);
    }

    #[test]
    fn test_snapshot_serializes() {
        let metrics = StorageMetrics::new();
        metrics.update_tier_sizes(1, 2, 3);
        let json = serde_json::to_value(metrics.snapshot()).unwrap();
        assert_eq!(json["dram_keys"], 2);
    }

    #[test]
    fn test_prometheus_export() {
        let metrics = StorageMetrics::new();
        metrics.record_hit(TierKind::Dram);
        metrics.record_demotions_to_ssd(4);

        let text = export_prometheus("embstore", &metrics.snapshot()).unwrap();
        assert!(text.contains("embstore_dram_hits 1"));
        assert!(text.contains("embstore_demotions_dram_to_ssd 4"));
        assert!(text.contains("# HELP embstore_hbm_hit_ratio"));
    }

    #[test]
    fn test_latency_tracker() {
        let tracker = LatencyTracker::start();
        assert!(tracker.elapsed() <= Duration::from_secs(60));
    }
}
