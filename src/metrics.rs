//! Prometheus metrics for the cluster: root/shard chain heights, mempool
//! sizes, peer counts, and RPC latency. One registry per process.

use prometheus::{Counter, CounterVec, Gauge, GaugeVec, Histogram, HistogramOpts, Opts, Registry, Encoder, TextEncoder};
use std::sync::{Arc, Mutex};

pub struct Metrics {
    pub root_tip_height: Gauge,
    pub root_blocks_added: Counter,

    pub shard_tip_height: GaugeVec,
    pub shard_mempool_size: GaugeVec,
    pub minor_blocks_added: CounterVec,
    pub cross_shard_transactions: CounterVec,

    pub peers_connected: Gauge,
    pub rpc_latency_seconds: Histogram,

    registry: Registry,
}

impl Metrics {
    pub fn new() -> Result<Self, prometheus::Error> {
        let registry = Registry::new();

        let root_tip_height = Gauge::with_opts(
            Opts::new("cluster_root_tip_height", "Current root chain tip height").namespace("cluster"),
        )?;
        let root_blocks_added = Counter::with_opts(
            Opts::new("cluster_root_blocks_added_total", "Total root blocks accepted").namespace("cluster"),
        )?;

        let shard_tip_height = GaugeVec::new(
            Opts::new("cluster_shard_tip_height", "Current tip height per shard").namespace("cluster"),
            &["branch"],
        )?;
        let shard_mempool_size = GaugeVec::new(
            Opts::new("cluster_shard_mempool_size", "Pending transaction count per shard").namespace("cluster"),
            &["branch"],
        )?;
        let minor_blocks_added = CounterVec::new(
            Opts::new("cluster_minor_blocks_added_total", "Total minor blocks accepted per shard").namespace("cluster"),
            &["branch"],
        )?;
        let cross_shard_transactions = CounterVec::new(
            Opts::new("cluster_cross_shard_transactions_total", "Total cross-shard deposits extracted per source shard")
                .namespace("cluster"),
            &["branch"],
        )?;

        let peers_connected =
            Gauge::with_opts(Opts::new("cluster_peers_connected", "Connected cluster peers").namespace("cluster"))?;

        let rpc_latency_seconds = Histogram::with_opts(
            HistogramOpts::new("cluster_rpc_latency_seconds", "Node API RPC handling latency")
                .namespace("cluster")
                .buckets(vec![0.001, 0.005, 0.01, 0.05, 0.1, 0.5, 1.0, 5.0]),
        )?;

        registry.register(Box::new(root_tip_height.clone()))?;
        registry.register(Box::new(root_blocks_added.clone()))?;
        registry.register(Box::new(shard_tip_height.clone()))?;
        registry.register(Box::new(shard_mempool_size.clone()))?;
        registry.register(Box::new(minor_blocks_added.clone()))?;
        registry.register(Box::new(cross_shard_transactions.clone()))?;
        registry.register(Box::new(peers_connected.clone()))?;
        registry.register(Box::new(rpc_latency_seconds.clone()))?;

        Ok(Self {
            root_tip_height,
            root_blocks_added,
            shard_tip_height,
            shard_mempool_size,
            minor_blocks_added,
            cross_shard_transactions,
            peers_connected,
            rpc_latency_seconds,
            registry,
        })
    }

    pub fn gather(&self) -> Result<String, prometheus::Error> {
        let encoder = TextEncoder::new();
        let metric_families = self.registry.gather();
        let mut buffer = Vec::new();
        encoder.encode(&metric_families, &mut buffer)?;
        Ok(String::from_utf8_lossy(&buffer).to_string())
    }

    pub fn record_root_block_added(&self, height: u64) {
        self.root_tip_height.set(height as f64);
        self.root_blocks_added.inc();
    }

    pub fn record_minor_block_added(&self, branch: &str, tip_height: u64) {
        self.shard_tip_height.with_label_values(&[branch]).set(tip_height as f64);
        self.minor_blocks_added.with_label_values(&[branch]).inc();
    }

    pub fn record_mempool_size(&self, branch: &str, size: usize) {
        self.shard_mempool_size.with_label_values(&[branch]).set(size as f64);
    }

    pub fn record_cross_shard_deposit(&self, branch: &str) {
        self.cross_shard_transactions.with_label_values(&[branch]).inc();
    }

    pub fn record_peer_count(&self, count: usize) {
        self.peers_connected.set(count as f64);
    }

    pub fn observe_rpc_latency(&self, seconds: f64) {
        self.rpc_latency_seconds.observe(seconds);
    }
}

pub type MetricsHandle = Arc<Mutex<Metrics>>;

pub fn create_metrics() -> Result<MetricsHandle, prometheus::Error> {
    Ok(Arc::new(Mutex::new(Metrics::new()?)))
}
