use std::sync::{LazyLock, RwLock};

use prometheus_client::encoding::EncodeLabelSet;
use prometheus_client::metrics::counter::Counter;
use prometheus_client::metrics::family::Family;
use prometheus_client::metrics::gauge::Gauge;
use prometheus_client::registry::Registry;
use tracing::warn;

pub static REGISTRY: LazyLock<RwLock<Registry>> =
    LazyLock::new(|| RwLock::new(Registry::with_prefix("regulus")));

#[derive(Clone)]
pub struct DaemonMetrics {
    pub bindings: Family<BindingLabels, Counter>,
    pub program_starts: Family<ProgramLabels, Counter>,
    pub endpoints: Gauge,
}

#[derive(Clone, Debug, Hash, PartialEq, Eq, EncodeLabelSet)]
pub struct BindingLabels {
    pub outcome: String,
}

#[derive(Clone, Debug, Hash, PartialEq, Eq, EncodeLabelSet)]
pub struct ProgramLabels {
    pub program: String,
    pub status: String,
}

impl Default for DaemonMetrics {
    fn default() -> Self {
        Self {
            bindings: Family::<BindingLabels, Counter>::default(),
            program_starts: Family::<ProgramLabels, Counter>::default(),
            endpoints: Gauge::default(),
        }
    }
}

impl DaemonMetrics {
    /// Register daemon metrics to start tracking them.
    pub fn register(self, r: &mut Registry) -> Self {
        r.register(
            "bindings",
            "Container binding attempts by outcome",
            self.bindings.clone(),
        );
        r.register(
            "program_starts",
            "Program starts by program and status",
            self.program_starts.clone(),
        );
        r.register(
            "endpoints",
            "Endpoints currently registered",
            self.endpoints.clone(),
        );
        self
    }

    /// Registers into the process-wide registry served on `/metrics`.
    pub fn registered() -> Self {
        let metrics = Self::default();
        match REGISTRY.write() {
            Ok(mut guard) => metrics.register(&mut guard),
            Err(_) => {
                warn!("metrics registry lock poisoned, daemon metrics are not exported");
                metrics
            }
        }
    }

    pub fn binding(&self, outcome: &str) {
        self.bindings
            .get_or_create(&BindingLabels {
                outcome: outcome.to_string(),
            })
            .inc();
    }

    pub fn program_start(&self, program: &str, status: &str) {
        self.program_starts
            .get_or_create(&ProgramLabels {
                program: program.to_string(),
                status: status.to_string(),
            })
            .inc();
    }
}
