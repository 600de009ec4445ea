use crate::SharedMirror;
use deployment_scaler_core::WatchEvent;
use prometheus_client::{
    collector::Collector,
    encoding::{DescriptorEncoder, EncodeLabelSet, EncodeMetric},
    metrics::{counter::Counter, family::Family, gauge::ConstGauge, MetricType},
    registry::Registry,
};

#[derive(Clone, Debug, Default)]
pub struct SyncMetrics {
    events: Family<EventLabels, Counter>,
    stale_events: Counter,
    watch_restarts: Counter,
    relists: Family<RelistLabels, Counter>,
}

/// Why the synchronizer listed the full collection.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub(crate) enum Relist {
    Initial,
    Resync,
    Expired,
}

#[derive(Clone, Debug, Hash, PartialEq, Eq, EncodeLabelSet)]
struct EventLabels {
    kind: &'static str,
}

#[derive(Clone, Debug, Hash, PartialEq, Eq, EncodeLabelSet)]
struct RelistLabels {
    reason: &'static str,
}

#[derive(Debug)]
struct Instrumented(SharedMirror);

/// Registers a collector that reports the size of the mirror.
pub fn register_mirror(reg: &mut Registry, mirror: SharedMirror) {
    reg.register_collector(Box::new(Instrumented(mirror)));
}

// === impl SyncMetrics ===

impl SyncMetrics {
    pub fn register(reg: &mut Registry) -> Self {
        let events = Family::default();
        reg.register(
            "events",
            "Count of watch events received by the synchronizer",
            events.clone(),
        );

        let stale_events = Counter::default();
        reg.register(
            "stale_events",
            "Count of watch events ignored because the mirror held a newer version",
            stale_events.clone(),
        );

        let watch_restarts = Counter::default();
        reg.register(
            "watch_restarts",
            "Count of watch subscriptions restarted after an error or disconnect",
            watch_restarts.clone(),
        );

        let relists = Family::default();
        reg.register(
            "relists",
            "Count of full lists of the deployment collection",
            relists.clone(),
        );

        Self {
            events,
            stale_events,
            watch_restarts,
            relists,
        }
    }

    pub(crate) fn event(&self, ev: &WatchEvent) {
        self.events
            .get_or_create(&EventLabels { kind: ev.kind() })
            .inc();
    }

    pub(crate) fn stale_event(&self) {
        self.stale_events.inc();
    }

    pub(crate) fn watch_restart(&self) {
        self.watch_restarts.inc();
    }

    pub(crate) fn relist(&self, reason: Relist) {
        let reason = match reason {
            Relist::Initial => "initial",
            Relist::Resync => "resync",
            Relist::Expired => "expired",
        };
        self.relists.get_or_create(&RelistLabels { reason }).inc();
    }
}

impl Collector for Instrumented {
    fn encode(&self, mut encoder: DescriptorEncoder<'_>) -> Result<(), std::fmt::Error> {
        let mirror = self.0.read();

        let total_encoder = encoder.encode_descriptor(
            "objects",
            "The number of deployments in the mirror",
            None,
            MetricType::Gauge,
        )?;
        ConstGauge::new(mirror.len() as i64).encode(total_encoder)?;

        let mut ns_encoder = encoder.encode_descriptor(
            "namespace_objects",
            "The number of deployments in the mirror by namespace",
            None,
            MetricType::Gauge,
        )?;
        for (ns, len) in mirror.namespaces() {
            let labels = vec![("namespace", ns)];
            let encoder = ns_encoder.encode_family(&labels)?;
            ConstGauge::new(len as i64).encode(encoder)?;
        }

        Ok(())
    }
}
