use generate_controller_core::k8s::UpdateRequestState;
use prometheus_client::{
    encoding::EncodeLabelSet,
    metrics::{counter::Counter, family::Family, histogram::Histogram},
    registry::{Registry, Unit},
};
use tokio::time;

#[derive(Clone, Debug)]
pub struct ReconcileMetrics {
    processed: Family<StateLabels, Counter>,
    requeued: Counter,
    dropped: Counter,
    duration: Histogram,
}

#[derive(Clone, Debug, Hash, PartialEq, Eq, EncodeLabelSet)]
struct StateLabels {
    state: String,
}

// === impl ReconcileMetrics ===

impl ReconcileMetrics {
    pub fn register(prom: &mut Registry) -> Self {
        let processed = Family::default();
        prom.register(
            "processed",
            "Count of update requests processed, by resulting state",
            processed.clone(),
        );

        let requeued = Counter::default();
        prom.register(
            "requeued",
            "Count of syncs that failed and were requeued",
            requeued.clone(),
        );

        let dropped = Counter::default();
        prom.register(
            "dropped",
            "Count of keys dropped after exhausting their requeues",
            dropped.clone(),
        );

        let duration = Histogram::new([0.01, 0.05, 0.1, 0.5, 1.0, 5.0, 30.0]);
        prom.register_with_unit(
            "duration",
            "Histogram of update request processing time",
            Unit::Seconds,
            duration.clone(),
        );

        Self {
            processed,
            requeued,
            dropped,
            duration,
        }
    }

    pub(crate) fn processed(&self, state: UpdateRequestState, elapsed: time::Duration) {
        self.processed
            .get_or_create(&StateLabels {
                state: state.to_string(),
            })
            .inc();
        self.duration.observe(elapsed.as_secs_f64());
    }

    pub(crate) fn requeued(&self) {
        self.requeued.inc();
    }

    pub(crate) fn dropped(&self) {
        self.dropped.inc();
    }
}

impl Default for ReconcileMetrics {
    fn default() -> Self {
        Self::register(&mut Registry::default())
    }
}
