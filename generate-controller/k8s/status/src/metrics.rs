use prometheus_client::{
    encoding::EncodeLabelSet,
    metrics::{counter::Counter, family::Family},
    registry::Registry,
};

/// Counts status patches and event deliveries.
#[derive(Clone, Debug)]
pub struct ControllerMetrics {
    pub(crate) patch_succeeded: Counter,
    pub(crate) patch_failed: Counter,
    pub(crate) patch_timeout: Counter,
    pub(crate) events_published: Family<ReasonLabels, Counter>,
    pub(crate) events_dropped: Counter,
    pub(crate) events_failed: Counter,
}

#[derive(Clone, Debug, Hash, PartialEq, Eq, EncodeLabelSet)]
pub(crate) struct ReasonLabels {
    pub(crate) reason: String,
}

// === impl ControllerMetrics ===

impl ControllerMetrics {
    pub fn register(prom: &mut Registry) -> Self {
        let patch_succeeded = Counter::default();
        prom.register(
            "patch_succeeded",
            "Count of successful update request status patches",
            patch_succeeded.clone(),
        );

        let patch_failed = Counter::default();
        prom.register(
            "patch_failed",
            "Count of failed update request status patches",
            patch_failed.clone(),
        );

        let patch_timeout = Counter::default();
        prom.register(
            "patch_timeout",
            "Count of update request status patches that timed out",
            patch_timeout.clone(),
        );

        let events_published = Family::default();
        prom.register(
            "events_published",
            "Count of events published, by reason",
            events_published.clone(),
        );

        let events_dropped = Counter::default();
        prom.register(
            "events_dropped",
            "Count of events dropped because the event queue was full",
            events_dropped.clone(),
        );

        let events_failed = Counter::default();
        prom.register(
            "events_failed",
            "Count of events the API server rejected",
            events_failed.clone(),
        );

        Self {
            patch_succeeded,
            patch_failed,
            patch_timeout,
            events_published,
            events_dropped,
            events_failed,
        }
    }
}

impl Default for ControllerMetrics {
    fn default() -> Self {
        Self::register(&mut Registry::default())
    }
}
