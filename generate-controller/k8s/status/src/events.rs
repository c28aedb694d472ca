use crate::metrics::{ControllerMetrics, ReasonLabels};
use generate_controller_core::{
    k8s::ResourceSpec, Event, EventSink, EventType, CONTROLLER_NAME,
};
use k8s_openapi::api::core::v1::ObjectReference;
use kube::runtime::events::{self as kevents, Recorder, Reporter};
use tokio::sync::mpsc::{self, error::TrySendError};

const POLICY_API_VERSION: &str = "kyverno.io/v1";

/// Notes longer than this are rejected by the events API.
const MAX_NOTE_LEN: usize = 1024;

/// Queues events for a background publisher.
///
/// Emitting never blocks: when the queue is full, the event is dropped.
#[derive(Clone, Debug)]
pub struct EventRecorder {
    tx: mpsc::Sender<Event>,
    metrics: ControllerMetrics,
}

// === impl EventRecorder ===

impl EventRecorder {
    pub fn channel(capacity: usize, metrics: ControllerMetrics) -> (Self, mpsc::Receiver<Event>) {
        let (tx, rx) = mpsc::channel(capacity);
        (Self { tx, metrics }, rx)
    }
}

impl EventSink for EventRecorder {
    fn emit(&self, event: Event) {
        match self.tx.try_send(event) {
            Ok(()) => {}
            Err(TrySendError::Full(event)) => {
                self.metrics.events_dropped.inc();
                tracing::warn!(policy = %event.policy, reason = %event.reason, "Event queue full; dropping event");
            }
            Err(TrySendError::Closed(_)) => {
                tracing::debug!("Event publisher stopped");
            }
        }
    }
}

/// Publishes queued events until every [`EventRecorder`] is dropped.
pub async fn publish_events(
    client: kube::Client,
    hostname: String,
    mut events: mpsc::Receiver<Event>,
    metrics: ControllerMetrics,
) {
    let recorder = Recorder::new(
        client,
        Reporter {
            controller: CONTROLLER_NAME.to_string(),
            instance: Some(hostname),
        },
    );
    while let Some(event) = events.recv().await {
        let (reference, kevent) = to_kube_event(&event);
        match recorder.publish(&kevent, &reference).await {
            Ok(()) => {
                metrics
                    .events_published
                    .get_or_create(&ReasonLabels {
                        reason: event.reason.to_string(),
                    })
                    .inc();
            }
            Err(error) => {
                metrics.events_failed.inc();
                tracing::warn!(policy = %event.policy, %error, "Failed to publish event");
            }
        }
    }
    tracing::debug!("Event channel closed");
}

/// Describes an event on its policy, referencing the affected resource as
/// the related object.
fn to_kube_event(event: &Event) -> (ObjectReference, kevents::Event) {
    let type_ = match event.reason.event_type() {
        EventType::Normal => kevents::EventType::Normal,
        EventType::Warning => kevents::EventType::Warning,
    };
    let mut note = match &event.source {
        Some(source) => format!("{} (rule {}, from {source})", event.message, event.rule),
        None => format!("{} (rule {})", event.message, event.rule),
    };
    truncate(&mut note, MAX_NOTE_LEN);

    let kevent = kevents::Event {
        type_,
        reason: event.reason.to_string(),
        note: Some(note),
        action: "Generate".to_string(),
        secondary: Some(resource_reference(&event.resource)),
    };
    (policy_reference(&event.policy), kevent)
}

/// Builds a reference to a policy from its key: `namespace/name` names a
/// `Policy`, a bare name a `ClusterPolicy`.
fn policy_reference(key: &str) -> ObjectReference {
    let (kind, namespace, name) = match key.split_once('/') {
        Some((ns, name)) => ("Policy", Some(ns.to_string()), name),
        None => ("ClusterPolicy", None, key),
    };
    ObjectReference {
        api_version: Some(POLICY_API_VERSION.to_string()),
        kind: Some(kind.to_string()),
        namespace,
        name: Some(name.to_string()),
        ..Default::default()
    }
}

fn resource_reference(spec: &ResourceSpec) -> ObjectReference {
    let non_empty = |s: &str| (!s.is_empty()).then(|| s.to_string());
    ObjectReference {
        api_version: non_empty(&spec.api_version),
        kind: non_empty(&spec.kind),
        namespace: non_empty(&spec.namespace),
        name: non_empty(&spec.name),
        uid: non_empty(&spec.uid),
        ..Default::default()
    }
}

fn truncate(s: &mut String, max: usize) {
    if s.len() <= max {
        return;
    }
    let mut end = max;
    while !s.is_char_boundary(end) {
        end -= 1;
    }
    s.truncate(end);
}

#[cfg(test)]
mod tests {
    use super::*;
    use generate_controller_core::Reason;
    use pretty_assertions::assert_eq;

    fn mk_event(policy: &str, reason: Reason) -> Event {
        Event {
            policy: policy.to_string(),
            rule: "gen".to_string(),
            reason,
            message: "resource generated".to_string(),
            resource: ResourceSpec::new("v1", "ConfigMap", "team", "cm"),
            source: None,
        }
    }

    #[test]
    fn events_reference_their_policy() {
        let (reference, event) = to_kube_event(&mk_event("team/p", Reason::PolicyApplied));
        assert_eq!(reference.kind.as_deref(), Some("Policy"));
        assert_eq!(reference.namespace.as_deref(), Some("team"));
        assert_eq!(reference.name.as_deref(), Some("p"));
        assert_eq!(event.reason, "PolicyApplied");
        assert!(matches!(event.type_, kevents::EventType::Normal));
        assert_eq!(event.note.as_deref(), Some("resource generated (rule gen)"));
        let secondary = event.secondary.expect("resource must be referenced");
        assert_eq!(secondary.name.as_deref(), Some("cm"));
        assert_eq!(secondary.uid, None);

        let (reference, event) = to_kube_event(&mk_event("cp", Reason::PolicyError));
        assert_eq!(reference.kind.as_deref(), Some("ClusterPolicy"));
        assert_eq!(reference.namespace, None);
        assert!(matches!(event.type_, kevents::EventType::Warning));
    }

    #[test]
    fn long_notes_are_truncated() {
        let mut event = mk_event("cp", Reason::PolicyError);
        event.message = "é".repeat(MAX_NOTE_LEN);
        let (_, event) = to_kube_event(&event);
        let note = event.note.expect("note");
        assert!(note.len() <= MAX_NOTE_LEN);
        assert!(note.starts_with('é'));
    }

    #[tokio::test(flavor = "current_thread")]
    async fn full_queue_drops_events() {
        let metrics = ControllerMetrics::default();
        let (recorder, mut rx) = EventRecorder::channel(1, metrics.clone());
        recorder.emit(mk_event("cp", Reason::PolicyApplied));
        recorder.emit(mk_event("cp", Reason::PolicyError));
        assert_eq!(metrics.events_dropped.get(), 1);

        let event = rx.recv().await.expect("first event is queued");
        assert_eq!(event.reason, Reason::PolicyApplied);
        drop(recorder);
        assert!(rx.recv().await.is_none());
    }
}
