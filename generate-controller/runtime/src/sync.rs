use crate::{metrics::ReconcileMetrics, status::StatusControl};
use anyhow::Result;
use generate_controller_background::GenerateController;
use generate_controller_core::k8s::{UpdateRequest, UpdateRequestState};
use generate_controller_k8s_index::SharedUpdateRequestIndex;
use std::sync::Arc;
use tokio::time;

/// Reads update requests from the local cache.
pub trait UpdateRequests: Send + Sync {
    fn get(&self, name: &str) -> Option<UpdateRequest>;

    fn names(&self) -> Vec<String>;
}

/// Moves update requests through their lifecycle.
#[async_trait::async_trait]
pub trait Lifecycle: Send + Sync {
    async fn set_pending(&self, name: &str) -> Result<()>;

    /// Counts a retry and returns a failed request to `Pending`.
    async fn retry(&self, ur: &UpdateRequest) -> Result<()>;

    async fn delete(&self, name: &str) -> Result<()>;
}

/// Reconciles a pending update request, returning the state it was left in.
#[async_trait::async_trait]
pub trait Process: Send + Sync {
    async fn process(&self, ur: &UpdateRequest) -> Result<UpdateRequestState>;
}

/// Drives a single update request one step through its lifecycle:
///
/// - a new request is marked `Pending`;
/// - a `Pending` request is processed and, once `Completed`, deleted;
/// - a `Failed` request is returned to `Pending` until it has been retried
///   `max_retries` times;
/// - a `Skip` request is left alone.
///
/// Each status change is observed through the index, which queues the
/// request again for the next step.
pub struct Syncer {
    requests: Arc<dyn UpdateRequests>,
    lifecycle: Arc<dyn Lifecycle>,
    processor: Arc<dyn Process>,
    max_retries: u32,
    metrics: ReconcileMetrics,
}

// === impl Syncer ===

impl Syncer {
    pub fn new(
        requests: Arc<dyn UpdateRequests>,
        lifecycle: Arc<dyn Lifecycle>,
        processor: Arc<dyn Process>,
        max_retries: u32,
        metrics: ReconcileMetrics,
    ) -> Self {
        Self {
            requests,
            lifecycle,
            processor,
            max_retries,
            metrics,
        }
    }

    pub fn metrics(&self) -> &ReconcileMetrics {
        &self.metrics
    }

    pub async fn sync(&self, name: &str) -> Result<()> {
        let Some(ur) = self.requests.get(name) else {
            tracing::debug!("Update request no longer exists");
            return Ok(());
        };

        match ur.state() {
            UpdateRequestState::Unknown => self.lifecycle.set_pending(name).await,

            UpdateRequestState::Pending => {
                let start = time::Instant::now();
                let state = self.processor.process(&ur).await?;
                self.metrics.processed(state, start.elapsed());
                tracing::info!(policy = %ur.spec.policy, %state, "Processed update request");
                if state == UpdateRequestState::Completed {
                    self.lifecycle.delete(name).await?;
                }
                Ok(())
            }

            UpdateRequestState::Failed => {
                let retries = ur.retry_count();
                if retries >= self.max_retries {
                    tracing::debug!(retries, "Update request exhausted its retries");
                    return Ok(());
                }
                tracing::debug!(retries, "Retrying failed update request");
                self.lifecycle.retry(&ur).await
            }

            UpdateRequestState::Completed => self.lifecycle.delete(name).await,

            UpdateRequestState::Skip => Ok(()),
        }
    }
}

impl UpdateRequests for SharedUpdateRequestIndex {
    fn get(&self, name: &str) -> Option<UpdateRequest> {
        self.read().get(name)
    }

    fn names(&self) -> Vec<String> {
        self.read().names()
    }
}

#[async_trait::async_trait]
impl Lifecycle for StatusControl {
    async fn set_pending(&self, name: &str) -> Result<()> {
        StatusControl::set_pending(self, name).await?;
        Ok(())
    }

    async fn retry(&self, ur: &UpdateRequest) -> Result<()> {
        StatusControl::retry(self, ur).await?;
        Ok(())
    }

    async fn delete(&self, name: &str) -> Result<()> {
        StatusControl::delete(self, name).await
    }
}

#[async_trait::async_trait]
impl Process for GenerateController {
    async fn process(&self, ur: &UpdateRequest) -> Result<UpdateRequestState> {
        self.process_update_request(ur).await
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use generate_controller_core::k8s::{
        update_request::{UpdateRequestSpec, RETRY_COUNT_ANNOTATION},
        UpdateRequestStatus,
    };
    use parking_lot::Mutex;
    use pretty_assertions::assert_eq;
    use std::collections::BTreeMap;

    #[derive(Default)]
    pub(crate) struct FakeRequests(pub(crate) Mutex<BTreeMap<String, UpdateRequest>>);

    #[derive(Clone, Debug, PartialEq, Eq)]
    pub(crate) enum Call {
        Pending(String),
        Retry(String, u32),
        Delete(String),
        Process(String),
    }

    #[derive(Default)]
    pub(crate) struct Recorder {
        pub(crate) calls: Mutex<Vec<Call>>,
        pub(crate) outcome: Mutex<Option<UpdateRequestState>>,
    }

    impl UpdateRequests for FakeRequests {
        fn get(&self, name: &str) -> Option<UpdateRequest> {
            self.0.lock().get(name).cloned()
        }

        fn names(&self) -> Vec<String> {
            self.0.lock().keys().cloned().collect()
        }
    }

    #[async_trait::async_trait]
    impl Lifecycle for Recorder {
        async fn set_pending(&self, name: &str) -> Result<()> {
            self.calls.lock().push(Call::Pending(name.to_string()));
            Ok(())
        }

        async fn retry(&self, ur: &UpdateRequest) -> Result<()> {
            let name = ur.metadata.name.clone().unwrap_or_default();
            self.calls.lock().push(Call::Retry(name, ur.retry_count()));
            Ok(())
        }

        async fn delete(&self, name: &str) -> Result<()> {
            self.calls.lock().push(Call::Delete(name.to_string()));
            Ok(())
        }
    }

    #[async_trait::async_trait]
    impl Process for Recorder {
        async fn process(&self, ur: &UpdateRequest) -> Result<UpdateRequestState> {
            let name = ur.metadata.name.clone().unwrap_or_default();
            self.calls.lock().push(Call::Process(name));
            (*self.outcome.lock()).ok_or_else(|| anyhow::anyhow!("status write failed"))
        }
    }

    pub(crate) fn mk_update_request(
        name: &str,
        state: UpdateRequestState,
        retries: u32,
    ) -> UpdateRequest {
        let mut ur = UpdateRequest::new(
            name,
            UpdateRequestSpec {
                policy: "gen-policy".to_string(),
                ..Default::default()
            },
        );
        ur.metadata.namespace = Some("kyverno".to_string());
        if retries > 0 {
            ur.metadata.annotations = Some(
                maplit::btreemap! { RETRY_COUNT_ANNOTATION.to_string() => retries.to_string() },
            );
        }
        ur.status = Some(UpdateRequestStatus {
            state,
            ..Default::default()
        });
        ur
    }

    pub(crate) fn mk_syncer(
        requests: &[UpdateRequest],
        outcome: Option<UpdateRequestState>,
    ) -> (Syncer, Arc<Recorder>) {
        let store = FakeRequests::default();
        for ur in requests {
            store
                .0
                .lock()
                .insert(ur.metadata.name.clone().unwrap_or_default(), ur.clone());
        }
        let recorder = Arc::new(Recorder::default());
        *recorder.outcome.lock() = outcome;
        let syncer = Syncer::new(
            Arc::new(store),
            recorder.clone(),
            recorder.clone(),
            3,
            ReconcileMetrics::default(),
        );
        (syncer, recorder)
    }

    #[tokio::test(flavor = "current_thread")]
    async fn new_requests_become_pending() {
        let (syncer, recorder) =
            mk_syncer(&[mk_update_request("ur", UpdateRequestState::Unknown, 0)], None);
        syncer.sync("ur").await.expect("sync must succeed");
        assert_eq!(*recorder.calls.lock(), vec![Call::Pending("ur".to_string())]);
    }

    #[tokio::test(flavor = "current_thread")]
    async fn completed_requests_are_deleted() {
        let (syncer, recorder) = mk_syncer(
            &[mk_update_request("ur", UpdateRequestState::Pending, 0)],
            Some(UpdateRequestState::Completed),
        );
        syncer.sync("ur").await.expect("sync must succeed");
        assert_eq!(
            *recorder.calls.lock(),
            vec![
                Call::Process("ur".to_string()),
                Call::Delete("ur".to_string())
            ]
        );
    }

    #[tokio::test(flavor = "current_thread")]
    async fn failed_processing_is_kept() {
        let (syncer, recorder) = mk_syncer(
            &[mk_update_request("ur", UpdateRequestState::Pending, 0)],
            Some(UpdateRequestState::Failed),
        );
        syncer.sync("ur").await.expect("sync must succeed");
        assert_eq!(*recorder.calls.lock(), vec![Call::Process("ur".to_string())]);
    }

    #[tokio::test(flavor = "current_thread")]
    async fn status_write_errors_are_returned() {
        let (syncer, _) =
            mk_syncer(&[mk_update_request("ur", UpdateRequestState::Pending, 0)], None);
        assert!(syncer.sync("ur").await.is_err());
    }

    #[tokio::test(flavor = "current_thread")]
    async fn failed_requests_are_retried_until_exhausted() {
        let (syncer, recorder) = mk_syncer(
            &[
                mk_update_request("again", UpdateRequestState::Failed, 2),
                mk_update_request("done", UpdateRequestState::Failed, 3),
            ],
            None,
        );
        syncer.sync("again").await.expect("sync must succeed");
        syncer.sync("done").await.expect("sync must succeed");
        assert_eq!(
            *recorder.calls.lock(),
            vec![Call::Retry("again".to_string(), 2)]
        );
    }

    #[tokio::test(flavor = "current_thread")]
    async fn skipped_and_missing_requests_are_ignored() {
        let (syncer, recorder) =
            mk_syncer(&[mk_update_request("ur", UpdateRequestState::Skip, 0)], None);
        syncer.sync("ur").await.expect("sync must succeed");
        syncer.sync("gone").await.expect("sync must succeed");
        assert!(recorder.calls.lock().is_empty());
    }
}
