use crate::k8s::{
    policy::AnyPolicy, ResourceSpec, UpdateRequest, UpdateRequestState, UpdateRequestStatus,
};
use anyhow::Result;

/// Looks up policies by key (`namespace/name` or `name`).
pub trait PolicyLister: Send + Sync {
    fn get(&self, key: &str) -> Option<AnyPolicy>;
}

/// Records the outcome of an update request.
#[async_trait::async_trait]
pub trait StatusStore: Send + Sync {
    async fn update_status(&self, name: &str, status: UpdateRequestStatus)
        -> Result<UpdateRequest>;

    async fn failed(
        &self,
        name: &str,
        message: String,
        generated: Vec<ResourceSpec>,
    ) -> Result<UpdateRequest> {
        let status = UpdateRequestStatus {
            state: UpdateRequestState::Failed,
            message,
            generated_resources: generated,
        };
        self.update_status(name, status).await
    }

    async fn success(&self, name: &str, generated: Vec<ResourceSpec>) -> Result<UpdateRequest> {
        let status = UpdateRequestStatus {
            state: UpdateRequestState::Completed,
            message: String::new(),
            generated_resources: generated,
        };
        self.update_status(name, status).await
    }

    async fn skip(&self, name: &str, generated: Vec<ResourceSpec>) -> Result<UpdateRequest> {
        let status = UpdateRequestStatus {
            state: UpdateRequestState::Skip,
            message: String::new(),
            generated_resources: generated,
        };
        self.update_status(name, status).await
    }
}
