use super::*;
use generate_controller_core::{
    client::Result as ClientResult,
    k8s::{
        labels::{Map, Selector},
        policy::{AnyPolicy, ClusterPolicySpec, Generation, PolicySpec, Rule},
        update_request::{RuleContext, UpdateRequestSpec},
        ClusterPolicy, DynamicObject, ResourceExt, ResourceSpec, UpdateRequest,
        UpdateRequestStatus,
    },
    ClientError, Discovery, Event, EventSink, PolicyLister, ResolvedKind, ResourceClient,
    StatusStore,
};
use parking_lot::Mutex;
use serde_json::{json, Value};
use std::{
    collections::{BTreeMap, BTreeSet},
    sync::Arc,
};


type Key = (String, String, String, String);

/// An in-memory cluster.
#[derive(Default)]
struct FakeClient {
    state: Mutex<State>,
}

#[derive(Default)]
struct State {
    objects: BTreeMap<Key, DynamicObject>,
    kinds: Vec<ResolvedKind>,
    writes: Writes,
    next_version: u64,
    fail_deletes: BTreeSet<String>,
    fail_lists: BTreeSet<String>,
    conflicts: usize,
    /// Stored just before the next create, as if written concurrently.
    racing_create: Option<DynamicObject>,
    /// Removed right after it is next read.
    vanishing: Option<Key>,
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
struct Writes {
    creates: usize,
    updates: usize,
    applies: usize,
    deletes: usize,
}

#[derive(Default)]
struct FakeStatus {
    statuses: Mutex<Vec<(String, UpdateRequestStatus)>>,
}

#[derive(Default)]
struct FakeEvents {
    events: Mutex<Vec<Event>>,
}

#[derive(Default)]
struct FakePolicies(Mutex<BTreeMap<String, AnyPolicy>>);

/// Wires a controller to fakes.
struct Harness {
    client: Arc<FakeClient>,
    status: Arc<FakeStatus>,
    events: Arc<FakeEvents>,
    policies: Arc<FakePolicies>,
    controller: GenerateController,
}

// === impl Harness ===

impl Harness {
    fn new() -> Self {
        let client = Arc::new(FakeClient::default());
        let status = Arc::new(FakeStatus::default());
        let events = Arc::new(FakeEvents::default());
        let policies = Arc::new(FakePolicies::default());
        let controller = GenerateController::new(
            client.clone(),
            Arc::new(BasicEngine::new()),
            policies.clone(),
            status.clone(),
            events.clone(),
        );
        Self {
            client,
            status,
            events,
            policies,
            controller,
        }
    }

    fn add_policy(&self, policy: AnyPolicy) {
        self.policies.0.lock().insert(policy.key(), policy);
    }

    fn remove_policy(&self, key: &str) {
        self.policies.0.lock().remove(key);
    }

    async fn process(&self, ur: &UpdateRequest) -> UpdateRequestStatus {
        self.controller
            .process_update_request(ur)
            .await
            .expect("status must be written");
        self.status.last()
    }
}

// === impl FakeClient ===

impl FakeClient {
    fn insert(&self, obj: DynamicObject) -> DynamicObject {
        let mut state = self.state.lock();
        let obj = state.store(obj);
        state.objects.insert(key(&obj), obj.clone());
        obj
    }

    fn remove(&self, spec: &ResourceSpec) {
        self.state.lock().objects.remove(&spec_key(spec));
    }

    fn object(&self, spec: &ResourceSpec) -> Option<DynamicObject> {
        self.state.lock().objects.get(&spec_key(spec)).cloned()
    }

    fn writes(&self) -> Writes {
        self.state.lock().writes
    }

    fn register_kind(&self, api_version: &str, kind: &str, plural: &str) {
        let (group, version) = generate_controller_core::k8s::split_api_version(api_version);
        self.state.lock().kinds.push(ResolvedKind {
            group: group.to_string(),
            version: version.to_string(),
            kind: kind.to_string(),
            plural: plural.to_string(),
            namespaced: true,
        });
    }

    fn fail_delete(&self, name: &str) {
        self.state.lock().fail_deletes.insert(name.to_string());
    }

    fn conflict_next_updates(&self, n: usize) {
        self.state.lock().conflicts = n;
    }

    fn fail_list(&self, kind: &str) {
        self.state.lock().fail_lists.insert(kind.to_string());
    }

    fn create_before_next_create(&self, obj: DynamicObject) {
        self.state.lock().racing_create = Some(obj);
    }

    fn vanish_after_next_read(&self, spec: &ResourceSpec) {
        self.state.lock().vanishing = Some(spec_key(spec));
    }
}

impl State {
    /// Assigns server-managed metadata.
    fn store(&mut self, mut obj: DynamicObject) -> DynamicObject {
        self.next_version += 1;
        if obj.metadata.uid.is_none() {
            obj.metadata.uid = Some(format!("uid-{}", self.next_version));
        }
        obj.metadata.resource_version = Some(self.next_version.to_string());
        obj
    }
}

#[async_trait::async_trait]
impl ResourceClient for FakeClient {
    async fn get(
        &self,
        api_version: &str,
        kind: &str,
        namespace: &str,
        name: &str,
    ) -> ClientResult<DynamicObject> {
        let spec = ResourceSpec::new(api_version, kind, namespace, name);
        let key = spec_key(&spec);
        let mut state = self.state.lock();
        let obj = state
            .objects
            .get(&key)
            .cloned()
            .ok_or_else(|| ClientError::not_found(&spec))?;
        if state.vanishing.as_ref() == Some(&key) {
            state.vanishing = None;
            state.objects.remove(&key);
        }
        Ok(obj)
    }

    async fn list(
        &self,
        api_version: &str,
        kind: &str,
        namespace: &str,
        selector: &Selector,
    ) -> ClientResult<Vec<DynamicObject>> {
        let state = self.state.lock();
        if state.fail_lists.contains(kind) {
            return Err(anyhow::anyhow!("list of {kind} refused").into());
        }
        Ok(state
            .objects
            .iter()
            .filter(|((av, k, ns, _), obj)| {
                av == api_version
                    && k == kind
                    && (namespace.is_empty() || ns == namespace)
                    && selector.matches_map(&labels(obj))
            })
            .map(|(_, obj)| obj.clone())
            .collect())
    }

    async fn create(&self, obj: DynamicObject) -> ClientResult<DynamicObject> {
        let mut state = self.state.lock();
        state.writes.creates += 1;
        if let Some(racing) = state.racing_create.take() {
            let racing = state.store(racing);
            state.objects.insert(key(&racing), racing);
        }
        let key = key(&obj);
        if state.objects.contains_key(&key) {
            return Err(ClientError::AlreadyExists(obj.name_any()));
        }
        let obj = state.store(obj);
        state.objects.insert(key, obj.clone());
        Ok(obj)
    }

    async fn update(&self, mut obj: DynamicObject) -> ClientResult<DynamicObject> {
        let mut state = self.state.lock();
        state.writes.updates += 1;
        if state.conflicts > 0 {
            state.conflicts -= 1;
            return Err(ClientError::Conflict(obj.name_any()));
        }
        let key = key(&obj);
        let Some(current) = state.objects.get(&key) else {
            return Err(ClientError::NotFound(obj.name_any()));
        };
        if obj.metadata.resource_version.is_some()
            && obj.metadata.resource_version != current.metadata.resource_version
        {
            return Err(ClientError::Conflict(obj.name_any()));
        }
        obj.metadata.uid = current.metadata.uid.clone();
        let obj = state.store(obj);
        state.objects.insert(key, obj.clone());
        Ok(obj)
    }

    async fn apply(&self, mut obj: DynamicObject) -> ClientResult<DynamicObject> {
        let mut state = self.state.lock();
        state.writes.applies += 1;
        let key = key(&obj);
        if let Some(current) = state.objects.get(&key) {
            obj.metadata.uid = current.metadata.uid.clone();
        }
        let obj = state.store(obj);
        state.objects.insert(key, obj.clone());
        Ok(obj)
    }

    async fn delete(
        &self,
        api_version: &str,
        kind: &str,
        namespace: &str,
        name: &str,
    ) -> ClientResult<()> {
        let mut state = self.state.lock();
        state.writes.deletes += 1;
        if state.fail_deletes.contains(name) {
            return Err(anyhow::anyhow!("delete of {name} refused").into());
        }
        let spec = ResourceSpec::new(api_version, kind, namespace, name);
        match state.objects.remove(&spec_key(&spec)) {
            Some(_) => Ok(()),
            None => Err(ClientError::not_found(&spec)),
        }
    }

    fn discovery(&self) -> &dyn Discovery {
        self
    }
}

#[async_trait::async_trait]
impl Discovery for FakeClient {
    async fn resolve(&self, api_version: &str, kind: &str) -> ClientResult<ResolvedKind> {
        self.state
            .lock()
            .kinds
            .iter()
            .find(|k| k.kind == kind && (api_version.is_empty() || k.api_version() == api_version))
            .cloned()
            .ok_or_else(|| ClientError::NotFound(format!("kind {kind}")))
    }
}

// === impl FakeStatus ===

impl FakeStatus {
    fn last(&self) -> UpdateRequestStatus {
        self.statuses
            .lock()
            .last()
            .map(|(_, s)| s.clone())
            .expect("a status must have been recorded")
    }

    fn count(&self) -> usize {
        self.statuses.lock().len()
    }
}

#[async_trait::async_trait]
impl StatusStore for FakeStatus {
    async fn update_status(
        &self,
        name: &str,
        status: UpdateRequestStatus,
    ) -> anyhow::Result<UpdateRequest> {
        self.statuses
            .lock()
            .push((name.to_string(), status.clone()));
        let mut ur = UpdateRequest::new(name, UpdateRequestSpec::default());
        ur.status = Some(status);
        Ok(ur)
    }
}

// === impl FakeEvents ===

impl FakeEvents {
    fn reasons(&self) -> Vec<generate_controller_core::Reason> {
        self.events.lock().iter().map(|e| e.reason).collect()
    }
}

impl EventSink for FakeEvents {
    fn emit(&self, event: Event) {
        self.events.lock().push(event);
    }
}

impl PolicyLister for FakePolicies {
    fn get(&self, key: &str) -> Option<AnyPolicy> {
        self.0.lock().get(key).cloned()
    }
}

// === helpers ===

fn key(obj: &DynamicObject) -> Key {
    spec_key(&ResourceSpec::from_object(obj))
}

fn spec_key(spec: &ResourceSpec) -> Key {
    (
        spec.api_version.clone(),
        spec.kind.clone(),
        spec.namespace.clone(),
        spec.name.clone(),
    )
}

fn labels(obj: &DynamicObject) -> Map {
    obj.labels().clone()
}

fn mk_object(api_version: &str, kind: &str, namespace: &str, name: &str, rest: Value) -> DynamicObject {
    let mut doc = json!({
        "apiVersion": api_version,
        "kind": kind,
        "metadata": {"name": name},
    });
    if !namespace.is_empty() {
        doc["metadata"]["namespace"] = json!(namespace);
    }
    if let (Value::Object(doc), Value::Object(rest)) = (&mut doc, rest) {
        for (k, v) in rest {
            if k == "metadata" {
                if let (Some(Value::Object(meta)), Value::Object(extra)) = (doc.get_mut("metadata"), v) {
                    meta.extend(extra);
                }
            } else {
                doc.insert(k, v);
            }
        }
    }
    serde_json::from_value(doc).expect("object must deserialize")
}

fn mk_namespace(name: &str) -> DynamicObject {
    mk_object("v1", "Namespace", "", name, json!({}))
}

fn mk_policy(rules: Vec<Rule>) -> AnyPolicy {
    ClusterPolicy::new(
        "gen-policy",
        ClusterPolicySpec {
            policy: PolicySpec {
                rules,
                ..Default::default()
            },
        },
    )
    .into()
}

fn mk_rule(name: &str, generation: Value) -> Rule {
    let generation: Generation =
        serde_json::from_value(generation).expect("generation must deserialize");
    Rule {
        name: name.to_string(),
        match_resources: Some(json!({"resources": {"kinds": ["Namespace"]}})),
        context: vec![],
        generate: Some(generation),
    }
}

fn mk_update_request(policy: &str, trigger: &DynamicObject, rules: &[&str]) -> UpdateRequest {
    let trigger = ResourceSpec::from_object(trigger);
    UpdateRequest::new(
        "ur-1",
        UpdateRequestSpec {
            policy: policy.to_string(),
            rule_context: rules
                .iter()
                .map(|rule| RuleContext {
                    rule: rule.to_string(),
                    trigger: trigger.clone(),
                    delete_downstream: false,
                    synchronize: false,
                })
                .collect(),
            ..Default::default()
        },
    )
}

/// Returns a copy of the request as if its status recorded `generated`.
fn with_records(mut ur: UpdateRequest, generated: Vec<ResourceSpec>) -> UpdateRequest {
    ur.status = Some(UpdateRequestStatus {
        generated_resources: generated,
        ..Default::default()
    });
    ur
}
