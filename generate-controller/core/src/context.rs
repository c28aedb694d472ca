use crate::k8s::{
    policy::AnyPolicy,
    update_request::{Operation, RequestInfo},
};
use serde_json::{Map, Value};

/// A JSON document holding the variables visible to a rule.
///
/// Paths are dotted (`request.object.metadata.name`); numeric segments and
/// `[n]` suffixes index into arrays.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct JsonContext {
    data: Map<String, Value>,
    checkpoints: Vec<Map<String, Value>>,
}

/// Everything needed to evaluate one policy against one trigger.
#[derive(Clone, Debug)]
pub struct PolicyContext {
    pub policy: AnyPolicy,
    pub new_resource: Option<Value>,
    pub old_resource: Option<Value>,
    pub operation: Operation,
    pub request_info: RequestInfo,
    pub json: JsonContext,
}

// === impl JsonContext ===

impl JsonContext {
    pub fn add(&mut self, path: &str, value: Value) {
        let segments = split_path(path);
        let Some((last, parents)) = segments.split_last() else {
            return;
        };

        let mut map = &mut self.data;
        for seg in parents {
            let entry = map
                .entry(seg.to_string())
                .or_insert_with(|| Value::Object(Map::new()));
            if !entry.is_object() {
                *entry = Value::Object(Map::new());
            }
            map = match entry {
                Value::Object(m) => m,
                _ => return,
            };
        }
        map.insert(last.to_string(), value);
    }

    pub fn query(&self, path: &str) -> Option<&Value> {
        let mut segments = split_path(path).into_iter();
        let first = segments.next()?;
        let mut value = self.data.get(first)?;
        for seg in segments {
            value = match value {
                Value::Object(m) => m.get(seg)?,
                Value::Array(a) => a.get(seg.parse::<usize>().ok()?)?,
                _ => return None,
            };
        }
        Some(value)
    }

    pub fn as_value(&self) -> Value {
        Value::Object(self.data.clone())
    }

    /// Saves the current state so that per-element bindings can be undone.
    pub fn checkpoint(&mut self) {
        self.checkpoints.push(self.data.clone());
    }

    /// Restores the most recent checkpoint and discards it.
    pub fn restore(&mut self) {
        if let Some(data) = self.checkpoints.pop() {
            self.data = data;
        }
    }

    /// Restores the most recent checkpoint, keeping it for reuse.
    pub fn reset(&mut self) {
        if let Some(data) = self.checkpoints.last() {
            self.data = data.clone();
        }
    }
}

fn split_path(path: &str) -> Vec<&str> {
    path.split('.')
        .flat_map(|seg| seg.split(['[', ']']))
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .collect()
}

// === impl PolicyContext ===

impl PolicyContext {
    pub fn new(
        policy: AnyPolicy,
        new_resource: Option<Value>,
        old_resource: Option<Value>,
        operation: Operation,
        request_info: RequestInfo,
    ) -> Self {
        let mut json = JsonContext::default();
        json.add("request.operation", serde_json::json!(operation));
        if let Some(obj) = new_resource.as_ref() {
            json.add("request.object", obj.clone());
        }
        if let Some(obj) = old_resource.as_ref() {
            json.add("request.oldObject", obj.clone());
        }
        let namespace = new_resource
            .as_ref()
            .or(old_resource.as_ref())
            .and_then(|o| o.pointer("/metadata/namespace"))
            .cloned()
            .unwrap_or(Value::String(String::new()));
        json.add("request.namespace", namespace);

        json.add("request.roles", serde_json::json!(request_info.roles));
        json.add(
            "request.clusterRoles",
            serde_json::json!(request_info.cluster_roles),
        );
        if let Some(user) = request_info.user_info.as_ref() {
            json.add("request.userInfo", user.clone());
            if let Some((ns, name)) = user
                .get("username")
                .and_then(Value::as_str)
                .and_then(|u| u.strip_prefix("system:serviceaccount:"))
                .and_then(|sa| sa.split_once(':'))
            {
                json.add("serviceAccountNamespace", Value::String(ns.to_string()));
                json.add("serviceAccountName", Value::String(name.to_string()));
            }
        }

        Self {
            policy,
            new_resource,
            old_resource,
            operation,
            request_info,
            json,
        }
    }

    /// The resource the policy is evaluated against: the new object, or the
    /// old object for deletions.
    pub fn resource(&self) -> Option<&Value> {
        self.new_resource.as_ref().or(self.old_resource.as_ref())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;
    use serde_json::json;

    #[test]
    fn add_and_query() {
        let mut ctx = JsonContext::default();
        ctx.add("request.object", json!({"metadata": {"name": "web"}, "items": [1, 2]}));
        ctx.add("element", json!("a"));

        assert_eq!(ctx.query("request.object.metadata.name"), Some(&json!("web")));
        assert_eq!(ctx.query("request.object.items[1]"), Some(&json!(2)));
        assert_eq!(ctx.query("request.object.items.0"), Some(&json!(1)));
        assert_eq!(ctx.query("element"), Some(&json!("a")));
        assert_eq!(ctx.query("request.missing"), None);
    }

    #[test]
    fn checkpoint_restore() {
        let mut ctx = JsonContext::default();
        ctx.add("a", json!(1));
        ctx.checkpoint();
        ctx.add("b", json!(2));
        assert_eq!(ctx.query("b"), Some(&json!(2)));
        ctx.reset();
        assert_eq!(ctx.query("b"), None);
        ctx.add("b", json!(3));
        ctx.restore();
        assert_eq!(ctx.query("b"), None);
        assert_eq!(ctx.query("a"), Some(&json!(1)));
    }

    #[test]
    fn policy_context_variables() {
        let policy = AnyPolicy::from(crate::k8s::ClusterPolicy::new("p", Default::default()));
        let ctx = PolicyContext::new(
            policy,
            Some(json!({"kind": "ConfigMap", "metadata": {"name": "cm", "namespace": "team-a"}})),
            None,
            Operation::Create,
            RequestInfo {
                user_info: Some(json!({"username": "system:serviceaccount:kube-system:builder"})),
                ..Default::default()
            },
        );
        assert_eq!(ctx.json.query("request.namespace"), Some(&json!("team-a")));
        assert_eq!(ctx.json.query("request.operation"), Some(&json!("CREATE")));
        assert_eq!(ctx.json.query("serviceAccountName"), Some(&json!("builder")));
        assert_eq!(
            ctx.json.query("serviceAccountNamespace"),
            Some(&json!("kube-system"))
        );
    }
}
