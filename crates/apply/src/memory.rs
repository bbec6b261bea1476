//! In-memory `ObjectStore` emulating the parts of an API server the
//! reconciler relies on: cluster-assigned fields, immutable paths, dry runs.

use std::collections::{BTreeMap, VecDeque};
use std::sync::{Mutex, PoisonError};

use async_trait::async_trait;
use serde_json::Value as Json;

use crate::{ensure_metadata, ApplyError, ObjectStore, TargetRef};

/// A persisted mutation, recorded for assertions.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Mutation {
    Create(TargetRef),
    Patch(TargetRef),
    Delete(TargetRef),
}

#[derive(Default)]
struct State {
    objects: BTreeMap<TargetRef, Json>,
    writes: Vec<Mutation>,
    failures: VecDeque<ApplyError>,
    next_uid: u64,
    next_rv: u64,
    next_ip: u32,
}

pub struct MemoryStore {
    state: Mutex<State>,
    /// (kind, dot path) pairs that may not change once set.
    immutable: Vec<(String, String)>,
}

impl Default for MemoryStore {
    fn default() -> Self { Self::new() }
}

impl MemoryStore {
    /// Immutable paths: `Service` `spec.clusterIP`, `Deployment` `spec.selector`,
    /// `Job` `spec.template`.
    pub fn new() -> Self {
        Self {
            state: Mutex::new(State::default()),
            immutable: vec![
                ("Service".into(), "spec.clusterIP".into()),
                ("Deployment".into(), "spec.selector".into()),
                ("Job".into(), "spec.template".into()),
            ],
        }
    }

    pub fn with_immutable(mut self, kind: &str, path: &str) -> Self {
        self.immutable.push((kind.into(), path.into()));
        self
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, State> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Fail the next store call (any operation) with `err`.
    pub fn fail_next(&self, err: ApplyError) {
        self.lock().failures.push_back(err);
    }

    /// Seed an object as if another actor created it.
    pub fn insert(&self, target: TargetRef, mut object: Json) {
        let mut st = self.lock();
        ensure_metadata(&mut object, &target);
        assign_identity(&mut st, &target, &mut object);
        st.objects.insert(target, object);
    }

    pub fn object(&self, target: &TargetRef) -> Option<Json> {
        self.lock().objects.get(target).cloned()
    }

    pub fn len(&self) -> usize { self.lock().objects.len() }

    pub fn is_empty(&self) -> bool { self.len() == 0 }

    /// Persisted writes in order; dry runs are not recorded.
    pub fn writes(&self) -> Vec<Mutation> { self.lock().writes.clone() }

    fn take_failure(&self) -> Result<(), ApplyError> {
        match self.lock().failures.pop_front() {
            Some(e) => Err(e),
            None => Ok(()),
        }
    }

    fn check_immutable(&self, target: &TargetRef, live: &Json, merged: &Json) -> Result<(), ApplyError> {
        for (kind, path) in &self.immutable {
            if *kind != target.gvk.kind {
                continue;
            }
            let ptr = format!("/{}", path.replace('.', "/"));
            if let (Some(old), Some(new)) = (live.pointer(&ptr), merged.pointer(&ptr)) {
                if old != new {
                    return Err(ApplyError::Immutable(format!(
                        "{} {:?} is invalid: {path}: Invalid value: {new}: field is immutable",
                        target.gvk.kind, target.name
                    )));
                }
            }
        }
        Ok(())
    }
}

fn assign_identity(st: &mut State, target: &TargetRef, object: &mut Json) {
    st.next_uid += 1;
    st.next_rv += 1;
    let uid = format!("00000000-0000-4000-8000-{:012x}", st.next_uid);
    if let Some(meta) = object.get_mut("metadata").and_then(Json::as_object_mut) {
        meta.insert("uid".into(), Json::String(uid));
        meta.insert("resourceVersion".into(), Json::String(st.next_rv.to_string()));
    }
    if target.gvk.kind == "Service" && target.gvk.group.is_empty() {
        let missing = object.pointer("/spec/clusterIP").and_then(Json::as_str).map_or(true, str::is_empty);
        if missing {
            st.next_ip += 1;
            let ip = format!("10.96.{}.{}", st.next_ip / 250, st.next_ip % 250 + 1);
            if let Some(spec) = object.as_object_mut().map(|o| o.entry("spec").or_insert_with(|| Json::Object(Default::default()))) {
                if let Some(spec) = spec.as_object_mut() {
                    spec.insert("clusterIP".into(), Json::String(ip));
                }
            }
        }
    }
}

/// Apply-style merge: objects merge per key, everything else replaces.
fn merge(live: &mut Json, desired: &Json) {
    match (live, desired) {
        (Json::Object(l), Json::Object(d)) => {
            for (k, v) in d {
                match l.get_mut(k) {
                    Some(slot) => merge(slot, v),
                    None => {
                        l.insert(k.clone(), v.clone());
                    }
                }
            }
        }
        (slot, v) => *slot = v.clone(),
    }
}

#[async_trait]
impl ObjectStore for MemoryStore {
    async fn get(&self, target: &TargetRef) -> Result<Option<Json>, ApplyError> {
        self.take_failure()?;
        Ok(self.object(target))
    }

    async fn create(&self, target: &TargetRef, object: &Json, dry_run: bool) -> Result<Json, ApplyError> {
        self.take_failure()?;
        let mut st = self.lock();
        if st.objects.contains_key(target) {
            return Err(ApplyError::Conflict(format!("{target} already exists")));
        }
        let mut obj = object.clone();
        ensure_metadata(&mut obj, target);
        assign_identity(&mut st, target, &mut obj);
        if !dry_run {
            st.objects.insert(target.clone(), obj.clone());
            st.writes.push(Mutation::Create(target.clone()));
        }
        Ok(obj)
    }

    async fn patch(&self, target: &TargetRef, object: &Json, dry_run: bool) -> Result<Json, ApplyError> {
        self.take_failure()?;
        let mut st = self.lock();
        let live = st.objects.get(target).cloned().ok_or_else(|| ApplyError::NotFound(target.to_string()))?;
        let mut merged = live.clone();
        merge(&mut merged, object);
        ensure_metadata(&mut merged, target);
        // Cluster-assigned identity survives the patch.
        for field in ["uid", "resourceVersion"] {
            if let Some(v) = live.pointer(&format!("/metadata/{field}")) {
                if let Some(meta) = merged.get_mut("metadata").and_then(Json::as_object_mut) {
                    meta.insert(field.into(), v.clone());
                }
            }
        }
        self.check_immutable(target, &live, &merged)?;
        if !dry_run {
            st.next_rv += 1;
            let rv = st.next_rv.to_string();
            if let Some(meta) = merged.get_mut("metadata").and_then(Json::as_object_mut) {
                meta.insert("resourceVersion".into(), Json::String(rv));
            }
            st.objects.insert(target.clone(), merged.clone());
            st.writes.push(Mutation::Patch(target.clone()));
        }
        Ok(merged)
    }

    async fn delete(&self, target: &TargetRef, dry_run: bool) -> Result<(), ApplyError> {
        self.take_failure()?;
        let mut st = self.lock();
        if !dry_run && st.objects.remove(target).is_some() {
            st.writes.push(Mutation::Delete(target.clone()));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{create_or_patch, ApplyAction};
    use kubetemplater_core::Gvk;
    use serde_json::json;

    fn svc() -> TargetRef {
        TargetRef { gvk: Gvk::new("", "v1", "Service"), namespace: Some("app".into()), name: "web".into() }
    }

    #[tokio::test]
    async fn create_assigns_uid_and_cluster_ip() {
        let store = MemoryStore::new();
        let out = create_or_patch(&store, &svc(), &json!({"apiVersion": "v1", "kind": "Service", "spec": {"ports": [{"port": 80}]}}), false)
            .await
            .unwrap();
        assert_eq!(out.action, ApplyAction::Created);
        let live = store.object(&svc()).unwrap();
        assert!(live.pointer("/metadata/uid").is_some());
        assert_eq!(live["spec"]["clusterIP"], "10.96.0.2");
        assert_eq!(store.writes(), vec![Mutation::Create(svc())]);
    }

    #[tokio::test]
    async fn changing_an_immutable_field_is_refused_and_leaves_the_object() {
        let store = MemoryStore::new();
        store.insert(svc(), json!({"apiVersion": "v1", "kind": "Service", "spec": {"clusterIP": "10.96.0.10"}}));
        let err = store
            .patch(&svc(), &json!({"spec": {"clusterIP": "10.96.0.99"}}), false)
            .await
            .unwrap_err();
        assert!(matches!(err, ApplyError::Immutable(ref m) if m.contains("field is immutable")));
        assert_eq!(store.object(&svc()).unwrap()["spec"]["clusterIP"], "10.96.0.10");
        assert!(store.writes().is_empty());
    }

    #[tokio::test]
    async fn reapplying_the_live_state_is_a_noop() {
        let store = MemoryStore::new();
        let desired = json!({"apiVersion": "v1", "kind": "Service", "spec": {"ports": [{"port": 80}]}});
        let created = create_or_patch(&store, &svc(), &desired, false).await.unwrap();
        assert!(!created.is_noop());
        assert!(created.summary.adds > 0);

        let again = create_or_patch(&store, &svc(), &desired, true).await.unwrap();
        assert_eq!(again.action, ApplyAction::Patched);
        assert!(again.is_noop(), "{:?}", again.summary);

        let mut labelled = desired.clone();
        labelled["metadata"] = json!({"labels": {"tier": "web"}});
        let changed = create_or_patch(&store, &svc(), &labelled, true).await.unwrap();
        assert!(!changed.is_noop());
        assert_eq!(changed.summary.adds, 1);
    }

    #[tokio::test]
    async fn dry_runs_do_not_persist() {
        let store = MemoryStore::new();
        store.create(&svc(), &json!({"kind": "Service"}), true).await.unwrap();
        assert!(store.is_empty());
        store.insert(svc(), json!({"kind": "Service", "metadata": {"labels": {"a": "1"}}}));
        let merged = store.patch(&svc(), &json!({"metadata": {"labels": {"b": "2"}}}), true).await.unwrap();
        assert_eq!(merged["metadata"]["labels"], json!({"a": "1", "b": "2"}));
        assert!(store.object(&svc()).unwrap()["metadata"]["labels"].get("b").is_none());
        store.delete(&svc(), true).await.unwrap();
        assert_eq!(store.len(), 1);
    }

    #[tokio::test]
    async fn injected_failures_fire_once() {
        let store = MemoryStore::new();
        store.fail_next(ApplyError::Transient("etcd timeout".into()));
        assert!(store.get(&svc()).await.is_err());
        assert!(store.get(&svc()).await.unwrap().is_none());
    }
}
