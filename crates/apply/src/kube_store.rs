//! `ObjectStore` over a live cluster: dynamic APIs resolved through
//! discovery, writes via server-side apply.

use std::time::Duration;

use async_trait::async_trait;
use kube::{
    api::{Api, DeleteParams, Patch, PatchParams, PostParams},
    core::{ApiResource, DynamicObject},
    discovery::{Discovery, Scope},
    Client,
};
use kubetemplater_core::{Gvk, FIELD_MANAGER};
use rustc_hash::FxHashMap;
use serde_json::Value as Json;
use tokio::sync::RwLock;
use tracing::{debug, info};

use crate::{ApplyError, ObjectStore, TargetRef};

const DELETE_POLL: Duration = Duration::from_millis(250);
const DELETE_TIMEOUT: Duration = Duration::from_secs(60);

pub struct KubeObjectStore {
    client: Client,
    resources: RwLock<FxHashMap<Gvk, (ApiResource, bool)>>,
}

impl KubeObjectStore {
    pub fn new(client: Client) -> Self {
        Self { client, resources: RwLock::new(FxHashMap::default()) }
    }

    /// Rerun discovery and replace the cache.
    pub async fn refresh(&self) -> Result<usize, ApplyError> {
        let discovery = Discovery::new(self.client.clone()).run().await?;
        let mut map = FxHashMap::default();
        for group in discovery.groups() {
            for (ar, caps) in group.recommended_resources() {
                let namespaced = matches!(caps.scope, Scope::Namespaced);
                map.insert(Gvk::new(ar.group.clone(), ar.version.clone(), ar.kind.clone()), (ar, namespaced));
            }
        }
        let n = map.len();
        *self.resources.write().await = map;
        info!(resources = n, "discovery refreshed");
        Ok(n)
    }

    async fn resource(&self, gvk: &Gvk) -> Result<(ApiResource, bool), ApplyError> {
        if let Some(hit) = self.resources.read().await.get(gvk) {
            return Ok(hit.clone());
        }
        // Kinds installed after the last refresh (new CRDs) show up here.
        debug!(gvk = %gvk, "discovery cache miss");
        self.refresh().await?;
        self.resources
            .read()
            .await
            .get(gvk)
            .cloned()
            .ok_or_else(|| ApplyError::UnknownKind(gvk.to_string()))
    }

    async fn api(&self, target: &TargetRef) -> Result<Api<DynamicObject>, ApplyError> {
        let (ar, namespaced) = self.resource(&target.gvk).await?;
        match (namespaced, target.namespace.as_deref()) {
            (true, Some(ns)) => Ok(Api::namespaced_with(self.client.clone(), ns, &ar)),
            (true, None) => Err(ApplyError::Manifest(format!("namespace required for namespaced kind {}", target.gvk))),
            (false, _) => Ok(Api::all_with(self.client.clone(), &ar)),
        }
    }
}

fn to_json(obj: &DynamicObject) -> Result<Json, ApplyError> {
    serde_json::to_value(obj).map_err(|e| ApplyError::Manifest(format!("serializing object: {e}")))
}

#[async_trait]
impl ObjectStore for KubeObjectStore {
    async fn get(&self, target: &TargetRef) -> Result<Option<Json>, ApplyError> {
        let api = self.api(target).await?;
        match api.get_opt(&target.name).await? {
            Some(obj) => Ok(Some(to_json(&obj)?)),
            None => Ok(None),
        }
    }

    async fn create(&self, target: &TargetRef, object: &Json, dry_run: bool) -> Result<Json, ApplyError> {
        let api = self.api(target).await?;
        let obj: DynamicObject = serde_json::from_value(object.clone())
            .map_err(|e| ApplyError::Manifest(format!("decoding object: {e}")))?;
        let pp = PostParams { dry_run, field_manager: Some(FIELD_MANAGER.to_string()) };
        let created = api.create(&pp, &obj).await?;
        to_json(&created)
    }

    async fn patch(&self, target: &TargetRef, object: &Json, dry_run: bool) -> Result<Json, ApplyError> {
        let api = self.api(target).await?;
        let mut pp = PatchParams::apply(FIELD_MANAGER).force();
        if dry_run {
            pp = pp.dry_run();
        }
        let patched = api.patch(&target.name, &pp, &Patch::Apply(object)).await?;
        to_json(&patched)
    }

    async fn delete(&self, target: &TargetRef, dry_run: bool) -> Result<(), ApplyError> {
        let api = self.api(target).await?;
        let dp = DeleteParams { dry_run, ..DeleteParams::default() };
        match api.delete(&target.name, &dp).await {
            Ok(_) => {}
            Err(kube::Error::Api(resp)) if resp.code == 404 => return Ok(()),
            Err(e) => return Err(e.into()),
        }
        if dry_run {
            return Ok(());
        }
        let deadline = tokio::time::Instant::now() + DELETE_TIMEOUT;
        while api.get_opt(&target.name).await?.is_some() {
            if tokio::time::Instant::now() >= deadline {
                return Err(ApplyError::Transient(format!("{target} still present after delete")));
            }
            tokio::time::sleep(DELETE_POLL).await;
        }
        Ok(())
    }
}
