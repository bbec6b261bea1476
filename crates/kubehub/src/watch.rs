//! Template and policy watchers feeding the work queue.

use std::collections::BTreeSet;
use std::sync::Arc;
use std::time::Duration;

use futures::StreamExt;
use kube::{
    api::Api,
    runtime::{
        watcher::{self, Event},
        WatchStreamExt,
    },
    Client,
};
use kubetemplater_core::{priority, KubeTemplate, KubeTemplatePolicy, ObjectKey};
use kubetemplater_policy::{PolicyResolver, PolicyStats};
use kubetemplater_queue::WorkQueue;
use kubetemplater_reconcile::StatusSink;
use metrics::counter;
use tracing::{debug, info, warn};

use crate::tracker::GenerationTracker;

/// State shared by the watchers and the resync loop.
pub struct WatchContext {
    pub queue: Arc<WorkQueue>,
    pub resolver: Arc<PolicyResolver>,
    pub stats: Arc<PolicyStats>,
    pub tracker: Arc<GenerationTracker>,
    pub sink: Arc<dyn StatusSink>,
}

impl WatchContext {
    /// Apply one template event. Returns how many keys were enqueued.
    pub fn on_template(&self, event: Event<KubeTemplate>) -> usize {
        match event {
            Event::Applied(t) => usize::from(self.observe_template(&t)),
            Event::Deleted(t) => {
                let key = ObjectKey::of(&t);
                debug!(template = %key, "template deleted");
                self.tracker.forget(&key);
                self.stats.forget_template(&key);
                0
            }
            Event::Restarted(list) => {
                let live: BTreeSet<ObjectKey> = list.iter().map(ObjectKey::of).collect();
                for gone in self.tracker.retain(|k| live.contains(k)) {
                    self.stats.forget_template(&gone);
                }
                debug!(count = list.len(), "template watch restart");
                list.iter().filter(|t| self.observe_template(t)).count()
            }
        }
    }

    fn observe_template(&self, t: &KubeTemplate) -> bool {
        let key = ObjectKey::of(t);
        if !self.tracker.observe(&key, t.metadata.generation) {
            return false;
        }
        counter!("watch_events_total", 1u64, "kind" => "KubeTemplate");
        self.queue.enqueue(key, priority::TEMPLATE_CHANGE);
        true
    }

    /// Apply one policy event: update the index, re-enqueue templates in every
    /// affected source namespace and return the policies whose status may have
    /// changed.
    pub fn on_policy(&self, event: Event<KubeTemplatePolicy>) -> Vec<ObjectKey> {
        let mut namespaces = BTreeSet::new();
        match event {
            Event::Applied(p) => self.index_policy(&p, &mut namespaces),
            Event::Deleted(p) => {
                let key = ObjectKey::of(&p);
                if let Some(old) = self.resolver.remove(&key) {
                    namespaces.insert(old.source_namespace);
                }
                self.stats.forget_policy(&key);
            }
            Event::Restarted(list) => {
                let live: BTreeSet<ObjectKey> = list.iter().map(ObjectKey::of).collect();
                let stale: Vec<ObjectKey> =
                    self.resolver.snapshot().entries.keys().filter(|k| !live.contains(*k)).cloned().collect();
                for key in stale {
                    if let Some(old) = self.resolver.remove(&key) {
                        namespaces.insert(old.source_namespace);
                    }
                    self.stats.forget_policy(&key);
                }
                for p in &list {
                    self.index_policy(p, &mut namespaces);
                }
            }
        }
        if namespaces.is_empty() {
            return Vec::new();
        }
        let mut enqueued = 0usize;
        for ns in &namespaces {
            for key in self.tracker.keys_in(ns) {
                self.queue.enqueue(key, priority::POLICY_CHANGE);
                enqueued += 1;
            }
        }
        info!(namespaces = ?namespaces, enqueued, "policy change fanned out");
        let index = self.resolver.snapshot();
        index.entries.values().filter(|e| namespaces.contains(&e.source_namespace)).map(|e| e.key.clone()).collect()
    }

    /// Index `p` unless the stored entry already has its generation, which
    /// filters out the events produced by our own status writes.
    fn index_policy(&self, p: &KubeTemplatePolicy, namespaces: &mut BTreeSet<String>) {
        let key = ObjectKey::of(p);
        let previous = self.resolver.snapshot().entries.get(&key).cloned();
        if let Some(prev) = &previous {
            if prev.generation.is_some() && prev.generation == p.metadata.generation {
                return;
            }
        }
        let Some(entry) = self.resolver.upsert(p) else { return };
        counter!("watch_events_total", 1u64, "kind" => "KubeTemplatePolicy");
        if let Some(prev) = previous {
            namespaces.insert(prev.source_namespace);
        }
        namespaces.insert(entry.source_namespace);
    }

    /// Write the current status of each policy; failures are logged.
    pub async fn publish_policy_statuses(&self, keys: &[ObjectKey]) {
        let index = self.resolver.snapshot();
        for key in keys {
            let Some(entry) = index.entries.get(key) else { continue };
            let status = self.stats.status_for(entry, &index);
            if let Err(e) = self.sink.policy_status(key, &status).await {
                warn!(policy = %key, error = %e, "policy status write failed");
            }
        }
    }

    /// Enqueue every known template at resync priority.
    pub fn resync(&self) -> usize {
        let keys = self.tracker.keys();
        let n = keys.len();
        for key in keys {
            self.queue.enqueue(key, priority::RESYNC);
        }
        counter!("resync_total", 1u64);
        n
    }
}

/// Watch `KubeTemplate`s in all namespaces until the stream ends.
pub async fn watch_templates(client: Client, ctx: Arc<WatchContext>) -> anyhow::Result<()> {
    let api: Api<KubeTemplate> = Api::all(client);
    let stream = watcher::watcher(api, watcher::Config::default()).default_backoff();
    futures::pin_mut!(stream);
    info!("template watcher started");
    while let Some(ev) = stream.next().await {
        match ev {
            Ok(ev) => {
                ctx.on_template(ev);
            }
            Err(e) => warn!(error = %e, "template watch error"),
        }
        if ctx.queue.is_shutdown() {
            break;
        }
    }
    warn!("template watcher stopped");
    Ok(())
}

/// Watch `KubeTemplatePolicy`s in the control namespace until the stream ends.
pub async fn watch_policies(client: Client, ctx: Arc<WatchContext>) -> anyhow::Result<()> {
    let api: Api<KubeTemplatePolicy> = Api::namespaced(client, ctx.resolver.control_namespace());
    let stream = watcher::watcher(api, watcher::Config::default()).default_backoff();
    futures::pin_mut!(stream);
    info!(namespace = %ctx.resolver.control_namespace(), "policy watcher started");
    while let Some(ev) = stream.next().await {
        match ev {
            Ok(ev) => {
                let changed = ctx.on_policy(ev);
                ctx.publish_policy_statuses(&changed).await;
            }
            Err(e) => warn!(error = %e, "policy watch error"),
        }
        if ctx.queue.is_shutdown() {
            break;
        }
    }
    warn!("policy watcher stopped");
    Ok(())
}

/// Periodically enqueue every known template until the queue shuts down.
pub async fn resync_loop(ctx: Arc<WatchContext>, period: Duration) {
    let mut tick = tokio::time::interval(period);
    tick.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
    tick.tick().await;
    loop {
        tick.tick().await;
        if ctx.queue.is_shutdown() {
            break;
        }
        let n = ctx.resync();
        debug!(templates = n, "resync enqueued");
    }
}
