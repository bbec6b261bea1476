//! Queue-driven worker loop.

use std::sync::Arc;

use kubetemplater_core::TemplatePhase;
use kubetemplater_queue::{RequeueOutcome, WorkItem, WorkQueue};
use metrics::counter;
use tracing::{debug, info, warn};

use crate::reconciler::{publish, ReconcileOutcome, Reconciler, Trigger};
use crate::status::StatusBuilder;
use crate::{StatusSink, TemplateSource};

/// Everything a worker needs; shared by all workers.
pub struct WorkerContext {
    pub queue: Arc<WorkQueue>,
    pub reconciler: Arc<Reconciler>,
    pub source: Arc<dyn TemplateSource>,
    pub sink: Arc<dyn StatusSink>,
}

/// Dequeue, reconcile, then `done` or `requeue` until the queue shuts down.
pub async fn run_worker(id: usize, ctx: Arc<WorkerContext>) {
    info!(worker = id, "worker started");
    while let Some(item) = ctx.queue.dequeue().await {
        let template = match ctx.source.get(&item.key).await {
            Ok(Some(t)) => t,
            Ok(None) => {
                debug!(worker = id, template = %item.key, "template gone; dropping work");
                ctx.reconciler.stats().forget_template(&item.key);
                ctx.queue.done(&item);
                continue;
            }
            Err(e) => {
                warn!(worker = id, template = %item.key, error = %e, "template read failed");
                retry_or_pause(id, &ctx, item, None, &e.to_string()).await;
                continue;
            }
        };

        let trigger = Trigger::from_priority(item.priority);
        let outcome = ctx.reconciler.reconcile(&template, trigger, ctx.sink.as_ref()).await;
        match outcome {
            ReconcileOutcome::Failed { message, retryable: true } => {
                retry_or_pause(id, &ctx, item, template.metadata.generation, &message).await;
            }
            _ => ctx.queue.done(&item),
        }
    }
    info!(worker = id, "worker stopped");
}

/// Requeue a failed item; once the queue drops it, mark the template Paused.
async fn retry_or_pause(id: usize, ctx: &WorkerContext, item: WorkItem, generation: Option<i64>, message: &str) {
    let key = item.key.clone();
    match ctx.queue.requeue(item, message) {
        RequeueOutcome::Scheduled { delay, retries, cycles } => {
            debug!(worker = id, template = %key, delay_ms = delay.as_millis() as u64, retries, cycles, "retry scheduled");
        }
        RequeueOutcome::Dropped { cycles } => {
            warn!(worker = id, template = %key, cycles, "retries exhausted; pausing template");
            counter!("reconcile_paused_total", 1u64);
            let status = StatusBuilder::new(generation)
                .build(TemplatePhase::Paused, format!("Paused after {cycles} retry cycle(s); last error: {message}"));
            publish(ctx.sink.as_ref(), &key, &status).await;
        }
        RequeueOutcome::Closed => {}
    }
}
