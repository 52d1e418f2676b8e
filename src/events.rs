//! Domain event and job bus seams.
//!
//! Events are dispatched strictly after the metadata transaction commits;
//! listeners must tolerate at-least-once delivery. The default
//! implementations are in-process tokio channels consumed by the queue
//! worker, but the traits keep an external broker swappable.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;

/// Serializable domain events emitted by the upload pipeline.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "type")]
pub enum DomainEvent {
    AvatarUpdated {
        user_id: String,
        new_media_id: String,
        old_media_id: Option<String>,
        version: Option<String>,
        collection: String,
        replaced: bool,
        url: Option<String>,
    },
    AvatarDeleted {
        user_id: String,
        media_id: String,
    },
    /// Non-avatar profiles emit the generic equivalent.
    MediaUpdated {
        owner_id: String,
        new_media_id: String,
        old_media_id: Option<String>,
        collection: String,
        replaced: bool,
    },
}

/// Queue jobs the pipeline defers to workers.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(tag = "type")]
pub enum Job {
    PostProcess { tenant_id: String, owner_id: String },
}

#[async_trait]
pub trait EventBus: Send + Sync {
    async fn dispatch(&self, event: DomainEvent);
}

#[async_trait]
pub trait JobBus: Send + Sync {
    async fn dispatch(&self, job: Job, delay: Option<Duration>);

    /// Number of jobs accepted but not yet taken by a worker, when the
    /// backend can tell. Used by the health check.
    fn depth(&self) -> Option<usize>;
}

// ─── In-process implementations ───────────────────────────────────────────────

pub struct InProcessEventBus {
    tx: mpsc::UnboundedSender<DomainEvent>,
}

impl InProcessEventBus {
    pub fn new() -> (Arc<Self>, mpsc::UnboundedReceiver<DomainEvent>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (Arc::new(Self { tx }), rx)
    }
}

#[async_trait]
impl EventBus for InProcessEventBus {
    async fn dispatch(&self, event: DomainEvent) {
        if self.tx.send(event).is_err() {
            tracing::warn!("event bus receiver dropped; event lost");
        }
    }
}

pub struct InProcessJobBus {
    tx: mpsc::UnboundedSender<Job>,
    pending: Arc<AtomicUsize>,
}

/// Worker-side handle: receives jobs and keeps the depth gauge honest.
pub struct JobReceiver {
    rx: mpsc::UnboundedReceiver<Job>,
    pending: Arc<AtomicUsize>,
}

impl JobReceiver {
    pub async fn recv(&mut self) -> Option<Job> {
        let job = self.rx.recv().await;
        if job.is_some() {
            self.pending.fetch_sub(1, Ordering::Relaxed);
        }
        job
    }
}

impl InProcessJobBus {
    pub fn new() -> (Arc<Self>, JobReceiver) {
        let (tx, rx) = mpsc::unbounded_channel();
        let pending = Arc::new(AtomicUsize::new(0));
        (
            Arc::new(Self {
                tx,
                pending: pending.clone(),
            }),
            JobReceiver { rx, pending },
        )
    }
}

#[async_trait]
impl JobBus for InProcessJobBus {
    async fn dispatch(&self, job: Job, delay: Option<Duration>) {
        let tx = self.tx.clone();
        self.pending.fetch_add(1, Ordering::Relaxed);
        let pending = self.pending.clone();
        match delay {
            None => {
                if tx.send(job).is_err() {
                    pending.fetch_sub(1, Ordering::Relaxed);
                    tracing::warn!("job bus receiver dropped; job lost");
                }
            }
            Some(delay) => {
                tokio::spawn(async move {
                    tokio::time::sleep(delay).await;
                    if tx.send(job).is_err() {
                        pending.fetch_sub(1, Ordering::Relaxed);
                        tracing::warn!("job bus receiver dropped; delayed job lost");
                    }
                });
            }
        }
    }

    fn depth(&self) -> Option<usize> {
        Some(self.pending.load(Ordering::Relaxed))
    }
}
