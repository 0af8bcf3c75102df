//! Run registry and reaper
//!
//! The registry is an explicitly owned table of running instances, cheap to
//! clone and shared between the orchestrator and the reaper tasks it
//! schedules. It starts empty; entries leave it through a reaper, an explicit
//! stop, eviction by a newer run, or shutdown.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, PoisonError};
use std::time::Duration;

use chrono::{DateTime, Utc};
use tokio::sync::{Mutex, OwnedMutexGuard};
use tokio::task::JoinHandle;
use tracing::{debug, info, instrument};

use crate::process::ServerProcess;
use crate::workspace::Workspace;

/// A launched server together with everything it owns
#[derive(Debug)]
pub struct RunningInstance {
    project_id: String,
    port: u16,
    health_check_url: String,
    started_at: DateTime<Utc>,
    process: ServerProcess,
    workspace: Workspace,
    /// Distinguishes successive runs of the same project
    generation: u64,
    reaper: Option<JoinHandle<()>>,
}

impl RunningInstance {
    pub fn new(
        process: ServerProcess,
        workspace: Workspace,
        health_check_url: String,
        generation: u64,
    ) -> Self {
        Self {
            project_id: workspace.project_id().to_string(),
            port: process.port(),
            health_check_url,
            started_at: Utc::now(),
            process,
            workspace,
            generation,
            reaper: None,
        }
    }

    pub fn project_id(&self) -> &str {
        &self.project_id
    }

    pub fn port(&self) -> u16 {
        self.port
    }

    pub fn health_check_url(&self) -> &str {
        &self.health_check_url
    }

    pub fn started_at(&self) -> DateTime<Utc> {
        self.started_at
    }

    pub fn generation(&self) -> u64 {
        self.generation
    }

    pub fn workspace(&self) -> &Workspace {
        &self.workspace
    }

    /// Attach the pending reaper so an early stop can cancel it
    pub fn set_reaper(&mut self, reaper: JoinHandle<()>) {
        self.reaper = Some(reaper);
    }

    /// Cancel the reaper, stop the server and delete the workspace
    ///
    /// Every step is best-effort; failures are logged by the step itself.
    #[instrument(skip(self), fields(project_id = %self.project_id, port = self.port))]
    pub async fn shutdown(mut self, grace: Duration) {
        if let Some(reaper) = self.reaper.take() {
            reaper.abort();
        }
        self.process.terminate(grace).await;
        self.workspace.destroy().await;
        info!("instance cleaned up");
    }

    fn info(&self) -> InstanceInfo {
        InstanceInfo {
            project_id: self.project_id.clone(),
            port: self.port,
            health_check_url: self.health_check_url.clone(),
            started_at: self.started_at,
            pid: self.process.pid(),
            generation: self.generation,
        }
    }
}

/// Snapshot of a registered instance
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InstanceInfo {
    pub project_id: String,
    pub port: u16,
    pub health_check_url: String,
    pub started_at: DateTime<Utc>,
    pub pid: Option<u32>,
    pub generation: u64,
}

#[derive(Debug, Default)]
struct Inner {
    instances: Mutex<HashMap<String, RunningInstance>>,
    /// Per-project locks, present only while someone holds or awaits one
    locks: std::sync::Mutex<HashMap<String, Arc<Mutex<()>>>>,
    next_generation: AtomicU64,
}

/// Exclusive hold on one project, see [`RunRegistry::lock_project`]
#[derive(Debug)]
pub struct ProjectGuard {
    inner: Arc<Inner>,
    project_id: String,
    guard: Option<OwnedMutexGuard<()>>,
}

impl Drop for ProjectGuard {
    fn drop(&mut self) {
        drop(self.guard.take());

        let mut locks = self
            .inner
            .locks
            .lock()
            .unwrap_or_else(PoisonError::into_inner);
        // Only the map's own reference left: nobody holds or waits for it
        if locks
            .get(&self.project_id)
            .is_some_and(|lock| Arc::strong_count(lock) == 1)
        {
            locks.remove(&self.project_id);
        }
    }
}

/// Concurrency-safe table of running instances, one per project
#[derive(Debug, Clone, Default)]
pub struct RunRegistry {
    inner: Arc<Inner>,
}

impl RunRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Serialize work on one project
    ///
    /// Runs, stops and reapers for the same project hold this guard while
    /// they touch its instance or workspace.
    pub async fn lock_project(&self, project_id: &str) -> ProjectGuard {
        let lock = {
            let mut locks = self
                .inner
                .locks
                .lock()
                .unwrap_or_else(PoisonError::into_inner);
            locks.entry(project_id.to_string()).or_default().clone()
        };
        ProjectGuard {
            inner: self.inner.clone(),
            project_id: project_id.to_string(),
            guard: Some(lock.lock_owned().await),
        }
    }

    pub fn next_generation(&self) -> u64 {
        self.inner.next_generation.fetch_add(1, Ordering::Relaxed) + 1
    }

    /// Register an instance, handing back any instance it replaced
    pub async fn insert(&self, instance: RunningInstance) -> Option<RunningInstance> {
        let mut instances = self.inner.instances.lock().await;
        debug!(
            project_id = %instance.project_id,
            generation = instance.generation,
            "registering instance"
        );
        instances.insert(instance.project_id.clone(), instance)
    }

    /// Remove and return the instance of a project
    pub async fn take(&self, project_id: &str) -> Option<RunningInstance> {
        self.inner.instances.lock().await.remove(project_id)
    }

    /// Remove the instance of a project only if it is still `generation`
    pub async fn take_if_generation(
        &self,
        project_id: &str,
        generation: u64,
    ) -> Option<RunningInstance> {
        let mut instances = self.inner.instances.lock().await;
        match instances.get(project_id) {
            Some(instance) if instance.generation == generation => instances.remove(project_id),
            _ => None,
        }
    }

    pub async fn info(&self, project_id: &str) -> Option<InstanceInfo> {
        self.inner
            .instances
            .lock()
            .await
            .get(project_id)
            .map(RunningInstance::info)
    }

    pub async fn contains(&self, project_id: &str) -> bool {
        self.inner.instances.lock().await.contains_key(project_id)
    }

    pub async fn len(&self) -> usize {
        self.inner.instances.lock().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.len().await == 0
    }

    pub async fn project_ids(&self) -> Vec<String> {
        let mut ids: Vec<String> = self.inner.instances.lock().await.keys().cloned().collect();
        ids.sort();
        ids
    }

    /// Schedule the one-shot cleanup of a run after `after`
    ///
    /// The reaper only removes the instance registered with `generation`; if a
    /// newer run replaced it in the meantime it does nothing.
    pub fn schedule_reaper(
        &self,
        project_id: &str,
        generation: u64,
        after: Duration,
        grace: Duration,
    ) -> JoinHandle<()> {
        let registry = self.clone();
        let project_id = project_id.to_string();

        tokio::spawn(async move {
            tokio::time::sleep(after).await;

            let _guard = registry.lock_project(&project_id).await;
            let Some(mut instance) = registry.take_if_generation(&project_id, generation).await
            else {
                debug!(project_id = %project_id, generation, "instance already gone, nothing to reap");
                return;
            };

            // This task is the reaper; it must not abort itself
            instance.reaper = None;
            info!(project_id = %project_id, generation, "retention window elapsed, reaping instance");
            instance.shutdown(grace).await;
        })
    }
}
