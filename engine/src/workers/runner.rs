//! Task runner: bounded pool of deployment workers
//!
//! Deployments wait in a FIFO intake queue until one of `concurrency` workers
//! picks them up. The runner tracks queued and active deployment ids, which is
//! what keeps a deployment from ever executing twice at the same time.

use std::collections::{HashMap, VecDeque};
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{watch, Mutex, Notify};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::deploy::pipeline::Pipeline;
use crate::errors::EngineError;
use crate::models::deployment::{Deployment, DeploymentId};

/// Task runner options
#[derive(Debug, Clone)]
pub struct Options {
    /// Number of deployments executing at once
    pub concurrency: usize,

    /// How long `cancel` waits for a running deployment to wind down
    pub cancel_timeout: Duration,
}

impl Default for Options {
    fn default() -> Self {
        Self {
            concurrency: 4,
            cancel_timeout: Duration::from_secs(15),
        }
    }
}

struct ActiveRun {
    token: CancellationToken,
    done: watch::Receiver<bool>,
}

#[derive(Default)]
struct RunnerState {
    pending: VecDeque<DeploymentId>,
    active: HashMap<DeploymentId, ActiveRun>,
}

/// A dequeued deployment, ready to execute
struct Job {
    deployment_id: DeploymentId,
    token: CancellationToken,
    done: watch::Sender<bool>,
}

pub struct TaskRunner {
    options: Options,
    pipeline: Arc<Pipeline>,
    state: Mutex<RunnerState>,
    notify: Notify,
    shutdown: CancellationToken,
    workers: Mutex<Vec<JoinHandle<()>>>,
}

impl TaskRunner {
    pub fn new(options: Options, pipeline: Arc<Pipeline>) -> Arc<Self> {
        Arc::new(Self {
            options,
            pipeline,
            state: Mutex::new(RunnerState::default()),
            notify: Notify::new(),
            shutdown: CancellationToken::new(),
            workers: Mutex::new(Vec::new()),
        })
    }

    /// Spawn the worker tasks
    pub async fn start(self: &Arc<Self>) {
        let mut workers = self.workers.lock().await;
        if !workers.is_empty() {
            return;
        }
        let concurrency = self.options.concurrency.max(1);
        for worker_id in 0..concurrency {
            let runner = Arc::clone(self);
            workers.push(tokio::spawn(async move {
                runner.worker_loop(worker_id).await;
            }));
        }
        info!(concurrency, "task runner started");
    }

    /// Queue a deployment for execution
    pub async fn submit(&self, deployment_id: &DeploymentId) -> Result<(), EngineError> {
        if self.shutdown.is_cancelled() {
            return Err(EngineError::ShutdownError(
                "task runner is shutting down".to_string(),
            ));
        }
        {
            let mut state = self.state.lock().await;
            if state.active.contains_key(deployment_id) || state.pending.contains(deployment_id) {
                return Err(EngineError::AlreadyRunning(deployment_id.clone()));
            }
            state.pending.push_back(deployment_id.clone());
        }
        self.notify.notify_one();
        debug!(deployment_id = %deployment_id, "deployment queued");
        Ok(())
    }

    /// Cancel a queued or running deployment.
    ///
    /// Returns `None` when the runner does not know the deployment. A running
    /// deployment that has not reached a terminal state within
    /// `cancel_timeout` is an error; it keeps winding down in the background.
    pub async fn cancel(
        &self,
        deployment_id: &DeploymentId,
    ) -> Result<Option<Deployment>, EngineError> {
        let running = {
            let mut state = self.state.lock().await;
            if let Some(pos) = state.pending.iter().position(|id| id == deployment_id) {
                state.pending.remove(pos);
                None
            } else if let Some(run) = state.active.get(deployment_id) {
                run.token.cancel();
                Some(run.done.clone())
            } else {
                return Ok(None);
            }
        };

        match running {
            None => {
                info!(deployment_id = %deployment_id, "cancelled queued deployment");
                self.pipeline.cancel_idle(deployment_id).await.map(Some)
            }
            Some(mut done) => {
                info!(deployment_id = %deployment_id, "cancelling running deployment");
                let wait = done.wait_for(|finished| *finished);
                if tokio::time::timeout(self.options.cancel_timeout, wait)
                    .await
                    .is_err()
                {
                    warn!(deployment_id = %deployment_id, timeout = ?self.options.cancel_timeout, "deployment still winding down");
                    return Err(EngineError::Internal(format!(
                        "deployment {} still winding down after {:?}",
                        deployment_id, self.options.cancel_timeout
                    )));
                }
                let deployment = self.pipeline.store().get(deployment_id).await?;
                if !deployment.state.is_terminal() {
                    return Err(EngineError::Internal(format!(
                        "deployment {} is still {} after cancellation",
                        deployment_id, deployment.state
                    )));
                }
                Ok(Some(deployment))
            }
        }
    }

    /// Whether the deployment is queued or executing
    pub async fn contains(&self, deployment_id: &DeploymentId) -> bool {
        let state = self.state.lock().await;
        state.active.contains_key(deployment_id) || state.pending.contains(deployment_id)
    }

    /// Stop taking work, cancel running deployments and wait for the workers
    pub async fn shutdown(&self, timeout: Duration) -> Result<(), EngineError> {
        self.shutdown.cancel();
        {
            let state = self.state.lock().await;
            for (deployment_id, run) in &state.active {
                info!(deployment_id = %deployment_id, "cancelling deployment for shutdown");
                run.token.cancel();
            }
            if !state.pending.is_empty() {
                warn!(queued = state.pending.len(), "queued deployments left pending");
            }
        }

        let workers: Vec<JoinHandle<()>> = self.workers.lock().await.drain(..).collect();
        let joined = tokio::time::timeout(timeout, futures::future::join_all(workers)).await;
        match joined {
            Ok(_) => {
                info!("task runner stopped");
                Ok(())
            }
            Err(_) => Err(EngineError::ShutdownError(format!(
                "workers still running after {:?}",
                timeout
            ))),
        }
    }

    async fn next(&self) -> Job {
        loop {
            {
                let mut state = self.state.lock().await;
                if let Some(deployment_id) = state.pending.pop_front() {
                    let token = self.shutdown.child_token();
                    let (done_tx, done_rx) = watch::channel(false);
                    state.active.insert(
                        deployment_id.clone(),
                        ActiveRun {
                            token: token.clone(),
                            done: done_rx,
                        },
                    );
                    return Job {
                        deployment_id,
                        token,
                        done: done_tx,
                    };
                }
            }
            self.notify.notified().await;
        }
    }

    async fn worker_loop(&self, worker_id: usize) {
        debug!(worker_id, "deployment worker started");
        loop {
            let job = tokio::select! {
                biased;
                _ = self.shutdown.cancelled() => break,
                job = self.next() => job,
            };
            self.execute(worker_id, job).await;

            // Another worker may be waiting on work this one left queued
            if !self.state.lock().await.pending.is_empty() {
                self.notify.notify_one();
            }
        }
        debug!(worker_id, "deployment worker stopped");
    }

    async fn execute(&self, worker_id: usize, job: Job) {
        let deployment_id = job.deployment_id;
        info!(worker_id, deployment_id = %deployment_id, "executing deployment");

        match self.pipeline.start(&deployment_id, &job.token).await {
            Ok(deployment) => {
                debug!(worker_id, deployment_id = %deployment_id, state = %deployment.state, "deployment done")
            }
            Err(e) => error!(worker_id, deployment_id = %deployment_id, "deployment execution failed: {}", e),
        }

        self.state.lock().await.active.remove(&deployment_id);
        let _ = job.done.send(true);
    }
}
