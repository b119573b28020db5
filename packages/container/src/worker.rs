// ABOUTME: Sequential command worker driving the orchestrator from agent events
// ABOUTME: Bounded command queue, one processing task, and outbound workload status events

use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap, HashSet};
use std::path::PathBuf;
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use crate::config::WorkerConfig;
use crate::deployment::DeploymentDescription;
use crate::finalize::RuntimeConfig;
use crate::orchestrator::Orchestrator;
use crate::{ContainerError, Result};

/// Everything needed to launch the workload of one agreement.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AgreementLaunchContext {
    pub agreement_id: String,
    /// Deployment description in its JSON wire form.
    pub deployment: String,
    pub environment_additions: HashMap<String, String>,
    /// Raw agreement configuration, persisted for the workload and used for dynamic permit values.
    pub config_payload: Vec<u8>,
}

#[derive(Debug, Clone)]
pub enum WorkerCommand {
    Configure {
        image_files: Vec<String>,
        launch: AgreementLaunchContext,
    },
    /// `deployment` is the runtime configuration reported when execution began.
    Maintain {
        agreement_id: String,
        deployment: BTreeMap<String, RuntimeConfig>,
    },
    /// Removes `agreement_ids` plus `current_agreement_id` when it is not empty.
    Shutdown {
        agreement_ids: Vec<String>,
        current_agreement_id: String,
        deployment: Option<BTreeMap<String, RuntimeConfig>>,
    },
    SyncResources {
        known_agreements: HashSet<String>,
    },
    Terminate,
}

/// Status events emitted to the governance layer.
#[derive(Debug, Clone, PartialEq)]
pub enum WorkloadEvent {
    ExecutionBegun {
        agreement_id: String,
        deployment: BTreeMap<String, RuntimeConfig>,
    },
    ExecutionFailed {
        agreement_id: String,
        /// Runtime configuration finalized before the failure, when any was.
        deployment: Option<BTreeMap<String, RuntimeConfig>>,
        reason: String,
    },
    PatternDestroyed {
        agreement_id: String,
    },
    ContainersSynced {
        successful: bool,
    },
}

impl WorkloadEvent {
    pub fn id(&self) -> &'static str {
        match self {
            WorkloadEvent::ExecutionBegun { .. } => "EXECUTION_BEGUN",
            WorkloadEvent::ExecutionFailed { .. } => "EXECUTION_FAILED",
            WorkloadEvent::PatternDestroyed { .. } => "PATTERN_DESTROYED",
            WorkloadEvent::ContainersSynced { .. } => "CONTAINERS_SYNCED",
        }
    }
}

/// Upstream events the worker reacts to.
#[derive(Debug, Clone)]
pub enum AgentEvent {
    ImagesFetched {
        image_files: Vec<String>,
        launch: AgreementLaunchContext,
    },
    MaintenanceRequested {
        agreement_id: String,
        deployment: BTreeMap<String, RuntimeConfig>,
    },
    AgreementEnded {
        agreement_ids: Vec<String>,
        current_agreement_id: String,
        deployment: Option<BTreeMap<String, RuntimeConfig>>,
    },
}

impl From<AgentEvent> for WorkerCommand {
    fn from(event: AgentEvent) -> Self {
        match event {
            AgentEvent::ImagesFetched {
                image_files,
                launch,
            } => WorkerCommand::Configure {
                image_files,
                launch,
            },
            AgentEvent::MaintenanceRequested {
                agreement_id,
                deployment,
            } => WorkerCommand::Maintain {
                agreement_id,
                deployment,
            },
            AgentEvent::AgreementEnded {
                agreement_ids,
                current_agreement_id,
                deployment,
            } => WorkerCommand::Shutdown {
                agreement_ids,
                current_agreement_id,
                deployment,
            },
        }
    }
}

/// Bounded multi-producer queue with a single consumer.
pub struct CommandQueue<C> {
    sender: mpsc::Sender<C>,
    receiver: Option<mpsc::Receiver<C>>,
}

impl<C: Send + 'static> CommandQueue<C> {
    pub fn new(capacity: usize) -> Self {
        let (sender, receiver) = mpsc::channel(capacity.max(1));
        Self {
            sender,
            receiver: Some(receiver),
        }
    }

    /// Waits for room when the queue is full.
    pub async fn send(&self, command: C) -> Result<()> {
        self.sender
            .send(command)
            .await
            .map_err(|_| ContainerError::Runtime("command queue is closed".to_string()))
    }

    pub fn sender(&self) -> mpsc::Sender<C> {
        self.sender.clone()
    }

    /// Hands out the consuming end; `None` once taken.
    pub fn take_receiver(&mut self) -> Option<mpsc::Receiver<C>> {
        self.receiver.take()
    }
}

/// Processes one command at a time against the orchestrator.
#[derive(Clone)]
pub struct CommandHandler {
    orchestrator: Arc<Orchestrator>,
    image_dir: PathBuf,
    events: mpsc::UnboundedSender<WorkloadEvent>,
}

impl CommandHandler {
    fn emit(&self, event: WorkloadEvent) {
        debug!("Emitting {}", event.id());
        if self.events.send(event).is_err() {
            warn!("Workload event dropped, no listener");
        }
    }

    /// Run `command` to completion. Returns `false` when the worker should stop.
    pub async fn handle(&self, command: WorkerCommand) -> bool {
        match command {
            WorkerCommand::Configure {
                image_files,
                launch,
            } => self.configure(image_files, launch).await,
            WorkerCommand::Maintain {
                agreement_id,
                deployment,
            } => self.maintain(&agreement_id, &deployment).await,
            WorkerCommand::Shutdown {
                agreement_ids,
                current_agreement_id,
                ..
            } => self.shutdown(agreement_ids, current_agreement_id).await,
            WorkerCommand::SyncResources { known_agreements } => {
                let successful = match self
                    .orchestrator
                    .sync_up_resources(&known_agreements)
                    .await
                {
                    Ok(_) => true,
                    Err(e) => {
                        error!("Unable to sync container resources: {}", e);
                        false
                    }
                };
                self.emit(WorkloadEvent::ContainersSynced { successful });
            }
            WorkerCommand::Terminate => {
                info!("Container worker terminating");
                return false;
            }
        }
        true
    }

    async fn configure(&self, image_files: Vec<String>, launch: AgreementLaunchContext) {
        let agreement_id = launch.agreement_id.clone();
        info!("Configuring workload for agreement {}", agreement_id);

        let fail = |reason: String, deployment| WorkloadEvent::ExecutionFailed {
            agreement_id: agreement_id.clone(),
            deployment,
            reason,
        };

        let deployment = match DeploymentDescription::from_json(&launch.deployment) {
            Ok(deployment) => deployment,
            Err(e) => {
                error!("Agreement {}: {}", agreement_id, e);
                self.emit(fail(e.to_string(), None));
                return;
            }
        };

        let archives: Vec<PathBuf> = image_files.iter().map(|f| self.image_dir.join(f)).collect();
        if let Err(e) = self.orchestrator.load_images(&archives).await {
            error!("Unable to load images for agreement {}: {}", agreement_id, e);
            self.emit(fail(e.to_string(), None));
            return;
        }

        match self
            .orchestrator
            .create(
                &agreement_id,
                &deployment,
                &launch.environment_additions,
                &launch.config_payload,
            )
            .await
        {
            Ok(configs) => self.emit(WorkloadEvent::ExecutionBegun {
                agreement_id: agreement_id.clone(),
                deployment: configs,
            }),
            Err(failure) => {
                self.emit(fail(failure.error.to_string(), Some(failure.partial)));
            }
        }
    }

    async fn maintain(&self, agreement_id: &str, deployment: &BTreeMap<String, RuntimeConfig>) {
        let expected = deployment.len();

        match self.orchestrator.running_count(agreement_id, deployment).await {
            Ok(running) if running < expected => {
                warn!(
                    "Agreement {} has {} of {} containers running",
                    agreement_id, running, expected
                );
                self.emit(WorkloadEvent::ExecutionFailed {
                    agreement_id: agreement_id.to_string(),
                    deployment: Some(deployment.clone()),
                    reason: format!("{} of {} containers running", running, expected),
                });
            }
            Ok(running) => debug!(
                "Agreement {} healthy, {} containers running",
                agreement_id, running
            ),
            Err(e) => error!(
                "Unable to check containers of agreement {}: {}",
                agreement_id, e
            ),
        }
    }

    async fn shutdown(&self, mut agreement_ids: Vec<String>, current_agreement_id: String) {
        if !current_agreement_id.is_empty() && !agreement_ids.contains(&current_agreement_id) {
            info!(
                "Shutting down resources of current agreement {}",
                current_agreement_id
            );
            agreement_ids.push(current_agreement_id.clone());
        }

        if let Err(e) = self.orchestrator.remove(&agreement_ids).await {
            error!(
                "Errors removing resources of agreements {:?}: {}",
                agreement_ids, e
            );
        }
        self.emit(WorkloadEvent::PatternDestroyed {
            agreement_id: current_agreement_id,
        });
    }
}

/// Owns the command queue and the single task processing it.
pub struct ContainerWorker {
    handler: CommandHandler,
    queue: CommandQueue<WorkerCommand>,
    events: Option<mpsc::UnboundedReceiver<WorkloadEvent>>,
    task: Option<JoinHandle<()>>,
}

impl ContainerWorker {
    pub fn new(orchestrator: Arc<Orchestrator>, config: &WorkerConfig) -> Self {
        let (sender, receiver) = mpsc::unbounded_channel();

        Self {
            handler: CommandHandler {
                orchestrator,
                image_dir: config.image_dir.clone(),
                events: sender,
            },
            queue: CommandQueue::new(config.command_queue_capacity),
            events: Some(receiver),
            task: None,
        }
    }

    /// Outbound workload events. Available once.
    pub fn messages(&mut self) -> Option<mpsc::UnboundedReceiver<WorkloadEvent>> {
        self.events.take()
    }

    /// Translate an upstream event into a command and queue it.
    pub async fn new_event(&self, event: AgentEvent) -> Result<()> {
        self.queue.send(event.into()).await
    }

    pub async fn enqueue(&self, command: WorkerCommand) -> Result<()> {
        self.queue.send(command).await
    }

    pub fn command_handler(&self) -> CommandHandler {
        self.handler.clone()
    }

    /// Spawn the processing task.
    pub fn start(&mut self) -> Result<()> {
        let mut receiver = self
            .queue
            .take_receiver()
            .ok_or_else(|| ContainerError::Runtime("container worker already started".to_string()))?;
        let handler = self.handler.clone();

        self.task = Some(tokio::spawn(async move {
            info!("Container worker started");
            while let Some(command) = receiver.recv().await {
                if !handler.handle(command).await {
                    break;
                }
            }
            info!("Container worker stopped");
        }));
        Ok(())
    }

    /// Queue a terminate command and wait for the task to drain up to it.
    pub async fn stop(&mut self) -> Result<()> {
        let Some(task) = self.task.take() else {
            return Ok(());
        };

        self.queue.send(WorkerCommand::Terminate).await?;
        task.await
            .map_err(|e| ContainerError::Runtime(format!("container worker task failed: {}", e)))
    }
}
