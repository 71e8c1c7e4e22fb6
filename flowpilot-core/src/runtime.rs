//! Process-wide runtime: builds the engine, HIL coordinator and scheduler
//! once and owns their background tasks

use crate::error::FlowResult;
use crate::models::configuration::Configuration;
use crate::models::workflow::WorkflowDefinition;
use crate::scheduler::Scheduler;
use crate::workflow::checkpoint::{CheckpointStore, JsonCheckpointStore, MemoryCheckpointStore};
use crate::workflow::engine::ExecutionEngine;
use crate::workflow::handler::HandlerRegistry;
use crate::workflow::hil::HilCoordinator;
use crate::workflow::registry::{CompiledWorkflow, ExecutionRegistry};
use anyhow::{Context, Result};
use std::path::Path;
use std::sync::{Arc, Mutex};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

pub struct FlowRuntime {
    config: Configuration,
    registry: Arc<ExecutionRegistry>,
    hil: Arc<HilCoordinator>,
    engine: Arc<ExecutionEngine>,
    scheduler: Arc<Scheduler>,
    shutdown: CancellationToken,
    tasks: Mutex<Vec<JoinHandle<()>>>,
}

impl FlowRuntime {
    /// Build the runtime with the checkpoint store named by the configuration.
    /// Must be called inside a tokio runtime.
    pub fn new(config: Configuration, handlers: HandlerRegistry) -> Result<Arc<Self>> {
        let store: Arc<dyn CheckpointStore> = match &config.store_path {
            Some(path) => Arc::new(
                JsonCheckpointStore::new(path)
                    .with_context(|| format!("Failed to open checkpoint store {}", path.display()))?,
            ),
            None => Arc::new(MemoryCheckpointStore::new()),
        };
        Self::with_store(config, handlers, store)
    }

    /// Build the runtime around an explicit checkpoint store
    pub fn with_store(
        config: Configuration,
        handlers: HandlerRegistry,
        store: Arc<dyn CheckpointStore>,
    ) -> Result<Arc<Self>> {
        let shutdown = CancellationToken::new();
        let registry = Arc::new(ExecutionRegistry::new(handlers));
        let (hil, resume_rx) = HilCoordinator::new(config.hil.clone());
        let hil = Arc::new(hil);
        let engine = Arc::new(ExecutionEngine::new(
            config.engine.clone(),
            registry.clone(),
            store,
            hil.clone(),
        ));
        let scheduler = Arc::new(Scheduler::new(
            config.scheduler.clone(),
            engine.clone(),
            shutdown.child_token(),
        ));

        let mut tasks = Vec::new();
        tasks.push(tokio::spawn(engine.clone().run_resume_dispatcher(resume_rx)));
        {
            let hil = hil.clone();
            let token = shutdown.child_token();
            tasks.push(tokio::spawn(async move { hil.run_sweeper(token).await }));
        }

        if let Some(dir) = &config.workflows_dir {
            for definition in load_workflows_dir(dir)? {
                let id = definition.id.clone();
                registry
                    .register_workflow(definition)
                    .with_context(|| format!("Invalid workflow '{}'", id))?;
            }
        }

        let runtime = Arc::new(Self {
            config,
            registry,
            hil,
            engine,
            scheduler,
            shutdown,
            tasks: Mutex::new(tasks),
        });

        runtime
            .engine
            .recover()
            .context("Failed to recover executions from checkpoints")?;
        runtime
            .scheduler
            .load_declared(runtime.config.schedules.clone());

        if runtime.config.scheduler.enabled {
            let handle = tokio::spawn(runtime.scheduler.clone().run());
            runtime.track(handle);
        }

        tracing::info!(
            "Runtime ready: {} workflow(s), {} schedule(s)",
            runtime.registry.list_workflows().len(),
            runtime.scheduler.list_schedules().len()
        );
        Ok(runtime)
    }

    pub fn config(&self) -> &Configuration {
        &self.config
    }

    pub fn registry(&self) -> &Arc<ExecutionRegistry> {
        &self.registry
    }

    pub fn hil(&self) -> &Arc<HilCoordinator> {
        &self.hil
    }

    pub fn engine(&self) -> &Arc<ExecutionEngine> {
        &self.engine
    }

    pub fn scheduler(&self) -> &Arc<Scheduler> {
        &self.scheduler
    }

    pub fn register_workflow(
        &self,
        definition: WorkflowDefinition,
    ) -> FlowResult<Arc<CompiledWorkflow>> {
        self.registry.register_workflow(definition)
    }

    fn track(&self, handle: JoinHandle<()>) {
        match self.tasks.lock() {
            Ok(mut tasks) => tasks.push(handle),
            Err(_) => tracing::warn!("Runtime task list poisoned; task left untracked"),
        }
    }

    /// Stop the background loops. Executions already in flight finish their
    /// current step on their own tasks.
    pub async fn shutdown(&self) {
        self.shutdown.cancel();
        let tasks = match self.tasks.lock() {
            Ok(mut tasks) => std::mem::take(&mut *tasks),
            Err(_) => Vec::new(),
        };
        for task in tasks {
            // The resume dispatcher only ends when its channel closes
            task.abort();
            let _ = task.await;
        }
        tracing::info!("Runtime stopped");
    }
}

/// Parse every `*.yaml` / `*.yml` file of a directory, in file name order
pub fn load_workflows_dir(dir: &Path) -> Result<Vec<WorkflowDefinition>> {
    let mut paths: Vec<_> = std::fs::read_dir(dir)
        .with_context(|| format!("Failed to read workflows directory {}", dir.display()))?
        .filter_map(|entry| entry.ok().map(|e| e.path()))
        .filter(|path| {
            path.extension()
                .and_then(|ext| ext.to_str())
                .is_some_and(|ext| ext == "yaml" || ext == "yml")
        })
        .collect();
    paths.sort();

    paths
        .iter()
        .map(|path| {
            let content = std::fs::read_to_string(path)
                .with_context(|| format!("Failed to read {}", path.display()))?;
            WorkflowDefinition::from_yaml_str(&content)
                .with_context(|| format!("Failed to load {}", path.display()))
        })
        .collect()
}
