//! Process-wide registries: raw configs, compiled definitions, and task
//! workers.
//!
//! All three maps are write-once-ish: configs and workers are registered at
//! startup and never replaced; definitions are compiled lazily on first use
//! and cached forever. Instead of mutable globals the registry is an object
//! threaded into the service.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, RwLock};

use workers::TaskWorker;

use crate::dag::WorkflowDefinition;
use crate::models::WorkflowConfig;
use crate::EngineError;

/// Shared registry of configs, compiled definitions and workers.
#[derive(Default)]
pub struct WorkflowRegistry {
    configs: RwLock<HashMap<String, WorkflowConfig>>,
    definitions: RwLock<HashMap<String, Arc<WorkflowDefinition>>>,
    /// Keyed by `"<workflow_type>_<task_type>"`.
    workers: RwLock<HashMap<String, Arc<dyn TaskWorker>>>,
    /// Serializes lazy compilation (double-checked against `definitions`).
    compile_lock: Mutex<()>,
}

fn worker_key(workflow_type: &str, task_type: &str) -> String {
    format!("{workflow_type}_{task_type}")
}

impl WorkflowRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Store a raw config. Conversion to an execution graph happens lazily on
    /// first use, so configs can be loaded before their workers are
    /// registered. Rejected once a definition for the same id has already
    /// been compiled.
    pub fn load_config(&self, config: WorkflowConfig) -> Result<(), EngineError> {
        if config.id.is_empty() {
            return Err(EngineError::ParamInvalid("workflow config id is empty".into()));
        }
        if self.definitions.read().unwrap().contains_key(&config.id) {
            return Err(EngineError::ParamInvalid(format!(
                "workflow config already compiled: {}",
                config.id
            )));
        }
        self.configs.write().unwrap().insert(config.id.clone(), config);
        Ok(())
    }

    /// Register the worker for `(workflow_type, task_type)`. Registrations
    /// are immutable: a duplicate is an error.
    pub fn register_worker(
        &self,
        workflow_type: &str,
        task_type: &str,
        worker: Arc<dyn TaskWorker>,
    ) -> Result<(), EngineError> {
        let key = worker_key(workflow_type, task_type);
        let mut workers = self.workers.write().unwrap();
        if workers.contains_key(&key) {
            return Err(EngineError::WorkerAlreadyRegistered(format!(
                "workflow_type: {workflow_type}, task_type: {task_type}"
            )));
        }
        workers.insert(key, worker);
        Ok(())
    }

    fn worker(&self, workflow_type: &str, task_type: &str) -> Option<Arc<dyn TaskWorker>> {
        self.workers
            .read()
            .unwrap()
            .get(&worker_key(workflow_type, task_type))
            .cloned()
    }

    /// Fetch the compiled definition for `workflow_type`, building and
    /// caching it on first use.
    pub fn definition(&self, workflow_type: &str) -> Result<Arc<WorkflowDefinition>, EngineError> {
        if let Some(definition) = self.definitions.read().unwrap().get(workflow_type) {
            return Ok(definition.clone());
        }

        let _guard = self.compile_lock.lock().unwrap();
        // Double-check: another caller may have compiled while we waited.
        if let Some(definition) = self.definitions.read().unwrap().get(workflow_type) {
            return Ok(definition.clone());
        }

        let config = self
            .configs
            .read()
            .unwrap()
            .get(workflow_type)
            .cloned()
            .ok_or_else(|| EngineError::ConfigNotFound(workflow_type.to_string()))?;

        let definition = WorkflowDefinition::compile(&config, |task_type| {
            self.worker(workflow_type, task_type)
        })
        .map_err(|e| e.context(format!("compiling workflow {workflow_type}")))?;

        let definition = Arc::new(definition);
        self.definitions
            .write()
            .unwrap()
            .insert(workflow_type.to_string(), definition.clone());
        Ok(definition)
    }

    /// Eagerly compile every loaded config, collecting all failures so a
    /// deployment can fail fast instead of at first run.
    pub fn preload_definitions(&self) -> Result<(), EngineError> {
        let workflow_types: Vec<String> = self.configs.read().unwrap().keys().cloned().collect();
        let mut failures = Vec::new();
        for workflow_type in workflow_types {
            if let Err(e) = self.definition(&workflow_type) {
                failures.push(e.to_string());
            }
        }
        if failures.is_empty() {
            Ok(())
        } else {
            Err(EngineError::DefinitionNotFound(failures.join("; ")))
        }
    }
}
