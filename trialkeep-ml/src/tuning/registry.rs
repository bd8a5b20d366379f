//! Experiment lookup by name.
//!
//! Experiments are registered as factories under dotted names such as
//! `lm.synthetic.SmallLm`. A name that is not registered yet triggers the
//! loader of its module path (`lm.synthetic`), which may register more
//! factories; the lookup is then retried once.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use trialkeep_core::{ConfigError, Result};

use super::experiment::Experiment;

pub type ExperimentFactory = Box<dyn Fn() -> Arc<dyn Experiment> + Send + Sync>;
pub type ModuleLoader = Box<dyn FnOnce(&mut ExperimentRegistry) + Send>;

#[derive(Default)]
pub struct ExperimentRegistry {
    factories: HashMap<String, ExperimentFactory>,
    loaders: HashMap<String, ModuleLoader>,
    loaded: HashSet<String>,
}

impl ExperimentRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(
        &mut self,
        name: impl Into<String>,
        factory: impl Fn() -> Arc<dyn Experiment> + Send + Sync + 'static,
    ) {
        let name = name.into();
        if self.factories.insert(name.clone(), Box::new(factory)).is_some() {
            tracing::warn!(experiment = %name, "Experiment registered twice; keeping the latest");
        }
    }

    /// Register a loader for every experiment under `module`.
    pub fn register_loader(
        &mut self,
        module: impl Into<String>,
        loader: impl FnOnce(&mut ExperimentRegistry) + Send + 'static,
    ) {
        self.loaders.insert(module.into(), Box::new(loader));
    }

    pub fn names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.factories.keys().cloned().collect();
        names.sort();
        names
    }

    /// Instantiate the experiment registered under `name`.
    pub fn get(&mut self, name: &str) -> Result<Arc<dyn Experiment>> {
        if let Some(factory) = self.factories.get(name) {
            return Ok(factory());
        }

        if let Some((module, _)) = name.rsplit_once('.')
            && self.load_module(module)
            && let Some(factory) = self.factories.get(name)
        {
            return Ok(factory());
        }

        Err(ConfigError::ExperimentNotFound {
            name: name.to_string(),
        }
        .into())
    }

    /// Run the loader of `module` once. Returns whether it ran now.
    fn load_module(&mut self, module: &str) -> bool {
        if self.loaded.contains(module) {
            return false;
        }
        let Some(loader) = self.loaders.remove(module) else {
            tracing::debug!(module, "No loader registered for module");
            return false;
        };
        tracing::info!(module, "Loading experiment module");
        loader(self);
        self.loaded.insert(module.to_string());
        true
    }
}
