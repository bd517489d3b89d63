use std::collections::HashMap;
use std::sync::{Arc, PoisonError, RwLock};

use tracing::info;

use crate::error::{Result, SchedulerError};
use crate::task::{Task, TaskFactory};
use crate::types::ExecutorDescriptor;

struct Executor {
    descriptor: ExecutorDescriptor,
    factory: TaskFactory,
}

/// Name -> task factory map, filled once at startup.
///
/// There is no deregistration: once a name is bound it stays bound for the
/// life of the process.
#[derive(Default)]
pub struct ExecutorRegistry {
    executors: RwLock<HashMap<String, Executor>>,
}

impl ExecutorRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Bind `descriptor.name` to `factory`. Fails if the name is taken; the
    /// existing binding is left untouched.
    pub fn register<F>(&self, descriptor: ExecutorDescriptor, factory: F) -> Result<()>
    where
        F: Fn() -> Box<dyn Task> + Send + Sync + 'static,
    {
        let mut executors = self.executors.write().unwrap_or_else(PoisonError::into_inner);
        if executors.contains_key(&descriptor.name) {
            return Err(SchedulerError::ExecutorExists {
                name: descriptor.name,
            });
        }
        info!(executor = %descriptor.name, "executor registered");
        executors.insert(
            descriptor.name.clone(),
            Executor {
                descriptor,
                factory: Arc::new(factory),
            },
        );
        Ok(())
    }

    pub fn get(&self, name: &str) -> Result<TaskFactory> {
        let executors = self.executors.read().unwrap_or_else(PoisonError::into_inner);
        executors
            .get(name)
            .map(|e| Arc::clone(&e.factory))
            .ok_or_else(|| SchedulerError::ExecutorNotFound {
                name: name.to_string(),
            })
    }

    pub fn contains(&self, name: &str) -> bool {
        let executors = self.executors.read().unwrap_or_else(PoisonError::into_inner);
        executors.contains_key(name)
    }

    /// Snapshot of every registered executor, sorted by name.
    pub fn list(&self) -> Vec<ExecutorDescriptor> {
        let executors = self.executors.read().unwrap_or_else(PoisonError::into_inner);
        let mut out: Vec<ExecutorDescriptor> =
            executors.values().map(|e| e.descriptor.clone()).collect();
        out.sort_by(|a, b| a.name.cmp(&b.name));
        out
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::task::{TaskError, TaskParams};
    use async_trait::async_trait;

    struct Named(&'static str);

    #[async_trait]
    impl Task for Named {
        fn set_params(&mut self, _params: &TaskParams) -> std::result::Result<(), TaskError> {
            Err(TaskError::InvalidParams(self.0.to_string()))
        }

        async fn run(&mut self) -> std::result::Result<(), TaskError> {
            Ok(())
        }
    }

    fn which(registry: &ExecutorRegistry, name: &str) -> String {
        let mut task = (registry.get(name).unwrap())();
        task.set_params(&TaskParams::default()).unwrap_err().to_string()
    }

    #[test]
    fn duplicate_registration_keeps_original_factory() {
        let registry = ExecutorRegistry::new();
        registry
            .register(ExecutorDescriptor::new("probe", "Probe"), || {
                Box::new(Named("first")) as Box<dyn Task>
            })
            .unwrap();

        let err = registry
            .register(ExecutorDescriptor::new("probe", "Probe v2"), || {
                Box::new(Named("second")) as Box<dyn Task>
            })
            .unwrap_err();
        assert!(matches!(err, SchedulerError::ExecutorExists { .. }));
        assert_eq!(err.kind(), fleet_core::ErrorKind::AlreadyExists);

        assert!(which(&registry, "probe").contains("first"));
        assert_eq!(registry.list()[0].display_name, "Probe");
    }

    #[test]
    fn unknown_name_is_not_found() {
        let registry = ExecutorRegistry::new();
        let err = registry.get("ghost").err().unwrap();
        assert_eq!(err.kind(), fleet_core::ErrorKind::NotFound);
        assert!(!registry.contains("ghost"));
    }

    #[test]
    fn list_is_sorted() {
        let registry = ExecutorRegistry::new();
        for name in ["script", "health", "test"] {
            registry
                .register(ExecutorDescriptor::new(name, name), || {
                    Box::new(Named("x")) as Box<dyn Task>
                })
                .unwrap();
        }
        let names: Vec<_> = registry.list().into_iter().map(|d| d.name).collect();
        assert_eq!(names, vec!["health", "script", "test"]);
    }
}
