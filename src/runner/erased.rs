//! Type-erased factory wrapper so the runner can restore tasks by type.

use std::collections::HashMap;
use std::sync::Arc;

use super::store::TaskRecord;
use crate::factory::{FactoryError, TaskFactory};
use crate::task::Task;

/// Object-safe view of a [`TaskFactory`] used for restoration only.
pub trait ErasedFactory: Send + Sync {
    fn type_tag(&self) -> &str;

    fn restore_erased(&self, record: &TaskRecord) -> Result<Arc<dyn Task>, FactoryError>;
}

impl<F> ErasedFactory for F
where
    F: TaskFactory,
{
    fn type_tag(&self) -> &str {
        self.task_type()
    }

    fn restore_erased(&self, record: &TaskRecord) -> Result<Arc<dyn Task>, FactoryError> {
        self.restore(record)
    }
}

/// Factories keyed by the task type they build.
#[derive(Clone, Default)]
pub(crate) struct FactoryRegistry {
    factories: HashMap<String, Arc<dyn ErasedFactory>>,
}

impl FactoryRegistry {
    pub(crate) fn register(&mut self, factory: Arc<dyn ErasedFactory>) {
        self.factories
            .insert(factory.type_tag().to_string(), factory);
    }

    pub(crate) fn get(&self, task_type: &str) -> Option<&Arc<dyn ErasedFactory>> {
        self.factories.get(task_type)
    }

    pub(crate) fn task_types(&self) -> impl Iterator<Item = &str> {
        self.factories.keys().map(String::as_str)
    }
}
