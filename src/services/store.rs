use dashmap::DashMap;

use crate::models::status::{StatusTag, TaskStatus};
use crate::models::task::TaskId;

/// Keyed status storage shared by the submitter, the consumer and the status
/// routes. Every write for a given task id is an atomic replace of the whole
/// record.
pub trait TaskStore: Send + Sync {
    fn get(&self, task_id: &TaskId) -> Option<TaskStatus>;

    /// Insert or overwrite the record for `status.task_id`.
    fn put(&self, status: TaskStatus);

    /// Overwrite the record only if one already exists. Returns whether a
    /// record was replaced.
    fn replace_existing(&self, status: TaskStatus) -> bool;

    /// Visit every tracked record. Must not call back into the store.
    fn scan(&self, visit: &mut dyn FnMut(&TaskStatus));

    fn count(&self, tag: StatusTag) -> usize {
        let mut n = 0;
        self.scan(&mut |status| {
            if status.tag() == tag {
                n += 1;
            }
        });
        n
    }
}

/// Volatile store backed by a sharded concurrent map. Records live until the
/// process exits.
#[derive(Debug, Default)]
pub struct InMemoryTaskStore {
    records: DashMap<TaskId, TaskStatus>,
}

impl InMemoryTaskStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }
}

impl TaskStore for InMemoryTaskStore {
    fn get(&self, task_id: &TaskId) -> Option<TaskStatus> {
        self.records.get(task_id).map(|entry| entry.value().clone())
    }

    fn put(&self, status: TaskStatus) {
        self.records.insert(status.task_id.clone(), status);
    }

    fn replace_existing(&self, status: TaskStatus) -> bool {
        match self.records.get_mut(&status.task_id) {
            Some(mut entry) => {
                *entry = status;
                true
            }
            None => false,
        }
    }

    fn scan(&self, visit: &mut dyn FnMut(&TaskStatus)) {
        for entry in self.records.iter() {
            visit(entry.value());
        }
    }
}
