// src/store/memory.rs

use std::collections::HashMap;
use std::sync::{Mutex, MutexGuard};

use super::{PipelineStore, StoreError, Versioned};
use crate::pipeline::PipelineRecord;
use crate::types::PipelineId;

#[derive(Debug, Default)]
struct Inner {
    records: HashMap<PipelineId, Versioned<PipelineRecord>>,
    next_pipeline_id: PipelineId,
    iids: HashMap<String, u64>,
}

/// In-process store. Versions start at 1 on insert and grow by one per
/// successful write.
#[derive(Debug, Default)]
pub struct MemoryStore {
    inner: Mutex<Inner>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, Inner> {
        // Records are replaced whole, so a poisoned lock still guards
        // consistent data.
        self.inner.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    pub fn version(&self, id: PipelineId) -> Option<u64> {
        self.lock().records.get(&id).map(|v| v.version)
    }
}

impl PipelineStore for MemoryStore {
    fn allocate_pipeline_id(&self) -> PipelineId {
        let mut inner = self.lock();
        inner.next_pipeline_id += 1;
        inner.next_pipeline_id
    }

    fn allocate_iid(&self, project: &str) -> u64 {
        let mut inner = self.lock();
        let iid = inner.iids.entry(project.to_string()).or_insert(0);
        *iid += 1;
        *iid
    }

    fn insert(&self, record: PipelineRecord) -> Result<(), StoreError> {
        let mut inner = self.lock();
        let id = record.id();
        if inner.records.contains_key(&id) {
            return Err(StoreError::AlreadyExists(id));
        }
        inner.next_pipeline_id = inner.next_pipeline_id.max(id);
        inner.records.insert(
            id,
            Versioned {
                version: 1,
                value: record,
            },
        );
        Ok(())
    }

    fn load(&self, id: PipelineId) -> Result<Versioned<PipelineRecord>, StoreError> {
        self.lock()
            .records
            .get(&id)
            .cloned()
            .ok_or(StoreError::NotFound(id))
    }

    fn compare_and_swap(
        &self,
        id: PipelineId,
        expected_version: u64,
        record: PipelineRecord,
    ) -> Result<u64, StoreError> {
        let mut inner = self.lock();
        let slot = inner.records.get_mut(&id).ok_or(StoreError::NotFound(id))?;
        if slot.version != expected_version {
            return Err(StoreError::Conflict {
                pipeline: id,
                expected: expected_version,
                actual: slot.version,
            });
        }
        slot.version += 1;
        slot.value = record;
        Ok(slot.version)
    }

    fn pipeline_ids(&self) -> Vec<PipelineId> {
        let mut ids: Vec<PipelineId> = self.lock().records.keys().copied().collect();
        ids.sort_unstable();
        ids
    }
}
