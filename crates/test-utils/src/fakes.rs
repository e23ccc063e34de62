use std::collections::{HashMap, VecDeque};
use std::future::Future;
use std::pin::Pin;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, Mutex};

use chrono::{DateTime, Utc};

use pipeline_engine::bridge::{BridgeError, CreatePipelineRequest, Project, ProjectResolver};
use pipeline_engine::config::ConfigFile;
use pipeline_engine::effects::Effect;
use pipeline_engine::engine::{Engine, EngineSettings};
use pipeline_engine::errors::Result;
use pipeline_engine::exec::downstream::downstream_header;
use pipeline_engine::exec::{DownstreamService, EffectDispatcher};
use pipeline_engine::pipeline::PipelineRecord;
use pipeline_engine::seed::seed_pipeline;
use pipeline_engine::store::{MemoryStore, PipelineStore, StoreError, Versioned};
use pipeline_engine::types::{PipelineId, Source};

/// A fake dispatcher that records every effect it is handed.
#[derive(Debug, Clone, Default)]
pub struct RecordingDispatcher {
    dispatched: Arc<Mutex<Vec<Effect>>>,
}

impl RecordingDispatcher {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn effects(&self) -> Vec<Effect> {
        self.dispatched.lock().unwrap().clone()
    }

    pub fn kinds(&self) -> Vec<&'static str> {
        self.effects().iter().map(Effect::kind).collect()
    }

    pub fn count(&self, kind: &str) -> usize {
        self.kinds().into_iter().filter(|k| *k == kind).count()
    }
}

impl EffectDispatcher for RecordingDispatcher {
    fn dispatch(&self, effects: Vec<Effect>) -> Pin<Box<dyn Future<Output = Result<()>> + Send + '_>> {
        let dispatched = Arc::clone(&self.dispatched);
        Box::pin(async move {
            dispatched.lock().unwrap().extend(effects);
            Ok(())
        })
    }
}

/// Wraps a `MemoryStore` and makes the next `n` compare-and-swap calls fail
/// as if another writer got there first.
#[derive(Debug, Default)]
pub struct ConflictingStore {
    inner: MemoryStore,
    pending_conflicts: AtomicU32,
    conflicts_raised: AtomicU32,
}

impl ConflictingStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn inject_conflicts(&self, n: u32) {
        self.pending_conflicts.store(n, Ordering::SeqCst);
    }

    pub fn conflicts_raised(&self) -> u32 {
        self.conflicts_raised.load(Ordering::SeqCst)
    }

    pub fn version(&self, id: PipelineId) -> Option<u64> {
        self.inner.version(id)
    }
}

impl PipelineStore for ConflictingStore {
    fn allocate_pipeline_id(&self) -> PipelineId {
        self.inner.allocate_pipeline_id()
    }

    fn allocate_iid(&self, project: &str) -> u64 {
        self.inner.allocate_iid(project)
    }

    fn insert(&self, record: PipelineRecord) -> std::result::Result<(), StoreError> {
        self.inner.insert(record)
    }

    fn load(&self, id: PipelineId) -> std::result::Result<Versioned<PipelineRecord>, StoreError> {
        self.inner.load(id)
    }

    fn compare_and_swap(
        &self,
        id: PipelineId,
        expected_version: u64,
        record: PipelineRecord,
    ) -> std::result::Result<u64, StoreError> {
        let injected = self
            .pending_conflicts
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok();
        if injected {
            self.conflicts_raised.fetch_add(1, Ordering::SeqCst);
            return Err(StoreError::Conflict {
                pipeline: id,
                expected: expected_version,
                actual: expected_version + 1,
            });
        }
        self.inner.compare_and_swap(id, expected_version, record)
    }

    fn pipeline_ids(&self) -> Vec<PipelineId> {
        self.inner.pipeline_ids()
    }
}

type Interleaved = Box<dyn FnOnce(&mut PipelineRecord) + Send>;

/// Wraps a `MemoryStore` and lets a competing writer change the record
/// between a caller's load and its compare-and-swap.
///
/// Each queued write runs, and is committed, just before the next
/// compare-and-swap call, so that call sees a real version conflict and has
/// to reload the competitor's changes.
#[derive(Default)]
pub struct InterleavingStore {
    inner: MemoryStore,
    competing: Mutex<VecDeque<Interleaved>>,
    committed: AtomicU32,
}

impl InterleavingStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Queue a competing write for the next compare-and-swap.
    pub fn interleave<F>(&self, write: F)
    where
        F: FnOnce(&mut PipelineRecord) + Send + 'static,
    {
        self.competing.lock().unwrap().push_back(Box::new(write));
    }

    /// Number of competing writes that made it into the store.
    pub fn competing_writes(&self) -> u32 {
        self.committed.load(Ordering::SeqCst)
    }

    pub fn version(&self, id: PipelineId) -> Option<u64> {
        self.inner.version(id)
    }
}

impl PipelineStore for InterleavingStore {
    fn allocate_pipeline_id(&self) -> PipelineId {
        self.inner.allocate_pipeline_id()
    }

    fn allocate_iid(&self, project: &str) -> u64 {
        self.inner.allocate_iid(project)
    }

    fn insert(&self, record: PipelineRecord) -> std::result::Result<(), StoreError> {
        self.inner.insert(record)
    }

    fn load(&self, id: PipelineId) -> std::result::Result<Versioned<PipelineRecord>, StoreError> {
        self.inner.load(id)
    }

    fn compare_and_swap(
        &self,
        id: PipelineId,
        expected_version: u64,
        record: PipelineRecord,
    ) -> std::result::Result<u64, StoreError> {
        let write = self.competing.lock().unwrap().pop_front();
        if let Some(write) = write {
            let Versioned { version, mut value } = self.inner.load(id)?;
            write(&mut value);
            self.inner.compare_and_swap(id, version, value)?;
            self.committed.fetch_add(1, Ordering::SeqCst);
        }
        self.inner.compare_and_swap(id, expected_version, record)
    }

    fn pipeline_ids(&self) -> Vec<PipelineId> {
        self.inner.pipeline_ids()
    }
}

/// Downstream service backed by in-memory definitions.
///
/// Child pipelines are looked up by their first include file, cross-project
/// pipelines by project path. Projects listed in `forbidden` answer with a
/// 403.
#[derive(Debug, Clone, Default)]
pub struct FakeDownstream {
    pub projects: HashMap<String, ConfigFile>,
    pub includes: HashMap<String, ConfigFile>,
    pub forbidden: Vec<String>,
    pub requests: Arc<Mutex<Vec<CreatePipelineRequest>>>,
}

impl FakeDownstream {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_project(mut self, path: &str, cfg: ConfigFile) -> Self {
        self.projects.insert(path.to_string(), cfg);
        self
    }

    pub fn with_include(mut self, file: &str, cfg: ConfigFile) -> Self {
        self.includes.insert(file.to_string(), cfg);
        self
    }

    pub fn forbid(mut self, path: &str) -> Self {
        self.forbidden.push(path.to_string());
        self.projects.entry(path.to_string()).or_insert_with(|| {
            crate::builders::ConfigFileBuilder::new()
                .with_job(
                    "noop",
                    crate::builders::JobConfigBuilder::new("test").build(),
                )
                .build()
        });
        self
    }

    pub fn requests(&self) -> Vec<CreatePipelineRequest> {
        self.requests.lock().unwrap().clone()
    }
}

impl ProjectResolver for FakeDownstream {
    fn find_by_full_path(&self, path: &str) -> Option<Project> {
        if path == "local/project" || self.projects.contains_key(path) {
            Some(Project::new(path, "main"))
        } else {
            None
        }
    }
}

impl DownstreamService for FakeDownstream {
    fn create_pipeline(
        &self,
        request: CreatePipelineRequest,
        id: PipelineId,
        iid: u64,
        now: DateTime<Utc>,
    ) -> Pin<Box<dyn Future<Output = std::result::Result<PipelineRecord, BridgeError>> + Send + '_>> {
        Box::pin(async move {
            self.requests.lock().unwrap().push(request.clone());

            if self.forbidden.contains(&request.project.path) {
                return Err(BridgeError::Service {
                    status: 403,
                    message: "insufficient permissions".to_string(),
                });
            }

            let cfg = if request.source == Source::ParentPipeline {
                request
                    .execute_params
                    .includes
                    .first()
                    .and_then(|file| self.includes.get(file))
            } else {
                self.projects.get(&request.project.path)
            };
            let Some(cfg) = cfg else {
                return Err(BridgeError::Service {
                    status: 404,
                    message: format!("no definition for {}", request.project.path),
                });
            };

            let header = downstream_header(&request, id, iid, now);
            Ok(seed_pipeline(cfg, header, now))
        })
    }
}

/// An engine over the given store and downstream service that records
/// dispatched effects.
pub fn engine_with<S>(
    store: Arc<S>,
    downstream: FakeDownstream,
) -> (Arc<Engine>, RecordingDispatcher)
where
    S: PipelineStore + 'static,
{
    let dispatcher = RecordingDispatcher::new();
    let engine = Engine::new(
        store,
        Arc::new(dispatcher.clone()),
        Arc::new(downstream),
        EngineSettings::default(),
    );
    (Arc::new(engine), dispatcher)
}

/// An engine over a fresh `MemoryStore` with no downstream projects.
pub fn memory_engine() -> (Arc<Engine>, RecordingDispatcher) {
    engine_with(Arc::new(MemoryStore::new()), FakeDownstream::new())
}
