// src/exec/downstream.rs

//! Creating downstream pipelines for bridges.

use std::collections::BTreeMap;
use std::future::Future;
use std::path::PathBuf;
use std::pin::Pin;

use chrono::{DateTime, Utc};
use tracing::{debug, info};

use crate::bridge::{BridgeError, CreatePipelineRequest, Project, ProjectResolver};
use crate::config::loader::load_from_path;
use crate::config::{ConfigFile, DownstreamProjectSection, ProjectSection, RawConfigFile};
use crate::errors::Result;
use crate::pipeline::{Pipeline, PipelineRecord};
use crate::seed::{seed_pipeline, seed_with_errors};
use crate::types::{ConfigSource, PipelineId, Source};

/// Creates the pipeline a bridge asked for.
///
/// The engine allocates the id and the per-project iid, and stores the
/// returned record. Failures use `BridgeError::Service` with an HTTP-style
/// status.
pub trait DownstreamService: ProjectResolver {
    fn create_pipeline(
        &self,
        request: CreatePipelineRequest,
        id: PipelineId,
        iid: u64,
        now: DateTime<Utc>,
    ) -> Pin<Box<dyn Future<Output = std::result::Result<PipelineRecord, BridgeError>> + Send + '_>>;
}

/// Header of a downstream pipeline as described by `request`.
pub fn downstream_header(
    request: &CreatePipelineRequest,
    id: PipelineId,
    iid: u64,
    now: DateTime<Utc>,
) -> Pipeline {
    let revision = &request.target_revision;
    // Local projects have no repository; the ref stands in for the commit.
    let sha = revision
        .checkout_sha
        .clone()
        .unwrap_or_else(|| revision.git_ref.clone());

    let mut pipeline = Pipeline::new(id, request.project.path.clone(), revision.git_ref.clone(), sha, now);
    pipeline.iid = iid;
    pipeline.before_sha = revision.before.clone();
    pipeline.source_sha = revision.source_sha.clone();
    pipeline.target_sha = revision.target_sha.clone();
    pipeline.source = request.source;
    pipeline.config_source = match request.source {
        Source::ParentPipeline => ConfigSource::BridgeSource,
        _ => ConfigSource::RepositorySource,
    };
    pipeline.merge_request_id = request.execute_params.merge_request_id;
    pipeline.variables = revision.variables.clone();
    pipeline.upstream = Some(request.upstream);
    pipeline
}

/// Downstream service backed by definition files next to the main one.
///
/// Child pipelines load their `include` files; cross-project pipelines load
/// the `definition` of the project from `[projects."<path>"]`. A definition
/// that cannot be read or validated still produces a pipeline, carrying the
/// problem as its config error.
#[derive(Debug, Clone)]
pub struct LocalDownstream {
    root: PathBuf,
    home: Project,
    projects: BTreeMap<String, DownstreamProjectSection>,
}

impl LocalDownstream {
    pub fn new(
        root: impl Into<PathBuf>,
        home: &ProjectSection,
        projects: &BTreeMap<String, DownstreamProjectSection>,
    ) -> Self {
        Self {
            root: root.into(),
            home: Project::new(home.path.clone(), home.default_branch.clone()),
            projects: projects.clone(),
        }
    }

    fn definition_files(&self, request: &CreatePipelineRequest) -> std::result::Result<Vec<PathBuf>, BridgeError> {
        if request.source == Source::ParentPipeline {
            return Ok(request
                .execute_params
                .includes
                .iter()
                .map(|file| self.root.join(file))
                .collect());
        }

        self.projects
            .get(&request.project.path)
            .and_then(|section| section.definition.as_deref())
            .map(|file| vec![self.root.join(file)])
            .ok_or_else(|| BridgeError::Service {
                status: 404,
                message: format!(
                    "project `{}` has no pipeline definition",
                    request.project.path
                ),
            })
    }
}

/// Read and merge definition files. Later files add jobs and variables;
/// stages come from the first file.
fn load_merged(files: &[PathBuf]) -> Result<ConfigFile> {
    let mut merged: Option<RawConfigFile> = None;
    for file in files {
        let raw = load_from_path(file)?;
        match merged.as_mut() {
            None => merged = Some(raw),
            Some(base) => {
                base.variables.extend(raw.variables);
                base.job.extend(raw.job);
            }
        }
    }
    ConfigFile::try_from(merged.unwrap_or_default())
}

fn display_paths(files: &[PathBuf]) -> Vec<String> {
    files.iter().map(|p| p.display().to_string()).collect()
}

impl ProjectResolver for LocalDownstream {
    fn find_by_full_path(&self, path: &str) -> Option<Project> {
        if path == self.home.path {
            return Some(self.home.clone());
        }
        self.projects
            .get(path)
            .map(|section| Project::new(path, section.default_branch.clone()))
    }
}

impl DownstreamService for LocalDownstream {
    fn create_pipeline(
        &self,
        request: CreatePipelineRequest,
        id: PipelineId,
        iid: u64,
        now: DateTime<Utc>,
    ) -> Pin<Box<dyn Future<Output = std::result::Result<PipelineRecord, BridgeError>> + Send + '_>> {
        Box::pin(async move {
            let files = self.definition_files(&request)?;
            let header = downstream_header(&request, id, iid, now);
            debug!(pipeline_id = id, files = ?display_paths(&files), "loading downstream definition");

            let record = match load_merged(&files) {
                Ok(cfg) => seed_pipeline(&cfg, header, now),
                Err(err) => {
                    info!(pipeline_id = id, error = %err, "downstream definition is invalid");
                    seed_with_errors(header, err.to_string())
                }
            };
            Ok(record)
        })
    }
}
