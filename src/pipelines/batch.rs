// src/pipelines/batch.rs: manifest-level orchestration

use std::collections::HashSet;
use std::path::PathBuf;
use std::sync::Arc;

use futures::stream::{self, StreamExt};
use log::{error, info, warn};

use crate::config::defs::{PipelineError, RunConfig};
use crate::pipelines::merge::merge_stage;
use crate::pipelines::post_process::{self, PostProcessReport};
use crate::pipelines::run_stage::{RunContext, RunOutcome, RunStagePipeline, RunState, SharedReference};
use crate::utils::command::ToolRunner;
use crate::utils::file::absolutize;
use crate::utils::manifest::{Manifest, RunRecord};

#[derive(Debug)]
pub struct BatchSummary {
    pub outcomes: Vec<RunOutcome>,
    pub merged: Option<PathBuf>,
    pub post_process: Option<PostProcessReport>,
}

impl BatchSummary {
    /// Sorted BAMs handed to the merge stage, manifest order.
    pub fn merge_inputs(&self) -> Vec<PathBuf> {
        self.outcomes.iter().filter_map(|o| o.artifact().cloned()).collect()
    }

    pub fn count(&self, state: RunState) -> usize {
        self.outcomes.iter().filter(|o| o.state == state).count()
    }
}

/// Where each run writes: `<batch_dir>/<sra basename>`, with `.2`, `.3`, ... appended when a
/// directory name is already taken so no two runs share a directory.
pub fn plan_run_contexts(config: &RunConfig, records: &[RunRecord]) -> Vec<RunContext> {
    let mut taken: HashSet<String> = HashSet::new();
    records
        .iter()
        .map(|record| {
            let sra_path = absolutize(&PathBuf::from(&record.run), &config.cwd);
            let base = sra_path
                .file_name()
                .map(|n| n.to_string_lossy().into_owned())
                .unwrap_or_else(|| record.run.clone());
            let mut dir_name = base.clone();
            let mut n = 1;
            // a suffixed name may itself be another run's basename
            while taken.contains(&dir_name) {
                n += 1;
                dir_name = format!("{}.{}", base, n);
            }
            taken.insert(dir_name.clone());
            RunContext::new(&record.run, &sra_path, &config.batch_dir.join(dir_name))
        })
        .collect()
}

pub struct BatchController {
    config: Arc<RunConfig>,
    runner: Arc<dyn ToolRunner>,
}

impl BatchController {
    pub fn new(config: Arc<RunConfig>, runner: Arc<dyn ToolRunner>) -> Self {
        BatchController { config, runner }
    }

    /// Processes every run of the manifest, merges what succeeded and optionally post-processes
    /// the merged BAM. A failing run never stops the batch; merge and post-processing failures do.
    pub async fn run(&self, manifest: &Manifest) -> Result<BatchSummary, PipelineError> {
        let config = self.config.as_ref();
        let runner = self.runner.as_ref();
        tokio::fs::create_dir_all(&config.batch_dir).await?;

        let reference = SharedReference::new(&config.reference, &config.batch_dir);
        let contexts = plan_run_contexts(config, &manifest.records);
        let jobs = config.options.jobs.max(1);
        info!(
            "Processing {} runs of batch {} ({} at a time)",
            manifest.records.len(),
            config.batch_name,
            jobs
        );

        // buffered keeps manifest order in the results
        let outcomes: Vec<RunOutcome> = stream::iter(manifest.records.iter().zip(contexts))
            .map(|(record, ctx)| {
                let reference = &reference;
                async move {
                    info!("Processing the file: {}", record.run);
                    RunStagePipeline::new(config, runner, reference, record, ctx)
                        .execute()
                        .await
                }
            })
            .buffered(jobs)
            .collect()
            .await;

        for outcome in &outcomes {
            match &outcome.result {
                Ok(bam) => info!("Run {} done: {}", outcome.run_id, bam.display()),
                Err(e) => error!("{}", e),
            }
        }

        let mut summary = BatchSummary {
            outcomes,
            merged: None,
            post_process: None,
        };
        let inputs = summary.merge_inputs();
        info!(
            "{} of {} runs succeeded ({} rejected, {} failed)",
            inputs.len(),
            summary.outcomes.len(),
            summary.count(RunState::Rejected),
            summary.count(RunState::Failed)
        );

        summary.merged = merge_stage(config, runner, &inputs).await?;

        if config.options.post_process {
            match &summary.merged {
                Some(merged) => {
                    let reference_path = reference.get().await?;
                    let report = post_process::run(config, runner, &reference_path, merged).await?;
                    summary.post_process = Some(report);
                }
                None => warn!("Skipping validation and downsampling: no merged BAM"),
            }
        }

        Ok(summary)
    }
}
