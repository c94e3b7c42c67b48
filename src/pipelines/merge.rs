use std::path::PathBuf;

use log::{info, warn};

use crate::config::defs::{PipelineError, RunConfig, MERGED_BAM, MERGE_LOG_STEM, PICARD_TAG};
use crate::utils::command::{picard, run_checked, ToolInvocation, ToolRunner};

/// Combines the per-run sorted BAMs into `<batch_dir>/output.bam`.
///
/// # Arguments
///
/// * `config` - RunConfig for the batch.
/// * `runner` - Executes MergeSamFiles.
/// * `inputs` - Sorted BAMs of the runs that reached Done, manifest order.
///
/// # Returns
/// Merged BAM path, or None when there was nothing to merge.
pub async fn merge_stage(
    config: &RunConfig,
    runner: &dyn ToolRunner,
    inputs: &[PathBuf],
) -> Result<Option<PathBuf>, PipelineError> {
    if inputs.is_empty() {
        // MergeSamFiles refuses to run without an I= argument
        warn!("No run of batch {} produced a BAM; nothing to merge", config.batch_name);
        return Ok(None);
    }

    info!("Combining {} sam/bam files ...", inputs.len());
    let merged = config.batch_dir.join(MERGED_BAM);
    let inv = ToolInvocation::new(
        PICARD_TAG,
        &config.tools.java,
        picard::merge_args(&config.tools.picard_jar, inputs, &merged),
        &config.batch_dir,
        MERGE_LOG_STEM,
    )
    .appending()
    .expecting([merged.clone()]);
    run_checked(runner, &inv).await?;

    info!("Finished combining the sam/bam files into {}", merged.display());
    Ok(Some(merged))
}
