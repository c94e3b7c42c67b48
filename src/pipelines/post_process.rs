// src/pipelines/post_process.rs: validation, read-group repair and downsampling of the merged BAM

use std::path::{Path, PathBuf};

use log::{info, warn};

use crate::config::defs::{
    PipelineError, RunConfig, GATK_TAG, PICARD_TAG, REDUCED_BAM, REPAIR_TEMP_SUFFIX,
    SAMTOOLS_TAG, VALIDATION_RECHECK_REPORT, VALIDATION_REPORT,
};
use crate::utils::command::{gatk, picard, run_checked, samtools, verify_outputs, ToolInvocation, ToolRunner};
use crate::utils::validation::ValidationReport;

#[derive(Debug, Clone, PartialEq)]
pub struct PostProcessReport {
    pub validation: ValidationReport,
    pub repaired: bool,
    /// Validation of the repaired BAM, only present when a repair ran.
    pub recheck: Option<ValidationReport>,
    pub reduced: PathBuf,
}

/// `<reference>.fai`
pub fn fasta_index_path(reference: &Path) -> PathBuf {
    let mut name = reference.as_os_str().to_owned();
    name.push(".fai");
    PathBuf::from(name)
}

/// `genome.fa` -> `genome.dict`
pub fn sequence_dictionary_path(reference: &Path) -> PathBuf {
    reference.with_extension("dict")
}

pub fn repair_temp_path(bam: &Path) -> PathBuf {
    let mut name = bam.as_os_str().to_owned();
    name.push(format!(".{}", REPAIR_TEMP_SUFFIX));
    PathBuf::from(name)
}

/// Creates whichever of the sequence dictionary and the fasta index is missing.
pub async fn ensure_reference_indices(
    config: &RunConfig,
    runner: &dyn ToolRunner,
    reference: &Path,
) -> Result<(), PipelineError> {
    let dict = sequence_dictionary_path(reference);
    let fai = fasta_index_path(reference);

    if !dict.exists() {
        info!("Creating sequence dictionary {}", dict.display());
        let inv = ToolInvocation::new(
            PICARD_TAG,
            &config.tools.java,
            picard::sequence_dictionary_args(&config.tools.picard_jar, reference, &dict),
            &config.batch_dir,
            "create_sequence_dictionary",
        )
        .expecting([dict.clone()]);
        run_checked(runner, &inv).await?;
    }

    if !fai.exists() {
        info!("Creating the index {}", fai.display());
        let inv = ToolInvocation::new(
            SAMTOOLS_TAG,
            &config.tools.samtools,
            samtools::faidx_args(reference),
            &config.batch_dir,
            "faidx",
        )
        .expecting([fai.clone()]);
        run_checked(runner, &inv).await?;
    }
    Ok(())
}

/// Runs ValidateSamFile in SUMMARY mode. Its exit status is non-zero whenever it finds
/// problems, so only a missing report counts as failure.
pub async fn validate(
    config: &RunConfig,
    runner: &dyn ToolRunner,
    bam: &Path,
    report_name: &str,
    log_stem: &str,
) -> Result<ValidationReport, PipelineError> {
    let report_path = config.batch_dir.join(report_name);
    let inv = ToolInvocation::new(
        PICARD_TAG,
        &config.tools.java,
        picard::validate_args(&config.tools.picard_jar, bam, &report_path),
        &config.batch_dir,
        log_stem,
    )
    .expecting([report_path.clone()]);
    let status = runner.run(&inv).await?;
    verify_outputs(&inv)?;
    let report = tokio::task::spawn_blocking(move || ValidationReport::from_file(&report_path))
        .await
        .map_err(|e| PipelineError::Other(e.into()))??;
    info!(
        "Validation of {} exited with {:?}: {} error type(s), {} warning type(s)",
        bam.display(),
        status.code,
        report.errors.len(),
        report.warnings.len()
    );
    Ok(report)
}

/// Rewrites `bam` with placeholder read groups, replacing the original in place.
pub async fn repair_read_groups(
    config: &RunConfig,
    runner: &dyn ToolRunner,
    bam: &Path,
) -> Result<(), PipelineError> {
    let temp = repair_temp_path(bam);
    let inv = ToolInvocation::new(
        PICARD_TAG,
        &config.tools.java,
        picard::add_read_groups_args(&config.tools.picard_jar, bam, &temp, &config.batch_name),
        &config.batch_dir,
        "fix_missing_read_group",
    )
    .expecting([temp.clone()]);
    run_checked(runner, &inv).await?;

    tokio::fs::remove_file(bam).await?;
    tokio::fs::rename(&temp, bam).await?;
    info!("Added read group {} to {}", config.batch_name, bam.display());
    Ok(())
}

/// Validate, repair missing read groups, index and downsample the merged BAM.
///
/// # Arguments
///
/// * `config` - RunConfig for the batch.
/// * `runner` - Executes picard, samtools and GATK.
/// * `reference` - Decompressed reference FASTA.
/// * `merged` - Output of the merge stage.
///
/// # Returns
/// PostProcessReport describing findings and the reduced-coverage BAM.
pub async fn run(
    config: &RunConfig,
    runner: &dyn ToolRunner,
    reference: &Path,
    merged: &Path,
) -> Result<PostProcessReport, PipelineError> {
    ensure_reference_indices(config, runner, reference).await?;

    info!("Validating the sam/bam file ...");
    let validation = validate(config, runner, merged, VALIDATION_REPORT, "check_bam").await?;

    let mut recheck = None;
    let repaired = validation.needs_read_group_repair();
    if repaired {
        repair_read_groups(config, runner, merged).await?;
        let after = validate(config, runner, merged, VALIDATION_RECHECK_REPORT, "check_bam.recheck").await?;
        if after.needs_read_group_repair() {
            warn!("{} still reports missing read groups after repair", merged.display());
        }
        recheck = Some(after);
    }

    let outstanding = recheck.as_ref().unwrap_or(&validation);
    for code in outstanding.errors.iter().filter(|c| !ValidationReport::is_repairable(c)) {
        warn!("Validation error {} is not handled automatically", code);
    }
    for code in &outstanding.warnings {
        warn!("Validation warning {} is not handled automatically", code);
    }

    info!("Start downsampling ...");
    let index = ToolInvocation::new(
        PICARD_TAG,
        &config.tools.java,
        picard::build_index_args(&config.tools.picard_jar, merged),
        &config.batch_dir,
        "build_bam_index",
    );
    run_checked(runner, &index).await?;

    let reduced = config.batch_dir.join(REDUCED_BAM);
    let reduce = ToolInvocation::new(
        GATK_TAG,
        &config.tools.java,
        gatk::reduce_coverage_args(
            &config.tools.gatk_jar,
            reference,
            merged,
            &reduced,
            config.options.target_coverage,
        ),
        &config.batch_dir,
        "reduce_coverage",
    )
    .expecting([reduced.clone()]);
    run_checked(runner, &reduce).await?;
    info!("Finished processing.");

    Ok(PostProcessReport {
        validation,
        repaired,
        recheck,
        reduced,
    })
}
