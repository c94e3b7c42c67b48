mod pipelines;
mod utils;
mod config;
mod cli;

use std::env;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{Duration, Instant};

use anyhow::Result;
use env_logger::Builder;
use log::{self, LevelFilter, debug, error, info};

use crate::cli::{parse, Arguments};
use crate::config::defs::{PipelineError, PipelineOptions, RunConfig, ToolPaths};
use crate::pipelines::batch::BatchController;
use crate::utils::command::{check_tools, ProcessRunner};
use crate::utils::file::absolutize;
use crate::utils::manifest::Manifest;


#[tokio::main]
async fn main() -> Result<()> {
    let run_start = Instant::now();

    let args = parse();

    let log_level = if args.verbose {
        LevelFilter::Debug
    } else {
        LevelFilter::Info
    };

    Builder::new()
        .filter_level(log_level)
        .format(|buf, record| {
            writeln!(
                buf,
                "[{}] {}: {}",
                chrono::Local::now().format("%Y-%m-%d %H:%M:%S"),
                record.level(),
                record.args()
            )
        })
        .init();

    println!("\n-------------\n RNA-seq preprocessing\n-------------\n");

    let dir = env::current_dir()?;
    info!("The current directory is {:?}\n", dir);

    let run_config = Arc::new(build_run_config(&args, &dir)?);
    debug!("Tools: {:?}", run_config.tools);

    if let Err(e) = run_batch(&args, run_config).await {
        if e.is_batch_fatal() {
            error!("Batch aborted before any run started: {}", e);
        } else {
            error!("Pipeline failed: {} at {} milliseconds.", e, run_start.elapsed().as_millis());
        }
        std::process::exit(1);
    }

    println!("Run complete: {} milliseconds.", run_start.elapsed().as_millis());
    Ok(())
}


async fn run_batch(args: &Arguments, run_config: Arc<RunConfig>) -> Result<(), PipelineError> {
    if !args.skip_tool_check {
        check_tools(&run_config.tools, run_config.options.post_process)?;
    }

    let manifest_path = absolutize(Path::new(&args.input), &run_config.cwd);
    let manifest = Manifest::load(&manifest_path, run_config.options.download)?;

    let runner = Arc::new(ProcessRunner::new(run_config.options.tool_timeout));
    let controller = BatchController::new(run_config.clone(), runner);
    let summary = controller.run(&manifest).await?;

    match &summary.merged {
        Some(merged) => info!("Merged BAM: {}", merged.display()),
        None => info!("No merged BAM was produced"),
    }
    if let Some(report) = &summary.post_process {
        info!("Reduced-coverage BAM: {}", report.reduced.display());
    }
    Ok(())
}


/// Resolves every path argument against `cwd` and gathers the tool locations.
///
/// # Arguments
/// * `args` - The parsed command-line arguments.
/// * `cwd` - The current working directory.
/// # Returns
/// RunConfig shared by every run of the batch.
fn build_run_config(args: &Arguments, cwd: &Path) -> Result<RunConfig> {
    if args.name.trim().is_empty() || args.name.contains(std::path::MAIN_SEPARATOR) {
        return Err(anyhow::anyhow!("Invalid batch name: {:?}", args.name));
    }
    let out_dir = absolutize(Path::new(&args.out_dir), cwd);
    let batch_dir = out_dir.join(&args.name);

    let mut tools = ToolPaths::from_lib_dir(&absolutize(Path::new(&args.lib_dir), cwd));
    if let Some(java) = &args.java {
        tools.java = PathBuf::from(java);
    }
    if let Some(samtools) = &args.samtools {
        tools.samtools = PathBuf::from(samtools);
    }
    if let Some(fastq_dump) = &args.fastq_dump {
        tools.fastq_dump = PathBuf::from(fastq_dump);
    }

    Ok(RunConfig {
        cwd: cwd.to_path_buf(),
        batch_name: args.name.clone(),
        batch_dir,
        reference: absolutize(Path::new(&args.genome), cwd),
        tools,
        options: PipelineOptions {
            threads: args.threads.max(1),
            jobs: args.jobs.max(1),
            download: args.download,
            post_process: args.downsample,
            target_coverage: args.target_coverage,
            tool_timeout: args.tool_timeout_secs.map(Duration::from_secs),
        },
    })
}
