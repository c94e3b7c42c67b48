/// Functions and structs for building and running external tool command lines

use std::env;
use std::fmt;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::time::Duration;

use async_trait::async_trait;
use log::{debug, error};
use tokio::process::Command;

use crate::config::defs::{PipelineError, ToolPaths};
use crate::utils::file::{stage_log_paths, StageLogs};


/// One external program call with its stdout/stderr destinations.
#[derive(Debug, Clone, PartialEq)]
pub struct ToolInvocation {
    pub tool: String,
    pub program: PathBuf,
    pub args: Vec<String>,
    pub log: PathBuf,
    pub errlog: PathBuf,
    /// Append to the log pair instead of truncating it.
    pub append: bool,
    /// Files the tool must leave behind for the call to count as successful.
    pub outputs: Vec<PathBuf>,
}

impl ToolInvocation {
    pub fn new(tool: &str, program: &Path, args: Vec<String>, log_dir: &Path, log_stem: &str) -> Self {
        let (log, errlog) = stage_log_paths(log_dir, log_stem);
        ToolInvocation {
            tool: tool.to_string(),
            program: program.to_path_buf(),
            args,
            log,
            errlog,
            append: false,
            outputs: Vec::new(),
        }
    }

    pub fn appending(mut self) -> Self {
        self.append = true;
        self
    }

    pub fn expecting<I: IntoIterator<Item = PathBuf>>(mut self, outputs: I) -> Self {
        self.outputs.extend(outputs);
        self
    }
}

impl fmt::Display for ToolInvocation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.program.display())?;
        for arg in &self.args {
            write!(f, " {}", arg)?;
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ToolStatus {
    pub code: Option<i32>,
}

impl ToolStatus {
    pub fn success(&self) -> bool {
        self.code == Some(0)
    }
}

/// Seam between the orchestration logic and the operating system.
#[async_trait]
pub trait ToolRunner: Send + Sync {
    /// Runs the invocation to completion. Only spawn/IO problems and timeouts are errors;
    /// the exit status is returned for the caller to judge.
    async fn run(&self, invocation: &ToolInvocation) -> Result<ToolStatus, PipelineError>;
}

/// Runs tools as child processes, stdout/stderr captured into the stage log pair.
#[derive(Debug, Clone, Default)]
pub struct ProcessRunner {
    pub timeout: Option<Duration>,
}

impl ProcessRunner {
    pub fn new(timeout: Option<Duration>) -> Self {
        ProcessRunner { timeout }
    }
}

#[async_trait]
impl ToolRunner for ProcessRunner {
    async fn run(&self, invocation: &ToolInvocation) -> Result<ToolStatus, PipelineError> {
        let exec_err = |e: std::io::Error| PipelineError::ToolExecution {
            tool: invocation.tool.clone(),
            error: e.to_string(),
        };

        let logs = StageLogs::open(&invocation.log, &invocation.errlog, invocation.append).map_err(exec_err)?;
        debug!("Running: {}", invocation);

        let mut child = Command::new(&invocation.program)
            .args(&invocation.args)
            .stdin(Stdio::null())
            .stdout(logs.stdout().map_err(exec_err)?)
            .stderr(logs.stderr().map_err(exec_err)?)
            .kill_on_drop(true)
            .spawn()
            .map_err(|e| PipelineError::ToolExecution {
                tool: invocation.tool.clone(),
                error: format!("failed to spawn {}: {}. Is it installed?", invocation.program.display(), e),
            })?;

        let status = match self.timeout {
            Some(limit) => {
                let waited = tokio::time::timeout(limit, child.wait()).await;
                match waited {
                    Ok(status) => status.map_err(exec_err)?,
                    Err(_) => {
                        error!("{} timed out after {}s, killing it", invocation.tool, limit.as_secs());
                        let _ = child.kill().await;
                        return Err(PipelineError::ToolTimeout {
                            tool: invocation.tool.clone(),
                            secs: limit.as_secs(),
                        });
                    }
                }
            }
            None => child.wait().await.map_err(exec_err)?,
        };

        drop(logs);
        Ok(ToolStatus { code: status.code() })
    }
}

/// Runs `invocation` and insists on a zero exit plus every declared output.
pub async fn run_checked(runner: &dyn ToolRunner, invocation: &ToolInvocation) -> Result<(), PipelineError> {
    let status = runner.run(invocation).await?;
    if !status.success() {
        return Err(PipelineError::ToolFailed {
            tool: invocation.tool.clone(),
            code: status.code,
            errlog: invocation.errlog.clone(),
        });
    }
    verify_outputs(invocation)
}

pub fn verify_outputs(invocation: &ToolInvocation) -> Result<(), PipelineError> {
    match invocation.outputs.iter().find(|p| !p.exists()) {
        Some(missing) => Err(PipelineError::MissingOutput {
            tool: invocation.tool.clone(),
            path: missing.clone(),
        }),
        None => Ok(()),
    }
}

fn path_arg(path: &Path) -> String {
    path.to_string_lossy().into_owned()
}

fn java_jar_args(jar: &Path) -> Vec<String> {
    vec!["-jar".to_string(), path_arg(jar)]
}


pub mod fastq_dump {
    use std::path::Path;
    use super::path_arg;

    /// `fastq-dump --dumpbase --split-files -O <out_dir> <sra>`
    pub fn arg_generator(sra: &Path, out_dir: &Path) -> Vec<String> {
        vec![
            "--dumpbase".to_string(),
            "--split-files".to_string(),
            "-O".to_string(),
            path_arg(out_dir),
            path_arg(sra),
        ]
    }
}

pub mod fastqc {
    use std::path::Path;
    use super::path_arg;

    pub fn arg_generator(reads: &Path, out_dir: &Path) -> Vec<String> {
        vec!["--outdir".to_string(), path_arg(out_dir), path_arg(reads)]
    }

    /// FastQC names its archive after the read file: `x_1.fastq` -> `x_1_fastqc.zip`.
    pub fn report_archive(reads: &Path, out_dir: &Path) -> std::path::PathBuf {
        let stem = reads
            .file_stem()
            .map(|s| s.to_string_lossy().into_owned())
            .unwrap_or_default();
        out_dir.join(format!("{}_fastqc.zip", stem))
    }
}

pub mod trimmomatic {
    use std::path::{Path, PathBuf};
    use super::{java_jar_args, path_arg};
    use crate::config::defs::{
        LEADING_QUALITY, MIN_READ_LENGTH, PHRED_ENCODING, SLIDING_WINDOW, TRAILING_QUALITY,
    };
    use crate::utils::adapters::illuminaclip;

    fn trailing_steps(adapter: &Path) -> Vec<String> {
        vec![
            illuminaclip(adapter),
            format!("LEADING:{}", LEADING_QUALITY),
            format!("TRAILING:{}", TRAILING_QUALITY),
            format!("SLIDINGWINDOW:{}", SLIDING_WINDOW),
            format!("MINLEN:{}", MIN_READ_LENGTH),
            PHRED_ENCODING.to_string(),
        ]
    }

    fn threads_args(threads: usize) -> Vec<String> {
        if threads > 1 {
            vec!["-threads".to_string(), threads.to_string()]
        } else {
            Vec::new()
        }
    }

    pub fn single_end(jar: &Path, threads: usize, input: &Path, output: &Path, adapter: &Path) -> Vec<String> {
        let mut args = java_jar_args(jar);
        args.push("SE".to_string());
        args.extend(threads_args(threads));
        args.push(path_arg(input));
        args.push(path_arg(output));
        args.extend(trailing_steps(adapter));
        args
    }

    /// `outputs` is forward paired, forward unpaired, reverse paired, reverse unpaired.
    pub fn paired_end(
        jar: &Path,
        threads: usize,
        inputs: (&Path, &Path),
        outputs: [&PathBuf; 4],
        adapter: &Path,
    ) -> Vec<String> {
        let mut args = java_jar_args(jar);
        args.push("PE".to_string());
        args.extend(threads_args(threads));
        args.push(path_arg(inputs.0));
        args.push(path_arg(inputs.1));
        args.extend(outputs.iter().map(|p| path_arg(p)));
        args.extend(trailing_steps(adapter));
        args
    }
}

pub mod bbmerge {
    use std::path::Path;
    use super::path_arg;

    pub fn arg_generator(r1: &Path, r2: &Path, adapters_out: &Path) -> Vec<String> {
        vec![
            format!("in1={}", path_arg(r1)),
            format!("in2={}", path_arg(r2)),
            format!("outa={}", path_arg(adapters_out)),
        ]
    }
}

pub mod hisat2 {
    use std::path::Path;
    use super::path_arg;

    pub fn build_args(reference: &Path, index_prefix: &Path) -> Vec<String> {
        vec![path_arg(reference), path_arg(index_prefix)]
    }

    pub fn align_args(index_prefix: &Path, reads: &[&Path], sam_out: &Path, threads: usize) -> Vec<String> {
        let mut args = Vec::new();
        if threads > 1 {
            args.push("-p".to_string());
            args.push(threads.to_string());
        }
        args.push("-x".to_string());
        args.push(path_arg(index_prefix));
        match reads {
            [single] => {
                args.push("-U".to_string());
                args.push(path_arg(single));
            }
            [r1, r2, ..] => {
                args.push("-1".to_string());
                args.push(path_arg(r1));
                args.push("-2".to_string());
                args.push(path_arg(r2));
            }
            [] => {}
        }
        args.push("-S".to_string());
        args.push(path_arg(sam_out));
        args
    }
}

pub mod samtools {
    use std::path::Path;
    use super::path_arg;
    use crate::config::defs::SamtoolsSubcommand;

    pub fn sort_args(sam: &Path, bam_out: &Path, temp_prefix: &Path, threads: usize) -> Vec<String> {
        let mut args = vec![
            SamtoolsSubcommand::Sort.as_str().to_string(),
            "-o".to_string(),
            path_arg(bam_out),
            "-O".to_string(),
            "bam".to_string(),
            "-T".to_string(),
            path_arg(temp_prefix),
        ];
        if threads > 1 {
            args.push("-@".to_string());
            args.push(threads.to_string());
        }
        args.push(path_arg(sam));
        args
    }

    pub fn faidx_args(reference: &Path) -> Vec<String> {
        vec![SamtoolsSubcommand::Faidx.as_str().to_string(), path_arg(reference)]
    }
}

pub mod picard {
    use std::path::{Path, PathBuf};
    use super::{java_jar_args, path_arg};
    use crate::config::defs::{PicardSubcommand, PICARD_MAX_RECORDS_IN_RAM, READ_GROUP_PLACEHOLDER};

    fn base(jar: &Path, subcommand: PicardSubcommand) -> Vec<String> {
        let mut args = java_jar_args(jar);
        args.push(subcommand.as_str().to_string());
        args
    }

    pub fn merge_args(jar: &Path, inputs: &[PathBuf], output: &Path) -> Vec<String> {
        let mut args = base(jar, PicardSubcommand::MergeSamFiles);
        args.push(format!("O={}", path_arg(output)));
        args.extend(inputs.iter().map(|i| format!("I={}", path_arg(i))));
        args
    }

    pub fn sequence_dictionary_args(jar: &Path, reference: &Path, dict_out: &Path) -> Vec<String> {
        let mut args = base(jar, PicardSubcommand::CreateSequenceDictionary);
        args.push(format!("R={}", path_arg(reference)));
        args.push(format!("O={}", path_arg(dict_out)));
        args
    }

    pub fn validate_args(jar: &Path, bam: &Path, report: &Path) -> Vec<String> {
        let mut args = base(jar, PicardSubcommand::ValidateSamFile);
        args.push(format!("I={}", path_arg(bam)));
        args.push(format!("O={}", path_arg(report)));
        args.push(format!("MAX_RECORDS_IN_RAM={}", PICARD_MAX_RECORDS_IN_RAM));
        args.push("MODE=SUMMARY".to_string());
        args
    }

    pub fn add_read_groups_args(jar: &Path, bam: &Path, output: &Path, read_group_id: &str) -> Vec<String> {
        let mut args = base(jar, PicardSubcommand::AddOrReplaceReadGroups);
        args.push(format!("I={}", path_arg(bam)));
        args.push(format!("O={}", path_arg(output)));
        args.push(format!("RGID={}", read_group_id));
        for field in ["RGLB", "RGPL", "RGPU", "RGSM"] {
            args.push(format!("{}={}", field, READ_GROUP_PLACEHOLDER));
        }
        args.push(format!("MAX_RECORDS_IN_RAM={}", PICARD_MAX_RECORDS_IN_RAM));
        args
    }

    pub fn build_index_args(jar: &Path, bam: &Path) -> Vec<String> {
        let mut args = base(jar, PicardSubcommand::BuildBamIndex);
        args.push(format!("I={}", path_arg(bam)));
        args
    }
}

pub mod gatk {
    use std::path::Path;
    use super::{java_jar_args, path_arg};

    /// GATK3 PrintReads with downsampling to `coverage` reads per start position.
    pub fn reduce_coverage_args(jar: &Path, reference: &Path, bam: &Path, output: &Path, coverage: u32) -> Vec<String> {
        let mut args = java_jar_args(jar);
        args.extend([
            "-T".to_string(),
            "PrintReads".to_string(),
            "-R".to_string(),
            path_arg(reference),
            "-I".to_string(),
            path_arg(bam),
            "-o".to_string(),
            path_arg(output),
            "-dcov".to_string(),
            coverage.to_string(),
            "-U".to_string(),
            "ALLOW_N_CIGAR_READS".to_string(),
        ]);
        args
    }
}


/// Looks `program` up the way the OS would: explicit paths must exist, bare names must be on PATH.
pub fn resolve_program(program: &Path) -> Option<PathBuf> {
    if program.components().count() > 1 || program.is_absolute() {
        return program.is_file().then(|| program.to_path_buf());
    }
    let path_var = env::var_os("PATH")?;
    env::split_paths(&path_var)
        .map(|dir| dir.join(program))
        .find(|candidate| candidate.is_file())
}

/// Presence check for every tool the batch may need. Missing tools are reported together.
pub fn check_tools(tools: &ToolPaths, post_process: bool) -> Result<(), PipelineError> {
    let mut missing = Vec::new();

    let programs = [
        &tools.java,
        &tools.fastq_dump,
        &tools.fastqc,
        &tools.bbmerge,
        &tools.hisat2_build,
        &tools.hisat2,
        &tools.samtools,
    ];
    for program in programs {
        if resolve_program(program).is_none() {
            missing.push(program.display().to_string());
        }
    }

    let mut files = vec![&tools.trimmomatic_jar, &tools.bbmap_adapters, &tools.picard_jar];
    if post_process {
        files.push(&tools.gatk_jar);
    }
    for file in files {
        if !file.is_file() {
            missing.push(file.display().to_string());
        }
    }
    if !tools.trimmomatic_adapter_dir.is_dir() {
        missing.push(tools.trimmomatic_adapter_dir.display().to_string());
    }

    if missing.is_empty() {
        Ok(())
    } else {
        Err(PipelineError::InvalidConfig(format!("required tools not found: {}", missing.join(", "))))
    }
}
