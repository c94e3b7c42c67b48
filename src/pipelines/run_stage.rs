// src/pipelines/run_stage.rs: per-run SRA -> sorted BAM state machine

use std::fmt;
use std::path::{Path, PathBuf};

use log::{debug, info, warn};
use tokio::sync::OnceCell;

use crate::config::defs::{
    PipelineError, RunConfig, ALIGNMENT_SAM, BBMERGE_TAG, DISCOVERED_ADAPTERS_FASTA, FASTQC_TAG,
    FASTQ_DUMP_TAG, HISAT2_BUILD_TAG, HISAT2_TAG, SAMTOOLS_TAG, SORTED_BAM, SORT_TEMP_PREFIX,
    TRIMMED_R1_FASTQ, TRIMMED_R1_UNPAIRED_FASTQ, TRIMMED_R2_FASTQ, TRIMMED_R2_UNPAIRED_FASTQ,
    TRIMMED_SE_FASTQ, TRIMMOMATIC_TAG,
};
use crate::utils::adapters::{self, AdapterStrategy};
use crate::utils::command::{
    bbmerge, fastq_dump, fastqc, hisat2, run_checked, samtools, trimmomatic, ToolInvocation,
    ToolRunner,
};
use crate::utils::file::{download_file, extract_archive, prepare_reference};
use crate::utils::manifest::{LibraryLayout, RunRecord};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RunState {
    NotStarted,
    ReferenceReady,
    ReadsAcquired,
    LayoutValidated,
    QcDone,
    Trimmed,
    Aligned,
    Sorted,
    Done,
    Rejected,
    Failed,
}

impl RunState {
    pub fn is_terminal(&self) -> bool {
        matches!(self, RunState::Done | RunState::Rejected | RunState::Failed)
    }
}

impl fmt::Display for RunState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Debug::fmt(self, f)
    }
}


/// Decompresses the batch reference at most once, however many runs ask for it.
#[derive(Debug)]
pub struct SharedReference {
    source: PathBuf,
    dest_dir: PathBuf,
    prepared: OnceCell<PathBuf>,
}

impl SharedReference {
    pub fn new(source: &Path, dest_dir: &Path) -> Self {
        SharedReference {
            source: source.to_path_buf(),
            dest_dir: dest_dir.to_path_buf(),
            prepared: OnceCell::new(),
        }
    }

    pub async fn get(&self) -> Result<PathBuf, PipelineError> {
        let path = self
            .prepared
            .get_or_try_init(|| async {
                let source = self.source.clone();
                let dest_dir = self.dest_dir.clone();
                tokio::task::spawn_blocking(move || prepare_reference(&source, &dest_dir))
                    .await
                    .map_err(|e| PipelineError::Other(e.into()))?
            })
            .await?;
        Ok(path.clone())
    }
}


/// Every path one run reads or writes, derived from its run directory and SRA file name.
#[derive(Debug, Clone, PartialEq)]
pub struct RunContext {
    pub run_id: String,
    pub run_dir: PathBuf,
    pub sra_path: PathBuf,
    /// Base name of the SRA file; stage logs are named after it.
    pub sra_name: String,
    /// What fastq-dump names its outputs after (`.sra` extension dropped).
    pub accession: String,
    pub reference: Option<PathBuf>,
}

impl RunContext {
    pub fn new(run_id: &str, sra_path: &Path, run_dir: &Path) -> Self {
        let sra_name = sra_path
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_else(|| run_id.to_string());
        let accession = sra_name.strip_suffix(".sra").unwrap_or(&sra_name).to_string();
        RunContext {
            run_id: run_id.to_string(),
            run_dir: run_dir.to_path_buf(),
            sra_path: sra_path.to_path_buf(),
            sra_name,
            accession,
            reference: None,
        }
    }

    pub fn with_reference(self, reference: PathBuf) -> Self {
        RunContext {
            reference: Some(reference),
            ..self
        }
    }

    pub fn log_stem(&self, stage: &str) -> String {
        format!("{}.{}", self.sra_name, stage)
    }

    /// Extracted reads: `<accession>_1.fastq`, `<accession>_2.fastq`.
    pub fn mate(&self, n: u8) -> PathBuf {
        self.run_dir.join(format!("{}_{}.fastq", self.accession, n))
    }

    pub fn raw_reads(&self, layout: &LibraryLayout) -> Vec<PathBuf> {
        if layout.is_paired() {
            vec![self.mate(1), self.mate(2)]
        } else {
            vec![self.mate(1)]
        }
    }

    pub fn trimmed_single(&self) -> PathBuf {
        self.run_dir.join(TRIMMED_SE_FASTQ)
    }

    /// forward paired, forward unpaired, reverse paired, reverse unpaired
    pub fn trimmed_paired(&self) -> [PathBuf; 4] {
        [
            self.run_dir.join(TRIMMED_R1_FASTQ),
            self.run_dir.join(TRIMMED_R1_UNPAIRED_FASTQ),
            self.run_dir.join(TRIMMED_R2_FASTQ),
            self.run_dir.join(TRIMMED_R2_UNPAIRED_FASTQ),
        ]
    }

    pub fn discovered_adapters(&self) -> PathBuf {
        self.run_dir.join(DISCOVERED_ADAPTERS_FASTA)
    }

    pub fn index_prefix(&self) -> Option<PathBuf> {
        let name = self.reference.as_ref()?.file_name()?;
        Some(self.run_dir.join(name))
    }

    pub fn sam(&self) -> PathBuf {
        self.run_dir.join(ALIGNMENT_SAM)
    }

    pub fn sorted_bam(&self) -> PathBuf {
        self.run_dir.join(SORTED_BAM)
    }

    pub fn sort_temp_prefix(&self) -> PathBuf {
        self.run_dir.join(SORT_TEMP_PREFIX)
    }
}


#[derive(Debug)]
pub struct RunOutcome {
    pub run_id: String,
    pub run_dir: PathBuf,
    pub state: RunState,
    pub result: Result<PathBuf, PipelineError>,
}

impl RunOutcome {
    pub fn artifact(&self) -> Option<&PathBuf> {
        match (&self.state, &self.result) {
            (RunState::Done, Ok(path)) => Some(path),
            _ => None,
        }
    }
}


/// Carries one RunRecord through every stage. Owned by a single run, never shared.
pub struct RunStagePipeline<'a> {
    config: &'a RunConfig,
    runner: &'a dyn ToolRunner,
    reference: &'a SharedReference,
    record: &'a RunRecord,
    ctx: RunContext,
    state: RunState,
}

impl<'a> RunStagePipeline<'a> {
    pub fn new(
        config: &'a RunConfig,
        runner: &'a dyn ToolRunner,
        reference: &'a SharedReference,
        record: &'a RunRecord,
        ctx: RunContext,
    ) -> Self {
        RunStagePipeline {
            config,
            runner,
            reference,
            record,
            ctx,
            state: RunState::NotStarted,
        }
    }

    pub async fn execute(mut self) -> RunOutcome {
        let result = self.drive().await;
        if let Err(e) = &result {
            let reached = self.state;
            self.state = match e {
                PipelineError::UnsupportedPlatform { .. } | PipelineError::UnsupportedLayout { .. } => {
                    RunState::Rejected
                }
                _ => RunState::Failed,
            };
            warn!("Run {} {} (last completed state {}): {}", self.ctx.run_id, self.state, reached, e);
        }
        RunOutcome {
            run_id: self.ctx.run_id,
            run_dir: self.ctx.run_dir,
            state: self.state,
            result,
        }
    }

    fn advance(&mut self, next: RunState) {
        debug!("Run {}: {} -> {}", self.ctx.run_id, self.state, next);
        self.state = next;
    }

    async fn drive(&mut self) -> Result<PathBuf, PipelineError> {
        // decided before any side effect; rejects colorspace data outright
        let strategy = adapters::select_for(self.record)?;
        debug!("Run {}: adapter strategy {:?}", self.ctx.run_id, strategy);

        tokio::fs::create_dir_all(&self.ctx.run_dir).await?;

        let reference = self.reference.get().await?;
        self.ctx = self.ctx.clone().with_reference(reference);
        self.advance(RunState::ReferenceReady);

        self.acquire_reads().await?;
        self.advance(RunState::ReadsAcquired);

        let reads = self.validate_layout()?;
        self.advance(RunState::LayoutValidated);

        self.quality_control(&reads).await?;
        self.advance(RunState::QcDone);

        let trimmed = self.trim(&reads, strategy).await?;
        self.advance(RunState::Trimmed);

        self.align(&trimmed).await?;
        self.advance(RunState::Aligned);

        let bam = self.sort().await?;
        self.advance(RunState::Sorted);

        self.advance(RunState::Done);
        Ok(bam)
    }

    fn invocation(&self, tool: &str, program: &Path, args: Vec<String>, stage: &str) -> ToolInvocation {
        ToolInvocation::new(tool, program, args, &self.ctx.run_dir, &self.ctx.log_stem(stage))
    }

    async fn acquire_reads(&mut self) -> Result<(), PipelineError> {
        if !self.ctx.sra_path.exists() {
            match (&self.record.download_path, self.config.options.download) {
                (Some(url), true) => {
                    info!("Downloading {} from {}", self.ctx.sra_path.display(), url);
                    download_file(url, &self.ctx.sra_path).await?;
                }
                _ => {
                    return Err(PipelineError::ReadsUnavailable {
                        run: self.ctx.run_id.clone(),
                        path: self.ctx.sra_path.clone(),
                    });
                }
            }
        }

        info!("Unpacking the SRA file: {} ...", self.ctx.sra_path.display());
        let tools = &self.config.tools;
        let inv = self.invocation(
            FASTQ_DUMP_TAG,
            &tools.fastq_dump,
            fastq_dump::arg_generator(&self.ctx.sra_path, &self.ctx.run_dir),
            FASTQ_DUMP_TAG,
        );
        run_checked(self.runner, &inv).await
    }

    fn validate_layout(&self) -> Result<Vec<PathBuf>, PipelineError> {
        let reads = self.ctx.raw_reads(&self.record.layout);
        if let Some(missing) = reads.iter().find(|p| !p.exists()) {
            if self.record.layout.is_paired() {
                return Err(PipelineError::LayoutMismatch {
                    run: self.ctx.run_id.clone(),
                    missing: missing.clone(),
                });
            }
            return Err(PipelineError::MissingOutput {
                tool: FASTQ_DUMP_TAG.to_string(),
                path: missing.clone(),
            });
        }
        Ok(reads)
    }

    async fn quality_control(&self, reads: &[PathBuf]) -> Result<(), PipelineError> {
        info!("QC {} ...", self.ctx.run_id);
        let tools = &self.config.tools;
        for (i, read_file) in reads.iter().enumerate() {
            let archive = fastqc::report_archive(read_file, &self.ctx.run_dir);
            let log_stem = format!("{}_{}.{}", self.ctx.sra_name, i + 1, FASTQC_TAG);
            let inv = ToolInvocation::new(
                FASTQC_TAG,
                &tools.fastqc,
                fastqc::arg_generator(read_file, &self.ctx.run_dir),
                &self.ctx.run_dir,
                &log_stem,
            )
            .expecting([archive.clone()]);
            run_checked(self.runner, &inv).await?;
            let dest = self.ctx.run_dir.clone();
            tokio::task::spawn_blocking(move || extract_archive(&archive, &dest))
                .await
                .map_err(|e| PipelineError::Other(e.into()))??;
        }
        Ok(())
    }

    /// Returns the trimmed read files that feed the aligner (paired outputs only for PE).
    async fn trim(&self, reads: &[PathBuf], strategy: AdapterStrategy) -> Result<Vec<PathBuf>, PipelineError> {
        info!("Trimming {} ...", self.ctx.run_id);
        let tools = &self.config.tools;
        let threads = self.config.options.threads;
        let discovered = self.ctx.discovered_adapters();

        if let (AdapterStrategy::Discover, [r1, r2]) = (strategy, reads) {
            let inv = self
                .invocation(
                    BBMERGE_TAG,
                    &tools.bbmerge,
                    bbmerge::arg_generator(r1, r2, &discovered),
                    "bbmap",
                )
                .expecting([discovered.clone()]);
            run_checked(self.runner, &inv).await?;
        }
        let adapter = strategy.adapter_path(tools, &discovered);

        let (args, feeds, outputs) = match reads {
            [single] => {
                let out = self.ctx.trimmed_single();
                let args = trimmomatic::single_end(&tools.trimmomatic_jar, threads, single, &out, &adapter);
                (args, vec![out.clone()], vec![out])
            }
            [r1, r2] => {
                let outs = self.ctx.trimmed_paired();
                let args = trimmomatic::paired_end(
                    &tools.trimmomatic_jar,
                    threads,
                    (r1.as_path(), r2.as_path()),
                    [&outs[0], &outs[1], &outs[2], &outs[3]],
                    &adapter,
                );
                (args, vec![outs[0].clone(), outs[2].clone()], outs.to_vec())
            }
            _ => {
                return Err(PipelineError::UnsupportedLayout {
                    run: self.ctx.run_id.clone(),
                    layout: self.record.layout.to_string(),
                });
            }
        };

        let inv = self
            .invocation(TRIMMOMATIC_TAG, &tools.java, args, TRIMMOMATIC_TAG)
            .expecting(outputs);
        run_checked(self.runner, &inv).await?;
        Ok(feeds)
    }

    async fn align(&self, trimmed: &[PathBuf]) -> Result<(), PipelineError> {
        info!("Aligning {} ...", self.ctx.run_id);
        let tools = &self.config.tools;
        let (Some(reference), Some(index_prefix)) = (&self.ctx.reference, self.ctx.index_prefix()) else {
            return Err(PipelineError::InvalidConfig(format!(
                "run {}: reference has not been prepared",
                self.ctx.run_id
            )));
        };

        let build = self.invocation(
            HISAT2_BUILD_TAG,
            &tools.hisat2_build,
            hisat2::build_args(reference, &index_prefix),
            HISAT2_BUILD_TAG,
        );
        run_checked(self.runner, &build).await?;

        let read_refs: Vec<&Path> = trimmed.iter().map(|p| p.as_path()).collect();
        let align = self
            .invocation(
                HISAT2_TAG,
                &tools.hisat2,
                hisat2::align_args(&index_prefix, &read_refs, &self.ctx.sam(), self.config.options.threads),
                HISAT2_TAG,
            )
            .expecting([self.ctx.sam()]);
        run_checked(self.runner, &align).await
    }

    async fn sort(&self) -> Result<PathBuf, PipelineError> {
        let bam = self.ctx.sorted_bam();
        let inv = self
            .invocation(
                SAMTOOLS_TAG,
                &self.config.tools.samtools,
                samtools::sort_args(
                    &self.ctx.sam(),
                    &bam,
                    &self.ctx.sort_temp_prefix(),
                    self.config.options.threads,
                ),
                SAMTOOLS_TAG,
            )
            .expecting([bam.clone()]);
        run_checked(self.runner, &inv).await?;
        Ok(bam)
    }
}
