use std::path::{Path, PathBuf};
use std::time::Duration;
use thiserror::Error;

// External software
pub const GZIP_EXT: &str = "gz";
pub const FASTQ_DUMP_TAG: &str = "fastq-dump";
pub const FASTQC_TAG: &str = "fastqc";
pub const TRIMMOMATIC_TAG: &str = "trimmomatic";
pub const BBMERGE_TAG: &str = "bbmerge.sh";
pub const HISAT2_BUILD_TAG: &str = "hisat2-build";
pub const HISAT2_TAG: &str = "hisat2";
pub const SAMTOOLS_TAG: &str = "samtools";
pub const PICARD_TAG: &str = "picard";
pub const GATK_TAG: &str = "gatk";
pub const JAVA_TAG: &str = "java";

#[derive(Debug, Clone, Copy, PartialEq)]
pub enum SamtoolsSubcommand {
    Sort,
    Faidx,
}

impl SamtoolsSubcommand {
    pub fn as_str(&self) -> &'static str {
        match self {
            SamtoolsSubcommand::Sort => "sort",
            SamtoolsSubcommand::Faidx => "faidx",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub enum PicardSubcommand {
    MergeSamFiles,
    CreateSequenceDictionary,
    ValidateSamFile,
    AddOrReplaceReadGroups,
    BuildBamIndex,
}

impl PicardSubcommand {
    pub fn as_str(&self) -> &'static str {
        match self {
            PicardSubcommand::MergeSamFiles => "MergeSamFiles",
            PicardSubcommand::CreateSequenceDictionary => "CreateSequenceDictionary",
            PicardSubcommand::ValidateSamFile => "ValidateSamFile",
            PicardSubcommand::AddOrReplaceReadGroups => "AddOrReplaceReadGroups",
            PicardSubcommand::BuildBamIndex => "BuildBamIndex",
        }
    }
}

// Manifest columns
pub const RUN_COLUMN: &str = "Run";
pub const PLATFORM_COLUMN: &str = "Platform";
pub const MODEL_COLUMN: &str = "Model";
pub const LAYOUT_COLUMN: &str = "LibraryLayout";
pub const DOWNLOAD_COLUMN: &str = "download_path";

// Platforms
pub const ILLUMINA_PLATFORM: &str = "ILLUMINA";
pub const ABI_SOLID_PLATFORM: &str = "ABI_SOLID";

// Static Filenames
pub const TRIMMED_SE_FASTQ: &str = "output.fastq";
pub const TRIMMED_R1_FASTQ: &str = "output_1.fastq";
pub const TRIMMED_R1_UNPAIRED_FASTQ: &str = "output_1_un.fastq";
pub const TRIMMED_R2_FASTQ: &str = "output_2.fastq";
pub const TRIMMED_R2_UNPAIRED_FASTQ: &str = "output_2_un.fastq";
pub const DISCOVERED_ADAPTERS_FASTA: &str = "adapters.fa";
pub const ALIGNMENT_SAM: &str = "output.sam";
pub const SORTED_BAM: &str = "output.bam";
pub const SORT_TEMP_PREFIX: &str = "output";
pub const MERGED_BAM: &str = "output.bam";
pub const MERGE_LOG_STEM: &str = "out";
pub const VALIDATION_REPORT: &str = "validatesam.log";
pub const VALIDATION_RECHECK_REPORT: &str = "validatesam.recheck.log";
pub const REPAIR_TEMP_SUFFIX: &str = "temp";
pub const REDUCED_BAM: &str = "output.reduce.bam";
pub const LOG_EXT: &str = "log";
pub const ERRLOG_EXT: &str = "errlog";

// Static Parameters
pub const ADAPTER_SEED_MISMATCHES: u32 = 2;
pub const ADAPTER_PALINDROME_THRESHOLD: u32 = 30;
pub const ADAPTER_SIMPLE_THRESHOLD: u32 = 10;
pub const LEADING_QUALITY: u32 = 3;
pub const TRAILING_QUALITY: u32 = 3;
pub const SLIDING_WINDOW: &str = "4:15";
pub const MIN_READ_LENGTH: u32 = 36;
pub const PHRED_ENCODING: &str = "TOPHRED33";
pub const PICARD_MAX_RECORDS_IN_RAM: u32 = 50_000;
pub const VALIDATION_HEADER_LINES: usize = 4;
pub const MISSING_READ_GROUP_CODE: &str = "MISSING_READ_GROUP";
pub const READ_GROUP_PLACEHOLDER: &str = "unknown";
pub const DEFAULT_TARGET_COVERAGE: u32 = 1;


#[derive(Debug, Error)]
pub enum PipelineError {
    #[error("{column} column is missing in input tsv file {path}")]
    MissingColumn { column: String, path: PathBuf },

    #[error("line {line} of {path} has {found} fields; column '{column}' needs index {index}")]
    MalformedRow {
        path: PathBuf,
        line: usize,
        column: String,
        index: usize,
        found: usize,
    },

    #[error("run {run}: platform {platform} is not supported (colorspace data cannot be processed)")]
    UnsupportedPlatform { run: String, platform: String },

    #[error("run {run}: unsupported library layout '{layout}'")]
    UnsupportedLayout { run: String, layout: String },

    #[error("run {run} doesn't have paired data ({missing} is absent). It's not processed.")]
    LayoutMismatch { run: String, missing: PathBuf },

    #[error("run {run}: raw reads {path} are absent and no download location is known")]
    ReadsUnavailable { run: String, path: PathBuf },

    #[error("failed to download {url}: {error}")]
    Download { url: String, error: String },

    #[error("failed to run {tool}: {error}")]
    ToolExecution { tool: String, error: String },

    #[error("{tool} exited with status {code:?}; see {errlog}")]
    ToolFailed {
        tool: String,
        code: Option<i32>,
        errlog: PathBuf,
    },

    #[error("{tool} exceeded the {secs}s timeout and was killed")]
    ToolTimeout { tool: String, secs: u64 },

    #[error("{tool} finished but did not produce {path}")]
    MissingOutput { tool: String, path: PathBuf },

    #[error("invalid configuration: {0}")]
    InvalidConfig(String),

    #[error("I/O error: {0}")]
    IOError(String),

    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

impl PipelineError {
    /// Batch-fatal errors stop the whole batch; everything else only ends the current run.
    pub fn is_batch_fatal(&self) -> bool {
        matches!(
            self,
            PipelineError::MissingColumn { .. }
                | PipelineError::MalformedRow { .. }
                | PipelineError::InvalidConfig(_)
        )
    }
}

impl From<std::io::Error> for PipelineError {
    fn from(e: std::io::Error) -> Self {
        PipelineError::IOError(e.to_string())
    }
}


/// Locations of every external program the pipeline drives.
#[derive(Debug, Clone, PartialEq)]
pub struct ToolPaths {
    pub java: PathBuf,
    pub fastq_dump: PathBuf,
    pub fastqc: PathBuf,
    pub trimmomatic_jar: PathBuf,
    pub trimmomatic_adapter_dir: PathBuf,
    pub bbmerge: PathBuf,
    pub bbmap_adapters: PathBuf,
    pub hisat2_build: PathBuf,
    pub hisat2: PathBuf,
    pub samtools: PathBuf,
    pub picard_jar: PathBuf,
    pub gatk_jar: PathBuf,
}

impl ToolPaths {
    /// Bundled install layout: everything but java, samtools and fastq-dump lives under `lib_dir`.
    pub fn from_lib_dir(lib_dir: &Path) -> Self {
        let trimmomatic_dir = lib_dir.join("Trimmomatic-0.38");
        let bbmap_dir = lib_dir.join("bbmap");
        let hisat2_dir = lib_dir.join("hisat2-2.1.0");
        ToolPaths {
            java: PathBuf::from(JAVA_TAG),
            fastq_dump: PathBuf::from(FASTQ_DUMP_TAG),
            fastqc: lib_dir.join("FastQC").join(FASTQC_TAG),
            trimmomatic_jar: trimmomatic_dir.join("trimmomatic-0.38.jar"),
            trimmomatic_adapter_dir: trimmomatic_dir.join("adapters"),
            bbmerge: bbmap_dir.join(BBMERGE_TAG),
            bbmap_adapters: bbmap_dir.join("resources").join("adapters.fa"),
            hisat2_build: hisat2_dir.join(HISAT2_BUILD_TAG),
            hisat2: hisat2_dir.join(HISAT2_TAG),
            samtools: PathBuf::from(SAMTOOLS_TAG),
            picard_jar: lib_dir.join("picard.jar"),
            gatk_jar: lib_dir.join("GenomeAnalysisTK.jar"),
        }
    }

    pub fn trimmomatic_adapter(&self, file_name: &str) -> PathBuf {
        self.trimmomatic_adapter_dir.join(file_name)
    }
}


#[derive(Debug, Clone, PartialEq)]
pub struct PipelineOptions {
    pub threads: usize,
    pub jobs: usize,
    pub download: bool,
    pub post_process: bool,
    pub target_coverage: u32,
    pub tool_timeout: Option<Duration>,
}

impl Default for PipelineOptions {
    fn default() -> Self {
        PipelineOptions {
            threads: 1,
            jobs: 1,
            download: false,
            post_process: false,
            target_coverage: DEFAULT_TARGET_COVERAGE,
            tool_timeout: None,
        }
    }
}


/// Read-only settings shared by every run of a batch.
#[derive(Debug, Clone)]
pub struct RunConfig {
    pub cwd: PathBuf,
    pub batch_name: String,
    pub batch_dir: PathBuf,
    pub reference: PathBuf,
    pub tools: ToolPaths,
    pub options: PipelineOptions,
}
