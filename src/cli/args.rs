use clap::Parser;

#[derive(Parser, Debug, Clone, Default)]
#[command(name = "rnaprep-pipelines", version, about = "Batch RNA-seq preprocessing: SRA extraction, QC, trimming, alignment, merging")]
pub struct Arguments {

    #[arg(short = 'i', long = "input", help = "Tab-separated run manifest with Run, Platform, Model and LibraryLayout columns")]
    pub input: String,

    #[arg(short = 'g', long = "genome", help = "Reference genome FASTA, optionally gzip compressed")]
    pub genome: String,

    #[arg(short = 'o', long = "out", default_value = ".")]
    pub out_dir: String,

    #[arg(short = 'n', long = "name", help = "Batch name; results are written to <out>/<name>")]
    pub name: String,

    #[arg(short = 'v', long = "verbose", action)]
    pub verbose: bool,

    #[arg(long = "lib-dir", env = "RNAPREP_LIB_DIR", default_value = "lib", help = "Install root of the bundled tools (Trimmomatic, FastQC, bbmap, hisat2, picard, GATK)")]
    pub lib_dir: String,

    #[arg(long)]
    pub java: Option<String>,

    #[arg(long)]
    pub samtools: Option<String>,

    #[arg(long = "fastq-dump")]
    pub fastq_dump: Option<String>,

    #[arg(long, default_value_t = false, help = "Fetch missing SRA files from the manifest's download_path column")]
    pub download: bool,

    #[arg(long, default_value_t = false, help = "Validate, repair and downsample the merged BAM")]
    pub downsample: bool,

    #[arg(long, default_value_t = 1)]
    pub target_coverage: u32,

    #[arg(long, default_value_t = 4)]
    pub threads: usize,

    #[arg(long, default_value_t = 1, help = "Number of runs processed concurrently")]
    pub jobs: usize,

    #[arg(long = "tool-timeout-secs", help = "Kill any external tool that runs longer than this")]
    pub tool_timeout_secs: Option<u64>,

    #[arg(long, default_value_t = false)]
    pub skip_tool_check: bool,
}
