use std::collections::HashSet;
use std::fs::{self, File};
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};

use anyhow::Result;
use async_trait::async_trait;
use tempfile::{tempdir, TempDir};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpListener;

use rnaprep_pipelines::config::defs::{
    PipelineError, PipelineOptions, RunConfig, ToolPaths, BBMERGE_TAG, FASTQC_TAG, FASTQ_DUMP_TAG,
    HISAT2_TAG, MISSING_READ_GROUP_CODE, PICARD_TAG, TRIMMOMATIC_TAG,
};
use rnaprep_pipelines::pipelines::batch::{BatchController, BatchSummary};
use rnaprep_pipelines::pipelines::run_stage::RunState;
use rnaprep_pipelines::utils::command::{ToolInvocation, ToolRunner, ToolStatus};
use rnaprep_pipelines::utils::manifest::Manifest;


/// Stands in for every external tool: records the call and leaves behind what the real tool
/// would have written.
#[derive(Default)]
struct FakeRunner {
    calls: Mutex<Vec<ToolInvocation>>,
    /// Accessions for which fastq-dump only produces the first mate.
    single_mate: HashSet<String>,
    /// (tool, argument substring) that exits non-zero.
    failing: Option<(String, String)>,
    /// The validator finds nothing wrong with any BAM.
    clean_validation: bool,
}

impl FakeRunner {
    fn calls(&self) -> Vec<ToolInvocation> {
        self.calls.lock().unwrap().clone()
    }

    fn calls_mentioning(&self, needle: &str) -> Vec<ToolInvocation> {
        self.calls()
            .into_iter()
            .filter(|inv| inv.args.iter().any(|a| a.contains(needle)))
            .collect()
    }

    fn picard_calls(&self, subcommand: &str) -> Vec<ToolInvocation> {
        self.calls()
            .into_iter()
            .filter(|inv| inv.tool == PICARD_TAG && inv.args.iter().any(|a| a == subcommand))
            .collect()
    }
}

fn arg_value(args: &[String], key: &str) -> Option<PathBuf> {
    args.iter().find_map(|a| a.strip_prefix(key)).map(PathBuf::from)
}

fn write_zip(path: &Path) -> Result<(), PipelineError> {
    let folder = path
        .file_stem()
        .map(|s| s.to_string_lossy().into_owned())
        .unwrap_or_default();
    let mut zip = zip::ZipWriter::new(File::create(path)?);
    zip.start_file(format!("{}/summary.txt", folder), zip::write::SimpleFileOptions::default())
        .map_err(|e| PipelineError::Other(e.into()))?;
    zip.write_all(b"PASS\tBasic Statistics\n")?;
    zip.finish().map_err(|e| PipelineError::Other(e.into()))?;
    Ok(())
}

#[async_trait]
impl ToolRunner for FakeRunner {
    async fn run(&self, inv: &ToolInvocation) -> Result<ToolStatus, PipelineError> {
        self.calls.lock().unwrap().push(inv.clone());

        if let Some((tool, needle)) = &self.failing {
            if inv.tool == *tool && inv.args.iter().any(|a| a.contains(needle.as_str())) {
                return Ok(ToolStatus { code: Some(1) });
            }
        }

        let mut code = 0;
        if inv.tool == FASTQ_DUMP_TAG {
            let out_dir = inv
                .args
                .iter()
                .position(|a| a == "-O")
                .and_then(|i| inv.args.get(i + 1))
                .map(PathBuf::from)
                .unwrap_or_default();
            let sra = PathBuf::from(inv.args.last().cloned().unwrap_or_default());
            let name = sra.file_name().unwrap_or_default().to_string_lossy().into_owned();
            let accession = name.strip_suffix(".sra").unwrap_or(&name).to_string();
            fs::write(out_dir.join(format!("{}_1.fastq", accession)), "@r\nACGT\n+\nIIII\n")?;
            if !self.single_mate.contains(&accession) {
                fs::write(out_dir.join(format!("{}_2.fastq", accession)), "@r\nTGCA\n+\nIIII\n")?;
            }
        } else if inv.tool == PICARD_TAG && inv.args.iter().any(|a| a == "ValidateSamFile") {
            let bam = arg_value(&inv.args, "I=").unwrap_or_default();
            let report = arg_value(&inv.args, "O=").unwrap_or_default();
            if self.clean_validation || fs::read_to_string(&bam).unwrap_or_default().contains("RG") {
                fs::write(&report, "No errors found\n")?;
            } else {
                fs::write(
                    &report,
                    format!(
                        "## HTSJDK Version: 2.18.2\n## PICARD Version: 2.18.29\n\n## HISTOGRAM\tjava.lang.String\n\
                         ERROR:{}\t1\nWARNING:RECORD_MISSING_READ_GROUP\t20\n\n",
                        MISSING_READ_GROUP_CODE
                    ),
                )?;
                code = 1;
            }
        } else if inv.tool == PICARD_TAG && inv.args.iter().any(|a| a == "AddOrReplaceReadGroups") {
            let out = arg_value(&inv.args, "O=").unwrap_or_default();
            fs::write(out, "RG")?;
        }

        for output in &inv.outputs {
            if output.exists() {
                continue;
            }
            if output.extension().is_some_and(|e| e == "zip") {
                write_zip(output)?;
            } else {
                fs::write(output, inv.tool.as_bytes())?;
            }
        }
        Ok(ToolStatus { code: Some(code) })
    }
}


struct Batch {
    dir: TempDir,
    config: RunConfig,
    manifest: Manifest,
}

impl Batch {
    fn batch_dir(&self) -> &Path {
        &self.config.batch_dir
    }

    fn run_dir(&self, name: &str) -> PathBuf {
        self.batch_dir().join(name)
    }
}

/// Rows are (Run, Platform, Model, LibraryLayout). Every SRA file is created next to the
/// manifest so nothing has to be downloaded.
fn setup(rows: &[(&str, &str, &str, &str)], options: PipelineOptions) -> Result<Batch> {
    let dir = tempdir()?;
    let data = dir.path().join("data");
    fs::create_dir_all(&data)?;

    let mut tsv = String::from("Run\tPlatform\tModel\tLibraryLayout\n");
    for (run, platform, model, layout) in rows {
        tsv.push_str(&format!("{}\t{}\t{}\t{}\n", run, platform, model, layout));
        fs::write(data.join(run), "sra")?;
    }
    let manifest_path = data.join("SraRunTable.txt");
    fs::write(&manifest_path, tsv)?;

    let reference = dir.path().join("genome.fa");
    fs::write(&reference, ">chr1\nACGTACGT\n")?;

    let config = RunConfig {
        cwd: data.clone(),
        batch_name: "batch1".to_string(),
        batch_dir: dir.path().join("out").join("batch1"),
        reference,
        tools: ToolPaths::from_lib_dir(&dir.path().join("lib")),
        options,
    };
    let manifest = Manifest::load(&manifest_path, false)?;
    Ok(Batch { dir, config, manifest })
}

async fn run_batch(batch: &Batch, runner: Arc<FakeRunner>) -> Result<BatchSummary> {
    let controller = BatchController::new(Arc::new(batch.config.clone()), runner);
    Ok(controller.run(&batch.manifest).await?)
}

/// Rewrites the manifest with a download_path column, `url` for `run` and empty elsewhere.
fn with_download_column(batch: &mut Batch, run: &str, url: &str) -> Result<()> {
    let path = batch.config.cwd.join("SraRunTable.download.txt");
    let mut tsv = String::from("Run\tPlatform\tModel\tLibraryLayout\tdownload_path\n");
    for record in &batch.manifest.records {
        let link = if record.run == run { url } else { "" };
        tsv.push_str(&format!(
            "{}\t{}\t{}\t{}\t{}\n",
            record.run, record.platform, record.model, record.layout, link
        ));
    }
    fs::write(&path, tsv)?;
    batch.manifest = Manifest::load(&path, true)?;
    Ok(())
}

/// Serves `body` once over plain HTTP and returns the URL of `name`.
async fn serve_once(name: &str, body: &'static [u8]) -> Result<String> {
    let listener = TcpListener::bind("127.0.0.1:0").await?;
    let url = format!("http://{}/{}", listener.local_addr()?, name);
    tokio::spawn(async move {
        if let Ok((mut socket, _)) = listener.accept().await {
            let mut request = [0u8; 1024];
            let _ = socket.read(&mut request).await;
            let header = format!(
                "HTTP/1.1 200 OK\r\nContent-Length: {}\r\nConnection: close\r\n\r\n",
                body.len()
            );
            let _ = socket.write_all(header.as_bytes()).await;
            let _ = socket.write_all(body).await;
            let _ = socket.shutdown().await;
        }
    });
    Ok(url)
}

fn states(summary: &BatchSummary) -> Vec<RunState> {
    summary.outcomes.iter().map(|o| o.state).collect()
}

fn merge_inputs(runner: &FakeRunner) -> Vec<PathBuf> {
    runner
        .picard_calls("MergeSamFiles")
        .iter()
        .flat_map(|inv| inv.args.iter().filter_map(|a| a.strip_prefix("I=")).map(PathBuf::from))
        .collect()
}


#[tokio::test]
async fn test_batch_with_post_processing() -> Result<()> {
    let batch = setup(
        &[
            ("SRR1.sra", "ILLUMINA", "Illumina HiSeq 2500", "SINGLE"),
            ("SRR2.sra", "ABI_SOLID", "AB 5500xl Genetic Analyzer", "SINGLE"),
            ("SRR3.sra", "ILLUMINA", "NextSeq 500", "PAIRED"),
        ],
        PipelineOptions {
            post_process: true,
            ..PipelineOptions::default()
        },
    )?;
    let runner = Arc::new(FakeRunner::default());
    let summary = run_batch(&batch, runner.clone()).await?;

    assert_eq!(states(&summary), vec![RunState::Done, RunState::Rejected, RunState::Done]);

    // colorspace run: no tool call, no directory
    assert!(runner.calls_mentioning("SRR2").is_empty());
    assert!(!batch.run_dir("SRR2.sra").exists());
    assert!(matches!(
        summary.outcomes[1].result,
        Err(PipelineError::UnsupportedPlatform { .. })
    ));

    let expected = vec![
        batch.run_dir("SRR1.sra").join("output.bam"),
        batch.run_dir("SRR3.sra").join("output.bam"),
    ];
    assert_eq!(summary.merge_inputs(), expected);
    assert_eq!(merge_inputs(&runner), expected);
    assert_eq!(summary.merged, Some(batch.batch_dir().join("output.bam")));

    // HiSeq single-end clips with the bundled TruSeq3 file, the unknown paired model discovers
    let trims: Vec<ToolInvocation> = runner
        .calls()
        .into_iter()
        .filter(|inv| inv.tool == TRIMMOMATIC_TAG)
        .collect();
    assert_eq!(trims.len(), 2);
    assert!(trims[0].args.iter().any(|a| a.starts_with("ILLUMINACLIP:") && a.contains("TruSeq3-SE.fa")));
    let discovered = batch.run_dir("SRR3.sra").join("adapters.fa");
    assert!(trims[1].args.contains(&format!("ILLUMINACLIP:{}:2:30:10", discovered.display())));
    let bbmerge: Vec<ToolInvocation> = runner
        .calls()
        .into_iter()
        .filter(|inv| inv.tool == BBMERGE_TAG)
        .collect();
    assert_eq!(bbmerge.len(), 1);
    assert_eq!(bbmerge[0].log, batch.run_dir("SRR3.sra").join("SRR3.sra.bbmap.log"));

    // fastqc reports were unpacked
    assert!(batch.run_dir("SRR3.sra").join("SRR3_2_fastqc").join("summary.txt").exists());

    let report = summary.post_process.expect("post-processing ran");
    assert!(report.validation.needs_read_group_repair());
    assert!(report.repaired);
    let recheck = report.recheck.expect("repaired BAM was revalidated");
    assert!(!recheck.errors.contains(MISSING_READ_GROUP_CODE));
    assert_eq!(fs::read_to_string(batch.batch_dir().join("output.bam"))?, "RG");
    assert!(!batch.batch_dir().join("output.bam.temp").exists());
    assert!(batch.batch_dir().join("validatesam.log").exists());
    assert!(batch.batch_dir().join("validatesam.recheck.log").exists());
    assert_eq!(report.reduced, batch.batch_dir().join("output.reduce.bam"));
    assert!(report.reduced.exists());

    let read_groups = runner.picard_calls("AddOrReplaceReadGroups");
    assert_eq!(read_groups.len(), 1);
    assert!(read_groups[0].args.contains(&"RGID=batch1".to_string()));

    // reference indices were created next to the reference
    assert!(batch.dir.path().join("genome.dict").exists());
    assert!(batch.dir.path().join("genome.fa.fai").exists());
    Ok(())
}

#[tokio::test]
async fn test_missing_mate_fails_only_that_run() -> Result<()> {
    let batch = setup(
        &[
            ("SRR4.sra", "ILLUMINA", "Illumina HiSeq 2000", "PAIRED"),
            ("SRR5.sra", "ILLUMINA", "Illumina HiSeq 2000", "PAIRED"),
        ],
        PipelineOptions::default(),
    )?;
    let runner = Arc::new(FakeRunner {
        single_mate: HashSet::from(["SRR4".to_string()]),
        ..FakeRunner::default()
    });
    let summary = run_batch(&batch, runner.clone()).await?;

    assert_eq!(states(&summary), vec![RunState::Failed, RunState::Done]);
    assert!(matches!(summary.outcomes[0].result, Err(PipelineError::LayoutMismatch { .. })));

    let srr4 = batch.run_dir("SRR4.sra");
    let srr4_tools: Vec<String> = runner
        .calls_mentioning(&srr4.display().to_string())
        .into_iter()
        .map(|inv| inv.tool)
        .collect();
    assert_eq!(srr4_tools, vec![FASTQ_DUMP_TAG.to_string()]);
    assert!(!srr4_tools.iter().any(|t| t == FASTQC_TAG || t == TRIMMOMATIC_TAG || t == HISAT2_TAG));

    assert_eq!(merge_inputs(&runner), vec![batch.run_dir("SRR5.sra").join("output.bam")]);
    assert!(summary.post_process.is_none());
    Ok(())
}

#[tokio::test]
async fn test_tool_failure_is_isolated_to_its_run() -> Result<()> {
    let batch = setup(
        &[
            ("SRR6.sra", "ILLUMINA", "Illumina MiSeq", "SINGLE"),
            ("SRR7.sra", "ILLUMINA", "Illumina MiSeq", "SINGLE"),
        ],
        PipelineOptions::default(),
    )?;
    let runner = Arc::new(FakeRunner {
        failing: Some((HISAT2_TAG.to_string(), "SRR6".to_string())),
        ..FakeRunner::default()
    });
    let summary = run_batch(&batch, runner.clone()).await?;

    assert_eq!(states(&summary), vec![RunState::Failed, RunState::Done]);
    match &summary.outcomes[0].result {
        Err(PipelineError::ToolFailed { tool, code, errlog }) => {
            assert_eq!(tool, HISAT2_TAG);
            assert_eq!(*code, Some(1));
            assert_eq!(*errlog, batch.run_dir("SRR6.sra").join("SRR6.sra.hisat2.errlog"));
        }
        other => panic!("expected ToolFailed, got {:?}", other),
    }
    // nothing after the failed stage ran for SRR6
    assert!(!batch.run_dir("SRR6.sra").join("output.bam").exists());
    assert_eq!(merge_inputs(&runner), vec![batch.run_dir("SRR7.sra").join("output.bam")]);
    Ok(())
}

#[tokio::test]
async fn test_no_successful_run_skips_merge() -> Result<()> {
    let batch = setup(
        &[
            ("SRR8.sra", "ABI_SOLID", "AB SOLiD 4 System", "SINGLE"),
            ("SRR9.sra", "ILLUMINA", "Illumina HiSeq 2500", "SINGLE"),
        ],
        PipelineOptions {
            post_process: true,
            ..PipelineOptions::default()
        },
    )?;
    let runner = Arc::new(FakeRunner {
        failing: Some((FASTQ_DUMP_TAG.to_string(), "SRR9".to_string())),
        ..FakeRunner::default()
    });
    let summary = run_batch(&batch, runner.clone()).await?;

    assert_eq!(states(&summary), vec![RunState::Rejected, RunState::Failed]);
    assert_eq!(summary.merged, None);
    assert!(summary.post_process.is_none());
    assert!(runner.calls().iter().all(|inv| inv.tool != PICARD_TAG));
    assert!(!batch.batch_dir().join("output.bam").exists());
    Ok(())
}

#[tokio::test]
async fn test_duplicate_runs_use_separate_directories() -> Result<()> {
    let batch = setup(
        &[
            ("SRR10.sra", "ILLUMINA", "Illumina HiSeq 4000", "SINGLE"),
            ("SRR10.sra", "ILLUMINA", "Illumina HiSeq 4000", "SINGLE"),
        ],
        PipelineOptions::default(),
    )?;
    let runner = Arc::new(FakeRunner::default());
    let summary = run_batch(&batch, runner.clone()).await?;

    assert_eq!(states(&summary), vec![RunState::Done, RunState::Done]);
    assert_eq!(
        merge_inputs(&runner),
        vec![
            batch.run_dir("SRR10.sra").join("output.bam"),
            batch.run_dir("SRR10.sra.2").join("output.bam"),
        ]
    );
    Ok(())
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_concurrent_runs_keep_manifest_order() -> Result<()> {
    let rows: Vec<(String, &str, &str, &str)> = (11..17)
        .map(|i| (format!("SRR{}.sra", i), "ILLUMINA", "Illumina HiSeq 2500", "SINGLE"))
        .collect();
    let borrowed: Vec<(&str, &str, &str, &str)> = rows
        .iter()
        .map(|(run, platform, model, layout)| (run.as_str(), *platform, *model, *layout))
        .collect();
    let batch = setup(
        &borrowed,
        PipelineOptions {
            jobs: 3,
            threads: 2,
            ..PipelineOptions::default()
        },
    )?;
    let runner = Arc::new(FakeRunner::default());
    let summary = run_batch(&batch, runner.clone()).await?;

    assert_eq!(summary.count(RunState::Done), rows.len());
    let expected: Vec<PathBuf> = rows
        .iter()
        .map(|(run, ..)| batch.run_dir(run).join("output.bam"))
        .collect();
    assert_eq!(merge_inputs(&runner), expected);

    // the merge log is appended to, never truncated
    let merge = runner.picard_calls("MergeSamFiles");
    assert!(merge[0].append);
    assert_eq!(merge[0].log, batch.batch_dir().join("out.log"));
    Ok(())
}


#[tokio::test]
async fn test_unavailable_reads_fail_only_that_run() -> Result<()> {
    let batch = setup(
        &[
            ("SRR20.sra", "ILLUMINA", "Illumina HiSeq 2500", "SINGLE"),
            ("SRR21.sra", "ILLUMINA", "Illumina HiSeq 2500", "SINGLE"),
            ("SRR22.sra", "ILLUMINA", "Illumina HiSeq 2500", "SINGLE"),
        ],
        PipelineOptions::default(),
    )?;
    fs::remove_file(batch.config.cwd.join("SRR21.sra"))?;
    let runner = Arc::new(FakeRunner::default());
    let summary = run_batch(&batch, runner.clone()).await?;

    assert_eq!(states(&summary), vec![RunState::Done, RunState::Failed, RunState::Done]);
    match &summary.outcomes[1].result {
        Err(PipelineError::ReadsUnavailable { run, path }) => {
            assert_eq!(run, "SRR21.sra");
            assert_eq!(*path, batch.config.cwd.join("SRR21.sra"));
        }
        other => panic!("expected ReadsUnavailable, got {:?}", other),
    }
    assert!(runner.calls_mentioning("SRR21").is_empty());
    assert_eq!(
        merge_inputs(&runner),
        vec![
            batch.run_dir("SRR20.sra").join("output.bam"),
            batch.run_dir("SRR22.sra").join("output.bam"),
        ]
    );
    Ok(())
}

#[tokio::test]
async fn test_missing_reads_are_downloaded_then_extracted() -> Result<()> {
    let mut batch = setup(
        &[
            ("SRR23.sra", "ILLUMINA", "Illumina HiSeq 2500", "SINGLE"),
            ("SRR24.sra", "ILLUMINA", "Illumina HiSeq 2500", "SINGLE"),
        ],
        PipelineOptions {
            download: true,
            ..PipelineOptions::default()
        },
    )?;
    let sra = batch.config.cwd.join("SRR23.sra");
    fs::remove_file(&sra)?;
    let url = serve_once("SRR23.sra", b"remote sra").await?;
    with_download_column(&mut batch, "SRR23.sra", &url)?;

    let runner = Arc::new(FakeRunner::default());
    let summary = run_batch(&batch, runner.clone()).await?;

    assert_eq!(states(&summary), vec![RunState::Done, RunState::Done]);
    assert_eq!(fs::read_to_string(&sra)?, "remote sra");
    assert!(!batch.config.cwd.join("SRR23.sra.part").exists());
    let dumps = runner.calls_mentioning(&sra.display().to_string());
    assert_eq!(dumps.len(), 1);
    assert_eq!(dumps[0].tool, FASTQ_DUMP_TAG);
    assert_eq!(merge_inputs(&runner).len(), 2);
    Ok(())
}

#[tokio::test]
async fn test_failed_download_fails_only_that_run() -> Result<()> {
    let mut batch = setup(
        &[
            ("SRR25.sra", "ILLUMINA", "Illumina HiSeq 2500", "SINGLE"),
            ("SRR26.sra", "ILLUMINA", "Illumina HiSeq 2500", "SINGLE"),
        ],
        PipelineOptions {
            download: true,
            ..PipelineOptions::default()
        },
    )?;
    fs::remove_file(batch.config.cwd.join("SRR25.sra"))?;
    // bound then dropped, so nothing listens on the port
    let closed = std::net::TcpListener::bind("127.0.0.1:0")?.local_addr()?;
    with_download_column(&mut batch, "SRR25.sra", &format!("http://{}/SRR25.sra", closed))?;

    let runner = Arc::new(FakeRunner::default());
    let summary = run_batch(&batch, runner.clone()).await?;

    assert_eq!(states(&summary), vec![RunState::Failed, RunState::Done]);
    assert!(matches!(summary.outcomes[0].result, Err(PipelineError::Download { .. })));
    assert!(runner.calls_mentioning("SRR25").is_empty());
    assert_eq!(merge_inputs(&runner), vec![batch.run_dir("SRR26.sra").join("output.bam")]);
    Ok(())
}

#[tokio::test]
async fn test_clean_bam_is_not_repaired() -> Result<()> {
    let batch = setup(
        &[("SRR27.sra", "ILLUMINA", "Illumina HiSeq 2500", "SINGLE")],
        PipelineOptions {
            post_process: true,
            ..PipelineOptions::default()
        },
    )?;
    let runner = Arc::new(FakeRunner {
        clean_validation: true,
        ..FakeRunner::default()
    });
    let summary = run_batch(&batch, runner.clone()).await?;

    let report = summary.post_process.expect("post-processing ran");
    assert!(report.validation.is_clean());
    assert!(!report.repaired);
    assert_eq!(report.recheck, None);
    assert!(runner.picard_calls("AddOrReplaceReadGroups").is_empty());
    assert_eq!(runner.picard_calls("ValidateSamFile").len(), 1);
    assert!(!batch.batch_dir().join("validatesam.recheck.log").exists());
    assert!(report.reduced.exists());
    Ok(())
}
