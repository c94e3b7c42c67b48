use std::fs::{File, OpenOptions};
use std::io::{self, BufReader, BufWriter, Read};
use std::path::{Path, PathBuf};

use anyhow::anyhow;
use flate2::read::GzDecoder;
use log::{debug, info};
use tokio::io::AsyncWriteExt;

use crate::config::defs::{PipelineError, ERRLOG_EXT, GZIP_EXT, LOG_EXT};

pub fn is_gzipped(path: &Path) -> io::Result<bool> {
    let mut file = File::open(path)?;
    let mut buffer = [0u8; 2];
    match file.read_exact(&mut buffer) {
        Ok(()) => Ok(buffer == [0x1F, 0x8B]), // Gzip magic bytes
        Err(e) if e.kind() == io::ErrorKind::UnexpectedEof => Ok(false),
        Err(e) => Err(e),
    }
}

/// Name of the decompressed copy: `genome.fa.gz` -> `genome.fa`.
pub fn decompressed_name(path: &Path) -> Option<String> {
    let name = path.file_name()?.to_string_lossy();
    name.strip_suffix(&format!(".{}", GZIP_EXT))
        .filter(|stem| !stem.is_empty())
        .map(|stem| stem.to_string())
}

/// Makes sure the reference is usable by tools that cannot read gzip.
///
/// # Arguments
///
/// * `reference` - Reference FASTA, possibly `.gz`.
/// * `dest_dir` - Where the decompressed copy goes.
///
/// # Returns
/// Path later stages should reference: the input itself when not compressed.
pub fn prepare_reference(reference: &Path, dest_dir: &Path) -> Result<PathBuf, PipelineError> {
    let Some(name) = decompressed_name(reference) else {
        return Ok(reference.to_path_buf());
    };
    let out_path = dest_dir.join(name);
    info!("Decompressing reference {} -> {}", reference.display(), out_path.display());

    let input = File::open(reference)
        .map_err(|e| PipelineError::IOError(format!("{}: {}", reference.display(), e)))?;
    let mut decoder = GzDecoder::new(BufReader::new(input));
    let mut output = BufWriter::new(File::create(&out_path)?);
    io::copy(&mut decoder, &mut output)
        .map_err(|e| PipelineError::IOError(format!("decompressing {}: {}", reference.display(), e)))?;
    io::Write::flush(&mut output)?;
    Ok(out_path)
}


/// `<dir>/<stem>.log` and `<dir>/<stem>.errlog`
pub fn stage_log_paths(dir: &Path, stem: &str) -> (PathBuf, PathBuf) {
    (
        dir.join(format!("{}.{}", stem, LOG_EXT)),
        dir.join(format!("{}.{}", stem, ERRLOG_EXT)),
    )
}

/// Open stdout/stderr capture files for one external invocation. Both handles are closed
/// when the value is dropped, whatever happened to the tool.
#[derive(Debug)]
pub struct StageLogs {
    pub log_path: PathBuf,
    pub errlog_path: PathBuf,
    log: File,
    errlog: File,
}

impl StageLogs {
    pub fn open(log_path: &Path, errlog_path: &Path, append: bool) -> io::Result<Self> {
        let open = |path: &Path| {
            let mut options = OpenOptions::new();
            options.create(true);
            if append {
                options.append(true);
            } else {
                options.write(true).truncate(true);
            }
            options.open(path)
        };
        Ok(StageLogs {
            log_path: log_path.to_path_buf(),
            errlog_path: errlog_path.to_path_buf(),
            log: open(log_path)?,
            errlog: open(errlog_path)?,
        })
    }

    pub fn stdout(&self) -> io::Result<std::process::Stdio> {
        Ok(self.log.try_clone()?.into())
    }

    pub fn stderr(&self) -> io::Result<std::process::Stdio> {
        Ok(self.errlog.try_clone()?.into())
    }
}


/// Unpacks a QC report archive next to it.
pub fn extract_archive(archive: &Path, dest_dir: &Path) -> Result<(), PipelineError> {
    let file = File::open(archive)
        .map_err(|e| PipelineError::IOError(format!("{}: {}", archive.display(), e)))?;
    let mut zip = zip::ZipArchive::new(BufReader::new(file))
        .map_err(|e| PipelineError::Other(anyhow!("Invalid archive {}: {}", archive.display(), e)))?;
    zip.extract(dest_dir)
        .map_err(|e| PipelineError::Other(anyhow!("Failed to unpack {}: {}", archive.display(), e)))?;
    debug!("Unpacked {} into {}", archive.display(), dest_dir.display());
    Ok(())
}


/// Streams `url` into `dest`, going through `<dest>.part` so an interrupted download
/// never looks like a finished file.
pub async fn download_file(url: &str, dest: &Path) -> Result<(), PipelineError> {
    let download_err = |e: &dyn std::fmt::Display| PipelineError::Download {
        url: url.to_string(),
        error: e.to_string(),
    };

    if let Some(parent) = dest.parent() {
        tokio::fs::create_dir_all(parent).await?;
    }
    let part_path = PathBuf::from(format!("{}.part", dest.display()));

    let mut response = reqwest::get(url)
        .await
        .and_then(|r| r.error_for_status())
        .map_err(|e| download_err(&e))?;

    let mut out = tokio::fs::File::create(&part_path).await?;
    let mut total: u64 = 0;
    while let Some(chunk) = response.chunk().await.map_err(|e| download_err(&e))? {
        out.write_all(&chunk).await?;
        total += chunk.len() as u64;
    }
    out.flush().await?;
    drop(out);

    tokio::fs::rename(&part_path, dest).await?;
    info!("Downloaded {} ({} bytes) to {}", url, total, dest.display());
    Ok(())
}


/// Resolves `path` against `cwd` unless it is already absolute.
pub fn absolutize(path: &Path, cwd: &Path) -> PathBuf {
    if path.is_absolute() {
        path.to_path_buf()
    } else {
        cwd.join(path)
    }
}
