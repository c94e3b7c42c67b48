// src/utils/manifest.rs: run manifest loading

use std::collections::HashMap;
use std::fmt;
use std::path::{Path, PathBuf};

use log::{debug, info};

use crate::config::defs::{
    PipelineError, DOWNLOAD_COLUMN, LAYOUT_COLUMN, MODEL_COLUMN, PLATFORM_COLUMN, RUN_COLUMN,
};

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LibraryLayout {
    Single,
    Paired,
    Other(String),
}

impl LibraryLayout {
    pub fn parse(raw: &str) -> Self {
        let trimmed = raw.trim();
        match trimmed.to_ascii_uppercase().as_str() {
            "SINGLE" => LibraryLayout::Single,
            "PAIRED" => LibraryLayout::Paired,
            _ => LibraryLayout::Other(trimmed.to_string()),
        }
    }

    pub fn is_paired(&self) -> bool {
        matches!(self, LibraryLayout::Paired)
    }
}

impl fmt::Display for LibraryLayout {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            LibraryLayout::Single => write!(f, "SINGLE"),
            LibraryLayout::Paired => write!(f, "PAIRED"),
            LibraryLayout::Other(raw) => write!(f, "{}", raw),
        }
    }
}

/// One manifest body row.
#[derive(Debug, Clone, PartialEq)]
pub struct RunRecord {
    pub run: String,
    pub platform: String,
    pub model: String,
    pub layout: LibraryLayout,
    pub download_path: Option<String>,
}

#[derive(Debug, Clone)]
pub struct Manifest {
    pub path: PathBuf,
    pub columns: HashMap<String, usize>,
    pub records: Vec<RunRecord>,
}

impl Manifest {
    /// Loads a tab-separated manifest. Every required column must be present in the header,
    /// `download_path` only when `require_download` is set.
    ///
    /// # Arguments
    ///
    /// * `path` - Manifest file, header on the first line.
    /// * `require_download` - Remote acquisition is enabled.
    ///
    /// # Returns
    /// Manifest with one RunRecord per body line, in file order.
    pub fn load(path: &Path, require_download: bool) -> Result<Self, PipelineError> {
        info!("Checking the input tsv file: {}", path.display());

        let mut reader = csv::ReaderBuilder::new()
            .delimiter(b'\t')
            .quoting(false)
            .flexible(true)
            .has_headers(true)
            .from_path(path)
            .map_err(|e| PipelineError::IOError(format!("{}: {}", path.display(), e)))?;

        let headers = reader
            .headers()
            .map_err(|e| PipelineError::IOError(format!("{}: {}", path.display(), e)))?
            .clone();
        // a repeated header name resolves to its first occurrence
        let mut columns: HashMap<String, usize> = HashMap::new();
        for (i, name) in headers.iter().enumerate() {
            columns.entry(name.trim().to_string()).or_insert(i);
        }

        let mut required = vec![RUN_COLUMN, PLATFORM_COLUMN, MODEL_COLUMN, LAYOUT_COLUMN];
        if require_download {
            required.push(DOWNLOAD_COLUMN);
        }
        for column in &required {
            if !columns.contains_key(*column) {
                return Err(PipelineError::MissingColumn {
                    column: column.to_string(),
                    path: path.to_path_buf(),
                });
            }
        }

        let mut records = Vec::new();
        for (row, result) in reader.records().enumerate() {
            // header is line 1
            let line = row + 2;
            let record = result
                .map_err(|e| PipelineError::IOError(format!("{} line {}: {}", path.display(), line, e)))?;
            if record.len() == 1 && record.get(0).is_some_and(|f| f.trim().is_empty()) {
                continue;
            }

            let field = |column: &str| -> Result<String, PipelineError> {
                let index = columns[column];
                record
                    .get(index)
                    .map(|v| v.to_string())
                    .ok_or_else(|| PipelineError::MalformedRow {
                        path: path.to_path_buf(),
                        line,
                        column: column.to_string(),
                        index,
                        found: record.len(),
                    })
            };

            let download_path = match columns.get(DOWNLOAD_COLUMN) {
                Some(_) if require_download => Some(field(DOWNLOAD_COLUMN)?),
                Some(&index) => record.get(index).map(|v| v.to_string()),
                None => None,
            }
            .filter(|v| !v.trim().is_empty());

            records.push(RunRecord {
                run: field(RUN_COLUMN)?,
                platform: field(PLATFORM_COLUMN)?,
                model: field(MODEL_COLUMN)?,
                layout: LibraryLayout::parse(&field(LAYOUT_COLUMN)?),
                download_path,
            });
        }

        debug!("Loaded {} runs from {}", records.len(), path.display());
        Ok(Manifest {
            path: path.to_path_buf(),
            columns,
            records,
        })
    }
}
