// ValidateSamFile SUMMARY report parsing

use std::collections::BTreeSet;
use std::fs::File;
use std::io::{BufRead, BufReader};
use std::path::Path;

use crate::config::defs::{PipelineError, MISSING_READ_GROUP_CODE, VALIDATION_HEADER_LINES};

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ValidationReport {
    pub errors: BTreeSet<String>,
    pub warnings: BTreeSet<String>,
}

impl ValidationReport {
    /// Parses a SUMMARY-mode report: skip the header, take the first tab field of each line,
    /// stop at the first blank line.
    pub fn parse<R: BufRead>(reader: R) -> Result<Self, PipelineError> {
        let mut report = ValidationReport::default();
        for line in reader.lines().skip(VALIDATION_HEADER_LINES) {
            let line = line?;
            let token = line.split('\t').next().unwrap_or("").trim_end();
            if token.is_empty() {
                break;
            }
            if token.contains("ERROR") {
                report.errors.insert(strip_marker(token, "ERROR:"));
            } else if token.contains("WARNING") {
                report.warnings.insert(strip_marker(token, "WARNING:"));
            }
        }
        Ok(report)
    }

    pub fn from_file(path: &Path) -> Result<Self, PipelineError> {
        let file = File::open(path)
            .map_err(|e| PipelineError::IOError(format!("validation report {}: {}", path.display(), e)))?;
        Self::parse(BufReader::new(file))
    }

    pub fn needs_read_group_repair(&self) -> bool {
        self.errors.contains(MISSING_READ_GROUP_CODE)
    }

    /// Codes the post-processing repairs by itself.
    pub fn is_repairable(code: &str) -> bool {
        code == MISSING_READ_GROUP_CODE
    }

    pub fn is_clean(&self) -> bool {
        self.errors.is_empty() && self.warnings.is_empty()
    }
}

fn strip_marker(token: &str, marker: &str) -> String {
    token.strip_prefix(marker).unwrap_or(token).to_string()
}
