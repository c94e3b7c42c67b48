// src/utils/adapters.rs: adapter clipping strategy per platform/model/layout

use std::path::{Path, PathBuf};

use crate::config::defs::{
    PipelineError, ToolPaths, ABI_SOLID_PLATFORM, ADAPTER_PALINDROME_THRESHOLD,
    ADAPTER_SEED_MISMATCHES, ADAPTER_SIMPLE_THRESHOLD, ILLUMINA_PLATFORM,
};
use crate::utils::manifest::{LibraryLayout, RunRecord};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AdapterSet {
    TruSeq3,
    TruSeq2,
}

impl AdapterSet {
    pub fn as_str(&self) -> &'static str {
        match self {
            AdapterSet::TruSeq3 => "TruSeq3",
            AdapterSet::TruSeq2 => "TruSeq2",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReadEnd {
    Single,
    Paired,
}

impl ReadEnd {
    pub fn suffix(&self) -> &'static str {
        match self {
            ReadEnd::Single => "SE",
            ReadEnd::Paired => "PE",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AdapterStrategy {
    /// Trimmomatic bundled adapter file, e.g. TruSeq3-PE.fa.
    Fixed { set: AdapterSet, end: ReadEnd },
    /// bbmap's generic adapter collection, single-end only.
    Generic,
    /// Run bbmerge overlap detection on the mate pair, then clip with what it found.
    Discover,
}

impl AdapterStrategy {
    /// Fixed adapter file name inside the Trimmomatic adapters directory.
    pub fn fixed_file_name(&self) -> Option<String> {
        match self {
            AdapterStrategy::Fixed { set, end } => {
                Some(format!("{}-{}.fa", set.as_str(), end.suffix()))
            }
            _ => None,
        }
    }

    /// Adapter fasta handed to the trimmer. `discovered` is the per-run bbmerge output.
    pub fn adapter_path(&self, tools: &ToolPaths, discovered: &Path) -> PathBuf {
        match self {
            AdapterStrategy::Fixed { set, end } => {
                tools.trimmomatic_adapter(&format!("{}-{}.fa", set.as_str(), end.suffix()))
            }
            AdapterStrategy::Generic => tools.bbmap_adapters.clone(),
            AdapterStrategy::Discover => discovered.to_path_buf(),
        }
    }
}

/// `ILLUMINACLIP:<adapter>:2:30:10`
pub fn illuminaclip(adapter: &Path) -> String {
    format!(
        "ILLUMINACLIP:{}:{}:{}:{}",
        adapter.display(),
        ADAPTER_SEED_MISMATCHES,
        ADAPTER_PALINDROME_THRESHOLD,
        ADAPTER_SIMPLE_THRESHOLD
    )
}

// (platform, model prefixes, adapter set); first match wins.
const ADAPTER_RULES: &[(&str, &[&str], AdapterSet)] = &[
    (ILLUMINA_PLATFORM, &["Illumina HiSeq", "Illumina MiSeq"], AdapterSet::TruSeq3),
    (ILLUMINA_PLATFORM, &["Illumina Genome Analyzer II"], AdapterSet::TruSeq2),
];

const UNSUPPORTED_PLATFORMS: &[&str] = &[ABI_SOLID_PLATFORM];

/// Picks the trimming strategy for a run without touching the filesystem or spawning anything.
///
/// # Arguments
///
/// * `run` - Run identifier, only used in error messages.
/// * `platform` - Manifest Platform value.
/// * `model` - Manifest Model value, matched by prefix.
/// * `layout` - Manifest LibraryLayout.
///
/// # Returns
/// AdapterStrategy, or a run-level rejection for colorspace platforms and unknown layouts.
pub fn select(
    run: &str,
    platform: &str,
    model: &str,
    layout: &LibraryLayout,
) -> Result<AdapterStrategy, PipelineError> {
    if UNSUPPORTED_PLATFORMS.contains(&platform) {
        return Err(PipelineError::UnsupportedPlatform {
            run: run.to_string(),
            platform: platform.to_string(),
        });
    }

    let end = match layout {
        LibraryLayout::Single => ReadEnd::Single,
        LibraryLayout::Paired => ReadEnd::Paired,
        LibraryLayout::Other(raw) => {
            return Err(PipelineError::UnsupportedLayout {
                run: run.to_string(),
                layout: raw.clone(),
            });
        }
    };

    let fixed = ADAPTER_RULES.iter().find(|(rule_platform, prefixes, _)| {
        *rule_platform == platform && prefixes.iter().any(|p| model.starts_with(p))
    });

    Ok(match (fixed, end) {
        (Some((_, _, set)), end) => AdapterStrategy::Fixed { set: *set, end },
        (None, ReadEnd::Single) => AdapterStrategy::Generic,
        (None, ReadEnd::Paired) => AdapterStrategy::Discover,
    })
}

pub fn select_for(record: &RunRecord) -> Result<AdapterStrategy, PipelineError> {
    select(&record.run, &record.platform, &record.model, &record.layout)
}
