//! Filesystem phase archive.
//!
//! Sealed phases are written as pretty JSON to
//! `<archive_dir>/phases/phase-<NNN>_<timestamp>_<id8>.json`.

use super::PhaseArchive;
use crate::collaborators::ArchiveStore;
use anyhow::{Context, Result};
use async_trait::async_trait;
use std::fs;
use std::path::{Path, PathBuf};

pub struct FsArchiveStore {
    archive_dir: PathBuf,
}

impl FsArchiveStore {
    pub fn new(archive_dir: &Path) -> Self {
        Self {
            archive_dir: archive_dir.to_path_buf(),
        }
    }

    pub fn phases_dir(&self) -> PathBuf {
        self.archive_dir.join("phases")
    }

    /// Write `archive` and return the file path.
    pub fn write(&self, archive: &PhaseArchive) -> Result<PathBuf> {
        let dir = self.phases_dir();
        fs::create_dir_all(&dir)
            .with_context(|| format!("Failed to create archive directory {}", dir.display()))?;

        let filename = format!(
            "phase-{:03}_{}_{}.json",
            archive.phase,
            archive.sealed_at.format("%Y-%m-%dT%H-%M-%S"),
            &archive.archive_id.to_string()[..8]
        );
        let path = dir.join(filename);

        let json = serde_json::to_string_pretty(archive).context("Failed to serialize phase archive")?;
        fs::write(&path, json)
            .with_context(|| format!("Failed to write phase archive {}", path.display()))?;
        Ok(path)
    }

    /// Archive files, most recent phase first.
    pub fn list(&self) -> Result<Vec<PathBuf>> {
        let dir = self.phases_dir();
        if !dir.exists() {
            return Ok(Vec::new());
        }

        let mut archives: Vec<PathBuf> = fs::read_dir(&dir)
            .with_context(|| format!("Failed to read {}", dir.display()))?
            .filter_map(|e| e.ok())
            .map(|e| e.path())
            .filter(|p| p.extension().map(|e| e == "json").unwrap_or(false))
            .collect();

        archives.sort();
        archives.reverse();
        Ok(archives)
    }

    pub fn load(&self, path: &Path) -> Result<PhaseArchive> {
        let content = fs::read_to_string(path)
            .with_context(|| format!("Failed to read phase archive {}", path.display()))?;
        serde_json::from_str(&content)
            .with_context(|| format!("Failed to parse phase archive {}", path.display()))
    }

    /// Load the archive for phase `phase`, or the latest one.
    pub fn find(&self, phase: Option<u32>) -> Result<Option<(PathBuf, PhaseArchive)>> {
        for path in self.list()? {
            if let Some(wanted) = phase
                && phase_number(&path) != Some(wanted)
            {
                continue;
            }
            let archive = self.load(&path)?;
            return Ok(Some((path, archive)));
        }
        Ok(None)
    }
}

fn phase_number(path: &Path) -> Option<u32> {
    let name = path.file_name()?.to_str()?;
    let rest = name.strip_prefix("phase-")?;
    let digits = rest.split('_').next()?;
    digits.parse().ok()
}

#[async_trait]
impl ArchiveStore for FsArchiveStore {
    async fn save(&self, archive: &PhaseArchive) -> Result<String> {
        let path = self.write(archive)?;
        Ok(path.display().to_string())
    }

    async fn latest_phase(&self) -> Result<Option<u32>> {
        Ok(self.list()?.iter().filter_map(|p| phase_number(p)).max())
    }
}
