//! Storage preflight: does the library have room for every pending export?

use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use crate::project::{ProjectKey, ProjectStore};

/// Source of free-space figures for a filesystem path.
pub trait SpaceProbe: Send + Sync {
    fn available_space(&self, path: &Path) -> std::io::Result<u64>;
}

/// Queries the filesystem through `fs2`.
#[derive(Debug, Clone, Copy, Default)]
pub struct FsSpaceProbe;

impl SpaceProbe for FsSpaceProbe {
    fn available_space(&self, path: &Path) -> std::io::Result<u64> {
        // The destination may not exist yet; measure its nearest existing ancestor.
        let existing = path
            .ancestors()
            .find(|p| p.exists())
            .unwrap_or_else(|| Path::new("."));
        fs2::available_space(existing)
    }
}

/// An upscaled artifact that has not reached the library yet.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PendingExport {
    #[serde(flatten)]
    pub key: ProjectKey,
    pub source: PathBuf,
    pub destination: PathBuf,
    pub bytes: u64,
    /// This item alone fits into the current free space.
    pub fits_now: bool,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StorageReport {
    pub free_bytes: u64,
    pub required_bytes: u64,
    pub required_count: usize,
    pub fits_all: bool,
    pub pending: Vec<PendingExport>,
}

/// Build a fresh report for `destination_root`. Read-only.
pub fn compute_report(
    store: &ProjectStore,
    destination_root: &Path,
    probe: &dyn SpaceProbe,
) -> std::io::Result<StorageReport> {
    let free_bytes = probe.available_space(destination_root)?;
    let mut pending = Vec::new();

    for project in store.list_projects()? {
        if project.exported {
            continue;
        }
        let (Some(source), Some(bytes)) = (project.upscaled_artifact, project.upscaled_bytes)
        else {
            continue;
        };
        let destination = store.export_path_for(&project.key, &source);
        pending.push(PendingExport {
            key: project.key,
            source,
            destination,
            bytes,
            fits_now: bytes <= free_bytes,
        });
    }

    let required_bytes = pending.iter().map(|p| p.bytes).sum();
    let report = StorageReport {
        free_bytes,
        required_bytes,
        required_count: pending.len(),
        fits_all: free_bytes >= required_bytes,
        pending,
    };
    tracing::debug!(
        "Storage preflight: {} pending exports, {} bytes required, {} free",
        report.required_count,
        report.required_bytes,
        report.free_bytes
    );
    Ok(report)
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    const GB: u64 = 1_000_000_000;

    struct FixedProbe(u64);

    impl SpaceProbe for FixedProbe {
        fn available_space(&self, _path: &Path) -> std::io::Result<u64> {
            Ok(self.0)
        }
    }

    fn add_upscaled(store: &ProjectStore, title: &str, year: &str, bytes: u64) -> PathBuf {
        let key = ProjectKey::new(title, year).unwrap();
        std::fs::create_dir_all(store.highres_dir(&key)).unwrap();
        let path = store.upscaled_path(&key);
        let file = std::fs::File::create(&path).unwrap();
        file.set_len(bytes).unwrap();
        path
    }

    #[test]
    fn sums_unexported_artifacts() {
        let tmp = tempfile::tempdir().unwrap();
        let store = ProjectStore::new(tmp.path().join("import"), tmp.path().join("library"));
        add_upscaled(&store, "Urlaub", "2001", 4 * GB);
        add_upscaled(&store, "Hochzeit", "1999", 8 * GB);

        let report = compute_report(&store, store.library_root(), &FixedProbe(10 * GB)).unwrap();
        assert_eq!(report.required_bytes, 12 * GB);
        assert_eq!(report.required_count, 2);
        assert_eq!(report.free_bytes, 10 * GB);
        assert!(!report.fits_all);
        assert!(report.pending.iter().all(|p| p.fits_now));
    }

    #[test]
    fn exported_projects_are_not_counted() {
        let tmp = tempfile::tempdir().unwrap();
        let store = ProjectStore::new(tmp.path().join("import"), tmp.path().join("library"));
        let source = add_upscaled(&store, "Urlaub", "2001", 16);
        add_upscaled(&store, "Hochzeit", "1999", 32);

        let key = ProjectKey::new("Urlaub", "2001").unwrap();
        let target = store.export_path_for(&key, &source);
        std::fs::create_dir_all(target.parent().unwrap()).unwrap();
        std::fs::copy(&source, &target).unwrap();

        let report = compute_report(&store, store.library_root(), &FixedProbe(100)).unwrap();
        assert_eq!(report.required_count, 1);
        assert_eq!(report.required_bytes, 32);
        assert!(report.fits_all);
        assert_eq!(report.pending[0].key.title, "Hochzeit");
    }

    #[test]
    fn fs_probe_handles_missing_destination() {
        let tmp = tempfile::tempdir().unwrap();
        let free = FsSpaceProbe
            .available_space(&tmp.path().join("not/yet/created"))
            .unwrap();
        assert!(free > 0);
    }
}
