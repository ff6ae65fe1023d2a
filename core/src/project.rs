//! Project store.
//!
//! A project is one `Title (Year)` directory under the import root:
//!
//! ```text
//! <import_root>/Urlaub (2001)/
//!     LowRes/part_001.avi, part_002.avi, movie_merged.avi
//!     HighRes/Urlaub (2001)_4k.mp4
//! ```
//!
//! Exports land in `<library_root>/Urlaub (2001)/Urlaub (2001).mp4`.

use std::ffi::OsStr;
use std::path::{Path, PathBuf};
use std::sync::LazyLock;

use regex_lite::Regex;
use serde::{Deserialize, Serialize};

pub const LOWRES_DIR: &str = "LowRes";
pub const HIGHRES_DIR: &str = "HighRes";
pub const MERGED_STEM: &str = "movie_merged";
pub const UPSCALED_SUFFIX: &str = "_4k.mp4";

const MERGED_EXTENSIONS: [&str; 4] = ["mp4", "avi", "mov", "mkv"];

static FOLDER_NAME_RE: LazyLock<Option<Regex>> =
    LazyLock::new(|| Regex::new(r"^(.+?)\s*\((\d{4})\)$").ok());

static PART_NAME_RE: LazyLock<Option<Regex>> =
    LazyLock::new(|| Regex::new(r"^part_(\d{3,})\.avi$").ok());

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("{reason}")]
pub struct InvalidProjectKey {
    pub reason: String,
}

/// Validated title + year pair identifying one project.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ProjectKey {
    pub title: String,
    pub year: String,
}

impl ProjectKey {
    pub fn new(title: &str, year: &str) -> Result<Self, InvalidProjectKey> {
        let title = title.trim();
        let year = year.trim();
        if title.is_empty() {
            return Err(InvalidProjectKey {
                reason: "title must not be empty".to_string(),
            });
        }
        if year.is_empty() {
            return Err(InvalidProjectKey {
                reason: "year must not be empty".to_string(),
            });
        }
        if title == "." || title == ".." || title.contains(['/', '\\', '\0']) {
            return Err(InvalidProjectKey {
                reason: format!("title '{title}' is not usable as a directory name"),
            });
        }
        if year.len() != 4 || !year.chars().all(|c| c.is_ascii_digit()) {
            return Err(InvalidProjectKey {
                reason: format!("year '{year}' must be four digits"),
            });
        }
        Ok(Self {
            title: title.to_string(),
            year: year.to_string(),
        })
    }

    /// Parse a `Title (Year)` folder name.
    pub fn from_dir_name(name: &str) -> Option<Self> {
        let caps = FOLDER_NAME_RE.as_ref()?.captures(name)?;
        let title = caps.get(1)?.as_str().trim();
        let year = caps.get(2)?.as_str();
        Self::new(title, year).ok()
    }

    pub fn dir_name(&self) -> String {
        format!("{} ({})", self.title, self.year)
    }
}

impl std::fmt::Display for ProjectKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{} ({})", self.title, self.year)
    }
}

/// Artifacts found on disk for one project.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Project {
    #[serde(flatten)]
    pub key: ProjectKey,
    pub dir: PathBuf,
    pub raw_parts: Vec<PathBuf>,
    pub merged_artifact: Option<PathBuf>,
    pub upscaled_artifact: Option<PathBuf>,
    pub upscaled_bytes: Option<u64>,
    pub export_path: Option<PathBuf>,
    pub exported: bool,
}

#[derive(Debug, Clone)]
pub struct ProjectStore {
    import_root: PathBuf,
    library_root: PathBuf,
}

impl ProjectStore {
    pub fn new(import_root: impl Into<PathBuf>, library_root: impl Into<PathBuf>) -> Self {
        Self {
            import_root: import_root.into(),
            library_root: library_root.into(),
        }
    }

    pub fn import_root(&self) -> &Path {
        &self.import_root
    }

    pub fn library_root(&self) -> &Path {
        &self.library_root
    }

    pub fn project_dir(&self, key: &ProjectKey) -> PathBuf {
        self.import_root.join(key.dir_name())
    }

    pub fn lowres_dir(&self, key: &ProjectKey) -> PathBuf {
        self.project_dir(key).join(LOWRES_DIR)
    }

    pub fn highres_dir(&self, key: &ProjectKey) -> PathBuf {
        self.project_dir(key).join(HIGHRES_DIR)
    }

    /// Create the raw-media directory, reusing it if present.
    pub fn ensure_lowres_dir(&self, key: &ProjectKey) -> std::io::Result<PathBuf> {
        let dir = self.lowres_dir(key);
        std::fs::create_dir_all(&dir)?;
        Ok(dir)
    }

    pub fn part_path(&self, key: &ProjectKey, index: u32) -> PathBuf {
        self.lowres_dir(key).join(format!("part_{index:03}.avi"))
    }

    /// Raw capture parts ordered by part number.
    pub fn raw_parts(&self, key: &ProjectKey) -> std::io::Result<Vec<(u32, PathBuf)>> {
        let dir = self.lowres_dir(key);
        if !dir.is_dir() {
            return Ok(Vec::new());
        }
        let Some(re) = PART_NAME_RE.as_ref() else {
            return Ok(Vec::new());
        };
        let mut parts = Vec::new();
        for entry in std::fs::read_dir(&dir)? {
            let entry = entry?;
            let name = entry.file_name();
            let Some(name) = name.to_str() else {
                continue;
            };
            if let Some(index) = re
                .captures(name)
                .and_then(|caps| caps.get(1))
                .and_then(|m| m.as_str().parse::<u32>().ok())
            {
                parts.push((index, entry.path()));
            }
        }
        parts.sort();
        Ok(parts)
    }

    /// One past the highest existing part number, starting at 1.
    pub fn next_part_index(&self, key: &ProjectKey) -> std::io::Result<u32> {
        let parts = self.raw_parts(key)?;
        Ok(parts.last().map_or(1, |(index, _)| index + 1))
    }

    /// Where the merge stage writes its output.
    pub fn merged_path(&self, key: &ProjectKey, extension: &str) -> PathBuf {
        self.lowres_dir(key)
            .join(format!("{MERGED_STEM}.{extension}"))
    }

    /// Newest `movie_merged*` file in the LowRes directory.
    pub fn find_merged(&self, key: &ProjectKey) -> std::io::Result<Option<PathBuf>> {
        let dir = self.lowres_dir(key);
        if !dir.is_dir() {
            return Ok(None);
        }
        let mut candidates = Vec::new();
        for entry in std::fs::read_dir(&dir)? {
            let entry = entry?;
            let path = entry.path();
            let is_merged = path
                .file_stem()
                .and_then(OsStr::to_str)
                .is_some_and(|stem| stem.starts_with(MERGED_STEM));
            let known_ext = path
                .extension()
                .and_then(OsStr::to_str)
                .is_some_and(|ext| MERGED_EXTENSIONS.contains(&ext.to_lowercase().as_str()));
            if is_merged && known_ext && path.is_file() {
                let modified = entry.metadata()?.modified()?;
                candidates.push((modified, path));
            }
        }
        candidates.sort();
        Ok(candidates.pop().map(|(_, path)| path))
    }

    /// Canonical upscale output path.
    pub fn upscaled_path(&self, key: &ProjectKey) -> PathBuf {
        self.highres_dir(key)
            .join(format!("{}{UPSCALED_SUFFIX}", key.dir_name()))
    }

    /// The canonical upscaled file, or any `*_4k.mp4` in HighRes.
    pub fn find_upscaled(&self, key: &ProjectKey) -> std::io::Result<Option<PathBuf>> {
        let canonical = self.upscaled_path(key);
        if canonical.is_file() {
            return Ok(Some(canonical));
        }
        let dir = self.highres_dir(key);
        if !dir.is_dir() {
            return Ok(None);
        }
        let mut found = Vec::new();
        for entry in std::fs::read_dir(&dir)? {
            let path = entry?.path();
            let matches = path
                .file_name()
                .and_then(OsStr::to_str)
                .is_some_and(|n| n.ends_with(UPSCALED_SUFFIX));
            if matches && path.is_file() {
                found.push(path);
            }
        }
        found.sort();
        Ok(found.into_iter().next())
    }

    /// `<library>/Title (Year)/Title (Year).<ext>`
    pub fn export_path(&self, key: &ProjectKey, extension: &str) -> PathBuf {
        let name = key.dir_name();
        self.library_root
            .join(&name)
            .join(format!("{name}.{extension}"))
    }

    /// `<library>/Title (Year)/<file_name>`, next to the exported movie.
    pub fn cover_path(&self, key: &ProjectKey, file_name: &str) -> PathBuf {
        self.library_root.join(key.dir_name()).join(file_name)
    }

    /// Export target for a given artifact, keeping its extension.
    pub fn export_path_for(&self, key: &ProjectKey, artifact: &Path) -> PathBuf {
        let ext = artifact
            .extension()
            .and_then(OsStr::to_str)
            .unwrap_or("mp4");
        self.export_path(key, ext)
    }

    /// True when the library copy exists with the artifact's length.
    pub fn is_exported(&self, key: &ProjectKey, artifact: &Path) -> std::io::Result<bool> {
        let target = self.export_path_for(key, artifact);
        let Ok(target_meta) = std::fs::metadata(&target) else {
            return Ok(false);
        };
        let source_meta = std::fs::metadata(artifact)?;
        Ok(target_meta.is_file() && target_meta.len() == source_meta.len())
    }

    pub fn project(&self, key: &ProjectKey) -> std::io::Result<Project> {
        let raw_parts = self
            .raw_parts(key)?
            .into_iter()
            .map(|(_, path)| path)
            .collect();
        let merged_artifact = self.find_merged(key)?;
        let upscaled_artifact = self.find_upscaled(key)?;
        let (upscaled_bytes, export_path, exported) = match &upscaled_artifact {
            Some(artifact) => (
                Some(std::fs::metadata(artifact)?.len()),
                Some(self.export_path_for(key, artifact)),
                self.is_exported(key, artifact)?,
            ),
            None => (None, None, false),
        };
        Ok(Project {
            key: key.clone(),
            dir: self.project_dir(key),
            raw_parts,
            merged_artifact,
            upscaled_artifact,
            upscaled_bytes,
            export_path,
            exported,
        })
    }

    /// All `Title (Year)` directories under the import root, sorted by name.
    pub fn list_projects(&self) -> std::io::Result<Vec<Project>> {
        if !self.import_root.is_dir() {
            return Ok(Vec::new());
        }
        let mut keys = Vec::new();
        for entry in std::fs::read_dir(&self.import_root)? {
            let entry = entry?;
            if !entry.file_type()?.is_dir() {
                continue;
            }
            match entry.file_name().to_str().and_then(ProjectKey::from_dir_name) {
                Some(key) => keys.push(key),
                None => tracing::debug!(
                    "Skipping non-project directory {}",
                    entry.path().display()
                ),
            }
        }
        keys.sort();
        keys.iter().map(|key| self.project(key)).collect()
    }

    /// Map an artifact path back to its project (`.../Title (Year)/<LowRes|HighRes>/file`).
    pub fn key_for_artifact(&self, artifact: &Path) -> Option<ProjectKey> {
        artifact
            .ancestors()
            .skip(1)
            .filter_map(|dir| dir.file_name().and_then(OsStr::to_str))
            .find_map(ProjectKey::from_dir_name)
    }
}
