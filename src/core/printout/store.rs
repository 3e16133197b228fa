//! Sample store and failure artifacts
//!
//! Samples live in `<root>/<run>/<font>_<variant>_<text>.png`, one run
//! directory per generation. Run directories are named so that the most
//! recent one sorts last.

use super::{save_comparison, Printout, PrintoutError, Sample};
use chrono::Local;
use regex::Regex;
use serde::Serialize;
use std::fmt;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::sync::OnceLock;
use tracing::{debug, info};

const EXTENSION: &str = "png";

fn name_pattern() -> Option<&'static Regex> {
    static PATTERN: OnceLock<Option<Regex>> = OnceLock::new();
    PATTERN
        .get_or_init(|| {
            Regex::new(r"^(?P<font>[A-Za-z]+[0-9]*)_(?P<variant>[A-Za-z0-9]+)_(?P<text>[A-Za-z0-9_-]+)$").ok()
        })
        .as_ref()
}

/// Parsed sample file name
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
pub struct SampleName {
    /// Font, e.g. `arial16`
    pub font: String,
    /// Rendering variant, e.g. `sample` or `bold`
    pub variant: String,
    /// Text sample, e.g. `text_short`
    pub text: String,
}

impl SampleName {
    /// Build a sample name
    pub fn new(font: &str, variant: &str, text: &str) -> Self {
        Self {
            font: font.to_string(),
            variant: variant.to_string(),
            text: text.to_string(),
        }
    }

    /// File name including extension
    pub fn file_name(&self) -> String {
        format!("{self}.{EXTENSION}")
    }
}

impl fmt::Display for SampleName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}_{}_{}", self.font, self.variant, self.text)
    }
}

impl FromStr for SampleName {
    type Err = PrintoutError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let stem = s.strip_suffix(".png").unwrap_or(s);
        let caps = name_pattern()
            .and_then(|re| re.captures(stem))
            .ok_or_else(|| PrintoutError::InvalidSampleName(s.to_string()))?;
        Ok(Self::new(&caps["font"], &caps["variant"], &caps["text"]))
    }
}

/// Directory of reference samples
#[derive(Debug, Clone)]
pub struct SampleStore {
    dir: PathBuf,
}

impl SampleStore {
    /// Use a directory of samples as is
    pub fn open(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    /// Use the most recent run under `root`; a root without run directories
    /// is used directly
    pub fn latest(root: &Path) -> Result<Self, PrintoutError> {
        let dir = match Self::latest_run(root)? {
            Some(run) => root.join(run),
            None => root.to_path_buf(),
        };
        debug!("Using samples from {}", dir.display());
        Ok(Self { dir })
    }

    /// Name of the lexicographically greatest run directory under `root`
    pub fn latest_run(root: &Path) -> Result<Option<String>, PrintoutError> {
        if !root.is_dir() {
            return Err(PrintoutError::SampleNotFound(root.to_path_buf()));
        }
        let mut latest: Option<String> = None;
        for entry in std::fs::read_dir(root)? {
            let entry = entry?;
            if !entry.file_type()?.is_dir() {
                continue;
            }
            let name = entry.file_name().to_string_lossy().into_owned();
            if latest.as_ref().map_or(true, |l| name > *l) {
                latest = Some(name);
            }
        }
        Ok(latest)
    }

    /// Create a new run directory named after the current time
    pub fn new_run(root: &Path) -> Result<Self, PrintoutError> {
        let run = Local::now().format("%Y-%m-%d_%H%M%S").to_string();
        let dir = root.join(run);
        std::fs::create_dir_all(&dir)?;
        info!("Created sample run {}", dir.display());
        Ok(Self { dir })
    }

    /// Directory samples are read from
    pub fn dir(&self) -> &Path {
        &self.dir
    }

    /// Path of a sample; `.png` is appended when missing
    pub fn path_of(&self, name: &str) -> PathBuf {
        if Path::new(name).extension().is_some_and(|e| e == EXTENSION) {
            self.dir.join(name)
        } else {
            self.dir.join(format!("{name}.{EXTENSION}"))
        }
    }

    /// Load a sample by file name
    pub fn load_sample(&self, name: &str) -> Result<Sample, PrintoutError> {
        let path = self.path_of(name);
        if !path.is_file() {
            return Err(PrintoutError::SampleNotFound(path));
        }
        Sample::load(&path)
    }

    /// Store a printout as a sample
    pub fn save_sample(&self, name: &SampleName, printout: &Printout) -> Result<PathBuf, PrintoutError> {
        let path = self.dir.join(name.file_name());
        printout.save(&path)?;
        Ok(path)
    }

    /// Samples following the naming scheme, sorted
    pub fn list(&self) -> Result<Vec<SampleName>, PrintoutError> {
        let mut names = Vec::new();
        for entry in std::fs::read_dir(&self.dir)? {
            let path = entry?.path();
            if path.extension().is_some_and(|e| e == EXTENSION) {
                if let Some(stem) = path.file_stem() {
                    if let Ok(name) = stem.to_string_lossy().parse() {
                        names.push(name);
                    }
                }
            }
        }
        names.sort();
        Ok(names)
    }
}

/// Output directory for failure artifacts
#[derive(Debug, Clone)]
pub struct ArtifactDir {
    dir: PathBuf,
}

impl ArtifactDir {
    /// Artifacts go under `dir`, created on first write
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    /// Directory artifacts are written to
    pub fn dir(&self) -> &Path {
        &self.dir
    }

    /// Write `<test_name>.png` comparing a failed printout with its sample
    pub fn save_failure(&self, test_name: &str, printout: &Printout, sample: &Printout) -> Result<PathBuf, PrintoutError> {
        let path = self.dir.join(format!("{}.{EXTENSION}", sanitize(test_name)));
        save_comparison(printout, sample, &path)?;
        info!("Saved comparison for {} to {}", test_name, path.display());
        Ok(path)
    }
}

fn sanitize(name: &str) -> String {
    name.chars()
        .map(|c| if c.is_ascii_alphanumeric() || matches!(c, '-' | '_') { c } else { '_' })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::super::testing::dots;
    use super::*;

    #[test]
    fn test_sample_name_parsing() {
        let name: SampleName = "arial16_sample_text_short.png".parse().unwrap();
        assert_eq!(name, SampleName::new("arial16", "sample", "text_short"));
        assert_eq!(name.to_string(), "arial16_sample_text_short");
        assert_eq!(name.file_name(), "arial16_sample_text_short.png");

        assert!("arial16.png".parse::<SampleName>().is_err());
        assert!("no spaces allowed_x_y".parse::<SampleName>().is_err());
    }

    #[test]
    fn test_latest_run() {
        let root = tempfile::tempdir().unwrap();
        for run in ["2024-01-05", "2024-03-01", "2023-12-31"] {
            std::fs::create_dir(root.path().join(run)).unwrap();
        }
        std::fs::write(root.path().join("zzz.txt"), b"not a run").unwrap();

        assert_eq!(
            SampleStore::latest_run(root.path()).unwrap().as_deref(),
            Some("2024-03-01")
        );
        let store = SampleStore::latest(root.path()).unwrap();
        assert_eq!(store.dir(), root.path().join("2024-03-01"));
    }

    #[test]
    fn test_save_load_and_list() {
        let root = tempfile::tempdir().unwrap();
        let store = SampleStore::new_run(root.path()).unwrap();
        let name = SampleName::new("arial16", "sample", "text_short");
        let printout = dots(384, 12, &[(3, 4)]);

        store.save_sample(&name, &printout).unwrap();
        let sample = store.load_sample("arial16_sample_text_short").unwrap();
        assert_eq!(sample.image(), printout.image());
        assert_eq!(store.list().unwrap(), vec![name]);

        let reopened = SampleStore::latest(root.path()).unwrap();
        assert!(reopened.load_sample("arial16_sample_text_short.png").is_ok());
    }

    #[test]
    fn test_missing_sample() {
        let root = tempfile::tempdir().unwrap();
        let store = SampleStore::open(root.path());
        assert!(matches!(
            store.load_sample("arial9_sample_missing"),
            Err(PrintoutError::SampleNotFound(_))
        ));
        assert!(matches!(
            SampleStore::latest(&root.path().join("absent")),
            Err(PrintoutError::SampleNotFound(_))
        ));
    }

    #[test]
    fn test_artifacts_written_on_demand() {
        let root = tempfile::tempdir().unwrap();
        let artifacts = ArtifactDir::new(root.path().join("comparison"));
        assert!(!artifacts.dir().exists());

        let path = artifacts
            .save_failure("Frame Recovery: 8 Bits Odd", &dots(8, 4, &[(1, 1)]), &dots(8, 4, &[]))
            .unwrap();
        assert!(path.is_file());
        assert_eq!(path.file_name().unwrap(), "Frame_Recovery__8_Bits_Odd.png");
    }
}
