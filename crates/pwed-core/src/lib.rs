pub mod cancel;
pub mod collection;
pub mod config;
pub mod error;
pub mod materialize;
pub mod overrides;
pub mod pattern;
pub mod ranges;
pub mod record;
pub mod smv;
pub mod xscale;

use std::fs::File;
use std::io::BufReader;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Mutex;
use std::time::{Duration, Instant};

use anyhow::Context;
use rayon::prelude::*;
use serde::{Deserialize, Serialize};

pub use cancel::{CancellationToken, ImportControl};
pub use collection::{CollectionError, CollectionInfo, ImageCollection, COLLECTION_FILENAME};
pub use config::EdConfig;
pub use error::ImportError;
pub use materialize::ImportAction;
pub use overrides::HeaderOverrides;
pub use pattern::{FilePattern, MatchedFile};
pub use record::{ImageRecord, RecordBuilder};

/// Directory under the output where matched files are copied or linked.
pub const EXTRA_DIR: &str = "extra";

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ImportOptions {
    /// Root directory the pattern is resolved against
    pub files_path: PathBuf,
    /// Template with `{TI}` and optionally `{TS}`, e.g. `SMV/data/{TI}.img`
    pub files_pattern: String,
    /// Output directory; relative paths live under the user data directory
    pub output: PathBuf,
    #[serde(default)]
    pub import_action: ImportAction,
    #[serde(default)]
    pub skip_images: Option<u64>,
    #[serde(default)]
    pub replace_rotation_axis: bool,
    #[serde(default)]
    pub rotation_axis: Option<String>,
    #[serde(default)]
    pub overrides: HeaderOverrides,
    #[serde(default)]
    pub strict_headers: bool,
}

impl ImportOptions {
    pub fn new(
        files_path: impl Into<PathBuf>,
        files_pattern: impl Into<String>,
        output: impl Into<PathBuf>,
    ) -> Self {
        Self {
            files_path: files_path.into(),
            files_pattern: files_pattern.into(),
            output: output.into(),
            import_action: ImportAction::default(),
            skip_images: None,
            replace_rotation_axis: false,
            rotation_axis: None,
            overrides: HeaderOverrides::default(),
            strict_headers: false,
        }
    }

    /// Load options saved as JSON.
    pub fn from_json_file(path: &Path) -> Result<Self, ImportError> {
        let file = File::open(path).map_err(|e| ImportError::io(path, e))?;
        Ok(serde_json::from_reader(BufReader::new(file))?)
    }

    pub fn validate(&self) -> Result<(), ImportError> {
        if self.files_path.as_os_str().is_empty() {
            return Err(ImportError::InvalidOptions("files path is empty".into()));
        }
        if !self.files_path.is_dir() {
            return Err(ImportError::InvalidOptions(format!(
                "files path {} is not a directory",
                self.files_path.display()
            )));
        }
        if !self.files_pattern.contains(pattern::TI_TAG) {
            return Err(ImportError::InvalidPattern {
                pattern: self.files_pattern.clone(),
                reason: format!("pattern must contain {}", pattern::TI_TAG),
            });
        }
        if self.replace_rotation_axis
            && self.rotation_axis.as_deref().map_or(true, |a| a.trim().is_empty())
        {
            return Err(ImportError::InvalidOptions(
                "rotation axis is required when replacing it".into(),
            ));
        }
        Ok(())
    }

    /// Rotation axis text to apply, only when replacement is requested.
    pub fn rotation_axis_override(&self) -> Option<&str> {
        if self.replace_rotation_axis {
            self.rotation_axis.as_deref()
        } else {
            None
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ImportResult {
    pub collection_path: PathBuf,
    pub total_images: u64,
    pub ignored_images: u64,
    /// Records with at least one field that could not be read
    pub partial_records: u64,
    #[serde(default)]
    pub ignored_ranges: Vec<(u64, u64)>,
    #[serde(default)]
    pub warnings: Vec<String>,
}

/// Type alias for progress callback: stage, current, total, message
pub type ProgressCallback = dyn Fn(&str, u64, u64, &str) + Send + Sync;

const PROGRESS_INTERVAL: Duration = Duration::from_millis(200);

/// Throttled progress reporter, emits at most every 200ms or on completion.
pub struct ThrottledProgress<'a> {
    inner: &'a ProgressCallback,
    last_emit: Mutex<Instant>,
}

impl<'a> ThrottledProgress<'a> {
    pub fn new(inner: &'a ProgressCallback) -> Self {
        let start = Instant::now()
            .checked_sub(Duration::from_secs(1))
            .unwrap_or_else(Instant::now);
        Self {
            inner,
            last_emit: Mutex::new(start),
        }
    }

    pub fn report(&self, stage: &str, current: u64, total: u64, message: &str) {
        let is_done = current + 1 >= total;
        if !is_done {
            let mut last = self.last_emit.lock().unwrap_or_else(|e| e.into_inner());
            if last.elapsed() < PROGRESS_INTERVAL {
                return;
            }
            *last = Instant::now();
        }
        (self.inner)(stage, current, total, message);
    }
}

/// Import every matching image into a new collection.
pub fn import_images(
    options: &ImportOptions,
    config: &EdConfig,
    progress_callback: &ProgressCallback,
) -> anyhow::Result<ImportResult> {
    import_images_with_control(options, config, &ImportControl::default(), progress_callback)
}

/// Import with cancellation support. A cancelled import leaves no collection file behind.
pub fn import_images_with_control(
    options: &ImportOptions,
    config: &EdConfig,
    control: &ImportControl,
    progress_callback: &ProgressCallback,
) -> anyhow::Result<ImportResult> {
    let tp = ThrottledProgress::new(progress_callback);
    options.validate()?;
    control.check()?;

    let output = config.resolve_output(&options.output);
    let pattern = FilePattern::new(&options.files_path, &options.files_pattern)?;
    log::info!("Glob pattern: {}", pattern.glob_pattern());
    log::info!("Regex pattern: {}", pattern.regex_pattern());

    // Stage 1: match
    let matched = pattern
        .matching_files()
        .with_context(|| format!("listing files under {}", options.files_path.display()))?;
    let mut warnings = Vec::new();
    if matched.is_empty() {
        let msg = format!("no files match {}", pattern.pattern());
        log::warn!("{}", msg);
        warnings.push(msg);
    } else {
        log::info!("Matched {} files", matched.len());
    }
    control.check()?;

    // Stage 2: bring files into the output directory
    let extra = output.join(EXTRA_DIR);
    let placed = materialize::materialize(&matched, &extra, options.import_action, control, &tp)
        .with_context(|| format!("importing files into {}", extra.display()))?;

    // Stage 3: read headers in parallel, results keep matched order
    let builder = RecordBuilder::new(options.overrides.clone())
        .with_skip_images(options.skip_images)
        .with_rotation_axis(options.rotation_axis_override())
        .with_strict_headers(options.strict_headers);
    let total = placed.len() as u64;
    let done = AtomicU64::new(0);
    let records = placed
        .par_iter()
        .map(|file| -> Result<ImageRecord, ImportError> {
            control.check()?;
            let record = builder.build(file)?;
            let n = done.fetch_add(1, Ordering::Relaxed);
            tp.report("headers", n, total, "Reading headers");
            Ok(record)
        })
        .collect::<Result<Vec<_>, _>>()?;
    control.check()?;

    // Stage 4: assemble and persist
    let collection_path = output.join(COLLECTION_FILENAME);
    let mut collection = ImageCollection::create(&collection_path)?;
    collection.set_skip_images(options.skip_images.filter(|&s| s != 0));
    for record in records {
        for diag in &record.diagnostics {
            warnings.push(format!(
                "{}: {}: {}",
                record.file_name.display(),
                diag.field,
                diag.message
            ));
        }
        collection
            .append(record)
            .context("assembling image collection")?;
    }
    collection
        .write()
        .with_context(|| format!("writing {}", collection_path.display()))?;

    let result = ImportResult {
        collection_path,
        total_images: collection.len() as u64,
        ignored_images: collection.iter().filter(|r| r.ignore).count() as u64,
        partial_records: collection.iter().filter(|r| r.is_partial()).count() as u64,
        ignored_ranges: collection.ignored_ranges(),
        warnings,
    };
    log::info!(
        "Imported {} images ({} ignored, {} partial) into {}",
        result.total_images,
        result.ignored_images,
        result.partial_records,
        result.collection_path.display()
    );
    collection.close();
    Ok(result)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;
    use tempfile::tempdir;

    fn noop(_: &str, _: u64, _: u64, _: &str) {}

    fn write_images(dir: &Path, ids: &[u64]) {
        let data = dir.join("data");
        fs::create_dir_all(&data).unwrap();
        for id in ids {
            let bytes = smv::smv_fixture(&[("PIXEL_SIZE", "0.055"), ("WAVELENGTH", "0.0251")]);
            fs::write(data.join(format!("{:05}.img", id)), bytes).unwrap();
        }
    }

    #[test]
    fn test_validate() {
        let dir = tempdir().unwrap();
        let mut opts = ImportOptions::new(dir.path(), "{TI}.img", "out");
        assert!(opts.validate().is_ok());

        opts.files_pattern = "*.img".into();
        assert!(matches!(opts.validate(), Err(ImportError::InvalidPattern { .. })));
        opts.files_pattern = "{TI}.img".into();

        opts.replace_rotation_axis = true;
        assert!(matches!(opts.validate(), Err(ImportError::InvalidOptions(_))));
        opts.rotation_axis = Some("0,1,0".into());
        assert!(opts.validate().is_ok());
        assert_eq!(opts.rotation_axis_override(), Some("0,1,0"));

        opts.files_path = dir.path().join("missing");
        assert!(opts.validate().is_err());
        opts.files_path = PathBuf::new();
        assert!(opts.validate().is_err());
    }

    #[test]
    fn test_rotation_axis_ignored_without_flag() {
        let mut opts = ImportOptions::new("/data", "{TI}.img", "out");
        opts.rotation_axis = Some("1,0,0".into());
        assert_eq!(opts.rotation_axis_override(), None);
    }

    #[test]
    fn test_options_from_json() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("opts.json");
        fs::write(
            &path,
            r#"{
                "files_path": "/data/exp12",
                "files_pattern": "SMV/data/{TI}.img",
                "output": "run1",
                "import_action": "copy",
                "skip_images": 10,
                "overrides": { "pixel_size": "0.028" }
            }"#,
        )
        .unwrap();

        let opts = ImportOptions::from_json_file(&path).unwrap();
        assert_eq!(opts.import_action, ImportAction::Copy);
        assert_eq!(opts.skip_images, Some(10));
        assert_eq!(opts.overrides.pixel_size.as_deref(), Some("0.028"));
        assert!(!opts.strict_headers);

        fs::write(&path, "{").unwrap();
        assert!(matches!(ImportOptions::from_json_file(&path), Err(ImportError::Json(_))));
    }

    #[test]
    fn test_import_skip_and_summary() {
        let src = tempdir().unwrap();
        let out = tempdir().unwrap();
        write_images(src.path(), &[1, 2, 3, 4, 5, 6]);

        let mut opts = ImportOptions::new(src.path(), "data/{TI}.img", out.path());
        opts.skip_images = Some(2);
        opts.import_action = ImportAction::Copy;
        let result = import_images(&opts, &EdConfig::new(out.path()), &noop).unwrap();

        assert_eq!(result.total_images, 6);
        assert_eq!(result.ignored_images, 3);
        assert_eq!(result.ignored_ranges, vec![(2, 2), (4, 4), (6, 6)]);
        assert_eq!(result.collection_path, out.path().join(COLLECTION_FILENAME));

        let collection = ImageCollection::open(&result.collection_path).unwrap();
        assert_eq!(collection.info().skip_images, Some(2));
        assert_eq!(collection.info().wavelength, Some(0.0251));
        let first = collection.get(1).unwrap();
        assert!(first.file_name.starts_with(fs::canonicalize(out.path()).unwrap().join(EXTRA_DIR)));
    }

    #[test]
    fn test_cancelled_import_writes_nothing() {
        let src = tempdir().unwrap();
        let out = tempdir().unwrap();
        write_images(src.path(), &[1, 2]);

        let token = CancellationToken::new();
        token.cancel();
        let control = ImportControl::new().with_cancel_token(token);
        let opts = ImportOptions::new(src.path(), "data/{TI}.img", out.path());
        let err = import_images_with_control(&opts, &EdConfig::new(out.path()), &control, &noop)
            .unwrap_err();

        assert!(matches!(err.downcast_ref::<ImportError>(), Some(ImportError::Cancelled)));
        assert!(!out.path().join(COLLECTION_FILENAME).exists());
    }

    #[test]
    fn test_throttled_progress_always_emits_last() {
        let calls = std::sync::Arc::new(Mutex::new(Vec::new()));
        let calls_cb = std::sync::Arc::clone(&calls);
        let cb = move |stage: &str, current: u64, total: u64, _: &str| {
            calls_cb.lock().unwrap().push((stage.to_string(), current, total));
        };
        let tp = ThrottledProgress::new(&cb);
        for i in 0..50 {
            tp.report("headers", i, 50, "");
        }
        let calls = calls.lock().unwrap().clone();
        assert_eq!(calls.first().map(|c| c.1), Some(0));
        assert_eq!(calls.last().map(|c| c.1), Some(49));
        assert!(calls.len() < 50);
    }
}
