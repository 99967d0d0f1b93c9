use std::collections::{BTreeSet, HashSet};
use std::fs::{self, File};
use std::io::{BufReader, BufWriter, Write};
use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::ranges::find_subranges;
use crate::record::ImageRecord;

/// Current persisted collection format version
const COLLECTION_VERSION: u32 = 1;

/// Default file name of a diffraction image collection inside an output directory
pub const COLLECTION_FILENAME: &str = "diffraction-images.json";

#[derive(Debug, thiserror::Error)]
pub enum CollectionError {
    #[error("collection {} is already written; no more records can be appended", .0.display())]
    AlreadyWritten(PathBuf),

    #[error("record id {0} is already in the collection")]
    DuplicateId(u64),

    #[error("record {0} has an empty file name")]
    EmptyFileName(u64),

    #[error("record {id}: {field} is not a finite number")]
    NonFinite { id: u64, field: &'static str },

    #[error("unsupported collection version {found} (expected {expected})")]
    Version { found: u32, expected: u32 },

    #[error("I/O error on {}", path.display())]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("invalid collection file: {0}")]
    Json(#[from] serde_json::Error),
}

fn io_err(path: &Path) -> impl FnOnce(std::io::Error) -> CollectionError + '_ {
    move |source| CollectionError::Io {
        path: path.to_path_buf(),
        source,
    }
}

fn save(stored: &StoredCollection, temp_path: &Path, path: &Path) -> Result<(), CollectionError> {
    let file = File::create(temp_path).map_err(io_err(temp_path))?;
    let mut writer = BufWriter::new(file);
    serde_json::to_writer_pretty(&mut writer, stored)?;
    writer.flush().map_err(io_err(temp_path))?;
    fs::rename(temp_path, path).map_err(io_err(path))
}

/// Where a collection is in its lifecycle. Closing consumes the collection.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CollectionState {
    Empty,
    Populated,
    Written,
}

/// Acquisition values shared by every image of a collection, plus paths to
/// artifacts produced by later processing steps.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct CollectionInfo {
    pub pixel_size_x: Option<f64>,
    pub pixel_size_y: Option<f64>,
    pub dim_x: Option<u32>,
    pub dim_y: Option<u32>,
    pub wavelength: Option<f64>,
    pub skip_images: Option<u64>,
    pub model_file: Option<PathBuf>,
    pub reflections_file: Option<PathBuf>,
    pub report_file: Option<PathBuf>,
}

/// On-disk form of a collection.
#[derive(Debug, Serialize, Deserialize)]
struct StoredCollection {
    version: u32,
    timestamp: DateTime<Utc>,
    info: CollectionInfo,
    records: Vec<ImageRecord>,
}

/// Ordered set of image records persisted as one JSON document.
#[derive(Debug)]
pub struct ImageCollection {
    path: PathBuf,
    info: CollectionInfo,
    records: Vec<ImageRecord>,
    ids: HashSet<u64>,
    state: CollectionState,
}

impl ImageCollection {
    /// Start an empty collection at `path`, deleting any collection already stored there.
    pub fn create(path: &Path) -> Result<Self, CollectionError> {
        if path.exists() {
            fs::remove_file(path).map_err(io_err(path))?;
        }
        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            fs::create_dir_all(parent).map_err(io_err(parent))?;
        }
        Ok(Self {
            path: path.to_path_buf(),
            info: CollectionInfo::default(),
            records: Vec::new(),
            ids: HashSet::new(),
            state: CollectionState::Empty,
        })
    }

    /// Reopen a written collection.
    pub fn open(path: &Path) -> Result<Self, CollectionError> {
        let file = File::open(path).map_err(io_err(path))?;
        let stored: StoredCollection = serde_json::from_reader(BufReader::new(file))?;
        if stored.version != COLLECTION_VERSION {
            return Err(CollectionError::Version {
                found: stored.version,
                expected: COLLECTION_VERSION,
            });
        }

        let mut ids = HashSet::with_capacity(stored.records.len());
        for r in &stored.records {
            if !ids.insert(r.id) {
                return Err(CollectionError::DuplicateId(r.id));
            }
        }

        Ok(Self {
            path: path.to_path_buf(),
            info: stored.info,
            records: stored.records,
            ids,
            state: CollectionState::Written,
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn state(&self) -> CollectionState {
        self.state
    }

    pub fn info(&self) -> &CollectionInfo {
        &self.info
    }

    pub fn info_mut(&mut self) -> &mut CollectionInfo {
        &mut self.info
    }

    pub fn set_skip_images(&mut self, skip: Option<u64>) {
        self.info.skip_images = skip;
    }

    /// Add a record under its own id.
    ///
    /// The first record carrying pixel size, dimensions or wavelength also fills
    /// those collection-level values when they are still unset.
    pub fn append(&mut self, record: ImageRecord) -> Result<(), CollectionError> {
        if self.state == CollectionState::Written {
            return Err(CollectionError::AlreadyWritten(self.path.clone()));
        }
        if record.file_name.as_os_str().is_empty() {
            return Err(CollectionError::EmptyFileName(record.id));
        }
        if let Some(field) = record.non_finite_field() {
            return Err(CollectionError::NonFinite {
                id: record.id,
                field,
            });
        }
        if !self.ids.insert(record.id) {
            return Err(CollectionError::DuplicateId(record.id));
        }

        let info = &mut self.info;
        info.pixel_size_x = info.pixel_size_x.or(record.pixel_size_x);
        info.pixel_size_y = info.pixel_size_y.or(record.pixel_size_y);
        info.dim_x = info.dim_x.or(record.dim_x);
        info.dim_y = info.dim_y.or(record.dim_y);
        info.wavelength = info.wavelength.or(record.wavelength);

        self.records.push(record);
        self.state = CollectionState::Populated;
        Ok(())
    }

    /// Flush every record to disk. Writes to a temp file first, then renames.
    pub fn write(&mut self) -> Result<(), CollectionError> {
        let stored = StoredCollection {
            version: COLLECTION_VERSION,
            timestamp: Utc::now(),
            info: self.info.clone(),
            records: std::mem::take(&mut self.records),
        };

        let result = save(&stored, &self.temp_path(), &self.path);
        self.records = stored.records;
        result?;

        log::debug!("wrote {} records to {}", self.records.len(), self.path.display());
        self.state = CollectionState::Written;
        Ok(())
    }

    /// Release the collection. Further use requires [`ImageCollection::open`].
    pub fn close(self) {
        log::debug!("closed {}", self.path.display());
    }

    fn temp_path(&self) -> PathBuf {
        let mut name = self
            .path
            .file_name()
            .map(|n| n.to_os_string())
            .unwrap_or_default();
        name.push(".tmp");
        self.path.with_file_name(name)
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    /// Records in insertion order.
    pub fn iter(&self) -> std::slice::Iter<'_, ImageRecord> {
        self.records.iter()
    }

    pub fn get(&self, id: u64) -> Option<&ImageRecord> {
        self.records.iter().find(|r| r.id == id)
    }

    /// Distinct file paths referenced by the records.
    pub fn files(&self) -> BTreeSet<PathBuf> {
        self.records.iter().map(|r| r.file_name.clone()).collect()
    }

    /// Copy pixel size, dimensions and wavelength from another collection.
    pub fn copy_info(&mut self, other: &ImageCollection) {
        self.info.pixel_size_x = other.info.pixel_size_x;
        self.info.pixel_size_y = other.info.pixel_size_y;
        self.info.dim_x = other.info.dim_x;
        self.info.dim_y = other.info.dim_y;
        self.info.wavelength = other.info.wavelength;
    }

    /// Runs of consecutive ids carrying the ignore flag.
    pub fn ignored_ranges(&self) -> Vec<(u64, u64)> {
        let mut ids: Vec<u64> = self
            .records
            .iter()
            .filter(|r| r.ignore)
            .map(|r| r.id)
            .collect();
        ids.sort_unstable();
        find_subranges(&ids)
    }
}

impl<'a> IntoIterator for &'a ImageCollection {
    type Item = &'a ImageRecord;
    type IntoIter = std::slice::Iter<'a, ImageRecord>;

    fn into_iter(self) -> Self::IntoIter {
        self.iter()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    fn sample_record(i: u64) -> ImageRecord {
        let mut r = ImageRecord::new(i, format!("/data/experiment01/images/img{:04}.img", i));
        r.set_pixel_size(0.055);
        r.set_dim(516);
        r.wavelength = Some(0.0251);
        r.distance = Some(532.2773);
        r.set_oscillation(-33.9, 0.3512);
        r.beam_center_x = Some(219.7);
        r.beam_center_y = Some(226.65);
        r.exposure_time = Some(0.3);
        r.two_theta = Some(0.0);
        r
    }

    #[test]
    fn test_round_trip() {
        let dir = tempdir().unwrap();
        let path = dir.path().join(COLLECTION_FILENAME);

        let mut set = ImageCollection::create(&path).unwrap();
        assert_eq!(set.state(), CollectionState::Empty);
        let originals: Vec<ImageRecord> = (1..=100).map(sample_record).collect();
        for r in &originals {
            set.append(r.clone()).unwrap();
        }
        assert_eq!(set.state(), CollectionState::Populated);
        set.write().unwrap();
        assert_eq!(set.state(), CollectionState::Written);
        set.close();

        let reopened = ImageCollection::open(&path).unwrap();
        assert_eq!(reopened.len(), 100);
        for (a, b) in reopened.iter().zip(originals.iter()) {
            assert_eq!(a, b);
        }
        assert_eq!(reopened.info().pixel_size_x, Some(0.055));
        assert_eq!(reopened.info().dim_y, Some(516));
        assert_eq!(reopened.info().wavelength, Some(0.0251));
    }

    #[test]
    fn test_append_after_write_is_rejected() {
        let dir = tempdir().unwrap();
        let mut set = ImageCollection::create(&dir.path().join("set.json")).unwrap();
        set.append(sample_record(1)).unwrap();
        set.write().unwrap();

        let err = set.append(sample_record(2)).unwrap_err();
        assert!(matches!(err, CollectionError::AlreadyWritten(_)));
        assert_eq!(set.len(), 1);
    }

    #[test]
    fn test_duplicate_id_and_empty_name() {
        let dir = tempdir().unwrap();
        let mut set = ImageCollection::create(&dir.path().join("set.json")).unwrap();
        set.append(sample_record(7)).unwrap();
        assert!(matches!(
            set.append(sample_record(7)).unwrap_err(),
            CollectionError::DuplicateId(7)
        ));
        assert!(matches!(
            set.append(ImageRecord::new(8, "")).unwrap_err(),
            CollectionError::EmptyFileName(8)
        ));
        assert_eq!(set.len(), 1);
    }

    #[test]
    fn test_non_finite_values_are_rejected() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("set.json");
        let mut set = ImageCollection::create(&path).unwrap();

        let mut r = sample_record(1);
        r.set_rotation_axis([f64::INFINITY, 0.0, 1.0]);
        assert!(matches!(
            set.append(r).unwrap_err(),
            CollectionError::NonFinite { id: 1, field: "rotation_axis" }
        ));
        let mut r = sample_record(2);
        r.distance = Some(f64::NAN);
        assert!(set.append(r).is_err());

        // rejected ids stay free
        set.append(sample_record(1)).unwrap();
        set.write().unwrap();
        assert_eq!(ImageCollection::open(&path).unwrap().len(), 1);
    }

    #[test]
    fn test_create_replaces_existing() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("set.json");
        let mut set = ImageCollection::create(&path).unwrap();
        set.append(sample_record(1)).unwrap();
        set.write().unwrap();

        let mut fresh = ImageCollection::create(&path).unwrap();
        assert!(!path.exists());
        fresh.write().unwrap();
        assert!(ImageCollection::open(&path).unwrap().is_empty());
    }

    #[test]
    fn test_files_are_distinct() {
        let dir = tempdir().unwrap();
        let mut set = ImageCollection::create(&dir.path().join("set.json")).unwrap();
        for i in 0..4u32 {
            let mut r = ImageRecord::new(u64::from(i) + 1, "/data/stack.mrcs");
            r.index = Some(i);
            set.append(r).unwrap();
        }
        set.append(ImageRecord::new(10, "/data/other.img")).unwrap();

        let files = set.files();
        assert_eq!(files.len(), 2);
        assert!(files.contains(Path::new("/data/stack.mrcs")));
    }

    #[test]
    fn test_ignored_ranges_and_lookup() {
        let dir = tempdir().unwrap();
        let mut set = ImageCollection::create(&dir.path().join("set.json")).unwrap();
        for i in [5u64, 1, 2, 3, 9] {
            let mut r = ImageRecord::new(i, format!("/d/{}.img", i));
            r.ignore = i != 9;
            set.append(r).unwrap();
        }
        assert_eq!(set.ignored_ranges(), vec![(1, 3), (5, 5)]);
        assert_eq!(set.get(9).unwrap().file_name, PathBuf::from("/d/9.img"));
        assert!(set.get(4).is_none());
        // insertion order is kept
        let ids: Vec<u64> = set.iter().map(|r| r.id).collect();
        assert_eq!(ids, vec![5, 1, 2, 3, 9]);
    }

    #[test]
    fn test_copy_info_and_partial_aggregates() {
        let dir = tempdir().unwrap();
        let mut a = ImageCollection::create(&dir.path().join("a.json")).unwrap();
        a.append(ImageRecord::new(1, "/d/1.mrc")).unwrap();
        a.append(sample_record(2)).unwrap();
        assert_eq!(a.info().pixel_size_x, Some(0.055));

        let mut b = ImageCollection::create(&dir.path().join("b.json")).unwrap();
        b.copy_info(&a);
        assert_eq!(b.info().dim_x, Some(516));
        assert_eq!(b.info().wavelength, Some(0.0251));
        assert_eq!(b.info().skip_images, None);
    }

    #[test]
    fn test_rejects_unknown_version() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("set.json");
        fs::write(
            &path,
            r#"{"version": 99, "timestamp": "2024-01-01T00:00:00Z", "info": {}, "records": []}"#,
        )
        .unwrap();
        assert!(matches!(
            ImageCollection::open(&path).unwrap_err(),
            CollectionError::Version { found: 99, .. }
        ));
    }
}
