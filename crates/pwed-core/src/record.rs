use std::collections::BTreeSet;
use std::path::{Path, PathBuf};
use std::str::FromStr;

use chrono::NaiveDateTime;
use serde::{Deserialize, Serialize};

use crate::error::ImportError;
use crate::overrides::HeaderOverrides;
use crate::pattern::MatchedFile;
use crate::smv::{self, HeaderFieldMap, HeaderKey};

/// Extensions whose files carry an SMV header.
const SMV_EXTENSIONS: &[&str] = &["img", "smv"];

/// Formats seen in the DATE field of SMV headers.
const DATE_FORMATS: &[&str] = &["%Y-%m-%d %H:%M:%S%.f", "%a %b %e %H:%M:%S %Y"];

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Detector {
    pub serial_number: Option<String>,
    pub beamline: Option<String>,
}

/// Results attached by a spot-finding step.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct SpotExtension {
    pub spot_count: Option<u64>,
    pub spots_file: Option<PathBuf>,
}

/// Results attached by an indexing step.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct IndexingExtension {
    pub space_group_number: Option<u32>,
    /// a, b, c, alpha, beta, gamma
    pub unit_cell: Option<[f64; 6]>,
    pub indexed_file: Option<PathBuf>,
}

/// A header field that could not be turned into a record value.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FieldDiagnostic {
    pub field: String,
    /// Raw value, `None` when the field was absent
    pub value: Option<String>,
    pub message: String,
}

/// Metadata of one diffraction image.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ImageRecord {
    /// Object id inside the owning collection
    pub id: u64,
    /// Position inside a multi-image stack; `None` for standalone files
    pub index: Option<u32>,
    pub file_name: PathBuf,
    /// Detector distance (mm)
    pub distance: Option<f64>,
    /// Oscillation start (degrees)
    pub osc_start: Option<f64>,
    /// Oscillation range (degrees)
    pub osc_range: Option<f64>,
    /// Beam centre (pixels)
    pub beam_center_x: Option<f64>,
    pub beam_center_y: Option<f64>,
    /// Exposure time (s)
    pub exposure_time: Option<f64>,
    pub two_theta: Option<f64>,
    /// Pixel size (mm)
    pub pixel_size_x: Option<f64>,
    pub pixel_size_y: Option<f64>,
    pub dim_x: Option<u32>,
    pub dim_y: Option<u32>,
    /// Wavelength (Å)
    pub wavelength: Option<f64>,
    pub rotation_axis: Option<[f64; 3]>,
    pub ignore: bool,
    pub collection_time: Option<NaiveDateTime>,
    pub detector: Option<Detector>,
    pub spots: Option<SpotExtension>,
    pub indexing: Option<IndexingExtension>,
    pub diagnostics: Vec<FieldDiagnostic>,
}

impl ImageRecord {
    pub fn new(id: u64, file_name: impl Into<PathBuf>) -> Self {
        Self {
            id,
            file_name: file_name.into(),
            ..Default::default()
        }
    }

    pub fn location(&self) -> (Option<u32>, &Path) {
        (self.index, &self.file_name)
    }

    pub fn set_location(&mut self, index: Option<u32>, file_name: impl Into<PathBuf>) {
        self.index = index;
        self.file_name = file_name.into();
    }

    pub fn base_name(&self) -> Option<&str> {
        self.file_name.file_name().and_then(|n| n.to_str())
    }

    pub fn extension(&self) -> Option<&str> {
        self.file_name.extension().and_then(|e| e.to_str())
    }

    pub fn oscillation(&self) -> (Option<f64>, Option<f64>) {
        (self.osc_start, self.osc_range)
    }

    pub fn set_oscillation(&mut self, start: f64, range: f64) {
        self.osc_start = Some(start);
        self.osc_range = Some(range);
    }

    pub fn beam_center(&self) -> (Option<f64>, Option<f64>) {
        (self.beam_center_x, self.beam_center_y)
    }

    /// Beam centre converted to millimetres with the pixel size.
    pub fn beam_center_mm(&self) -> Option<(f64, f64)> {
        Some((
            self.beam_center_x? * self.pixel_size_x?,
            self.beam_center_y? * self.pixel_size_y?,
        ))
    }

    /// Pixel size, assumed equal along X and Y.
    pub fn pixel_size(&self) -> Option<f64> {
        self.pixel_size_x
    }

    pub fn set_pixel_size(&mut self, value: f64) {
        self.pixel_size_x = Some(value);
        self.pixel_size_y = Some(value);
    }

    pub fn dim(&self) -> (Option<u32>, Option<u32>) {
        (self.dim_x, self.dim_y)
    }

    /// Sets both dimensions; non-square detectors are not represented.
    pub fn set_dim(&mut self, value: u32) {
        self.dim_x = Some(value);
        self.dim_y = Some(value);
    }

    pub fn set_rotation_axis(&mut self, axis: [f64; 3]) {
        self.rotation_axis = Some(axis);
    }

    pub fn files(&self) -> BTreeSet<PathBuf> {
        BTreeSet::from([self.file_name.clone()])
    }

    /// True when at least one header field could not be used.
    pub fn is_partial(&self) -> bool {
        !self.diagnostics.is_empty()
    }

    /// Name of the first float field holding NaN or an infinity, which JSON cannot store.
    pub fn non_finite_field(&self) -> Option<&'static str> {
        let scalars = [
            ("distance", self.distance),
            ("osc_start", self.osc_start),
            ("osc_range", self.osc_range),
            ("beam_center_x", self.beam_center_x),
            ("beam_center_y", self.beam_center_y),
            ("exposure_time", self.exposure_time),
            ("two_theta", self.two_theta),
            ("pixel_size_x", self.pixel_size_x),
            ("pixel_size_y", self.pixel_size_y),
            ("wavelength", self.wavelength),
        ];
        let bad = |v: &f64| !v.is_finite();
        scalars
            .iter()
            .find(|(_, v)| v.as_ref().map_or(false, bad))
            .map(|(name, _)| *name)
            .or_else(|| {
                self.rotation_axis
                    .filter(|axis| axis.iter().any(bad))
                    .map(|_| "rotation_axis")
            })
            .or_else(|| {
                self.indexing
                    .as_ref()
                    .and_then(|ix| ix.unit_cell)
                    .filter(|cell| cell.iter().any(bad))
                    .map(|_| "unit_cell")
            })
    }
}

/// Parse `"x,y,z"` into a rotation axis.
pub fn parse_rotation_axis(text: &str) -> Result<[f64; 3], ImportError> {
    let parts: Vec<&str> = text.split(',').map(str::trim).collect();
    let [x, y, z] = parts.as_slice() else {
        return Err(ImportError::RotationAxisParse(text.to_string()));
    };
    let parse = |s: &str| match s.parse::<f64>() {
        Ok(v) if v.is_finite() => Ok(v),
        _ => Err(ImportError::RotationAxisParse(text.to_string())),
    };
    Ok([parse(*x)?, parse(*y)?, parse(*z)?])
}

pub fn is_smv_file(path: &Path) -> bool {
    path.extension()
        .and_then(|e| e.to_str())
        .map_or(false, |ext| {
            SMV_EXTENSIONS.iter().any(|known| ext.eq_ignore_ascii_case(known))
        })
}

fn parse_collection_time(text: &str) -> Option<NaiveDateTime> {
    DATE_FORMATS
        .iter()
        .find_map(|fmt| NaiveDateTime::parse_from_str(text.trim(), fmt).ok())
}

/// Coerces header values one field at a time, collecting failures instead of stopping.
struct FieldReader<'a> {
    header: &'a HeaderFieldMap,
    file: &'a Path,
    diagnostics: Vec<FieldDiagnostic>,
}

impl<'a> FieldReader<'a> {
    fn new(header: &'a HeaderFieldMap, file: &'a Path) -> Self {
        Self {
            header,
            file,
            diagnostics: Vec::new(),
        }
    }

    fn coerce<T: FromStr>(&self, key: HeaderKey) -> Result<Option<T>, ImportError> {
        let Some(raw) = self.header.get(key) else {
            return Ok(None);
        };
        raw.parse::<T>()
            .map(Some)
            .map_err(|_| ImportError::FieldCoercion {
                field: key.to_string(),
                value: raw.to_string(),
                expected: std::any::type_name::<T>(),
            })
    }

    fn take<T: FromStr>(&mut self, key: HeaderKey) -> Option<T> {
        match self.coerce::<T>(key) {
            Ok(Some(value)) => Some(value),
            Ok(None) => {
                log::warn!("{}: header field {} missing", self.file.display(), key);
                self.diagnostics.push(FieldDiagnostic {
                    field: key.to_string(),
                    value: None,
                    message: "missing".to_string(),
                });
                None
            }
            Err(e) => {
                log::warn!("{}: {}", self.file.display(), e);
                self.diagnostics.push(FieldDiagnostic {
                    field: key.to_string(),
                    value: self.header.get(key).map(str::to_string),
                    message: e.to_string(),
                });
                None
            }
        }
    }

    /// Like [`FieldReader::take`], rejecting NaN and infinities.
    fn take_f64(&mut self, key: HeaderKey) -> Option<f64> {
        let value = self.take::<f64>(key)?;
        if value.is_finite() {
            return Some(value);
        }
        log::warn!("{}: header field {} is not finite ({})", self.file.display(), key, value);
        self.diagnostics.push(FieldDiagnostic {
            field: key.to_string(),
            value: self.header.get(key).map(str::to_string),
            message: "not a finite number".to_string(),
        });
        None
    }

    fn take_time(&mut self) -> Option<NaiveDateTime> {
        let raw = self.header.get(HeaderKey::Date)?;
        let parsed = parse_collection_time(raw);
        if parsed.is_none() {
            log::warn!("{}: unrecognised DATE {:?}", self.file.display(), raw);
            self.diagnostics.push(FieldDiagnostic {
                field: HeaderKey::Date.to_string(),
                value: Some(raw.to_string()),
                message: "unrecognised date format".to_string(),
            });
        }
        parsed
    }
}

/// Builds one [`ImageRecord`] per matched file.
#[derive(Debug, Clone, Default)]
pub struct RecordBuilder {
    skip_images: Option<u64>,
    rotation_axis: Option<[f64; 3]>,
    overrides: HeaderOverrides,
    strict_headers: bool,
}

impl RecordBuilder {
    pub fn new(overrides: HeaderOverrides) -> Self {
        Self {
            overrides,
            ..Default::default()
        }
    }

    /// Every image whose id is a multiple of `skip` gets the ignore flag.
    pub fn with_skip_images(mut self, skip: Option<u64>) -> Self {
        self.skip_images = skip.filter(|&s| s != 0);
        self
    }

    /// Fixed rotation axis for every record. A malformed value is logged and dropped.
    pub fn with_rotation_axis(mut self, axis: Option<&str>) -> Self {
        self.rotation_axis = axis.and_then(|text| match parse_rotation_axis(text) {
            Ok(axis) => Some(axis),
            Err(e) => {
                log::warn!("{}; rotation axis left unset", e);
                None
            }
        });
        self
    }

    /// Propagate malformed headers instead of importing the file without header values.
    pub fn with_strict_headers(mut self, strict: bool) -> Self {
        self.strict_headers = strict;
        self
    }

    pub fn rotation_axis(&self) -> Option<[f64; 3]> {
        self.rotation_axis
    }

    pub fn build(&self, file: &MatchedFile) -> Result<ImageRecord, ImportError> {
        let mut record = ImageRecord::new(file.image_id, &file.path);
        if let Some(skip) = self.skip_images {
            record.ignore = file.image_id % skip == 0;
        }
        if let Some(axis) = self.rotation_axis {
            record.set_rotation_axis(axis);
        }

        if is_smv_file(&file.path) {
            match smv::read_header(&file.path) {
                Ok(raw) => {
                    let header = self.overrides.apply(&raw);
                    self.fill_from_header(&mut record, &header);
                }
                Err(e @ ImportError::MalformedHeader { .. }) if !self.strict_headers => {
                    log::warn!("{}; importing without header values", e);
                }
                Err(e) => return Err(e),
            }
        }
        log::debug!("built record {} for {}", record.id, record.file_name.display());
        Ok(record)
    }

    /// Assign every known header field to the record, each one independently.
    pub fn fill_from_header(&self, record: &mut ImageRecord, header: &HeaderFieldMap) {
        let file = record.file_name.clone();
        let mut fields = FieldReader::new(header, &file);

        if let Some(v) = fields.take_f64(HeaderKey::PixelSize) {
            record.set_pixel_size(v);
        }
        // SIZE1 only: both dimensions share it
        if let Some(v) = fields.take::<u32>(HeaderKey::Size1) {
            record.set_dim(v);
        }
        record.wavelength = fields.take_f64(HeaderKey::Wavelength);
        record.distance = fields.take_f64(HeaderKey::Distance);
        record.osc_start = fields.take_f64(HeaderKey::OscStart);
        record.osc_range = fields.take_f64(HeaderKey::OscRange);
        record.beam_center_x = fields.take_f64(HeaderKey::BeamCenterX);
        record.beam_center_y = fields.take_f64(HeaderKey::BeamCenterY);
        record.exposure_time = fields.take_f64(HeaderKey::Time);
        record.two_theta = fields.take_f64(HeaderKey::TwoTheta);
        record.collection_time = fields.take_time();

        let serial_number = header.get(HeaderKey::DetectorSn).map(str::to_string);
        let beamline = header.get(HeaderKey::Beamline).map(str::to_string);
        if serial_number.is_some() || beamline.is_some() {
            record.detector = Some(Detector {
                serial_number,
                beamline,
            });
        }

        record.diagnostics.extend(fields.diagnostics);
    }
}
