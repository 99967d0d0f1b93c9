//! Reader for the ASCII header block at the start of SMV (`.img`) diffraction images.
//!
//! The first [`PREAMBLE_LEN`] bytes hold the opening brace and the `HEADER_BYTES=<n>;`
//! declaration on the second line. The `n` bytes that follow are the header body:
//! `KEY=VALUE;` records terminated by a line made of a single `}`.

use std::collections::BTreeMap;
use std::fmt;
use std::fs::File;
use std::io::Read;
use std::path::Path;

use crate::error::ImportError;

/// Size of the fixed preamble that carries the HEADER_BYTES declaration.
pub const PREAMBLE_LEN: usize = 45;

const HEADER_BYTES_KEY: &str = "HEADER_BYTES";

/// Header fields the importer knows how to interpret.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum HeaderKey {
    Size1,
    Size2,
    PixelSize,
    Wavelength,
    Distance,
    OscStart,
    OscRange,
    BeamCenterX,
    BeamCenterY,
    Time,
    TwoTheta,
    Date,
    DetectorSn,
    Beamline,
}

impl HeaderKey {
    pub const ALL: [HeaderKey; 14] = [
        HeaderKey::Size1,
        HeaderKey::Size2,
        HeaderKey::PixelSize,
        HeaderKey::Wavelength,
        HeaderKey::Distance,
        HeaderKey::OscStart,
        HeaderKey::OscRange,
        HeaderKey::BeamCenterX,
        HeaderKey::BeamCenterY,
        HeaderKey::Time,
        HeaderKey::TwoTheta,
        HeaderKey::Date,
        HeaderKey::DetectorSn,
        HeaderKey::Beamline,
    ];

    /// Key as it is spelled in the header text.
    pub fn as_str(self) -> &'static str {
        match self {
            HeaderKey::Size1 => "SIZE1",
            HeaderKey::Size2 => "SIZE2",
            HeaderKey::PixelSize => "PIXEL_SIZE",
            HeaderKey::Wavelength => "WAVELENGTH",
            HeaderKey::Distance => "DISTANCE",
            HeaderKey::OscStart => "OSC_START",
            HeaderKey::OscRange => "OSC_RANGE",
            HeaderKey::BeamCenterX => "BEAM_CENTER_X",
            HeaderKey::BeamCenterY => "BEAM_CENTER_Y",
            HeaderKey::Time => "TIME",
            HeaderKey::TwoTheta => "TWOTHETA",
            HeaderKey::Date => "DATE",
            HeaderKey::DetectorSn => "DETECTOR_SN",
            HeaderKey::Beamline => "BEAMLINE",
        }
    }

    pub fn from_name(name: &str) -> Option<Self> {
        Self::ALL.into_iter().find(|k| k.as_str() == name)
    }
}

impl fmt::Display for HeaderKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Raw key/value pairs of one header block.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct HeaderFieldMap {
    fields: BTreeMap<String, String>,
}

impl HeaderFieldMap {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self, key: HeaderKey) -> Option<&str> {
        self.get_raw(key.as_str())
    }

    pub fn get_raw(&self, key: &str) -> Option<&str> {
        self.fields.get(key).map(String::as_str)
    }

    pub fn insert(&mut self, key: impl Into<String>, value: impl Into<String>) {
        self.fields.insert(key.into(), value.into());
    }

    pub fn len(&self) -> usize {
        self.fields.len()
    }

    pub fn is_empty(&self) -> bool {
        self.fields.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &str)> {
        self.fields.iter().map(|(k, v)| (k.as_str(), v.as_str()))
    }
}

impl FromIterator<(String, String)> for HeaderFieldMap {
    fn from_iter<I: IntoIterator<Item = (String, String)>>(iter: I) -> Self {
        Self {
            fields: iter.into_iter().collect(),
        }
    }
}

/// Decode bytes as ASCII, dropping anything outside the 7-bit range.
fn decode_ascii(bytes: &[u8]) -> String {
    bytes
        .iter()
        .filter(|b| b.is_ascii())
        .map(|&b| b as char)
        .collect()
}

/// Extract the declared header body size from the preamble text.
fn parse_header_bytes(preamble: &str) -> Result<usize, String> {
    let line = preamble
        .split('\n')
        .nth(1)
        .ok_or_else(|| "preamble has no HEADER_BYTES line".to_string())?;
    let (key, value) = line
        .split_once('=')
        .ok_or_else(|| format!("expected HEADER_BYTES=<n>; got {:?}", line))?;
    if key.trim() != HEADER_BYTES_KEY {
        return Err(format!("expected {} on the second line, got {:?}", HEADER_BYTES_KEY, key.trim()));
    }
    let value = value.replace(';', "");
    value
        .trim()
        .parse::<usize>()
        .map_err(|_| format!("HEADER_BYTES value {:?} is not an integer", value.trim()))
}

/// Split the header body into key/value pairs.
pub fn parse_header_body(body: &str) -> HeaderFieldMap {
    let mut map = HeaderFieldMap::new();
    for record in body.split('\n') {
        // end of header
        if record == "}" {
            break;
        }
        let Some((key, value)) = record.split_once('=') else {
            continue;
        };
        map.insert(key.replace(';', "").trim(), value.replace(';', "").trim());
    }
    map
}

/// Read and parse the header of an SMV image.
pub fn read_header(path: &Path) -> Result<HeaderFieldMap, ImportError> {
    let file = File::open(path).map_err(|e| ImportError::io(path, e))?;
    let mut reader = std::io::BufReader::new(file);

    let mut preamble = Vec::with_capacity(PREAMBLE_LEN);
    (&mut reader)
        .take(PREAMBLE_LEN as u64)
        .read_to_end(&mut preamble)
        .map_err(|e| ImportError::io(path, e))?;

    let header_size = parse_header_bytes(&decode_ascii(&preamble))
        .map_err(|reason| ImportError::malformed(path, reason))?;

    let mut body = vec![0u8; header_size];
    reader
        .read_exact(&mut body)
        .map_err(|e| ImportError::io(path, e))?;

    Ok(parse_header_body(&decode_ascii(&body)))
}

/// Same as [`read_header`] over an in-memory image.
pub fn parse_header_from_bytes(bytes: &[u8]) -> Result<HeaderFieldMap, String> {
    let preamble_end = bytes.len().min(PREAMBLE_LEN);
    let header_size = parse_header_bytes(&decode_ascii(&bytes[..preamble_end]))?;
    let body = bytes
        .get(preamble_end..preamble_end + header_size)
        .ok_or_else(|| format!("image is shorter than the declared {} header bytes", header_size))?;
    Ok(parse_header_body(&decode_ascii(body)))
}

/// Build an SMV image for tests: header text padded to `HEADER_BYTES`, then pixel bytes.
#[cfg(test)]
pub(crate) fn smv_fixture(fields: &[(&str, &str)]) -> Vec<u8> {
    const HEADER: usize = 512;
    let mut text = format!("{{\n{}={:5};\nDIM=2;\nBYTE_ORDER=little_endian;\n", HEADER_BYTES_KEY, HEADER);
    for (k, v) in fields {
        text.push_str(&format!("{}={};\n", k, v));
    }
    text.push_str("}\n");
    let mut bytes = text.into_bytes();
    assert!(bytes.len() <= HEADER, "fixture header too long");
    bytes.resize(HEADER, b' ');
    bytes.extend(std::iter::repeat(0u8).take(HEADER));
    bytes
}
