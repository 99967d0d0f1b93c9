use serde::{Deserialize, Serialize};

use crate::smv::{HeaderFieldMap, HeaderKey};

/// User-corrected header values. Each non-empty entry replaces the value parsed
/// from the image header before numeric coercion.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct HeaderOverrides {
    pub size1: Option<String>,
    pub size2: Option<String>,
    pub pixel_size: Option<String>,
    pub exposure_time: Option<String>,
    pub detector_distance: Option<String>,
    pub osc_start: Option<String>,
    pub osc_range: Option<String>,
    pub wavelength: Option<String>,
    pub beam_center_x: Option<String>,
    pub beam_center_y: Option<String>,
}

impl HeaderOverrides {
    /// Overrides that are set and non-blank, paired with the header key they replace.
    pub fn pairs(&self) -> Vec<(HeaderKey, &str)> {
        [
            (HeaderKey::Size1, &self.size1),
            (HeaderKey::Size2, &self.size2),
            (HeaderKey::PixelSize, &self.pixel_size),
            (HeaderKey::Time, &self.exposure_time),
            (HeaderKey::Distance, &self.detector_distance),
            (HeaderKey::OscStart, &self.osc_start),
            (HeaderKey::OscRange, &self.osc_range),
            (HeaderKey::Wavelength, &self.wavelength),
            (HeaderKey::BeamCenterX, &self.beam_center_x),
            (HeaderKey::BeamCenterY, &self.beam_center_y),
        ]
        .into_iter()
        .filter_map(|(key, value)| {
            let value = value.as_deref()?.trim();
            (!value.is_empty()).then_some((key, value))
        })
        .collect()
    }

    pub fn is_empty(&self) -> bool {
        self.pairs().is_empty()
    }

    /// Copy of `raw` with every configured override applied.
    pub fn apply(&self, raw: &HeaderFieldMap) -> HeaderFieldMap {
        let mut effective = raw.clone();
        for (key, value) in self.pairs() {
            effective.insert(key.as_str(), value);
        }
        effective
    }
}
