use std::fmt::Write as _;
use std::fs;
use std::path::{Path, PathBuf};
use std::process::Command;

use anyhow::{bail, Context};
use serde::{Deserialize, Serialize};

pub const XSCALE_INPUT: &str = "XSCALE.INP";
pub const DEFAULT_OUTPUT_NAME: &str = "MERGED.HKL";
pub const DEFAULT_PROGRAM: &str = "xscale";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ExportFileType {
    #[serde(rename = "XDS_ASCII")]
    XdsAscii,
}

/// Reflection file produced by a processing step.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExportFile {
    pub path: PathBuf,
    pub file_type: ExportFileType,
}

/// Scaling and merging of XDS_ASCII reflection files with xscale.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct XscaleJob {
    pub input_files: Vec<PathBuf>,
    pub output_name: String,
    /// Six cell constants, passed through as text
    pub unit_cell: Option<String>,
    pub space_group_number: Option<u32>,
    pub d_min: Option<f64>,
    pub d_max: Option<f64>,
    pub save_correction_images: bool,
}

impl Default for XscaleJob {
    fn default() -> Self {
        Self {
            input_files: Vec::new(),
            output_name: DEFAULT_OUTPUT_NAME.to_string(),
            unit_cell: None,
            space_group_number: None,
            d_min: None,
            d_max: None,
            save_correction_images: false,
        }
    }
}

impl XscaleJob {
    pub fn new(input_files: Vec<PathBuf>) -> Self {
        Self {
            input_files,
            ..Default::default()
        }
    }

    /// `(d_min, d_max)` when both limits are set and ordered.
    pub fn resolution(&self) -> Option<(f64, f64)> {
        match (self.d_min, self.d_max) {
            (Some(d_min), Some(d_max)) if d_min < d_max => Some((d_min, d_max)),
            (Some(d_min), Some(d_max)) => {
                log::warn!(
                    "ignoring resolution limits: d_min {} is not below d_max {}",
                    d_min,
                    d_max
                );
                None
            }
            _ => None,
        }
    }

    pub fn render_input(&self) -> String {
        let mut out = String::new();
        let save = if self.save_correction_images { "TRUE" } else { "FALSE" };
        // writeln! into a String cannot fail
        let _ = writeln!(out, "SAVE_CORRECTION_IMAGES= {}", save);
        if let Some(sg) = self.space_group_number {
            let _ = writeln!(out, "SPACE_GROUP_NUMBER= {}", sg);
        }
        if let Some(cell) = self.unit_cell.as_deref().filter(|c| !c.trim().is_empty()) {
            let _ = writeln!(out, "UNIT_CELL_CONSTANTS= {}", cell.trim());
        }
        out.push('\n');
        let _ = writeln!(out, "OUTPUT_FILE= {}", self.output_name);
        out.push('\n');

        let resolution = self.resolution();
        for file in &self.input_files {
            let _ = writeln!(out, "    INPUT_FILE= {}", file.display());
            if let Some((d_min, d_max)) = resolution {
                let _ = writeln!(out, "    INCLUDE_RESOLUTION_RANGE= {} {}", d_max, d_min);
            }
            out.push('\n');
        }
        out
    }

    pub fn write_input(&self, dir: &Path) -> anyhow::Result<PathBuf> {
        fs::create_dir_all(dir).with_context(|| format!("creating {}", dir.display()))?;
        let path = dir.join(XSCALE_INPUT);
        fs::write(&path, self.render_input())
            .with_context(|| format!("writing {}", path.display()))?;
        log::info!("xscale input file: {}", path.display());
        Ok(path)
    }

    /// Write the input file and run `program` in `dir`.
    pub fn run(&self, dir: &Path, program: &str) -> anyhow::Result<ExportFile> {
        if self.input_files.is_empty() {
            bail!("no input files to scale");
        }
        self.write_input(dir)?;

        let output = Command::new(program)
            .current_dir(dir)
            .output()
            .with_context(|| format!("failed to start {}", program))?;
        if !output.status.success() {
            bail!(
                "{} exited with {}: {}",
                program,
                output.status,
                String::from_utf8_lossy(&output.stderr).trim()
            );
        }

        let path = dir.join(&self.output_name);
        log::info!("{} finished, merged reflections in {}", program, path.display());
        Ok(ExportFile {
            path,
            file_type: ExportFileType::XdsAscii,
        })
    }
}
