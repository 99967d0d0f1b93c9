use std::ffi::OsString;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

pub const USER_DATA_ENV: &str = "SCIPION_ED_USERDATA";
pub const TEST_DATA_ENV: &str = "SCIPION_ED_TESTDATA";

const DEFAULT_USER_DATA_DIR: &str = "ScipionEdUserData";

/// Locations used by the importer, resolved once and passed in explicitly.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EdConfig {
    /// Base for relative output directories
    pub user_data_dir: PathBuf,
    /// Directory with reference datasets, when available
    pub test_data_dir: Option<PathBuf>,
}

impl EdConfig {
    pub fn new(user_data_dir: impl Into<PathBuf>) -> Self {
        Self {
            user_data_dir: user_data_dir.into(),
            test_data_dir: None,
        }
    }

    /// Read `SCIPION_ED_USERDATA` / `SCIPION_ED_TESTDATA` from the process environment.
    pub fn from_env() -> Self {
        Self::from_vars(|key| std::env::var_os(key))
    }

    /// Build from any variable lookup; unset user data falls back to `~/ScipionEdUserData`.
    pub fn from_vars<F>(get: F) -> Self
    where
        F: Fn(&str) -> Option<OsString>,
    {
        let user_data_dir = get(USER_DATA_ENV)
            .filter(|v| !v.is_empty())
            .map(PathBuf::from)
            .unwrap_or_else(|| {
                dirs::home_dir()
                    .unwrap_or_else(|| PathBuf::from("."))
                    .join(DEFAULT_USER_DATA_DIR)
            });
        let test_data_dir = get(TEST_DATA_ENV)
            .filter(|v| !v.is_empty())
            .map(PathBuf::from);
        Self {
            user_data_dir,
            test_data_dir,
        }
    }

    /// Absolute outputs are kept; relative ones live under the user data directory.
    pub fn resolve_output(&self, output: &Path) -> PathBuf {
        if output.is_absolute() {
            output.to_path_buf()
        } else {
            self.user_data_dir.join(output)
        }
    }
}

impl Default for EdConfig {
    fn default() -> Self {
        Self::from_vars(|_| None)
    }
}
