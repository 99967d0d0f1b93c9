use std::path::{Path, PathBuf};

use regex::Regex;

use crate::error::ImportError;

/// Placeholder for the per-image integer identifier.
pub const TI_TAG: &str = "{TI}";
/// Placeholder for the tilt-series / group identifier.
pub const TS_TAG: &str = "{TS}";

/// A file that matched the import pattern.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MatchedFile {
    pub path: PathBuf,
    /// Text captured by `{TS}`, when the pattern has one
    pub tilt_series: Option<String>,
    /// Integer captured by `{TI}`
    pub image_id: u64,
}

/// Template such as `experiment_12/SMV/data/{TI}.img` rooted at a directory,
/// expanded into a glob for enumeration and a regex for id extraction.
#[derive(Debug, Clone)]
pub struct FilePattern {
    pattern: String,
    glob_pattern: String,
    regex: Regex,
}

impl FilePattern {
    pub fn new(root: &Path, template: &str) -> Result<Self, ImportError> {
        let template = template.trim();
        if !template.contains(TI_TAG) {
            return Err(ImportError::InvalidPattern {
                pattern: template.to_string(),
                reason: format!("pattern must contain {}", TI_TAG),
            });
        }

        // root with a trailing separator; its characters are matched literally
        let prefix = root.join("").to_string_lossy().into_owned();
        let pattern = format!("{}{}", prefix, template);
        let glob_pattern = format!(
            "{}{}",
            glob::Pattern::escape(&prefix),
            template.replace(TS_TAG, "*").replace(TI_TAG, "*")
        );
        glob::Pattern::new(&glob_pattern).map_err(|e| ImportError::InvalidPattern {
            pattern: glob_pattern.clone(),
            reason: e.to_string(),
        })?;

        let regex_pattern = format!("^{}{}$", regex::escape(&prefix), template_to_regex(template));
        let regex = Regex::new(&regex_pattern).map_err(|e| ImportError::InvalidPattern {
            pattern: regex_pattern.clone(),
            reason: e.to_string(),
        })?;

        Ok(Self {
            pattern,
            glob_pattern,
            regex,
        })
    }

    /// Root joined with the raw template.
    pub fn pattern(&self) -> &str {
        &self.pattern
    }

    pub fn glob_pattern(&self) -> &str {
        &self.glob_pattern
    }

    pub fn regex_pattern(&self) -> &str {
        self.regex.as_str()
    }

    pub fn has_tilt_series(&self) -> bool {
        self.pattern.contains(TS_TAG)
    }

    /// Match one path against the regex, extracting the identifiers.
    pub fn match_path(&self, path: &Path) -> Option<MatchedFile> {
        let text = path.to_str()?;
        let caps = self.regex.captures(text)?;
        let image_id = match caps.name("TI")?.as_str().parse::<u64>() {
            Ok(id) => id,
            Err(e) => {
                log::warn!("Skipping {}: image id out of range ({})", text, e);
                return None;
            }
        };
        Some(MatchedFile {
            path: path.to_path_buf(),
            tilt_series: caps.name("TS").map(|m| m.as_str().to_string()),
            image_id,
        })
    }

    /// Enumerate files matching the glob, sorted by path, keeping those the regex accepts.
    ///
    /// An empty result is not an error.
    pub fn matching_files(&self) -> Result<Vec<MatchedFile>, ImportError> {
        let entries = glob::glob(&self.glob_pattern).map_err(|e| ImportError::InvalidPattern {
            pattern: self.glob_pattern.clone(),
            reason: e.to_string(),
        })?;

        let mut paths = Vec::new();
        for entry in entries {
            match entry {
                Ok(path) => paths.push(path),
                Err(e) => {
                    let path = e.path().to_path_buf();
                    return Err(ImportError::io(path, e.into_error()));
                }
            }
        }
        // by path text, not by component
        paths.sort_by(|a, b| a.as_os_str().cmp(b.as_os_str()));

        Ok(paths.iter().filter_map(|p| self.match_path(p)).collect())
    }
}

/// Translate the glob-style template into a regex fragment.
fn template_to_regex(template: &str) -> String {
    let mut regex = String::with_capacity(template.len() * 2);
    let mut rest = template;
    while !rest.is_empty() {
        if let Some(tail) = rest.strip_prefix(TS_TAG) {
            regex.push_str("(?P<TS>.*)");
            rest = tail;
        } else if let Some(tail) = rest.strip_prefix(TI_TAG) {
            regex.push_str(r"(?P<TI>\d+)");
            rest = tail;
        } else {
            let mut chars = rest.chars();
            let Some(c) = chars.next() else { break };
            match c {
                '*' => regex.push_str("(.*)"),
                '?' => regex.push('.'),
                _ => regex.push_str(&regex::escape(c.encode_utf8(&mut [0u8; 4]))),
            }
            rest = chars.as_str();
        }
    }
    regex
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs::{self, File};
    use tempfile::tempdir;

    #[test]
    fn test_requires_ti_placeholder() {
        let err = FilePattern::new(Path::new("/data"), "images/*.img").unwrap_err();
        assert!(matches!(err, ImportError::InvalidPattern { .. }));
    }

    #[test]
    fn test_expanded_patterns() {
        let p = FilePattern::new(Path::new("/data"), "run_{TS}/img{TI}.img").unwrap();
        assert_eq!(p.glob_pattern(), "/data/run_*/img*.img");
        assert_eq!(
            p.regex_pattern(),
            r"^/data/run_(?P<TS>.*)/img(?P<TI>\d+)\.img$"
        );
        assert!(p.has_tilt_series());
    }

    #[test]
    fn test_sorted_then_matched() {
        let dir = tempdir().unwrap();
        for name in ["img0003.img", "img0001.img", "img0002.img", "notes.txt"] {
            File::create(dir.path().join(name)).unwrap();
        }

        let p = FilePattern::new(dir.path(), "img{TI}.img").unwrap();
        let files = p.matching_files().unwrap();
        let ids: Vec<u64> = files.iter().map(|f| f.image_id).collect();
        assert_eq!(ids, vec![1, 2, 3]);
        assert!(files.windows(2).all(|w| w[0].path < w[1].path));
        assert!(files.iter().all(|f| f.tilt_series.is_none()));

        // restartable
        assert_eq!(p.matching_files().unwrap(), files);
    }

    #[test]
    fn test_glob_hits_rejected_by_regex() {
        let dir = tempdir().unwrap();
        File::create(dir.path().join("img12.img")).unwrap();
        File::create(dir.path().join("imgXY.img")).unwrap();

        let p = FilePattern::new(dir.path(), "img{TI}.img").unwrap();
        let files = p.matching_files().unwrap();
        assert_eq!(files.len(), 1);
        assert_eq!(files[0].image_id, 12);
    }

    #[test]
    fn test_tilt_series_capture() {
        let dir = tempdir().unwrap();
        for ts in ["tsA", "tsB"] {
            fs::create_dir(dir.path().join(ts)).unwrap();
            File::create(dir.path().join(ts).join("7.img")).unwrap();
        }

        let p = FilePattern::new(dir.path(), "{TS}/{TI}.img").unwrap();
        let files = p.matching_files().unwrap();
        let groups: Vec<_> = files.iter().map(|f| f.tilt_series.clone().unwrap()).collect();
        assert_eq!(groups, vec!["tsA", "tsB"]);
        assert!(files.iter().all(|f| f.image_id == 7));
    }

    #[test]
    fn test_no_matches_is_empty() {
        let dir = tempdir().unwrap();
        let p = FilePattern::new(&dir.path().join("missing"), "{TI}.img").unwrap();
        assert!(p.matching_files().unwrap().is_empty());
    }

    #[test]
    fn test_sorted_by_path_text() {
        let dir = tempdir().unwrap();
        for (ts, name) in [("grid1", "5.img"), ("grid1-2", "6.img")] {
            fs::create_dir(dir.path().join(ts)).unwrap();
            File::create(dir.path().join(ts).join(name)).unwrap();
        }

        let p = FilePattern::new(dir.path(), "{TS}/{TI}.img").unwrap();
        let files = p.matching_files().unwrap();
        let groups: Vec<_> = files.iter().map(|f| f.tilt_series.clone().unwrap()).collect();
        assert_eq!(groups, vec!["grid1-2", "grid1"]);
        assert_eq!(files[0].image_id, 6);
    }

    #[test]
    fn test_special_characters_in_root() {
        let dir = tempdir().unwrap();
        let root = dir.path().join("run[1]*?");
        fs::create_dir(&root).unwrap();
        File::create(root.join("3.img")).unwrap();
        // would match the unescaped glob and regex
        fs::create_dir(dir.path().join("run1xy")).unwrap();
        File::create(dir.path().join("run1xy").join("4.img")).unwrap();

        let p = FilePattern::new(&root, "{TI}.img").unwrap();
        let files = p.matching_files().unwrap();
        assert_eq!(files.len(), 1);
        assert_eq!(files[0].image_id, 3);
        assert_eq!(files[0].path, root.join("3.img"));
    }

    #[test]
    fn test_wildcard_in_template() {
        let dir = tempdir().unwrap();
        File::create(dir.path().join("scan_a_0005.img")).unwrap();
        File::create(dir.path().join("scan_b_0006.img")).unwrap();

        let p = FilePattern::new(dir.path(), "scan_*_{TI}.img").unwrap();
        let ids: Vec<u64> = p.matching_files().unwrap().iter().map(|f| f.image_id).collect();
        assert_eq!(ids, vec![5, 6]);
    }
}
