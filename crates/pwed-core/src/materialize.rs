use std::collections::{HashMap, HashSet};
use std::fs;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use crate::cancel::ImportControl;
use crate::error::ImportError;
use crate::pattern::MatchedFile;
use crate::ThrottledProgress;

/// How matched files are brought into the output directory.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum ImportAction {
    Copy,
    AbsoluteLink,
    #[default]
    RelativeLink,
}

/// Pick a destination for `file_name` inside `dir` that neither this run nor the
/// directory already uses, appending `(n)` before the extension on collision.
fn assign_destination(
    dir: &Path,
    file_name: &str,
    used: &mut HashSet<PathBuf>,
    counters: &mut HashMap<String, u32>,
) -> PathBuf {
    let base = dir.join(file_name);
    let counter = counters.entry(file_name.to_string()).or_insert(0);
    if *counter == 0 && used.insert(base.clone()) {
        return base;
    }

    let stem = Path::new(file_name)
        .file_stem()
        .and_then(|s| s.to_str())
        .unwrap_or("file");
    let ext = Path::new(file_name)
        .extension()
        .and_then(|s| s.to_str())
        .unwrap_or("");
    loop {
        *counter += 1;
        let new_name = if ext.is_empty() {
            format!("{}({})", stem, counter)
        } else {
            format!("{}({}).{}", stem, counter, ext)
        };
        let candidate = dir.join(new_name);
        if used.insert(candidate.clone()) {
            break candidate;
        }
    }
}

#[cfg(unix)]
fn symlink(target: &Path, link: &Path) -> std::io::Result<()> {
    std::os::unix::fs::symlink(target, link)
}

#[cfg(windows)]
fn symlink(target: &Path, link: &Path) -> std::io::Result<()> {
    std::os::windows::fs::symlink_file(target, link)
}

fn copy_preserving_mtime(src: &Path, dest: &Path) -> std::io::Result<()> {
    fs::copy(src, dest)?;
    let meta = fs::metadata(src)?;
    let mtime = filetime::FileTime::from_last_modification_time(&meta);
    filetime::set_file_mtime(dest, mtime)
}

fn place(src: &Path, dest: &Path, dest_dir: &Path, action: ImportAction) -> std::io::Result<()> {
    if fs::symlink_metadata(dest).is_ok() {
        fs::remove_file(dest)?;
    }
    match action {
        ImportAction::Copy => copy_preserving_mtime(src, dest),
        ImportAction::AbsoluteLink => symlink(&fs::canonicalize(src)?, dest),
        ImportAction::RelativeLink => {
            let abs_src = fs::canonicalize(src)?;
            let rel = pathdiff::diff_paths(&abs_src, dest_dir).unwrap_or(abs_src);
            symlink(&rel, dest)
        }
    }
}

/// Location of the directory entry itself, with the parent resolved but a final symlink kept.
fn entry_path(path: &Path) -> PathBuf {
    match (path.parent(), path.file_name()) {
        (Some(parent), Some(name)) => fs::canonicalize(if parent.as_os_str().is_empty() {
            Path::new(".")
        } else {
            parent
        })
        .map(|p| p.join(name))
        .unwrap_or_else(|_| path.to_path_buf()),
        _ => path.to_path_buf(),
    }
}

/// Copy or link every matched file into `dest_dir`, returning the files at their new paths.
///
/// Matched files already inside `dest_dir` are used where they are. A destination that
/// is, or resolves to, a matched source is never replaced; the file gets a new name instead.
/// Any filesystem failure aborts: a half-imported directory is not usable.
pub fn materialize(
    files: &[MatchedFile],
    dest_dir: &Path,
    action: ImportAction,
    control: &ImportControl,
    progress: &ThrottledProgress,
) -> Result<Vec<MatchedFile>, ImportError> {
    fs::create_dir_all(dest_dir).map_err(|e| ImportError::io(dest_dir, e))?;
    let dest_dir = fs::canonicalize(dest_dir).map_err(|e| ImportError::io(dest_dir, e))?;

    let entries: Vec<PathBuf> = files.iter().map(|f| entry_path(&f.path)).collect();
    let protected: HashSet<PathBuf> = entries
        .iter()
        .cloned()
        .chain(files.iter().filter_map(|f| fs::canonicalize(&f.path).ok()))
        .collect();

    let mut used: HashSet<PathBuf> = entries
        .iter()
        .filter(|e| e.parent() == Some(dest_dir.as_path()))
        .cloned()
        .collect();
    let mut counters: HashMap<String, u32> = HashMap::new();
    let total = files.len() as u64;
    let mut placed = Vec::with_capacity(files.len());

    for (i, (file, entry)) in files.iter().zip(&entries).enumerate() {
        control.check()?;

        let dest = if entry.parent() == Some(dest_dir.as_path()) {
            log::debug!("{} is already in {}", file.path.display(), dest_dir.display());
            entry.clone()
        } else {
            let file_name = file
                .path
                .file_name()
                .and_then(|n| n.to_str())
                .unwrap_or("image");
            let mut dest = assign_destination(&dest_dir, file_name, &mut used, &mut counters);
            while protected.contains(&dest) {
                dest = assign_destination(&dest_dir, file_name, &mut used, &mut counters);
            }
            place(&file.path, &dest, &dest_dir, action)
                .map_err(|e| ImportError::io(&file.path, e))?;
            log::debug!("{:?} {} -> {}", action, file.path.display(), dest.display());
            dest
        };
        progress.report("import", i as u64, total, "Importing files");

        placed.push(MatchedFile {
            path: dest,
            tilt_series: file.tilt_series.clone(),
            image_id: file.image_id,
        });
    }

    Ok(placed)
}
