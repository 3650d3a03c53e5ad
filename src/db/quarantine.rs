//! Moves suspect database files out of the live path and tracks what became of them.

use std::cmp::Ordering;
use std::fs::{self, File};
use std::io;
use std::path::{Path, PathBuf};
use std::time::SystemTime;

use regex::Regex;
use serde::Serialize;
use tracing::{info, warn};

use crate::db::{remove_sidecars, sync_dir, SIDECAR_SUFFIXES};
use crate::time::file_stamp;
use crate::{AppError, AppResult};

pub const QUARANTINE_MARKER: &str = "Corrupted";

const MAX_COLLISION_SUFFIX: u32 = 99;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum QuarantineReason {
    OpenFailed,
    CheckFailed,
    /// A live operation hit a fatal error; `context` names the operation.
    Runtime { context: String, code: i32 },
}

impl QuarantineReason {
    pub fn runtime(context: impl Into<String>, code: i32) -> Self {
        QuarantineReason::Runtime {
            context: context.into(),
            code,
        }
    }

    /// File-name safe tag: lowercase ascii, digits and underscores only.
    pub fn tag(&self) -> String {
        let raw = match self {
            QuarantineReason::OpenFailed => "open_failed".to_string(),
            QuarantineReason::CheckFailed => "check_failed".to_string(),
            QuarantineReason::Runtime { context, code } => format!("runtime_{context}_{code}"),
        };
        sanitize_tag(&raw)
    }
}

fn sanitize_tag(raw: &str) -> String {
    let mut out = String::with_capacity(raw.len());
    for ch in raw.chars() {
        let ch = ch.to_ascii_lowercase();
        if ch.is_ascii_lowercase() || ch.is_ascii_digit() {
            out.push(ch);
        } else if !out.ends_with('_') {
            out.push('_');
        }
    }
    let trimmed = out.trim_matches('_');
    if trimmed.is_empty() {
        "unknown".to_string()
    } else {
        trimmed.to_string()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum Disposition {
    Recovered,
    Empty,
    NoRecipes,
}

impl Disposition {
    pub fn as_str(self) -> &'static str {
        match self {
            Disposition::Recovered => "Recovered",
            Disposition::Empty => "Empty",
            Disposition::NoRecipes => "NoRecipes",
        }
    }

    fn parse(tag: &str) -> Option<Self> {
        match tag {
            "Recovered" => Some(Disposition::Recovered),
            "Empty" => Some(Disposition::Empty),
            "NoRecipes" => Some(Disposition::NoRecipes),
            _ => None,
        }
    }
}

/// `pantry.sqlite3` splits into `("pantry", Some("sqlite3"))`.
fn split_name(path: &Path) -> (String, Option<String>) {
    let stem = path
        .file_stem()
        .map(|s| s.to_string_lossy().into_owned())
        .unwrap_or_else(|| "database".to_string());
    let ext = path.extension().map(|e| e.to_string_lossy().into_owned());
    (stem, ext)
}

fn file_name(base: &str, ext: Option<&str>) -> String {
    match ext {
        Some(ext) => format!("{base}.{ext}"),
        None => base.to_string(),
    }
}

/// Pick a sibling path that does not exist yet, appending `-NN` on collision.
fn free_sibling(dir: &Path, base: &str, ext: Option<&str>) -> AppResult<PathBuf> {
    let first = dir.join(file_name(base, ext));
    if !first.exists() {
        return Ok(first);
    }
    for n in 1..=MAX_COLLISION_SUFFIX {
        let candidate = dir.join(file_name(&format!("{base}-{n:02}"), ext));
        if !candidate.exists() {
            return Ok(candidate);
        }
    }
    Err(AppError::new(
        "DB_QUARANTINE/NAME_EXHAUSTED",
        "No free quarantine file name available",
    )
    .with_context("dir", dir.display().to_string())
    .with_context("base", base.to_string()))
}

fn parent_dir(path: &Path) -> &Path {
    match path.parent() {
        Some(parent) if !parent.as_os_str().is_empty() => parent,
        _ => Path::new("."),
    }
}

/// Relocate the file at `path` beside itself under a timestamped, reason-tagged
/// name and delete the sidecars the original left behind.
///
/// Returns `Ok(None)` when there was nothing at `path`.
pub fn quarantine(path: &Path, reason: &QuarantineReason) -> AppResult<Option<PathBuf>> {
    if !path.exists() {
        // Orphaned sidecars would be replayed into the fresh file.
        remove_sidecars(path).ok();
        return Ok(None);
    }

    let dir = parent_dir(path);
    let (stem, ext) = split_name(path);
    let base = format!("{stem}_{QUARANTINE_MARKER}_{}_{}", file_stamp(), reason.tag());
    let target = free_sibling(dir, &base, ext.as_deref())?;

    if let Err(rename_err) = fs::rename(path, &target) {
        warn!(
            target: "pantry",
            event = "quarantine_rename_failed",
            path = %path.display(),
            error = %rename_err
        );
        copy_then_remove(path, &target)?;
    }

    remove_sidecars(path).map_err(|err| {
        AppError::from(err)
            .with_context("operation", "remove_sidecars")
            .with_context("path", path.display().to_string())
    })?;
    sync_dir(dir).ok();

    warn!(
        target: "pantry",
        event = "db_quarantined",
        path = %path.display(),
        quarantine = %target.display(),
        reason = %reason.tag()
    );
    Ok(Some(target))
}

fn copy_then_remove(path: &Path, target: &Path) -> AppResult<()> {
    let copied = fs::copy(path, target).and_then(|_| File::open(target)?.sync_all());
    if let Err(err) = copied {
        let _ = fs::remove_file(target);
        return Err(AppError::new(
            "DB_QUARANTINE/MOVE_FAILED",
            "Could not move or copy the database out of the way",
        )
        .with_context("from", path.display().to_string())
        .with_context("to", target.display().to_string())
        .with_cause(err));
    }
    fs::remove_file(path).map_err(|err| {
        AppError::new(
            "DB_QUARANTINE/MOVE_FAILED",
            "Copied the database but could not remove the original",
        )
        .with_context("from", path.display().to_string())
        .with_context("copy", target.display().to_string())
        .with_cause(err)
    })
}

/// Rename a quarantine file to carry `disposition` so it is never salvaged again.
/// Already-processed files are returned unchanged.
pub fn mark_processed(file: &Path, disposition: Disposition) -> AppResult<PathBuf> {
    let name = file
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_default();
    let marker = format!("_{QUARANTINE_MARKER}_");
    let Some(split_at) = name.find(&marker) else {
        return Ok(file.to_path_buf());
    };
    if !file.exists() {
        return Err(AppError::new(
            "DB_QUARANTINE/MISSING",
            "Quarantine file no longer exists",
        )
        .with_context("path", file.display().to_string()));
    }

    let stem = &name[..split_at];
    let (_, ext) = split_name(file);
    let base = format!("{stem}_{}_{}", disposition.as_str(), file_stamp());
    let dir = parent_dir(file);
    let target = free_sibling(dir, &base, ext.as_deref())?;

    fs::rename(file, &target).map_err(|err| {
        AppError::from(err)
            .with_context("operation", "mark_processed")
            .with_context("from", file.display().to_string())
            .with_context("to", target.display().to_string())
    })?;
    remove_sidecars(file).ok();
    sync_dir(dir).ok();

    info!(
        target: "pantry",
        event = "quarantine_marked",
        from = %file.display(),
        to = %target.display(),
        disposition = disposition.as_str()
    );
    Ok(target)
}

#[derive(Debug, Clone, Serialize)]
pub struct QuarantineEntry {
    pub path: PathBuf,
    pub stamp: String,
    /// `None` while the file still awaits salvage.
    pub disposition: Option<Disposition>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
    pub size_bytes: u64,
    #[serde(skip)]
    modified: Option<SystemTime>,
}

impl QuarantineEntry {
    pub fn is_pending(&self) -> bool {
        self.disposition.is_none()
    }
}

fn name_pattern(db_path: &Path) -> AppResult<Regex> {
    let (stem, ext) = split_name(db_path);
    let ext_part = match ext {
        Some(ext) => format!(r"\.{}", regex::escape(&ext)),
        None => String::new(),
    };
    let pattern = format!(
        r"^{}_(Corrupted|Recovered|Empty|NoRecipes)_(\d{{8}}_\d{{6}})(?:_([a-z0-9_]+?))?(?:-\d{{2}})?{}$",
        regex::escape(&stem),
        ext_part
    );
    Regex::new(&pattern).map_err(|err| {
        AppError::new("DB_QUARANTINE/PATTERN", err.to_string())
            .with_context("db_path", db_path.display().to_string())
    })
}

/// Every quarantine file beside `db_path`, pending and processed, oldest first.
pub fn list_quarantine(db_path: &Path) -> AppResult<Vec<QuarantineEntry>> {
    let pattern = name_pattern(db_path)?;
    let dir = parent_dir(db_path);
    let read = match fs::read_dir(dir) {
        Ok(read) => read,
        Err(err) if err.kind() == io::ErrorKind::NotFound => return Ok(Vec::new()),
        Err(err) => {
            return Err(AppError::from(err).with_context("dir", dir.display().to_string()))
        }
    };

    let mut entries = Vec::new();
    for dirent in read {
        let dirent = dirent?;
        let name = dirent.file_name().to_string_lossy().into_owned();
        if SIDECAR_SUFFIXES.iter().any(|suffix| name.ends_with(suffix)) {
            continue;
        }
        let Some(caps) = pattern.captures(&name) else {
            continue;
        };
        let meta = match dirent.metadata() {
            Ok(meta) if meta.is_file() => meta,
            _ => continue,
        };
        let disposition = Disposition::parse(&caps[1]);
        entries.push(QuarantineEntry {
            path: dirent.path(),
            stamp: caps[2].to_string(),
            disposition,
            reason: caps.get(3).map(|m| m.as_str().to_string()),
            size_bytes: meta.len(),
            modified: meta.modified().ok(),
        });
    }

    entries.sort_by(compare_entries);
    Ok(entries)
}

fn compare_entries(a: &QuarantineEntry, b: &QuarantineEntry) -> Ordering {
    a.modified
        .cmp(&b.modified)
        .then_with(|| a.path.file_name().cmp(&b.path.file_name()))
}

/// The most recently modified quarantine file that has not been processed yet.
pub fn latest_candidate(db_path: &Path) -> AppResult<Option<PathBuf>> {
    Ok(list_quarantine(db_path)?
        .into_iter()
        .filter(QuarantineEntry::is_pending)
        .max_by(compare_entries)
        .map(|entry| entry.path))
}
