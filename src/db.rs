use std::ffi::OsString;
use std::fs::{self, File};
use std::io::{self, Write};
use std::path::{Path, PathBuf};

pub mod backup;
pub mod faults;
pub mod fatal;
pub mod handle;
pub mod health;
pub mod quarantine;
pub mod recovery;
pub mod schema;
pub mod serializer;

/// Transient files SQLite keeps beside a database in WAL mode.
pub const SIDECAR_SUFFIXES: [&str; 3] = ["-wal", "-shm", "-journal"];

pub fn sidecar_path(db_path: &Path, suffix: &str) -> PathBuf {
    let mut os = OsString::from(db_path.as_os_str());
    os.push(suffix);
    PathBuf::from(os)
}

/// Delete the WAL/SHM/journal files beside `db_path`. Missing files are fine.
pub fn remove_sidecars(db_path: &Path) -> io::Result<()> {
    for suffix in SIDECAR_SUFFIXES {
        match fs::remove_file(sidecar_path(db_path, suffix)) {
            Ok(()) => {}
            Err(err) if err.kind() == io::ErrorKind::NotFound => {}
            Err(err) => return Err(err),
        }
    }
    Ok(())
}

pub fn sidecar_bytes(db_path: &Path) -> u64 {
    SIDECAR_SUFFIXES
        .iter()
        .map(|suffix| {
            fs::metadata(sidecar_path(db_path, suffix))
                .map(|meta| meta.len())
                .unwrap_or(0)
        })
        .sum()
}

pub fn sync_dir(path: &Path) -> io::Result<()> {
    File::open(path)?.sync_all()
}

/// Write `bytes` to `path` through a temp file so readers never see a torn file.
pub fn write_atomic(path: &Path, bytes: &[u8]) -> io::Result<()> {
    let parent = path.parent().unwrap_or_else(|| Path::new("."));
    fs::create_dir_all(parent)?;
    let tmp = sidecar_path(path, ".tmp");
    {
        let mut file = File::create(&tmp)?;
        file.write_all(bytes)?;
        file.sync_all()?;
    }
    if let Err(err) = fs::rename(&tmp, path) {
        let _ = fs::remove_file(&tmp);
        return Err(err);
    }
    sync_dir(parent).ok();
    Ok(())
}
