//! Runtime locations of sockets and log files.

use std::fs;
use std::io;
use std::os::unix::fs::{DirBuilderExt, PermissionsExt};
use std::path::{Path, PathBuf};

const APP_DIR: &str = "taro";

/// Directory holding the sockets of all running instances of the current user.
///
/// `$XDG_RUNTIME_DIR/taro` when the runtime directory exists, otherwise
/// `/tmp/taro_<uid>`. Created with mode 0700 when missing.
pub fn socket_dir() -> io::Result<PathBuf> {
    let dir = match std::env::var_os("XDG_RUNTIME_DIR") {
        Some(runtime) if Path::new(&runtime).is_dir() => Path::new(&runtime).join(APP_DIR),
        _ => std::env::temp_dir().join(format!("{APP_DIR}_{}", current_uid())),
    };
    ensure_private_dir(&dir)?;
    Ok(dir)
}

fn current_uid() -> u32 {
    unsafe { libc::getuid() }
}

pub fn ensure_private_dir(dir: &Path) -> io::Result<()> {
    if dir.is_dir() {
        return Ok(());
    }
    fs::DirBuilder::new()
        .recursive(true)
        .mode(0o700)
        .create(dir)?;
    // The builder mode is filtered through the umask.
    fs::set_permissions(dir, fs::Permissions::from_mode(0o700))
}

pub fn socket_path(dir: &Path, name: &str, extension: &str) -> PathBuf {
    dir.join(format!("{name}.{extension}"))
}

/// Socket files in `dir` with the given extension, sorted by path.
///
/// A missing directory yields an empty list.
pub fn socket_files(dir: &Path, extension: &str) -> io::Result<Vec<PathBuf>> {
    let entries = match fs::read_dir(dir) {
        Ok(entries) => entries,
        Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(Vec::new()),
        Err(e) => return Err(e),
    };
    let mut files = Vec::new();
    for entry in entries {
        let path = entry?.path();
        if path.extension().is_some_and(|ext| ext == extension) {
            files.push(path);
        }
    }
    files.sort();
    Ok(files)
}

/// Instance id encoded in a socket file name.
pub fn socket_name(path: &Path) -> Option<&str> {
    path.file_stem().and_then(|s| s.to_str())
}

/// Default log file: `$XDG_CACHE_HOME/taro/taro.log` or `~/.cache/taro/taro.log`.
pub fn log_file_path() -> PathBuf {
    let cache = std::env::var_os("XDG_CACHE_HOME")
        .map(PathBuf::from)
        .or_else(|| std::env::var_os("HOME").map(|home| Path::new(&home).join(".cache")))
        .unwrap_or_else(std::env::temp_dir);
    cache.join(APP_DIR).join("taro.log")
}

/// Default history database used by the json persistence type.
pub fn default_database_path() -> PathBuf {
    let data = std::env::var_os("XDG_DATA_HOME")
        .map(PathBuf::from)
        .or_else(|| {
            std::env::var_os("HOME").map(|home| Path::new(&home).join(".local").join("share"))
        })
        .unwrap_or_else(std::env::temp_dir);
    data.join(APP_DIR).join("jobs.jsonl")
}
