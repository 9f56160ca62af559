//! Content-addressed download directory.
//!
//! A download key (the URL) maps to two deterministic paths inside a
//! logical subdirectory of the root:
//!
//! - temp: `<sha256(key)>.temp`, written while the transfer runs
//! - final: `<sha256(key)>[.<ext>]`, where `ext` is the key's own extension
//!
//! The mapping is a pure function of `(dirname, key)`, so a partially
//! written temp file is found again after a restart and can be resumed.
//! Every mutation of the tree (directory creation, rename, delete) happens
//! under one lock per root. The lock is shared by every handle opened on the
//! same root within the process.

use std::collections::HashMap;
use std::fs;
use std::io;
use std::path::{Component, Path, PathBuf};
use std::sync::{Arc, OnceLock, Weak};

use parking_lot::Mutex;
use sha2::{Digest, Sha256};
use tracing::{debug, warn};
use url::Url;

use super::constants::{MAX_EXTENSION_LEN, TEMP_EXTENSION};

/// Download directory rooted at a fixed path.
#[derive(Debug)]
pub struct DownloadDirectory {
    root: PathBuf,
    lock: Arc<Mutex<()>>,
}

/// Root path to its tree lock. Entries die with their last handle.
static ROOT_LOCKS: OnceLock<Mutex<HashMap<PathBuf, Weak<Mutex<()>>>>> = OnceLock::new();

fn root_lock(root: &Path) -> Arc<Mutex<()>> {
    let key = std::path::absolute(root).unwrap_or_else(|_| root.to_path_buf());
    let mut locks = ROOT_LOCKS.get_or_init(Mutex::default).lock();
    if let Some(lock) = locks.get(&key).and_then(Weak::upgrade) {
        return lock;
    }
    locks.retain(|_, lock| lock.strong_count() > 0);
    let lock = Arc::new(Mutex::new(()));
    locks.insert(key, Arc::downgrade(&lock));
    lock
}

impl DownloadDirectory {
    /// Creates a directory handle. Nothing is created on disk until a path is requested.
    ///
    /// Handles on the same root share one tree lock.
    #[must_use]
    pub fn new(root: impl Into<PathBuf>) -> Self {
        let root = root.into();
        let lock = root_lock(&root);
        Self { root, lock }
    }

    /// The root of the tree.
    #[must_use]
    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Returns the temp path for `key`, creating the scope directory if needed.
    ///
    /// # Errors
    ///
    /// Returns an IO error if `dirname` is not a plain relative path or the
    /// directory cannot be created.
    pub fn temp_path_for(&self, dirname: &str, key: &str) -> io::Result<PathBuf> {
        let dir = self.prepare_scope(dirname)?;
        Ok(dir.join(temp_file_name(key)))
    }

    /// Returns the final path for `key`, creating the scope directory if needed.
    ///
    /// # Errors
    ///
    /// Same as [`temp_path_for`](Self::temp_path_for).
    pub fn final_path_for(&self, dirname: &str, key: &str) -> io::Result<PathBuf> {
        let dir = self.prepare_scope(dirname)?;
        Ok(dir.join(final_file_name(key)))
    }

    /// Returns the final file for `key` if it exists on disk.
    #[must_use]
    pub fn existing_final_file(&self, dirname: &str, key: &str) -> Option<PathBuf> {
        let path = self.scope_dir(dirname).ok()?.join(final_file_name(key));
        path.is_file().then_some(path)
    }

    /// Returns the file called `name` in the scope if it exists and is not a temp file.
    #[must_use]
    pub fn final_file_by_name(&self, dirname: &str, name: &str) -> Option<PathBuf> {
        if name.is_empty() || has_temp_extension(Path::new(name)) {
            return None;
        }
        let dir = self.scope_dir(dirname).ok()?;
        let path = dir.join(name);
        // `name` must stay a plain file name inside the scope.
        if path.parent() != Some(dir.as_path()) {
            return None;
        }
        path.is_file().then_some(path)
    }

    /// Lists the non-temp files of a scope.
    ///
    /// # Errors
    ///
    /// Returns an IO error if the scope cannot be prepared or read.
    pub fn list_final_files(&self, dirname: &str) -> io::Result<Vec<PathBuf>> {
        self.list(dirname, |path| !has_temp_extension(path))
    }

    /// Lists the temp files of a scope.
    ///
    /// # Errors
    ///
    /// Returns an IO error if the scope cannot be prepared or read.
    pub fn list_temp_files(&self, dirname: &str) -> io::Result<Vec<PathBuf>> {
        self.list(dirname, has_temp_extension)
    }

    /// Deletes temp files of a scope for which `select` returns true.
    ///
    /// Returns the number of deleted entries.
    pub fn delete_temp_files(&self, dirname: &str, select: impl FnMut(&Path) -> bool) -> usize {
        self.delete_where(dirname, true, select)
    }

    /// Deletes non-temp files of a scope for which `select` returns true.
    ///
    /// Returns the number of deleted entries.
    pub fn delete_final_files(&self, dirname: &str, select: impl FnMut(&Path) -> bool) -> usize {
        self.delete_where(dirname, false, select)
    }

    /// Publishes `temp` at `final_path`, replacing whatever was there.
    ///
    /// # Errors
    ///
    /// Returns the IO error of the delete or rename step.
    pub fn replace_final(&self, temp: &Path, final_path: &Path) -> io::Result<()> {
        let _guard = self.lock.lock();
        remove_entry(final_path)?;
        fs::rename(temp, final_path)
    }

    /// Moves an arbitrary `file` into the scope under `name` (or its own
    /// file name when `name` is empty), overwriting an existing file.
    ///
    /// # Errors
    ///
    /// Returns `InvalidInput` if either name carries the temp extension or
    /// `name` is not a plain file name, otherwise the IO error of the move.
    pub fn take_file(&self, dirname: &str, file: &Path, name: &str) -> io::Result<PathBuf> {
        let name = if name.is_empty() {
            file.file_name()
                .and_then(|n| n.to_str())
                .unwrap_or_default()
                .to_string()
        } else {
            name.to_string()
        };
        if name.is_empty() || has_temp_extension(file) || has_temp_extension(Path::new(&name)) {
            return Err(io::Error::new(
                io::ErrorKind::InvalidInput,
                format!("refusing to take {} as {name:?}", file.display()),
            ));
        }
        if !is_plain_relative(Path::new(&name)) || Path::new(&name).components().count() != 1 {
            return Err(io::Error::new(
                io::ErrorKind::InvalidInput,
                format!("{name:?} is not a plain file name"),
            ));
        }

        let dir = self.prepare_scope(dirname)?;
        let target = dir.join(&name);
        if target == file {
            return Ok(target);
        }

        let _guard = self.lock.lock();
        remove_entry(&target)?;
        if let Err(rename_error) = fs::rename(file, &target) {
            // rename fails across filesystems; fall back to copy + delete
            debug!(error = %rename_error, "rename failed, copying instead");
            fs::copy(file, &target)?;
            fs::remove_file(file)?;
        }
        Ok(target)
    }

    fn list(&self, dirname: &str, keep: impl Fn(&Path) -> bool) -> io::Result<Vec<PathBuf>> {
        let dir = self.prepare_scope(dirname)?;
        let _guard = self.lock.lock();
        let mut files = Vec::new();
        for entry in fs::read_dir(&dir)? {
            let path = entry?.path();
            if keep(&path) {
                files.push(path);
            }
        }
        files.sort();
        Ok(files)
    }

    fn delete_where(
        &self,
        dirname: &str,
        temp: bool,
        mut select: impl FnMut(&Path) -> bool,
    ) -> usize {
        let dir = match self.prepare_scope(dirname) {
            Ok(dir) => dir,
            Err(error) => {
                warn!(dirname, error = %error, "cannot prepare download directory for deletion");
                return 0;
            }
        };
        let _guard = self.lock.lock();
        let Ok(entries) = fs::read_dir(&dir) else {
            return 0;
        };

        let mut count = 0;
        for entry in entries.flatten() {
            let path = entry.path();
            if has_temp_extension(&path) != temp || !select(&path) {
                continue;
            }
            match remove_entry(&path) {
                Ok(()) => count += 1,
                Err(error) => warn!(path = %path.display(), error = %error, "failed to delete file"),
            }
        }
        if count > 0 {
            debug!(dirname, count, temp, "deleted files from download directory");
        }
        count
    }

    fn prepare_scope(&self, dirname: &str) -> io::Result<PathBuf> {
        let dir = self.scope_dir(dirname)?;
        let _guard = self.lock.lock();
        ensure_dir(&dir)?;
        Ok(dir)
    }

    fn scope_dir(&self, dirname: &str) -> io::Result<PathBuf> {
        if dirname.is_empty() {
            return Ok(self.root.clone());
        }
        if !is_plain_relative(Path::new(dirname)) {
            return Err(io::Error::new(
                io::ErrorKind::InvalidInput,
                format!("dirname {dirname:?} must be a relative path without '..'"),
            ));
        }
        Ok(self.root.join(dirname))
    }
}

/// Hex-encoded SHA-256 of `key`.
#[must_use]
pub fn key_hash(key: &str) -> String {
    Sha256::digest(key.as_bytes())
        .iter()
        .map(|byte| format!("{byte:02x}"))
        .collect()
}

/// File name of the temp file for `key`.
#[must_use]
pub fn temp_file_name(key: &str) -> String {
    format!("{}.{TEMP_EXTENSION}", key_hash(key))
}

/// File name of the final file for `key`.
#[must_use]
pub fn final_file_name(key: &str) -> String {
    let hash = key_hash(key);
    match key_extension(key) {
        Some(ext) => format!("{hash}.{ext}"),
        None => hash,
    }
}

/// Extension of the resource named by `key`, if it has a usable one.
///
/// URLs use the last segment of their path, so query strings and fragments
/// never leak into the extension. Extensions that are not short ASCII
/// alphanumerics, or that equal the temp extension, are dropped.
#[must_use]
pub fn key_extension(key: &str) -> Option<String> {
    let last_segment = match Url::parse(key) {
        Ok(url) => url
            .path_segments()
            .and_then(|mut segments| segments.next_back().map(str::to_string))?,
        Err(_) => {
            let without_query = key.split(['?', '#']).next().unwrap_or(key);
            without_query.rsplit('/').next().unwrap_or(without_query).to_string()
        }
    };

    let (stem, ext) = last_segment.rsplit_once('.')?;
    let usable = !stem.is_empty()
        && !ext.is_empty()
        && ext.len() <= MAX_EXTENSION_LEN
        && ext.bytes().all(|b| b.is_ascii_alphanumeric())
        && !ext.eq_ignore_ascii_case(TEMP_EXTENSION);
    usable.then(|| ext.to_string())
}

/// Returns true if `path` carries the temp extension.
#[must_use]
pub fn has_temp_extension(path: &Path) -> bool {
    path.extension().is_some_and(|ext| ext == TEMP_EXTENSION)
}

fn is_plain_relative(path: &Path) -> bool {
    path.components().all(|c| matches!(c, Component::Normal(_)))
}

fn ensure_dir(dir: &Path) -> io::Result<()> {
    if dir.is_dir() {
        return Ok(());
    }
    if dir.is_file() {
        debug!(path = %dir.display(), "replacing regular file occupying directory slot");
        fs::remove_file(dir)?;
    }
    fs::create_dir_all(dir)
}

fn remove_entry(path: &Path) -> io::Result<()> {
    let result = if path.is_dir() {
        fs::remove_dir_all(path)
    } else {
        fs::remove_file(path)
    };
    match result {
        Err(error) if error.kind() == io::ErrorKind::NotFound => Ok(()),
        other => other,
    }
}
