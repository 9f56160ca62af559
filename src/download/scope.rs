//! Directory-scoped maintenance on top of a [`Downloader`].

use std::collections::HashSet;
use std::io;
use std::path::{Path, PathBuf};

use tracing::debug;

use super::directory::final_file_name;
use super::registry::Downloader;

/// View of one logical subdirectory of the download root.
///
/// Obtained through [`Downloader::dir`]. The empty name is the root itself.
#[derive(Debug, Clone)]
pub struct DirScope {
    downloader: Downloader,
    dirname: String,
}

impl Downloader {
    /// Returns the maintenance view of `dirname`.
    #[must_use]
    pub fn dir(&self, dirname: impl Into<String>) -> DirScope {
        DirScope {
            downloader: self.clone(),
            dirname: dirname.into(),
        }
    }
}

impl DirScope {
    /// The logical subdirectory name.
    #[must_use]
    pub fn dirname(&self) -> &str {
        &self.dirname
    }

    /// Deletes every temp file of the scope that does not back an active task.
    ///
    /// Returns the number of deleted files.
    pub fn delete_temp_files(&self) -> usize {
        let inner = &self.downloader.inner;
        // registrations wait until the sweep is done
        let guard = inner.state.lock();
        let in_use: HashSet<PathBuf> = guard
            .borrow()
            .active
            .values()
            .map(|entry| entry.temp.clone())
            .collect();
        let deleted = inner
            .directory
            .delete_temp_files(&self.dirname, |path| !in_use.contains(path));
        drop(guard);
        debug!(dirname = %self.dirname, deleted, "deleted temp files");
        deleted
    }

    /// Deletes every final file of the scope.
    pub fn delete_final_files(&self) -> usize {
        self.delete_final_files_where(|_| true)
    }

    /// Deletes every final file of the scope except the one for `url`.
    pub fn delete_final_files_except(&self, url: &str) -> usize {
        let keep = final_file_name(url);
        self.delete_final_files_where(|path| {
            path.file_name().and_then(|name| name.to_str()) != Some(keep.as_str())
        })
    }

    /// Deletes the final files of the scope for which `filter` returns true.
    pub fn delete_final_files_where(&self, filter: impl FnMut(&Path) -> bool) -> usize {
        let deleted = self
            .downloader
            .inner
            .directory
            .delete_final_files(&self.dirname, filter);
        debug!(dirname = %self.dirname, deleted, "deleted final files");
        deleted
    }

    /// Final file downloaded for `url`, if present.
    #[must_use]
    pub fn final_file(&self, url: &str) -> Option<PathBuf> {
        self.downloader
            .inner
            .directory
            .existing_final_file(&self.dirname, url)
    }

    /// Final file called `name`, if present.
    #[must_use]
    pub fn final_file_by_name(&self, name: &str) -> Option<PathBuf> {
        self.downloader
            .inner
            .directory
            .final_file_by_name(&self.dirname, name)
    }

    /// Lists the final files of the scope.
    ///
    /// # Errors
    ///
    /// Returns an IO error if the scope cannot be read.
    pub fn list_final_files(&self) -> io::Result<Vec<PathBuf>> {
        self.downloader.inner.directory.list_final_files(&self.dirname)
    }

    /// Moves `file` into the scope as `name` (its own name when empty),
    /// replacing any existing file.
    ///
    /// # Errors
    ///
    /// Returns `InvalidInput` for temp-extension or non-plain names, otherwise
    /// the IO error of the move.
    pub fn take_file(&self, file: &Path, name: &str) -> io::Result<PathBuf> {
        self.downloader
            .inner
            .directory
            .take_file(&self.dirname, file, name)
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use std::sync::Arc;

    use tempfile::TempDir;

    use crate::download::DownloadRequest;
    use crate::download::registry::tests::{CancelMode, FakeExecutor, downloader};

    #[test]
    fn test_delete_temp_files_keeps_active_task_temp() {
        let dir = TempDir::new().unwrap();
        let executor = FakeExecutor::new(CancelMode::Deferred);
        let downloader = downloader(dir.path(), Arc::clone(&executor));

        downloader.add_task(DownloadRequest::builder().dirname("apk").build("https://x/live.apk"));
        let (_, live_temp, _) = executor.submission(0);
        std::fs::write(&live_temp, b"live").unwrap();
        let stale = live_temp.with_file_name("deadbeef.temp");
        std::fs::write(&stale, b"stale").unwrap();

        assert_eq!(downloader.dir("apk").delete_temp_files(), 1);
        assert!(live_temp.exists());
        assert!(!stale.exists());
    }

    #[test]
    fn test_final_file_lookup_and_selective_delete() {
        let dir = TempDir::new().unwrap();
        let executor = FakeExecutor::new(CancelMode::Deferred);
        let downloader = downloader(dir.path(), Arc::clone(&executor));

        for (index, url) in ["https://x/a.zip", "https://x/b.zip"].iter().enumerate() {
            downloader.add_task(DownloadRequest::new(*url));
            let (_, temp, updater) = executor.submission(index);
            std::fs::write(&temp, url.as_bytes()).unwrap();
            updater.notify_success();
        }

        let scope = downloader.dir("");
        let a = scope.final_file("https://x/a.zip").unwrap();
        assert!(scope.final_file("https://x/b.zip").is_some());
        let a_name = a.file_name().unwrap().to_str().unwrap().to_string();
        assert_eq!(scope.final_file_by_name(&a_name), Some(a.clone()));

        assert_eq!(scope.delete_final_files_except("https://x/a.zip"), 1);
        assert!(a.exists());
        assert!(scope.final_file("https://x/b.zip").is_none());

        assert_eq!(scope.delete_final_files(), 1);
        assert!(scope.list_final_files().unwrap().is_empty());
    }

    #[test]
    fn test_take_file_moves_into_scope_and_rejects_temp() {
        let dir = TempDir::new().unwrap();
        let outside = TempDir::new().unwrap();
        let executor = FakeExecutor::new(CancelMode::Deferred);
        let downloader = downloader(dir.path(), executor);
        let scope = downloader.dir("docs");

        let source = outside.path().join("report.pdf");
        std::fs::write(&source, b"pdf").unwrap();
        let taken = scope.take_file(&source, "").unwrap();
        assert_eq!(taken, dir.path().join("docs").join("report.pdf"));
        assert!(!source.exists());
        assert_eq!(scope.final_file_by_name("report.pdf"), Some(taken));

        let temp = outside.path().join("x.temp");
        std::fs::write(&temp, b"t").unwrap();
        let err = scope.take_file(&temp, "").unwrap_err();
        assert_eq!(err.kind(), std::io::ErrorKind::InvalidInput);
    }
}
