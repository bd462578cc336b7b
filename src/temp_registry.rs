use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use tracing::{debug, warn};

const TEMP_PREFIX: &str = "powercycle-";

/// Ephemeral files and directories owned by one phase of a run.
///
/// Every path created through a scope is removed when the scope is released
/// or dropped. Removal failures are logged and never escalated.
#[derive(Debug)]
pub struct TempScope {
    label: &'static str,
    files: Vec<PathBuf>,
    dirs: Vec<PathBuf>,
}

impl TempScope {
    pub fn new(label: &'static str) -> Self {
        Self {
            label,
            files: Vec::new(),
            dirs: Vec::new(),
        }
    }

    pub fn label(&self) -> &'static str {
        self.label
    }

    pub fn len(&self) -> usize {
        self.files.len() + self.dirs.len()
    }

    pub fn is_empty(&self) -> bool {
        self.files.is_empty() && self.dirs.is_empty()
    }

    /// Creates an empty file under `dir`. A missing `dir` is created and
    /// tracked as well, so it disappears with the scope.
    pub fn create_file(&mut self, dir: &Path, suffix: &str) -> io::Result<PathBuf> {
        if !dir.is_dir() {
            fs::create_dir_all(dir)?;
            self.dirs.push(dir.to_path_buf());
        }
        let file = tempfile::Builder::new()
            .prefix(TEMP_PREFIX)
            .suffix(suffix)
            .tempfile_in(dir)?;
        let path = file.into_temp_path().keep().map_err(|err| err.error)?;
        debug!("temp-create scope={} path={}", self.label, path.display());
        self.files.push(path.clone());
        Ok(path)
    }

    /// Writes `contents` to a fresh file and marks it executable.
    pub fn create_script(&mut self, dir: &Path, suffix: &str, contents: &str) -> io::Result<PathBuf> {
        let path = self.create_file(dir, suffix)?;
        fs::write(&path, contents)?;
        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            let mut perms = fs::metadata(&path)?.permissions();
            perms.set_mode(perms.mode() | 0o111);
            fs::set_permissions(&path, perms)?;
        }
        Ok(path)
    }

    pub fn create_dir(&mut self, parent: &Path) -> io::Result<PathBuf> {
        let path = parent.join(format!("{TEMP_PREFIX}{}", nanoid::nanoid!(10)));
        fs::create_dir_all(&path)?;
        debug!("temp-create-dir scope={} path={}", self.label, path.display());
        self.dirs.push(path.clone());
        Ok(path)
    }

    /// Removes one tracked file. Unknown paths are left alone.
    pub fn release(&mut self, path: &Path) -> bool {
        let Some(idx) = self.files.iter().position(|p| p == path) else {
            warn!("temp-release-unknown scope={} path={}", self.label, path.display());
            return false;
        };
        if let Err(err) = fs::remove_file(path) {
            warn!(
                "temp-release-failed scope={} path={} err={}",
                self.label,
                path.display(),
                err
            );
        }
        if path.exists() {
            return false;
        }
        self.files.remove(idx);
        true
    }

    pub fn release_all(&mut self) {
        for path in std::mem::take(&mut self.files) {
            if let Err(err) = fs::remove_file(&path) {
                warn!(
                    "temp-release-failed scope={} path={} err={}",
                    self.label,
                    path.display(),
                    err
                );
            }
        }
        // Innermost directories first.
        while let Some(dir) = self.dirs.pop() {
            if let Err(err) = fs::remove_dir_all(&dir) {
                warn!(
                    "temp-release-dir-failed scope={} path={} err={}",
                    self.label,
                    dir.display(),
                    err
                );
            }
        }
    }
}

impl Drop for TempScope {
    fn drop(&mut self) {
        if !self.is_empty() {
            debug!("temp-scope-drop scope={} entries={}", self.label, self.len());
            self.release_all();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn dropping_scope_removes_files_and_created_dirs() {
        let root = TempDir::new().unwrap();
        let nested = root.path().join("tmp");
        let (file, script) = {
            let mut scope = TempScope::new("test");
            let file = scope.create_file(&nested, ".yml").unwrap();
            let script = scope.create_script(root.path(), ".sh", "echo hi\n").unwrap();
            assert!(file.exists());
            assert_eq!(fs::read_to_string(&script).unwrap(), "echo hi\n");
            assert_eq!(scope.len(), 3);
            (file, script)
        };
        assert!(!file.exists());
        assert!(!script.exists());
        assert!(!nested.exists());
        assert!(root.path().exists());
    }

    #[test]
    fn release_of_vanished_file_is_not_an_error() {
        let root = TempDir::new().unwrap();
        let mut scope = TempScope::new("test");
        let file = scope.create_file(root.path(), ".log").unwrap();
        fs::remove_file(&file).unwrap();

        assert!(scope.release(&file));
        assert!(scope.is_empty());
        assert!(!scope.release(&file));
    }

    #[test]
    fn create_dir_is_tracked() {
        let root = TempDir::new().unwrap();
        let mut scope = TempScope::new("test");
        let dir = scope.create_dir(root.path()).unwrap();
        fs::write(dir.join("inner.txt"), b"x").unwrap();
        scope.release_all();
        assert!(!dir.exists());
        assert!(scope.is_empty());
    }

    #[cfg(unix)]
    #[test]
    fn scripts_are_executable() {
        use std::os::unix::fs::PermissionsExt;
        let root = TempDir::new().unwrap();
        let mut scope = TempScope::new("test");
        let script = scope.create_script(root.path(), ".sh", "true\n").unwrap();
        let mode = fs::metadata(&script).unwrap().permissions().mode();
        assert_eq!(mode & 0o111, 0o111);
    }
}
