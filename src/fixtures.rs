use super::Result;
use crate::errors::HarnessError;
use nix::unistd::{access, AccessFlags};
use once_cell::sync::Lazy;
use std::fs;
use std::os::unix::fs::PermissionsExt;
use std::path::{Path, PathBuf};
use tokio::sync::{Mutex, MutexGuard};
use tracing::{debug, info, warn};

/// Serialises every scenario that mutates fixture files
static FIXTURE_LOCK: Lazy<Mutex<()>> = Lazy::new(|| Mutex::new(()));

/// Held while a scenario mutates shared fixture files
pub struct FixtureLock {
    _guard: MutexGuard<'static, ()>,
}

impl FixtureLock {
    pub async fn acquire() -> Self {
        let guard = FIXTURE_LOCK.lock().await;
        debug!("fixture lock acquired");
        Self { _guard: guard }
    }
}

/// On-disk layout the server is configured against.
///
/// Relative `conf_dir` and `www_root` are resolved against `project_root`,
/// which is also the server's working directory.
#[derive(Debug, Clone)]
pub struct FixtureLayout {
    pub project_root: PathBuf,
    pub conf_dir: PathBuf,
    pub www_root: PathBuf,
}

impl FixtureLayout {
    pub fn new(project_root: impl Into<PathBuf>, conf_dir: impl AsRef<Path>, www_root: impl AsRef<Path>) -> Self {
        let project_root = project_root.into();
        let conf_dir = project_root.join(conf_dir);
        let www_root = project_root.join(www_root);
        Self {
            project_root,
            conf_dir,
            www_root,
        }
    }

    pub fn conf_path(&self, file: &str) -> PathBuf {
        self.conf_dir.join(file)
    }

    pub fn www_path(&self, relative: &str) -> PathBuf {
        self.www_root.join(relative.trim_start_matches('/'))
    }

    pub fn uploads(&self) -> PathBuf {
        self.www_root.join("uploads")
    }

    pub fn cgi_bin(&self) -> PathBuf {
        self.www_root.join("cgi-bin")
    }

    /// Creates the uploads directory and marks every CGI script executable.
    ///
    /// Returns the number of scripts made executable. A script that cannot
    /// be chmod-ed is logged and skipped.
    pub fn prepare(&self) -> Result<usize> {
        if !self.www_root.is_dir() {
            return Err(HarnessError::Fixture {
                path: self.www_root.clone(),
                source: std::io::Error::new(std::io::ErrorKind::NotFound, "document root missing"),
            }
            .into());
        }

        let uploads = self.uploads();
        fs::create_dir_all(&uploads).map_err(|source| HarnessError::Fixture {
            path: uploads.clone(),
            source,
        })?;

        let cgi_bin = self.cgi_bin();
        let entries = match fs::read_dir(&cgi_bin) {
            Ok(entries) => entries,
            Err(e) => {
                warn!("no cgi-bin at {}: {}", cgi_bin.display(), e);
                return Ok(0);
            }
        };

        let mut prepared = 0;
        for entry in entries.flatten() {
            let path = entry.path();
            if !path.is_file() {
                continue;
            }
            match make_executable(&path) {
                Ok(()) => prepared += 1,
                Err(e) => warn!("could not mark {} executable: {}", path.display(), e),
            }
        }
        info!("Prepared fixtures under {} ({} CGI scripts)", self.www_root.display(), prepared);
        Ok(prepared)
    }
}

fn make_executable(path: &Path) -> std::io::Result<()> {
    let mut permissions = fs::metadata(path)?.permissions();
    permissions.set_mode(permissions.mode() | 0o111);
    fs::set_permissions(path, permissions)
}

/// Changes a path's mode and restores the previous mode on drop
#[derive(Debug)]
pub struct PermissionGuard {
    path: PathBuf,
    original_mode: u32,
}

impl PermissionGuard {
    pub fn apply(path: impl Into<PathBuf>, mode: u32) -> Result<Self> {
        let path = path.into();
        let fixture_err = |source| HarnessError::Fixture {
            path: path.clone(),
            source,
        };
        let original_mode = fs::metadata(&path).map_err(fixture_err)?.permissions().mode() & 0o7777;
        fs::set_permissions(&path, fs::Permissions::from_mode(mode)).map_err(fixture_err)?;
        debug!("{} mode {:o} -> {:o}", path.display(), original_mode, mode);
        Ok(Self { path, original_mode })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn original_mode(&self) -> u32 {
        self.original_mode
    }

    /// Whether this process is actually denied `flags` on the path.
    ///
    /// Privileged users bypass mode bits, in which case a permission
    /// scenario cannot observe anything.
    pub fn denies(&self, flags: AccessFlags) -> bool {
        access(&self.path, flags).is_err()
    }
}

impl Drop for PermissionGuard {
    fn drop(&mut self) {
        match fs::set_permissions(&self.path, fs::Permissions::from_mode(self.original_mode)) {
            Ok(()) => debug!("{} mode restored to {:o}", self.path.display(), self.original_mode),
            Err(e) => warn!("failed to restore mode of {}: {}", self.path.display(), e),
        }
    }
}

/// A file created for one scenario and removed on drop
#[derive(Debug)]
pub struct ScratchFile {
    path: PathBuf,
}

impl ScratchFile {
    pub fn create(path: impl Into<PathBuf>, contents: &[u8]) -> Result<Self> {
        let path = path.into();
        fs::write(&path, contents).map_err(|source| HarnessError::Fixture {
            path: path.clone(),
            source,
        })?;
        Ok(Self { path })
    }

    /// Removes `path` on drop if something (usually the server) created it
    pub fn track(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl Drop for ScratchFile {
    fn drop(&mut self) {
        if let Err(e) = fs::remove_file(&self.path) {
            if e.kind() != std::io::ErrorKind::NotFound {
                warn!("failed to remove {}: {}", self.path.display(), e);
            }
        }
    }
}
