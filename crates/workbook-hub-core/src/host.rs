//! Host service implementations.

use std::path::{Path, PathBuf};

use async_trait::async_trait;
use chrono::DateTime;

use crate::traits::{HostServices, QuarantineInfo};

const QUARANTINE_XATTR: &str = "com.apple.quarantine";

/// Host services backed by the local file system.
#[derive(Debug, Clone)]
pub struct LocalHostServices {
    root: PathBuf,
}

impl LocalHostServices {
    /// Temp directories are created beneath `root`.
    #[must_use]
    pub const fn new(root: PathBuf) -> Self {
        Self { root }
    }

    #[must_use]
    pub fn root(&self) -> &Path {
        &self.root
    }
}

impl Default for LocalHostServices {
    fn default() -> Self {
        Self::new(std::env::temp_dir().join("workbook-hub"))
    }
}

#[async_trait]
impl HostServices for LocalHostServices {
    async fn temp_directory(&self, subdirectories: &[&str]) -> std::io::Result<PathBuf> {
        create_nested(&self.root, subdirectories).await
    }

    async fn quarantine_info(&self, path: &Path) -> std::io::Result<Option<QuarantineInfo>> {
        if !cfg!(target_os = "macos") {
            return Ok(None);
        }

        let output = tokio::process::Command::new("xattr")
            .arg("-p")
            .arg(QUARANTINE_XATTR)
            .arg(path)
            .output()
            .await?;

        // xattr exits non-zero when the attribute is absent.
        if !output.status.success() {
            return Ok(None);
        }

        let raw = String::from_utf8_lossy(&output.stdout);
        Ok(Some(parse_quarantine_value(path, raw.trim())))
    }

    async fn strip_quarantine_info(&self, path: &Path) -> std::io::Result<()> {
        if !cfg!(target_os = "macos") {
            return Ok(());
        }

        let status = tokio::process::Command::new("xattr")
            .arg("-d")
            .arg(QUARANTINE_XATTR)
            .arg(path)
            .status()
            .await?;

        if !status.success() {
            tracing::debug!(path = %path.display(), "No quarantine attribute to strip");
        }
        Ok(())
    }
}

/// Host services for platforms (and tests) without quarantine support.
#[derive(Debug, Clone)]
pub struct NoopHostServices {
    root: PathBuf,
}

impl NoopHostServices {
    #[must_use]
    pub const fn new(root: PathBuf) -> Self {
        Self { root }
    }
}

#[async_trait]
impl HostServices for NoopHostServices {
    async fn temp_directory(&self, subdirectories: &[&str]) -> std::io::Result<PathBuf> {
        create_nested(&self.root, subdirectories).await
    }

    async fn quarantine_info(&self, _path: &Path) -> std::io::Result<Option<QuarantineInfo>> {
        Ok(None)
    }

    async fn strip_quarantine_info(&self, _path: &Path) -> std::io::Result<()> {
        Ok(())
    }
}

async fn create_nested(root: &Path, subdirectories: &[&str]) -> std::io::Result<PathBuf> {
    let mut path = root.to_path_buf();
    for sub in subdirectories {
        let sub = Path::new(sub);
        if sub.is_absolute() || sub.components().any(|c| matches!(c, std::path::Component::ParentDir)) {
            return Err(std::io::Error::new(
                std::io::ErrorKind::InvalidInput,
                format!("temp subdirectory must be relative: {}", sub.display()),
            ));
        }
        path.push(sub);
    }
    tokio::fs::create_dir_all(&path).await?;
    Ok(path)
}

/// Parse `flags;hex-epoch-seconds;agent-name;uuid`.
fn parse_quarantine_value(path: &Path, raw: &str) -> QuarantineInfo {
    let mut fields = raw.split(';');
    let _flags = fields.next();
    let timestamp = fields
        .next()
        .and_then(|hex| i64::from_str_radix(hex, 16).ok())
        .and_then(|secs| DateTime::from_timestamp(secs, 0));
    let agent_name = fields
        .next()
        .filter(|name| !name.is_empty())
        .map(ToString::to_string);

    QuarantineInfo {
        path: path.to_path_buf(),
        timestamp,
        agent_name,
        origin_url: None,
    }
}
