use std::path::{Path, PathBuf};

use serde::Serialize;
use tokio::fs;
use tracing::{error, info};

const EXTENSION: &str = ".xml";

#[derive(Debug, thiserror::Error)]
pub enum DocumentError {
    #[error("file not found: {0}")]
    NotFound(String),
    #[error("invalid file name {0:?}")]
    InvalidName(String),
    #[error("failed to {action} {}: {source}", .path.display())]
    Io {
        action: &'static str,
        path: PathBuf,
        source: std::io::Error,
    },
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Document {
    pub filename: String,
    pub xml: String,
}

/// XML documents kept as plain files, one directory per caller-chosen folder.
#[derive(Debug, Clone)]
pub struct DocumentStore {
    default_dir: PathBuf,
}

impl DocumentStore {
    pub fn new(default_dir: impl Into<PathBuf>) -> Self {
        Self {
            default_dir: default_dir.into(),
        }
    }

    pub fn default_dir(&self) -> &Path {
        &self.default_dir
    }

    /// Falls back to the default directory when none (or an empty one) is given.
    pub fn resolve(&self, directory: Option<&str>) -> PathBuf {
        match directory {
            Some(dir) if !dir.is_empty() => PathBuf::from(dir),
            _ => self.default_dir.clone(),
        }
    }

    /// Every regular `*.xml` file in `dir`, sorted by name.
    pub async fn list(&self, dir: &Path) -> Result<Vec<Document>, DocumentError> {
        ensure_dir(dir).await?;

        let mut entries = fs::read_dir(dir).await.map_err(io_error("read", dir))?;
        let mut names = Vec::new();
        while let Some(entry) = entries.next_entry().await.map_err(io_error("read", dir))? {
            let Ok(name) = entry.file_name().into_string() else {
                continue;
            };
            if !has_extension(&name) {
                continue;
            }
            let is_file = entry.file_type().await.map(|t| t.is_file()).unwrap_or(false);
            if is_file {
                names.push(name);
            }
        }
        names.sort();

        let mut documents = Vec::with_capacity(names.len());
        for filename in names {
            let path = dir.join(&filename);
            let xml = fs::read_to_string(&path).await.map_err(|source| {
                error!(path = %path.display(), %source, "failed to read document");
                DocumentError::Io {
                    action: "read",
                    path: path.clone(),
                    source,
                }
            })?;
            documents.push(Document { filename, xml });
        }
        Ok(documents)
    }

    /// Writes `xml` under the base name of `filename`, adding `.xml` if missing.
    pub async fn save(
        &self,
        filename: &str,
        xml: &str,
        dir: &Path,
    ) -> Result<PathBuf, DocumentError> {
        ensure_dir(dir).await?;
        let path = dir.join(safe_name(filename)?);
        fs::write(&path, xml).await.map_err(io_error("write", &path))?;
        info!(path = %path.display(), "saved document");
        Ok(path)
    }

    pub async fn delete(&self, filename: &str, dir: &Path) -> Result<(), DocumentError> {
        ensure_dir(dir).await?;
        let name = safe_name(filename)?;
        let path = dir.join(&name);
        match fs::remove_file(&path).await {
            Ok(()) => {
                info!(path = %path.display(), "deleted document");
                Ok(())
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                Err(DocumentError::NotFound(name))
            }
            Err(e) => Err(DocumentError::Io {
                action: "delete",
                path,
                source: e,
            }),
        }
    }
}

async fn ensure_dir(dir: &Path) -> Result<(), DocumentError> {
    if !fs::try_exists(dir).await.unwrap_or(false) {
        fs::create_dir_all(dir).await.map_err(io_error("create", dir))?;
        info!(dir = %dir.display(), "created document directory");
    }
    Ok(())
}

fn safe_name(filename: &str) -> Result<String, DocumentError> {
    let base = Path::new(filename)
        .file_name()
        .and_then(|name| name.to_str())
        .ok_or_else(|| DocumentError::InvalidName(filename.to_string()))?;

    if has_extension(base) {
        Ok(base.to_string())
    } else {
        Ok(format!("{base}{EXTENSION}"))
    }
}

fn has_extension(name: &str) -> bool {
    name.to_ascii_lowercase().ends_with(EXTENSION)
}

fn io_error(action: &'static str, path: &Path) -> impl FnOnce(std::io::Error) -> DocumentError {
    let path = path.to_path_buf();
    move |source| DocumentError::Io { action, path, source }
}
