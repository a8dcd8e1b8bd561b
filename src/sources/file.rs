//! Sandboxed file-system template provider

use super::Source;
use crate::ast::AstKey;
use crate::error::{Error, Result};
use async_trait::async_trait;
use std::path::{Component, Path, PathBuf};
use std::time::SystemTime;

/// Reads templates beneath a sandbox directory.
///
/// The sandbox root is the hard boundary no lookup may leave. An optional
/// view root (within the sandbox) is where ordinary lookups land; a lookup
/// made with `escape` may climb out of the view root but never out of the
/// sandbox. A required extension is appended to bare names, and the
/// visible-only policy rejects dot-prefixed path components.
pub struct FileSource {
    sandbox: PathBuf,
    view_root: PathBuf,
    extension: Option<String>,
    visible_only: bool,
}

impl FileSource {
    pub fn new(sandbox: impl Into<PathBuf>) -> Result<Self> {
        let sandbox = sandbox.into();
        Ok(Self {
            view_root: sandbox.clone(),
            sandbox,
            extension: Some("stencil".to_string()),
            visible_only: true,
        })
    }

    /// Narrow lookups to a view root inside the sandbox.
    pub fn with_view_root(mut self, view_root: impl Into<PathBuf>) -> Result<Self> {
        let view_root = view_root.into();
        if !view_root.starts_with(&self.sandbox) {
            return Err(Error::illegal_access(
                view_root.to_string_lossy(),
                "view root must sit within the sandbox",
            ));
        }
        self.view_root = view_root;
        Ok(self)
    }

    /// Extension appended to names lacking one; `None` disables the policy.
    pub fn with_extension(mut self, extension: Option<&str>) -> Self {
        self.extension = extension.map(|e| e.trim_start_matches('.').to_string());
        self
    }

    pub fn with_hidden_files(mut self, allowed: bool) -> Self {
        self.visible_only = !allowed;
        self
    }

    /// Resolve a template name to an on-disk path, enforcing every policy.
    fn resolve(&self, name: &str, escape: bool) -> Result<PathBuf> {
        let illegal = |limitation: &str| Error::illegal_access(name, limitation);

        let mut relative = name.trim_start_matches('/').to_string();
        if let Some(extension) = &self.extension {
            if Path::new(&relative).extension().is_none() {
                relative = format!("{}.{}", relative, extension);
            }
        }

        let candidate = Path::new(&relative);
        for component in candidate.components() {
            match component {
                Component::Normal(part) => {
                    if self.visible_only && part.to_string_lossy().starts_with('.') {
                        return Err(illegal("hidden files are not visible"));
                    }
                }
                Component::ParentDir if escape => {}
                Component::ParentDir => {
                    return Err(illegal("relative traversal is confined to the view root"));
                }
                Component::CurDir => {}
                _ => return Err(illegal("absolute paths are not permitted")),
            }
        }

        let root = if escape { &self.sandbox } else { &self.view_root };
        let path = normalize(&root.join(candidate));
        if !path.starts_with(&self.sandbox) {
            return Err(illegal("path leaves the sandbox"));
        }
        if !escape && !path.starts_with(&self.view_root) {
            return Err(illegal("path leaves the view root"));
        }
        Ok(path)
    }
}

/// Collapse `.` and `..` lexically; the sandbox check runs on the result.
fn normalize(path: &Path) -> PathBuf {
    let mut normalized = PathBuf::new();
    for component in path.components() {
        match component {
            Component::ParentDir => {
                normalized.pop();
            }
            Component::CurDir => {}
            other => normalized.push(other),
        }
    }
    normalized
}

#[async_trait]
impl Source for FileSource {
    async fn file(&self, key: &AstKey, escape: bool) -> Result<(String, Vec<u8>)> {
        let path = self.resolve(&key.name, escape)?;
        match tokio::fs::read(&path).await {
            Ok(bytes) => Ok((path.to_string_lossy().into_owned(), bytes)),
            Err(error) if error.kind() == std::io::ErrorKind::NotFound => {
                Err(Error::NoTemplateExists(key.name.clone()))
            }
            Err(error) => Err(error.into()),
        }
    }

    async fn timestamp(&self, key: &AstKey) -> Result<SystemTime> {
        let path = self.resolve(&key.name, false)?;
        let metadata = tokio::fs::metadata(&path)
            .await
            .map_err(|_| Error::NoTemplateExists(key.name.clone()))?;
        metadata.modified().map_err(Into::into)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn write(dir: &TempDir, name: &str, body: &str) {
        let path = dir.path().join(name);
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent).unwrap();
        }
        std::fs::write(path, body).unwrap();
    }

    #[tokio::test]
    async fn test_reads_with_appended_extension() {
        let dir = TempDir::new().unwrap();
        write(&dir, "index.stencil", "Hello");
        let source = FileSource::new(dir.path()).unwrap();
        let (_, bytes) = source
            .file(&AstKey::searched("index"), false)
            .await
            .unwrap();
        assert_eq!(bytes, b"Hello");
    }

    #[tokio::test]
    async fn test_missing_template_error() {
        let dir = TempDir::new().unwrap();
        let source = FileSource::new(dir.path()).unwrap();
        let error = source
            .file(&AstKey::searched("absent"), false)
            .await
            .unwrap_err();
        assert!(matches!(error, Error::NoTemplateExists(_)));
    }

    #[tokio::test]
    async fn test_traversal_rejected_without_escape() {
        let dir = TempDir::new().unwrap();
        let source = FileSource::new(dir.path()).unwrap();
        let error = source
            .file(&AstKey::searched("../outside"), false)
            .await
            .unwrap_err();
        assert!(matches!(error, Error::IllegalAccess { .. }));
    }

    #[tokio::test]
    async fn test_escape_confined_to_sandbox() {
        let dir = TempDir::new().unwrap();
        write(&dir, "shared/common.stencil", "Shared");
        let source = FileSource::new(dir.path())
            .unwrap()
            .with_view_root(dir.path().join("views"))
            .unwrap();
        std::fs::create_dir_all(dir.path().join("views")).unwrap();

        // escaping the view root within the sandbox is allowed
        let (_, bytes) = source
            .file(&AstKey::searched("shared/common"), true)
            .await
            .unwrap();
        assert_eq!(bytes, b"Shared");

        // leaving the sandbox is not, even with escape
        let error = source
            .file(&AstKey::searched("../../etc/passwd"), true)
            .await
            .unwrap_err();
        assert!(matches!(error, Error::IllegalAccess { .. }));
    }

    #[tokio::test]
    async fn test_hidden_files_invisible() {
        let dir = TempDir::new().unwrap();
        write(&dir, ".secret.stencil", "hidden");
        let source = FileSource::new(dir.path()).unwrap();
        let error = source
            .file(&AstKey::searched(".secret"), false)
            .await
            .unwrap_err();
        assert!(matches!(error, Error::IllegalAccess { .. }));
    }

    #[test]
    fn test_view_root_must_sit_in_sandbox() {
        let dir = TempDir::new().unwrap();
        let result = FileSource::new(dir.path())
            .unwrap()
            .with_view_root("/elsewhere");
        assert!(result.is_err());
    }
}
