use std::path::PathBuf;

use async_trait::async_trait;

/// Source of the auxiliary credential forwarded to agents with setup tasks.
#[async_trait]
pub trait TokenSource: Send + Sync {
    /// `Ok(None)` when no token is configured.
    async fn fetch(&self) -> std::io::Result<Option<String>>;
}

/// Reads the token from a file on every call, so rotation needs no restart.
pub struct FileTokenSource {
    path: PathBuf,
}

impl FileTokenSource {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }
}

#[async_trait]
impl TokenSource for FileTokenSource {
    async fn fetch(&self) -> std::io::Result<Option<String>> {
        let raw = tokio::fs::read_to_string(&self.path).await?;
        Ok(Some(raw.trim().to_string()))
    }
}

/// Fixed token, or none at all.
pub struct StaticTokenSource(pub Option<String>);

#[async_trait]
impl TokenSource for StaticTokenSource {
    async fn fetch(&self) -> std::io::Result<Option<String>> {
        Ok(self.0.clone())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn file_token_is_trimmed() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("token");
        std::fs::write(&path, "secret\n").unwrap();
        let token = FileTokenSource::new(&path).fetch().await.unwrap();
        assert_eq!(token.as_deref(), Some("secret"));
    }

    #[tokio::test]
    async fn missing_file_is_an_io_error() {
        let source = FileTokenSource::new("/nonexistent/relay/token");
        assert!(source.fetch().await.is_err());
    }
}
