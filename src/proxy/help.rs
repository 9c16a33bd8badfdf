//! Help content served when a request carries no usable target.
//!
//! The file is read on first use and kept for the life of the server.
//! Concurrent first requests may race to read it; only one copy is kept.

use std::io;
use std::path::{Path, PathBuf};

use tokio::sync::OnceCell;
use tracing::debug;

#[derive(Debug)]
pub struct HelpText {
    path: PathBuf,
    content: OnceCell<String>,
}

impl HelpText {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            content: OnceCell::new(),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// `text/html` for `.html` files, `text/plain` otherwise
    pub fn content_type(&self) -> &'static str {
        match self.path.extension().and_then(|ext| ext.to_str()) {
            Some("html") => "text/html",
            _ => "text/plain",
        }
    }

    /// Help text, reading the file on first call. Read errors are not cached.
    pub async fn load(&self) -> io::Result<&str> {
        let content = self
            .content
            .get_or_try_init(|| async {
                debug!(path = %self.path.display(), "Loading help text");
                tokio::fs::read_to_string(&self.path).await
            })
            .await?;
        Ok(content.as_str())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn temp_file(name: &str, content: &str) -> PathBuf {
        let path = std::env::temp_dir().join(format!("proksy-{}-{}", std::process::id(), name));
        std::fs::write(&path, content).unwrap();
        path
    }

    #[test]
    fn content_type_follows_extension() {
        assert_eq!(HelpText::new("./index.html").content_type(), "text/html");
        assert_eq!(HelpText::new("./README.md").content_type(), "text/plain");
        assert_eq!(HelpText::new("./usage").content_type(), "text/plain");
    }

    #[test]
    fn loads_once_and_caches() {
        let path = temp_file("help.txt", "usage: /<url>");
        let help = HelpText::new(&path);

        let first = tokio_test::block_on(help.load()).unwrap().to_string();
        assert_eq!(first, "usage: /<url>");

        // later edits are not observed once cached
        std::fs::write(&path, "changed").unwrap();
        let second = tokio_test::block_on(help.load()).unwrap();
        assert_eq!(second, "usage: /<url>");

        std::fs::remove_file(&path).unwrap();
    }

    #[tokio::test]
    async fn missing_file_is_an_error() {
        let help = HelpText::new("/nonexistent/proksy/help.md");
        assert!(help.load().await.is_err());
    }
}
