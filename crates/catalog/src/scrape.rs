//! Scraper contract: a scraper turns one external catalog into a batch of
//! normalized entries. Network/HTML scrapers live outside this crate; the
//! only built-in producer reads hand-curated files for the `custom` source.

use crate::model::{Entry, SourceType};
use async_trait::async_trait;
use std::path::{Path, PathBuf};

/// Directories a scraper may use for cached/working state.
#[derive(Debug, Clone)]
pub struct ScrapeContext {
    pub cache_dir: PathBuf,
    pub sources_dir: PathBuf,
}

impl ScrapeContext {
    /// Scraper-private working directory: `<sources>/<source-slug>/`.
    #[must_use]
    pub fn source_dir(&self, source: SourceType) -> PathBuf {
        self.sources_dir.join(source.as_str())
    }
}

/// A producer of normalized entries for one source.
///
/// `scrape` is the single commit point of a refresh: the scheduler
/// bulk-inserts whatever it returns, so a cancelled or failed scrape never
/// half-updates the store.
#[async_trait]
pub trait Scraper: Send + Sync {
    fn source(&self) -> SourceType;

    async fn scrape(&self, ctx: &ScrapeContext) -> anyhow::Result<Vec<Entry>>;
}

/// File-based scraper for the `custom` source: reads entry lists from
/// `<sources>/custom/*.json|*.yaml|*.yml`. Each file holds either a bare
/// list of entries or `{entries: [...]}`.
pub struct FileScraper;

#[derive(serde::Deserialize)]
#[serde(untagged)]
enum EntryFile {
    Wrapped { entries: Vec<Entry> },
    Bare(Vec<Entry>),
}

impl EntryFile {
    fn into_entries(self) -> Vec<Entry> {
        match self {
            EntryFile::Wrapped { entries } | EntryFile::Bare(entries) => entries,
        }
    }
}

#[async_trait]
impl Scraper for FileScraper {
    fn source(&self) -> SourceType {
        SourceType::Custom
    }

    async fn scrape(&self, ctx: &ScrapeContext) -> anyhow::Result<Vec<Entry>> {
        let dir = ctx.source_dir(SourceType::Custom);
        if !dir.exists() {
            tracing::debug!(dir = %dir.display(), "no custom source directory");
            return Ok(Vec::new());
        }

        let mut entries = Vec::new();
        let mut listing = tokio::fs::read_dir(&dir).await?;
        let mut paths = Vec::new();
        while let Some(item) = listing.next_entry().await? {
            paths.push(item.path());
        }
        paths.sort();

        for path in paths {
            match read_entry_file(&path).await {
                Ok(Some(batch)) => entries.extend(batch),
                Ok(None) => {}
                Err(e) => {
                    tracing::warn!(path = %path.display(), error = %e, "skipping custom source file");
                }
            }
        }

        // Custom files may omit the source field's intent; pin it.
        for entry in &mut entries {
            entry.source = SourceType::Custom;
        }
        Ok(entries)
    }
}

async fn read_entry_file(path: &Path) -> anyhow::Result<Option<Vec<Entry>>> {
    let ext = path
        .extension()
        .and_then(|e| e.to_str())
        .unwrap_or_default()
        .to_ascii_lowercase();
    let parsed = match ext.as_str() {
        "json" => {
            let text = tokio::fs::read_to_string(path).await?;
            serde_json::from_str::<EntryFile>(&text)?
        }
        "yaml" | "yml" => {
            let text = tokio::fs::read_to_string(path).await?;
            serde_yaml::from_str::<EntryFile>(&text)?
        }
        _ => return Ok(None),
    };
    Ok(Some(parsed.into_entries()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn ctx(dir: &TempDir) -> ScrapeContext {
        ScrapeContext {
            cache_dir: dir.path().join("cache"),
            sources_dir: dir.path().join("sources"),
        }
    }

    #[tokio::test]
    async fn missing_directory_yields_empty_batch() {
        let dir = TempDir::new().unwrap();
        let entries = FileScraper.scrape(&ctx(&dir)).await.unwrap();
        assert!(entries.is_empty());
    }

    #[tokio::test]
    async fn reads_json_and_yaml_files() {
        let dir = TempDir::new().unwrap();
        let ctx = ctx(&dir);
        let custom = ctx.source_dir(SourceType::Custom);
        std::fs::create_dir_all(&custom).unwrap();

        std::fs::write(
            custom.join("a.json"),
            r#"{"entries": [{"id": "one", "name": "One", "description": "d", "source": "docker"}]}"#,
        )
        .unwrap();
        std::fs::write(
            custom.join("b.yaml"),
            "- id: two\n  name: Two\n  description: d\n  source: custom\n",
        )
        .unwrap();
        std::fs::write(custom.join("notes.txt"), "ignored").unwrap();

        let entries = FileScraper.scrape(&ctx).await.unwrap();
        assert_eq!(entries.len(), 2);
        // Source is pinned to custom regardless of what the file claims.
        assert!(entries.iter().all(|e| e.source == SourceType::Custom));
    }

    #[tokio::test]
    async fn malformed_file_is_skipped() {
        let dir = TempDir::new().unwrap();
        let ctx = ctx(&dir);
        let custom = ctx.source_dir(SourceType::Custom);
        std::fs::create_dir_all(&custom).unwrap();

        std::fs::write(custom.join("bad.json"), "{not json").unwrap();
        std::fs::write(
            custom.join("good.json"),
            r#"[{"id": "ok", "name": "Ok", "description": "d", "source": "custom"}]"#,
        )
        .unwrap();

        let entries = FileScraper.scrape(&ctx).await.unwrap();
        assert_eq!(entries.len(), 1);
        assert_eq!(entries[0].id, "ok");
    }
}
