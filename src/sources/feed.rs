use async_trait::async_trait;
use serde_json::Value;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};

use super::{
    parse_page_body, CandidateFields, FieldMap, ListingPage, RawListing, SourceAdapter, SourceError,
};

/// Reads pre-fetched pages from `{dir}/page-{n}.json`. Array pages look ahead
/// for the next file; a page file that is asked for but missing is an error.
#[derive(Debug, Clone)]
pub struct FileFeedAdapter {
    source_id: String,
    dir: PathBuf,
    fields: FieldMap,
    max_pages: u32,
}

impl FileFeedAdapter {
    pub fn new(source_id: &str, dir: impl AsRef<Path>, fields: FieldMap, max_pages: u32) -> Self {
        Self {
            source_id: source_id.to_string(),
            dir: dir.as_ref().to_path_buf(),
            fields,
            max_pages,
        }
    }

    pub fn page_path(&self, page: u32) -> PathBuf {
        self.dir.join(format!("page-{}.json", page))
    }
}

#[async_trait]
impl SourceAdapter for FileFeedAdapter {
    fn source_id(&self) -> &str {
        &self.source_id
    }

    fn max_pages(&self) -> u32 {
        self.max_pages
    }

    async fn list_page(&self, page: u32) -> Result<ListingPage, SourceError> {
        let path = self.page_path(page);
        let content = match tokio::fs::read_to_string(&path).await {
            Ok(content) => content,
            Err(err) if err.kind() == ErrorKind::NotFound => {
                return Err(SourceError::Unavailable(format!("{} not found", path.display())));
            }
            Err(err) => return Err(SourceError::Fetch(format!("{}: {}", path.display(), err))),
        };
        let body: Value = serde_json::from_str(&content)
            .map_err(|e| SourceError::Parse(format!("{}: {}", path.display(), e)))?;
        let mut page_data = parse_page_body(&body)?;
        // Without an explicit flag, look ahead for the next file.
        if body.is_array() {
            page_data.has_more = tokio::fs::try_exists(self.page_path(page + 1))
                .await
                .unwrap_or(false);
        }
        Ok(page_data)
    }

    fn parse(&self, raw: &RawListing) -> Result<CandidateFields, SourceError> {
        self.fields.extract(raw)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[tokio::test]
    async fn reads_pages_until_missing() {
        let td = tempdir().unwrap();
        std::fs::write(
            td.path().join("page-1.json"),
            r#"[{"title": "A", "price": "2.8 tỷ"}]"#,
        )
        .unwrap();
        std::fs::write(
            td.path().join("page-2.json"),
            r#"{"listings": [{"title": "B"}], "has_more": false}"#,
        )
        .unwrap();
        let adapter = FileFeedAdapter::new("feed", td.path(), FieldMap::default(), 10);

        let p1 = adapter.list_page(1).await.unwrap();
        assert_eq!(p1.listings.len(), 1);
        assert!(p1.has_more);
        let fields = adapter.parse(&p1.listings[0]).unwrap();
        assert_eq!(fields.price_text.as_deref(), Some("2.8 tỷ"));

        let p2 = adapter.list_page(2).await.unwrap();
        assert!(!p2.has_more);
    }

    #[tokio::test]
    async fn missing_page_is_not_retried() {
        let td = tempdir().unwrap();
        let adapter = FileFeedAdapter::new("feed", td.path().join("nowhere"), FieldMap::default(), 10);
        let err = adapter.list_page(1).await.unwrap_err();
        assert!(matches!(err, SourceError::Unavailable(_)));
        assert!(err.to_string().contains("page-1.json"));
        assert!(!err.is_retryable());
    }

    #[tokio::test]
    async fn malformed_page_is_parse_error() {
        let td = tempdir().unwrap();
        std::fs::write(td.path().join("page-1.json"), "{not json").unwrap();
        let adapter = FileFeedAdapter::new("feed", td.path(), FieldMap::default(), 10);
        let err = adapter.list_page(1).await.unwrap_err();
        assert!(matches!(err, SourceError::Parse(_)));
    }
}
