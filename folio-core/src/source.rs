use std::ops::Range;
use std::sync::Arc;

use async_trait::async_trait;
use bytes::{Bytes, BytesMut};
use serde::{Deserialize, Serialize};
use tracing::{debug, instrument, warn};

use crate::config::SiteLayout;
use crate::error::{FetchError, ViewerError};
use crate::store::RecordStore;
use crate::{DocumentId, PageNumber, RenderMode};

/// Network-ish access to static issue data.
#[async_trait]
pub trait Fetcher: Send + Sync {
    async fn fetch(&self, url: &str) -> Result<Bytes, FetchError>;

    /// A partial reply holds at most `range.end - range.start` bytes; fewer means
    /// end of resource.
    async fn fetch_range(&self, url: &str, range: Range<u64>) -> Result<RangeReply, FetchError>;

    async fn exists(&self, url: &str) -> bool;
}

/// Answer to a range request.
#[derive(Debug, Clone, PartialEq)]
pub enum RangeReply {
    Partial(Bytes),
    /// The server ignored the range and sent the whole resource.
    Full(Bytes),
}

impl RangeReply {
    pub fn into_bytes(self) -> Bytes {
        match self {
            RangeReply::Partial(bytes) | RangeReply::Full(bytes) => bytes,
        }
    }
}

/// Where the bytes of a document come from.
#[derive(Debug, Clone, PartialEq)]
pub enum DocumentSource {
    /// Previously stored blob.
    Bytes(Bytes),
    /// Remote document, fetched in ranges by the decoder.
    Stream { url: String },
    /// Raster mode manifest.
    Manifest { url: String },
}

impl DocumentSource {
    pub fn mode(&self) -> RenderMode {
        match self {
            DocumentSource::Bytes(_) | DocumentSource::Stream { .. } => RenderMode::Vector,
            DocumentSource::Manifest { .. } => RenderMode::Raster,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct IssueDetail {
    pub id: String,
    pub title: String,
    #[serde(default)]
    pub publish_date: Option<String>,
    #[serde(default)]
    pub pdf_url: Option<String>,
    #[serde(default)]
    pub cover_image: Option<String>,
    #[serde(default)]
    pub articles: Vec<ArticleSummary>,
}

/// Every published issue, as listed in the site's issue index.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct IssueIndex {
    pub issues: Vec<IssueDetail>,
}

impl IssueIndex {
    pub fn parse(raw: &[u8]) -> Result<Self, String> {
        serde_json::from_slice(raw).map_err(|err| err.to_string())
    }

    /// Newest publish date first; undated issues go last.
    pub fn newest_first(&self) -> Vec<&IssueDetail> {
        let mut issues: Vec<&IssueDetail> = self.issues.iter().collect();
        issues.sort_by(|a, b| b.publish_date.cmp(&a.publish_date));
        issues
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ArticleSummary {
    pub id: String,
    pub title: String,
    pub page_number: PageNumber,
    #[serde(default)]
    pub order: u32,
    #[serde(default)]
    pub summary: Option<String>,
    #[serde(default)]
    pub insight: Option<String>,
}

/// Local cache first, then the issue detail's document URL, then the
/// conventional path derived from the id.
pub struct SourceResolver {
    records: Arc<dyn RecordStore>,
    fetcher: Arc<dyn Fetcher>,
    site: SiteLayout,
}

impl SourceResolver {
    pub fn new(records: Arc<dyn RecordStore>, fetcher: Arc<dyn Fetcher>, site: SiteLayout) -> Self {
        Self {
            records,
            fetcher,
            site,
        }
    }

    pub fn site(&self) -> &SiteLayout {
        &self.site
    }

    #[instrument(skip(self, document), fields(document = %document))]
    pub async fn resolve(
        &self,
        document: &DocumentId,
        mode: RenderMode,
    ) -> Result<DocumentSource, ViewerError> {
        match mode {
            RenderMode::Raster => Ok(DocumentSource::Manifest {
                url: self.site.manifest_url(document),
            }),
            RenderMode::Vector => self.resolve_vector(document).await,
        }
    }

    async fn resolve_vector(&self, document: &DocumentId) -> Result<DocumentSource, ViewerError> {
        match self.records.load_blob(document).await {
            Ok(Some(blob)) if !blob.is_empty() => {
                debug!(bytes = blob.len(), "resolved document from local records");
                return Ok(DocumentSource::Bytes(blob));
            }
            Ok(_) => {}
            Err(err) => warn!(?err, "failed to read local record, trying remote sources"),
        }

        if let Some(detail) = self.issue_detail(document).await {
            if let Some(href) = detail.pdf_url.as_deref().filter(|href| !href.is_empty()) {
                let url = self.site.resolve_href(href);
                if self.fetcher.exists(&url).await {
                    debug!(%url, "resolved document from issue detail");
                    return Ok(DocumentSource::Stream { url });
                }
                warn!(%url, "issue detail points at a missing document, trying default path");
            }
        }

        let url = self.site.default_pdf_url(document);
        if self.fetcher.exists(&url).await {
            debug!(%url, "resolved document from default path");
            return Ok(DocumentSource::Stream { url });
        }

        Err(ViewerError::DocumentNotFound {
            document: document.clone(),
        })
    }

    /// Issue detail JSON, `None` when missing or unreadable.
    pub async fn issue_detail(&self, document: &DocumentId) -> Option<IssueDetail> {
        let url = self.site.issue_detail_url(document);
        let raw = match self.fetcher.fetch(&url).await {
            Ok(raw) => raw,
            Err(err) => {
                debug!(%err, "issue detail unavailable");
                return None;
            }
        };
        match serde_json::from_slice(&raw) {
            Ok(detail) => Some(detail),
            Err(err) => {
                warn!(%url, %err, "failed to decode issue detail");
                None
            }
        }
    }
}

/// Downloads `url` in fixed size range requests until a short chunk arrives,
/// or until the server answers with the whole resource.
pub async fn fetch_chunked(
    fetcher: &dyn Fetcher,
    url: &str,
    chunk_size: usize,
) -> Result<Bytes, FetchError> {
    let chunk_size = chunk_size.max(1) as u64;
    let mut buffer = BytesMut::new();
    let mut offset = 0u64;
    loop {
        let chunk = match fetcher.fetch_range(url, offset..offset + chunk_size).await? {
            RangeReply::Partial(chunk) => chunk,
            RangeReply::Full(whole) => {
                debug!(%url, bytes = whole.len(), "server ignored range request");
                return Ok(whole);
            }
        };
        let received = chunk.len() as u64;
        buffer.extend_from_slice(&chunk);
        offset += received;
        if received < chunk_size {
            break;
        }
    }
    Ok(buffer.freeze())
}
