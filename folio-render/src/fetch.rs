use std::io::{ErrorKind, Read, SeekFrom};
use std::ops::Range;
use std::path::{Component, Path, PathBuf};
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use folio_core::{FetchError, Fetcher, RangeReply};
use tokio::io::{AsyncReadExt, AsyncSeekExt};
use tracing::{debug, instrument};

/// Serves a static deploy of the issue site from a local directory.
pub struct StaticSiteFetcher {
    root: PathBuf,
    mount: Option<String>,
}

impl StaticSiteFetcher {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self {
            root: root.into(),
            mount: None,
        }
    }

    /// Strips the deploy prefix (for example `/weekly/`) before resolving files.
    pub fn with_mount(mut self, base_path: &str) -> Self {
        let trimmed = base_path.trim_matches('/');
        self.mount = (!trimmed.is_empty()).then(|| format!("/{}/", trimmed));
        self
    }

    fn path_for(&self, url: &str) -> Result<PathBuf, FetchError> {
        let path = url.split(['?', '#']).next().unwrap_or_default();
        let path = match &self.mount {
            Some(mount) => path.strip_prefix(mount.as_str()).unwrap_or(path),
            None => path,
        };
        let relative = Path::new(path.trim_start_matches('/'));
        if relative
            .components()
            .any(|component| !matches!(component, Component::Normal(_)))
        {
            return Err(FetchError::NotFound { url: url.into() });
        }
        Ok(self.root.join(relative))
    }
}

fn io_error(url: &str, err: std::io::Error) -> FetchError {
    match err.kind() {
        ErrorKind::NotFound => FetchError::NotFound { url: url.into() },
        _ => FetchError::Io {
            url: url.into(),
            reason: err.to_string(),
        },
    }
}

#[async_trait]
impl Fetcher for StaticSiteFetcher {
    async fn fetch(&self, url: &str) -> Result<Bytes, FetchError> {
        let path = self.path_for(url)?;
        let raw = tokio::fs::read(&path)
            .await
            .map_err(|err| io_error(url, err))?;
        Ok(Bytes::from(raw))
    }

    async fn fetch_range(&self, url: &str, range: Range<u64>) -> Result<RangeReply, FetchError> {
        let path = self.path_for(url)?;
        let mut file = tokio::fs::File::open(&path)
            .await
            .map_err(|err| io_error(url, err))?;
        file.seek(SeekFrom::Start(range.start))
            .await
            .map_err(|err| io_error(url, err))?;
        let mut chunk = Vec::new();
        file.take(range.end.saturating_sub(range.start))
            .read_to_end(&mut chunk)
            .await
            .map_err(|err| io_error(url, err))?;
        Ok(RangeReply::Partial(Bytes::from(chunk)))
    }

    async fn exists(&self, url: &str) -> bool {
        match self.path_for(url) {
            Ok(path) => tokio::fs::metadata(path)
                .await
                .map(|meta| meta.is_file())
                .unwrap_or(false),
            Err(_) => false,
        }
    }
}

/// Fetches from a web deploy. ureq is blocking, so every request runs on the
/// blocking pool.
pub struct HttpFetcher {
    origin: String,
    agent: ureq::Agent,
}

impl HttpFetcher {
    pub fn new(origin: &str) -> Self {
        let agent = ureq::AgentBuilder::new()
            .timeout_connect(Duration::from_secs(10))
            .timeout_read(Duration::from_secs(60))
            .build();
        Self {
            origin: origin.trim_end_matches('/').to_string(),
            agent,
        }
    }

    pub fn absolute(&self, url: &str) -> String {
        if url.starts_with("http://") || url.starts_with("https://") {
            url.to_string()
        } else {
            format!("{}/{}", self.origin, url.trim_start_matches('/'))
        }
    }

    async fn request(
        &self,
        method: &'static str,
        url: &str,
        range: Option<Range<u64>>,
    ) -> Result<Response, FetchError> {
        let agent = self.agent.clone();
        let absolute = self.absolute(url);
        let original = url.to_string();
        tokio::task::spawn_blocking(move || {
            let mut request = agent.request(method, &absolute);
            if let Some(range) = &range {
                request = request.set(
                    "Range",
                    &format!("bytes={}-{}", range.start, range.end.saturating_sub(1)),
                );
            }
            match request.call() {
                Ok(response) => read_response(&original, response),
                Err(ureq::Error::Status(404, _)) => Err(FetchError::NotFound { url: original }),
                // Asking past the end of the document.
                Err(ureq::Error::Status(416, _)) => Ok(Response {
                    status: 416,
                    body: Vec::new(),
                }),
                Err(ureq::Error::Status(status, _)) => Err(FetchError::Status {
                    url: original,
                    status,
                }),
                Err(err) => Err(FetchError::Transport {
                    url: original,
                    reason: err.to_string(),
                }),
            }
        })
        .await
        .map_err(|err| FetchError::Transport {
            url: url.into(),
            reason: err.to_string(),
        })?
    }
}

struct Response {
    status: u16,
    body: Vec<u8>,
}

fn read_response(url: &str, response: ureq::Response) -> Result<Response, FetchError> {
    let status = response.status();
    let mut body = Vec::new();
    response
        .into_reader()
        .read_to_end(&mut body)
        .map_err(|err| FetchError::Io {
            url: url.into(),
            reason: err.to_string(),
        })?;
    Ok(Response { status, body })
}

#[async_trait]
impl Fetcher for HttpFetcher {
    #[instrument(skip(self))]
    async fn fetch(&self, url: &str) -> Result<Bytes, FetchError> {
        let response = self.request("GET", url, None).await?;
        Ok(Bytes::from(response.body))
    }

    async fn fetch_range(&self, url: &str, range: Range<u64>) -> Result<RangeReply, FetchError> {
        let response = self.request("GET", url, Some(range)).await?;
        Ok(range_reply(response))
    }

    async fn exists(&self, url: &str) -> bool {
        match self.request("HEAD", url, None).await {
            Ok(_) => true,
            Err(err) => {
                debug!(%err, "existence check failed");
                false
            }
        }
    }
}

/// Servers that ignore `Range` answer 200 with the whole body.
fn range_reply(response: Response) -> RangeReply {
    let body = Bytes::from(response.body);
    if response.status == 200 {
        RangeReply::Full(body)
    } else {
        RangeReply::Partial(body)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;

    use folio_core::source::fetch_chunked;
    use tempfile::tempdir;

    fn site() -> (tempfile::TempDir, StaticSiteFetcher) {
        let dir = tempdir().unwrap();
        fs::create_dir_all(dir.path().join("data/pages/2025-40")).unwrap();
        fs::write(dir.path().join("data/pages/2025-40/manifest.json"), b"{}").unwrap();
        let body: Vec<u8> = (0..300u32).map(|v| v as u8).collect();
        fs::create_dir_all(dir.path().join("data/pdfs")).unwrap();
        fs::write(dir.path().join("data/pdfs/2025-40.pdf"), body).unwrap();
        let fetcher = StaticSiteFetcher::new(dir.path());
        (dir, fetcher)
    }

    #[tokio::test]
    async fn serves_files_under_root() {
        let (_dir, fetcher) = site();
        let raw = fetcher
            .fetch("/data/pages/2025-40/manifest.json")
            .await
            .unwrap();
        assert_eq!(raw.as_ref(), b"{}");
        assert!(fetcher.exists("/data/pdfs/2025-40.pdf?v=2").await);
        assert!(!fetcher.exists("/data/pdfs").await);
        assert!(matches!(
            fetcher.fetch("/data/pdfs/nope.pdf").await,
            Err(FetchError::NotFound { .. })
        ));
    }

    #[tokio::test]
    async fn rejects_paths_leaving_the_root() {
        let (_dir, fetcher) = site();
        assert!(matches!(
            fetcher.fetch("/data/../../etc/passwd").await,
            Err(FetchError::NotFound { .. })
        ));
        assert!(!fetcher.exists("/../secret").await);
    }

    #[tokio::test]
    async fn mount_prefix_is_stripped() {
        let (_dir, fetcher) = site();
        let fetcher = fetcher.with_mount("/weekly/");
        assert!(fetcher.exists("/weekly/data/pdfs/2025-40.pdf").await);
        assert!(fetcher.exists("/data/pdfs/2025-40.pdf").await);
    }

    #[tokio::test]
    async fn ranges_are_short_at_end_of_file() {
        let (_dir, fetcher) = site();
        let chunk = fetcher
            .fetch_range("/data/pdfs/2025-40.pdf", 256..512)
            .await
            .unwrap()
            .into_bytes();
        assert_eq!(chunk.len(), 44);
        assert_eq!(chunk[0], 0);

        let whole = fetch_chunked(&fetcher, "/data/pdfs/2025-40.pdf", 128)
            .await
            .unwrap();
        assert_eq!(whole.len(), 300);
        assert_eq!(whole[299], (299u32 as u8));
    }

    #[test]
    fn http_urls_are_joined_with_origin() {
        let fetcher = HttpFetcher::new("https://example.org/");
        assert_eq!(
            fetcher.absolute("/data/issues/2025-40.json"),
            "https://example.org/data/issues/2025-40.json"
        );
        assert_eq!(
            fetcher.absolute("https://cdn.example.org/a.pdf"),
            "https://cdn.example.org/a.pdf"
        );
    }

    #[test]
    fn ignored_range_is_reported_as_full_body() {
        let full = Response {
            status: 200,
            body: (0..10u8).collect(),
        };
        assert_eq!(
            range_reply(full),
            RangeReply::Full(Bytes::from_static(&[0, 1, 2, 3, 4, 5, 6, 7, 8, 9]))
        );
        let partial = Response {
            status: 206,
            body: vec![1, 2],
        };
        assert_eq!(
            range_reply(partial),
            RangeReply::Partial(Bytes::from_static(&[1, 2]))
        );
        let past_end = Response {
            status: 416,
            body: Vec::new(),
        };
        assert_eq!(range_reply(past_end), RangeReply::Partial(Bytes::new()));
    }
}
