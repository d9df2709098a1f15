use std::fs;
use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::{DocumentId, ViewerError};

/// Runtime tunables, read from `config.toml`. Every field is optional.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ViewerConfig {
    pub preload_range: u32,
    pub background_batch_size: usize,
    pub background_idle_ms: u64,
    pub backward_sweep: bool,
    pub scale: f32,
    pub range_chunk_size: usize,
    pub header_offset: f64,
    pub page_gap: f64,
    pub label_height: f64,
    pub content_width: f64,
    pub default_aspect_ratio: f64,
    pub worker_denylist: Vec<String>,
    pub site: SiteLayout,
}

impl Default for ViewerConfig {
    fn default() -> Self {
        Self {
            preload_range: 2,
            background_batch_size: 4,
            background_idle_ms: 50,
            backward_sweep: true,
            scale: 1.5,
            range_chunk_size: 65_536,
            header_offset: 80.0,
            page_gap: 16.0,
            label_height: 20.0,
            content_width: 1024.0,
            default_aspect_ratio: 1.414,
            worker_denylist: Vec::new(),
            site: SiteLayout::default(),
        }
    }
}

impl ViewerConfig {
    /// Loads the config at `path`, falling back to defaults when the file is absent.
    pub fn load(path: &Path) -> Result<Self, ViewerError> {
        if !path.exists() {
            return Ok(Self::default());
        }
        let raw = fs::read_to_string(path).map_err(|err| ViewerError::io(path, err))?;
        let config: ViewerConfig = toml::from_str(&raw)
            .map_err(|err| ViewerError::Config(format!("{}: {}", path.display(), err)))?;
        Ok(config.sanitized())
    }

    pub fn background_idle(&self) -> Duration {
        Duration::from_millis(self.background_idle_ms)
    }

    fn sanitized(mut self) -> Self {
        self.background_batch_size = self.background_batch_size.max(1);
        self.range_chunk_size = self.range_chunk_size.max(1024);
        if !self.scale.is_finite() || self.scale <= 0.0 {
            self.scale = 1.5;
        }
        if !self.default_aspect_ratio.is_finite() || self.default_aspect_ratio <= 0.0 {
            self.default_aspect_ratio = 1.414;
        }
        if !self.content_width.is_finite() || self.content_width <= 0.0 {
            self.content_width = 1024.0;
        }
        self
    }
}

/// Where static issue data lives on the site.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SiteLayout {
    /// Deployment prefix every static path is served under, e.g. `/caixinweekly/`.
    pub base_path: String,
    /// Sub-path segment toggled when a raster asset fails from its primary base.
    /// Unset means the segment of `base_path`.
    pub alternate_strip: Option<String>,
    pub pdf_dir: String,
    /// JSON list of every published issue.
    pub issue_index: String,
    pub issue_dir: String,
    pub pages_dir: String,
    pub manifest_file: String,
}

impl Default for SiteLayout {
    fn default() -> Self {
        Self {
            base_path: "/".to_string(),
            alternate_strip: None,
            pdf_dir: "/data/pdfs".to_string(),
            issue_index: "/data/issues.json".to_string(),
            issue_dir: "/data/issues".to_string(),
            pages_dir: "/data/pages".to_string(),
            manifest_file: "manifest.json".to_string(),
        }
    }
}

impl SiteLayout {
    pub fn url_for(&self, path: &str) -> String {
        let base = self.base_path.trim_end_matches('/');
        if path.starts_with('/') {
            format!("{}{}", base, path)
        } else {
            format!("{}/{}", base, path)
        }
    }

    /// Resolves an href found in issue data. Absolute URLs and paths that already
    /// carry the deployment prefix are kept as they are.
    pub fn resolve_href(&self, href: &str) -> String {
        let base = self.base_path.trim_end_matches('/');
        if href.contains("://") || (!base.is_empty() && href.starts_with(&format!("{}/", base))) {
            href.to_string()
        } else {
            self.url_for(href)
        }
    }

    pub fn issues_url(&self) -> String {
        self.url_for(&self.issue_index)
    }

    pub fn issue_detail_url(&self, document: &DocumentId) -> String {
        self.url_for(&format!("{}/{}.json", dir(&self.issue_dir), document))
    }

    pub fn default_pdf_url(&self, document: &DocumentId) -> String {
        self.url_for(&format!("{}/{}.pdf", dir(&self.pdf_dir), document))
    }

    pub fn pages_base(&self, document: &DocumentId) -> String {
        self.url_for(&format!("{}/{}/", dir(&self.pages_dir), document))
    }

    pub fn manifest_url(&self, document: &DocumentId) -> String {
        format!("{}{}", self.pages_base(document), self.manifest_file)
    }

    /// The other side of a sub-path mismatch: strips the configured segment when
    /// `base` carries it and adds it otherwise.
    pub fn alternate_base(&self, base: &str) -> Option<String> {
        let segment = self
            .alternate_strip
            .as_deref()
            .unwrap_or(&self.base_path)
            .trim_matches('/');
        if segment.is_empty() {
            return None;
        }
        let prefix = format!("/{}/", segment);
        let alternate = match base.strip_prefix(&prefix) {
            Some(rest) => format!("/{}", rest),
            None if base.starts_with('/') => format!("/{}{}", segment, base),
            None => return None,
        };
        (alternate != base).then_some(alternate)
    }
}

fn dir(path: &str) -> &str {
    path.trim_end_matches('/')
}
