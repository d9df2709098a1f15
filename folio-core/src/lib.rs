//! Progressive rendering engine for scanned magazine issues.
//!
//! A [`LoadSessionManager`] opens a document through one of two render
//! backends and hands it to the [`PageScheduler`], which mounts pages into a
//! [`PageFlow`] while the [`ScrollAnchor`] keeps the viewport steady.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

pub mod anchor;
pub mod backend;
pub mod config;
pub mod error;
pub mod flow;
pub mod manifest;
pub mod probe;
pub mod scheduler;
pub mod session;
pub mod source;
pub mod store;
pub mod viewer;

pub use anchor::ScrollAnchor;
pub use backend::{
    Backend, DecodedDocument, DocumentDecoder, DocumentHandle, ImageState, ImageSurface,
    OpenContext, OpenParams, PageSurface,
};
pub use config::{SiteLayout, ViewerConfig};
pub use error::{FetchError, ViewerError};
pub use flow::{FlowLayout, Insertion, MountedPage, PageFlow};
pub use manifest::{Manifest, OutlineEntry};
pub use probe::{CapabilityProber, HostEnvironment};
pub use scheduler::{PageEntry, PageScheduler, PageState, PageTable, ScheduleConfig, SweepReport};
pub use session::{
    EventQueue, LoadSessionManager, LoadState, SessionContext, SessionHandle, SessionKey,
    SessionToken, StartOutcome, ViewerDeps, ViewerEvent,
};
pub use source::{
    ArticleSummary, DocumentSource, Fetcher, IssueDetail, IssueIndex, RangeReply, SourceResolver,
};
pub use store::{
    DirectoryRecordStore, FileSettingsStore, MemoryRecordStore, MemorySettingsStore, RecordStore,
    SettingsStore, ViewerSettings,
};
pub use viewer::{Viewer, ViewerStatus};

/// 1-based page index.
pub type PageNumber = u32;

/// Identifier of an issue as used in routes and static paths, e.g. `2025-40`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct DocumentId(String);

impl DocumentId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for DocumentId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RenderMode {
    /// Decode and paint the page description.
    #[default]
    Vector,
    /// Show pre-rendered page images listed in a manifest.
    Raster,
}

impl RenderMode {
    pub fn toggled(self) -> Self {
        match self {
            RenderMode::Vector => RenderMode::Raster,
            RenderMode::Raster => RenderMode::Vector,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            RenderMode::Vector => "vector",
            RenderMode::Raster => "raster",
        }
    }
}

impl fmt::Display for RenderMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for RenderMode {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "vector" | "pdf" => Ok(RenderMode::Vector),
            "raster" | "image" | "images" => Ok(RenderMode::Raster),
            other => Err(format!("unknown render mode `{}`", other)),
        }
    }
}

/// RGBA8 pixels.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RenderImage {
    pub width: u32,
    pub height: u32,
    pub pixels: Vec<u8>,
}

impl RenderImage {
    /// Height over width, `None` for degenerate images.
    pub fn aspect_ratio(&self) -> Option<f64> {
        (self.width > 0 && self.height > 0).then(|| self.height as f64 / self.width as f64)
    }
}

/// Parses the page component of a route. Anything unusable means page 1.
pub fn parse_target_page(raw: Option<&str>) -> PageNumber {
    raw.and_then(|value| value.trim().parse::<i64>().ok())
        .filter(|&page| page >= 1)
        .map(|page| page.min(PageNumber::MAX as i64) as PageNumber)
        .unwrap_or(1)
}

/// Clamps `page` into `[1, page_count]` once the count is known.
pub fn clamp_page(page: PageNumber, page_count: u32) -> PageNumber {
    page.clamp(1, page_count.max(1))
}

#[derive(Debug, Clone, PartialEq)]
pub enum Command {
    ScrollBy { pixels: f64 },
    ScrollScreens { count: isize },
    NextPage { count: usize },
    PrevPage { count: usize },
    GotoPage { page: PageNumber },
    LastPage,
    ToggleMode,
    Reload,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn target_page_defaults_to_first_page() {
        assert_eq!(parse_target_page(None), 1);
        assert_eq!(parse_target_page(Some("")), 1);
        assert_eq!(parse_target_page(Some("abc")), 1);
        assert_eq!(parse_target_page(Some("0")), 1);
        assert_eq!(parse_target_page(Some("-4")), 1);
        assert_eq!(parse_target_page(Some(" 20 ")), 20);
    }

    #[test]
    fn target_page_is_clamped_to_document() {
        assert_eq!(clamp_page(0, 50), 1);
        assert_eq!(clamp_page(20, 50), 20);
        assert_eq!(clamp_page(80, 50), 50);
        assert_eq!(clamp_page(3, 0), 1);
    }

    #[test]
    fn render_mode_parses_aliases() {
        assert_eq!("PDF".parse::<RenderMode>().unwrap(), RenderMode::Vector);
        assert_eq!("images".parse::<RenderMode>().unwrap(), RenderMode::Raster);
        assert!("paper".parse::<RenderMode>().is_err());
        assert_eq!(RenderMode::Vector.toggled(), RenderMode::Raster);
        assert_eq!(RenderMode::default(), RenderMode::Vector);
    }
}
