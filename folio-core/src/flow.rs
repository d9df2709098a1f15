use std::collections::BTreeMap;

use crate::backend::{ImageState, PageSurface};
use crate::config::ViewerConfig;
use crate::PageNumber;

/// Geometry of the page column, in layout pixels.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct FlowLayout {
    pub content_width: f64,
    pub label_height: f64,
    pub page_gap: f64,
    pub header_offset: f64,
    pub viewport_height: f64,
}

impl Default for FlowLayout {
    fn default() -> Self {
        Self::from_config(&ViewerConfig::default())
    }
}

impl FlowLayout {
    pub fn from_config(config: &ViewerConfig) -> Self {
        Self {
            content_width: config.content_width,
            label_height: config.label_height,
            page_gap: config.page_gap,
            header_offset: config.header_offset,
            viewport_height: 900.0,
        }
    }

    fn outer_height(&self, surface: &PageSurface) -> f64 {
        self.label_height + surface.layout_height(self.content_width) + self.page_gap
    }
}

#[derive(Debug, Clone)]
pub struct MountedPage {
    pub page: PageNumber,
    pub surface: PageSurface,
    /// Measured height of the whole page element: label, surface and gap.
    pub height: f64,
}

/// Where a page landed.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Insertion {
    pub page: PageNumber,
    pub position: usize,
    pub top: f64,
    pub height: f64,
}

/// The scrolling column of mounted pages, ordered by page index no matter in
/// which order the pages arrive.
#[derive(Debug, Clone)]
pub struct PageFlow {
    layout: FlowLayout,
    pages: BTreeMap<PageNumber, MountedPage>,
    page_count: u32,
    scroll_top: f64,
    pinned: Option<PageNumber>,
}

impl PageFlow {
    pub fn new(layout: FlowLayout) -> Self {
        Self {
            layout,
            pages: BTreeMap::new(),
            page_count: 0,
            scroll_top: 0.0,
            pinned: None,
        }
    }

    pub fn layout(&self) -> &FlowLayout {
        &self.layout
    }

    pub fn set_viewport_height(&mut self, height: f64) {
        if height.is_finite() && height > 0.0 {
            self.layout.viewport_height = height;
        }
    }

    /// Drops every mounted page and resets scrolling.
    pub fn clear(&mut self) {
        self.pages.clear();
        self.page_count = 0;
        self.scroll_top = 0.0;
        self.pinned = None;
    }

    pub fn set_page_count(&mut self, page_count: u32) {
        self.page_count = page_count;
    }

    pub fn page_count(&self) -> u32 {
        self.page_count
    }

    pub fn len(&self) -> usize {
        self.pages.len()
    }

    pub fn is_empty(&self) -> bool {
        self.pages.is_empty()
    }

    pub fn contains(&self, page: PageNumber) -> bool {
        self.pages.contains_key(&page)
    }

    pub fn get(&self, page: PageNumber) -> Option<&MountedPage> {
        self.pages.get(&page)
    }

    pub fn pages(&self) -> impl Iterator<Item = &MountedPage> {
        self.pages.values()
    }

    pub fn page_numbers(&self) -> Vec<PageNumber> {
        self.pages.keys().copied().collect()
    }

    /// Mounts `surface` for `page`. A page that is already mounted is left alone.
    pub fn insert(&mut self, page: PageNumber, surface: PageSurface) -> Option<Insertion> {
        if self.pages.contains_key(&page) {
            return None;
        }
        let height = self.layout.outer_height(&surface);
        let position = self.pages.range(..page).count();
        let top: f64 = self.pages.range(..page).map(|(_, p)| p.height).sum();
        self.pages.insert(
            page,
            MountedPage {
                page,
                surface,
                height,
            },
        );
        Some(Insertion {
            page,
            position,
            top,
            height,
        })
    }

    /// Replaces the image state of a mounted raster page and returns the change
    /// in element height.
    pub fn settle_image(&mut self, page: PageNumber, state: ImageState) -> Option<f64> {
        let layout = self.layout;
        let mounted = self.pages.get_mut(&page)?;
        let PageSurface::Image(surface) = &mut mounted.surface else {
            return None;
        };
        surface.state = state;
        let height = layout.outer_height(&mounted.surface);
        let delta = height - mounted.height;
        mounted.height = height;
        Some(delta)
    }

    pub fn page_top(&self, page: PageNumber) -> Option<f64> {
        if !self.pages.contains_key(&page) {
            return None;
        }
        Some(self.pages.range(..page).map(|(_, p)| p.height).sum())
    }

    /// Position of `page` relative to the top of the viewport.
    pub fn screen_y(&self, page: PageNumber) -> Option<f64> {
        self.page_top(page).map(|top| top - self.scroll_top)
    }

    pub fn total_height(&self) -> f64 {
        self.pages.values().map(|p| p.height).sum()
    }

    /// The mounted page covering document offset `y`.
    pub fn page_at(&self, y: f64) -> Option<PageNumber> {
        let mut top = 0.0;
        let mut last = None;
        for mounted in self.pages.values() {
            if y < top + mounted.height {
                return Some(mounted.page);
            }
            top += mounted.height;
            last = Some(mounted.page);
        }
        last
    }

    /// The page a reader is looking at, just below the header.
    pub fn current_page(&self) -> Option<PageNumber> {
        // half a pixel absorbs rounding left over from `jump_to`
        self.page_at(self.scroll_top + self.layout.header_offset + 0.5)
    }

    pub fn scroll_top(&self) -> f64 {
        self.scroll_top
    }

    pub fn scroll_to(&mut self, y: f64) {
        self.scroll_top = y.max(0.0);
    }

    pub fn scroll_by(&mut self, delta: f64) {
        self.scroll_to(self.scroll_top + delta);
    }

    /// Reader initiated scrolling releases any pinned target page.
    pub fn user_scroll(&mut self, delta: f64) {
        self.pinned = None;
        let max = (self.total_height() - self.layout.viewport_height).max(0.0);
        self.scroll_top = (self.scroll_top + delta).clamp(0.0, max);
    }

    /// Instantly positions `page` just below the header. Returns false when the
    /// page is not mounted.
    pub fn jump_to(&mut self, page: PageNumber) -> bool {
        match self.page_top(page) {
            Some(top) => {
                self.scroll_to(top - self.layout.header_offset);
                self.pinned = Some(page);
                true
            }
            None => false,
        }
    }

    pub fn pinned(&self) -> Option<PageNumber> {
        self.pinned
    }

}
