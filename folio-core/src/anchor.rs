use tracing::trace;

use crate::flow::PageFlow;
use crate::PageNumber;

/// Keeps the anchor page still on screen while pages appear above it.
#[derive(Debug, Default, Clone, Copy)]
pub struct ScrollAnchor {
    page: Option<PageNumber>,
}

impl ScrollAnchor {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set(&mut self, page: PageNumber) {
        self.page = Some(page);
    }

    pub fn clear(&mut self) {
        self.page = None;
    }

    pub fn page(&self) -> Option<PageNumber> {
        self.page
    }

    /// Anchors on whatever page currently sits under the header.
    pub fn follow_viewport(&mut self, flow: &PageFlow) {
        self.page = flow.current_page();
    }

    /// Shifts the viewport by `delta` when `changed` sits above the anchor.
    /// Must run under the same flow borrow as the change itself.
    pub fn compensate(&self, flow: &mut PageFlow, changed: PageNumber, delta: f64) -> f64 {
        match self.page {
            Some(anchor) if changed < anchor && delta != 0.0 => {
                flow.scroll_by(delta);
                trace!(anchor, changed, delta, "compensated scroll offset");
                delta
            }
            _ => 0.0,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::PageSurface;
    use crate::flow::FlowLayout;
    use crate::RenderImage;

    fn painted(height: u32) -> PageSurface {
        PageSurface::Painted(RenderImage {
            width: 100,
            height,
            pixels: Vec::new(),
        })
    }

    fn flow() -> PageFlow {
        PageFlow::new(FlowLayout {
            content_width: 100.0,
            label_height: 12.0,
            page_gap: 8.0,
            header_offset: 40.0,
            viewport_height: 400.0,
        })
    }

    #[test]
    fn insertion_above_anchor_keeps_anchor_on_screen() {
        let mut flow = flow();
        flow.insert(20, painted(300));
        flow.insert(21, painted(300));
        flow.scroll_to(150.0);

        let mut anchor = ScrollAnchor::new();
        anchor.set(20);
        let before = flow.screen_y(20).unwrap();
        let scroll_before = flow.scroll_top();

        let inserted = flow.insert(19, painted(137)).unwrap();
        let applied = anchor.compensate(&mut flow, 19, inserted.height);

        assert_eq!(applied, inserted.height);
        assert!((flow.scroll_top() - scroll_before - inserted.height).abs() < 1e-9);
        assert!((flow.screen_y(20).unwrap() - before).abs() < 1e-9);
    }

    #[test]
    fn insertion_below_anchor_needs_no_compensation() {
        let mut flow = flow();
        flow.insert(20, painted(300));
        let mut anchor = ScrollAnchor::new();
        anchor.set(20);
        let inserted = flow.insert(22, painted(300)).unwrap();
        assert_eq!(anchor.compensate(&mut flow, 22, inserted.height), 0.0);
        assert_eq!(flow.scroll_top(), 0.0);
    }

    #[test]
    fn cleared_anchor_never_compensates() {
        let mut flow = flow();
        flow.insert(20, painted(300));
        let mut anchor = ScrollAnchor::new();
        anchor.set(20);
        anchor.clear();
        let inserted = flow.insert(3, painted(300)).unwrap();
        assert_eq!(anchor.compensate(&mut flow, 3, inserted.height), 0.0);
        assert_eq!(anchor.page(), None);
    }

    #[test]
    fn follow_viewport_picks_page_under_header() {
        let mut flow = flow();
        for page in 5..=8 {
            flow.insert(page, painted(100));
        }
        flow.scroll_to(130.0);
        let mut anchor = ScrollAnchor::new();
        anchor.follow_viewport(&flow);
        assert_eq!(anchor.page(), Some(6));
    }
}
