use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use tracing::{debug, info, instrument, warn};

use crate::anchor::ScrollAnchor;
use crate::backend::{Backend, ImageState, PageSurface};
use crate::config::ViewerConfig;
use crate::error::ViewerError;
use crate::flow::PageFlow;
use crate::session::{EventQueue, SessionContext, ViewerEvent};
use crate::{clamp_page, PageNumber};

#[derive(Debug, Clone, PartialEq)]
pub struct ScheduleConfig {
    /// Pages rendered eagerly on each side of the target.
    pub preload_range: u32,
    pub batch_size: usize,
    /// Pause between background batches.
    pub idle: Duration,
    pub backward_sweep: bool,
}

impl Default for ScheduleConfig {
    fn default() -> Self {
        Self::from_config(&ViewerConfig::default())
    }
}

impl ScheduleConfig {
    pub fn from_config(config: &ViewerConfig) -> Self {
        Self {
            preload_range: config.preload_range,
            batch_size: config.background_batch_size.max(1),
            idle: config.background_idle(),
            backward_sweep: config.backward_sweep,
        }
    }
}

/// Pages around `target`, nearest first, alternating above and below.
pub fn neighborhood(target: PageNumber, range: u32, page_count: u32) -> Vec<PageNumber> {
    let mut pages = Vec::with_capacity(range as usize * 2);
    for offset in 1..=range {
        if let Some(before) = target.checked_sub(offset).filter(|&p| p >= 1) {
            pages.push(before);
        }
        if let Some(after) = target.checked_add(offset).filter(|&p| p <= page_count) {
            pages.push(after);
        }
    }
    pages
}

/// Everything after the neighborhood, in batches of `batch_size`.
pub fn forward_batches(
    target: PageNumber,
    range: u32,
    page_count: u32,
    batch_size: usize,
) -> Vec<Vec<PageNumber>> {
    let start = target.saturating_add(range).saturating_add(1);
    let pages: Vec<PageNumber> = (start..=page_count).collect();
    pages.chunks(batch_size.max(1)).map(<[_]>::to_vec).collect()
}

/// Everything before the neighborhood, nearest first, in batches of `batch_size`.
pub fn backward_batches(target: PageNumber, range: u32, batch_size: usize) -> Vec<Vec<PageNumber>> {
    let end = target.saturating_sub(range);
    let pages: Vec<PageNumber> = (1..end).rev().collect();
    pages.chunks(batch_size.max(1)).map(<[_]>::to_vec).collect()
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum PageState {
    #[default]
    Unrendered,
    Rendering,
    Rendered,
    Failed,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct PageEntry {
    pub state: PageState,
    /// Index in the flow at the moment the page was mounted.
    pub position: Option<usize>,
}

/// Per-session page records, created lazily on the first render attempt.
#[derive(Debug, Default, Clone)]
pub struct PageTable {
    entries: BTreeMap<PageNumber, PageEntry>,
}

impl PageTable {
    pub fn state(&self, page: PageNumber) -> PageState {
        self.entries
            .get(&page)
            .map(|entry| entry.state)
            .unwrap_or_default()
    }

    /// Claims `page` for rendering. Only unrendered pages can be claimed.
    fn claim(&mut self, page: PageNumber) -> bool {
        let entry = self.entries.entry(page).or_default();
        if entry.state != PageState::Unrendered {
            return false;
        }
        entry.state = PageState::Rendering;
        true
    }

    fn set_position(&mut self, page: PageNumber, position: usize) {
        self.entries.entry(page).or_default().position = Some(position);
    }

    fn finish(&mut self, page: PageNumber, state: PageState) {
        self.entries.entry(page).or_default().state = state;
    }

    pub fn count(&self, state: PageState) -> usize {
        self.entries.values().filter(|entry| entry.state == state).count()
    }

    pub fn completed(&self) -> Vec<PageNumber> {
        self.entries
            .iter()
            .filter(|(_, entry)| entry.state == PageState::Rendered)
            .map(|(page, _)| *page)
            .collect()
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SweepReport {
    /// Pages in the order they finished, failures included.
    pub completion_order: Vec<PageNumber>,
    pub rendered: usize,
    pub failed: usize,
    pub skipped: usize,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Unit {
    Mounted,
    Skipped,
    Failed,
}

/// Decides what to render next for one session and mounts the results.
pub struct PageScheduler {
    ctx: SessionContext,
    flow: Arc<Mutex<PageFlow>>,
    events: EventQueue,
    config: ScheduleConfig,
    table: PageTable,
    anchor: ScrollAnchor,
    report: SweepReport,
}

impl PageScheduler {
    pub fn new(
        ctx: SessionContext,
        flow: Arc<Mutex<PageFlow>>,
        events: EventQueue,
        config: ScheduleConfig,
    ) -> Self {
        Self {
            ctx,
            flow,
            events,
            config,
            table: PageTable::default(),
            anchor: ScrollAnchor::new(),
            report: SweepReport::default(),
        }
    }

    pub fn table(&self) -> &PageTable {
        &self.table
    }

    pub fn report(&self) -> &SweepReport {
        &self.report
    }

    /// Target first, then its neighborhood, then the background sweep.
    #[instrument(skip(self, backend))]
    pub async fn run(
        &mut self,
        backend: &Backend,
        target: PageNumber,
    ) -> Result<SweepReport, ViewerError> {
        let page_count = backend.page_count();
        let target = clamp_page(target, page_count);

        self.render_target(backend, target).await?;
        self.render_neighborhood(backend, target).await?;
        self.render_background(backend, target).await?;
        self.realign(target)?;

        info!(
            rendered = self.report.rendered,
            failed = self.report.failed,
            "document reached steady state"
        );
        Ok(self.report.clone())
    }

    pub(crate) async fn render_target(
        &mut self,
        backend: &Backend,
        target: PageNumber,
    ) -> Result<(), ViewerError> {
        let unit = self.render_unit(backend, target).await?;
        let jumped = {
            let mut flow = self.flow.lock();
            self.ctx.check()?;
            flow.jump_to(target)
        };
        if jumped {
            self.emit(ViewerEvent::TargetReady {
                token: self.ctx.token(),
                page: target,
            });
        } else {
            warn!(page = target, ?unit, "target page could not be shown");
        }
        Ok(())
    }

    pub(crate) async fn render_neighborhood(
        &mut self,
        backend: &Backend,
        target: PageNumber,
    ) -> Result<(), ViewerError> {
        let pages = neighborhood(target, self.config.preload_range, backend.page_count());
        self.anchor.set(target);
        let mut outcome = Ok(());
        for page in pages {
            if let Err(err) = self.render_unit(backend, page).await {
                outcome = Err(err);
                break;
            }
        }
        self.anchor.clear();
        outcome
    }

    pub(crate) async fn render_background(
        &mut self,
        backend: &Backend,
        target: PageNumber,
    ) -> Result<(), ViewerError> {
        let range = self.config.preload_range;
        let forward = forward_batches(target, range, backend.page_count(), self.config.batch_size);
        for batch in forward {
            self.idle().await?;
            for page in batch {
                self.render_unit(backend, page).await?;
            }
        }

        if !self.config.backward_sweep {
            return Ok(());
        }
        // Every page here lands above already mounted content.
        let backward = backward_batches(target, range, self.config.batch_size);
        for batch in backward {
            self.idle().await?;
            for page in batch {
                self.anchor.follow_viewport(&self.flow.lock());
                let unit = self.render_unit(backend, page).await;
                self.anchor.clear();
                unit?;
            }
        }
        Ok(())
    }

    /// Re-aligns the target once late layout shifts settled, unless the reader moved.
    fn realign(&self, target: PageNumber) -> Result<(), ViewerError> {
        let mut flow = self.flow.lock();
        self.ctx.check()?;
        if flow.pinned() == Some(target) {
            flow.jump_to(target);
        }
        Ok(())
    }

    async fn idle(&self) -> Result<(), ViewerError> {
        if self.config.idle.is_zero() {
            tokio::task::yield_now().await;
        } else {
            tokio::select! {
                _ = self.ctx.cancelled() => {}
                _ = tokio::time::sleep(self.config.idle) => {}
            }
        }
        self.ctx.check()
    }

    async fn render_unit(&mut self, backend: &Backend, page: PageNumber) -> Result<Unit, ViewerError> {
        self.ctx.check()?;
        if !self.table.claim(page) {
            self.report.skipped += 1;
            return Ok(Unit::Skipped);
        }

        let surface = match backend.render_page(page).await {
            Ok(surface) => surface,
            Err(err) => {
                self.ctx.check()?;
                warn!(page, %err, "page render failed");
                self.fail(page);
                return Ok(Unit::Failed);
            }
        };

        let pending = surface.is_pending().then(|| surface.clone());
        {
            let mut flow = self.flow.lock();
            self.ctx.check()?;
            match flow.insert(page, surface) {
                Some(insertion) => {
                    self.anchor.compensate(&mut flow, page, insertion.height);
                    self.table.set_position(page, insertion.position);
                }
                None => debug!(page, "page already mounted"),
            }
        }

        if let Some(surface) = pending {
            if self.complete_surface(backend, page, &surface).await? {
                self.fail(page);
                return Ok(Unit::Failed);
            }
        }

        self.table.finish(page, PageState::Rendered);
        self.report.rendered += 1;
        self.report.completion_order.push(page);
        self.emit(ViewerEvent::PageMounted {
            token: self.ctx.token(),
            page,
        });
        Ok(Unit::Mounted)
    }

    /// Loads the content of a mounted placeholder. Returns true when it broke.
    async fn complete_surface(
        &mut self,
        backend: &Backend,
        page: PageNumber,
        surface: &PageSurface,
    ) -> Result<bool, ViewerError> {
        let Some(state) = backend.load_surface(surface).await else {
            return Ok(false);
        };
        let broken = matches!(state, ImageState::Broken);
        let mut flow = self.flow.lock();
        self.ctx.check()?;
        if let Some(delta) = flow.settle_image(page, state) {
            self.anchor.compensate(&mut flow, page, delta);
        }
        Ok(broken)
    }

    fn fail(&mut self, page: PageNumber) {
        self.table.finish(page, PageState::Failed);
        self.report.failed += 1;
        self.report.completion_order.push(page);
        self.emit(ViewerEvent::PageFailed {
            token: self.ctx.token(),
            page,
        });
    }

    fn emit(&self, event: ViewerEvent) {
        if self.ctx.is_live() {
            self.events.lock().push(event);
        }
    }
}
