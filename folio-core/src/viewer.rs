use std::sync::Arc;

use anyhow::Result;
use tracing::{debug, warn};

use crate::session::{LoadSessionManager, LoadState, StartOutcome};
use crate::store::{SettingsStore, ViewerSettings};
use crate::{clamp_page, Command, DocumentId, PageNumber, RenderMode};

/// Snapshot for status lines.
#[derive(Debug, Clone, PartialEq)]
pub struct ViewerStatus {
    pub document: Option<DocumentId>,
    pub mode: RenderMode,
    pub load_state: LoadState,
    pub current_page: Option<PageNumber>,
    pub page_count: u32,
    pub mounted: usize,
}

/// Reader facing entry point: routes, commands and remembered settings.
pub struct Viewer {
    manager: LoadSessionManager,
    settings: Arc<dyn SettingsStore>,
    remembered: ViewerSettings,
    document: Option<DocumentId>,
}

impl Viewer {
    pub fn new(manager: LoadSessionManager, settings: Arc<dyn SettingsStore>) -> Self {
        let remembered = settings.load().unwrap_or_else(|err| {
            warn!(?err, "failed to load viewer settings, using defaults");
            ViewerSettings::default()
        });
        Self {
            manager,
            settings,
            remembered,
            document: None,
        }
    }

    pub fn manager(&self) -> &LoadSessionManager {
        &self.manager
    }

    pub fn mode(&self) -> RenderMode {
        self.remembered.render_mode
    }

    pub fn document(&self) -> Option<&DocumentId> {
        self.document.as_ref()
    }

    pub fn last_issue(&self) -> Option<&DocumentId> {
        self.remembered.last_issue.as_ref()
    }

    /// Opens `document` at `page` in the remembered render mode.
    pub fn open(&mut self, document: DocumentId, page: PageNumber) -> Result<StartOutcome> {
        if self.remembered.last_issue.as_ref() != Some(&document) {
            self.remembered.last_issue = Some(document.clone());
            self.persist()?;
        }
        self.document = Some(document.clone());
        Ok(self.manager.start_session(document, page, self.mode()))
    }

    /// Opens the issue read last time, if any.
    pub fn reopen_last(&mut self, page: PageNumber) -> Result<Option<StartOutcome>> {
        match self.remembered.last_issue.clone() {
            Some(document) => self.open(document, page).map(Some),
            None => Ok(None),
        }
    }

    /// Remembers `mode` and reloads the open document in it at the current page.
    pub fn set_mode(&mut self, mode: RenderMode) -> Result<Option<StartOutcome>> {
        if mode == self.mode() {
            return Ok(None);
        }
        self.remembered.render_mode = mode;
        self.persist()?;
        let Some(document) = self.document.clone() else {
            return Ok(None);
        };
        let page = self.resume_page();
        debug!(%mode, page, "switching render mode");
        Ok(Some(self.manager.start_session(document, page, mode)))
    }

    /// Applies a reader command. Returns whether the view changed.
    pub fn apply(&mut self, command: Command) -> Result<bool> {
        match command {
            Command::ScrollBy { pixels } => {
                self.manager.flow().lock().user_scroll(pixels);
                Ok(true)
            }
            Command::ScrollScreens { count } => {
                let flow = self.manager.flow();
                let mut flow = flow.lock();
                let step = flow.layout().viewport_height * 0.9;
                flow.user_scroll(step * count as f64);
                Ok(true)
            }
            Command::NextPage { count } => Ok(self.step_pages(count.max(1) as isize)),
            Command::PrevPage { count } => Ok(self.step_pages(-(count.max(1) as isize))),
            Command::GotoPage { page } => Ok(self.goto(page)),
            Command::LastPage => {
                let page_count = self.manager.flow().lock().page_count();
                Ok(page_count > 0 && self.goto(page_count))
            }
            Command::ToggleMode => Ok(self.set_mode(self.mode().toggled())?.is_some()),
            Command::Reload => Ok(self.reload()),
        }
    }

    pub fn current_page(&self) -> Option<PageNumber> {
        self.manager.flow().lock().current_page()
    }

    pub fn status(&self) -> ViewerStatus {
        let flow = self.manager.flow();
        let flow = flow.lock();
        ViewerStatus {
            document: self.document.clone(),
            mode: self.mode(),
            load_state: self.manager.load_state(),
            current_page: flow.current_page(),
            page_count: flow.page_count(),
            mounted: flow.len(),
        }
    }

    fn step_pages(&mut self, delta: isize) -> bool {
        let flow = self.manager.flow();
        let mut flow = flow.lock();
        let Some(current) = flow.current_page() else {
            return false;
        };
        let pages = flow.page_numbers();
        let Some(index) = pages.iter().position(|page| *page == current) else {
            return false;
        };
        let target = index
            .saturating_add_signed(delta)
            .min(pages.len().saturating_sub(1));
        flow.jump_to(pages[target])
    }

    /// Jumps when the page is already mounted, otherwise reloads around it.
    fn goto(&mut self, page: PageNumber) -> bool {
        let page = {
            let flow = self.manager.flow();
            let mut flow = flow.lock();
            let page = if flow.page_count() > 0 {
                clamp_page(page, flow.page_count())
            } else {
                page.max(1)
            };
            if flow.jump_to(page) {
                return true;
            }
            page
        };
        let Some(document) = self.document.clone() else {
            return false;
        };
        self.manager.start_session(document, page, self.mode());
        true
    }

    fn reload(&mut self) -> bool {
        let Some(document) = self.document.clone() else {
            return false;
        };
        let page = self.resume_page();
        self.manager.cancel();
        self.manager.start_session(document, page, self.mode());
        true
    }

    fn resume_page(&self) -> PageNumber {
        self.current_page()
            .or_else(|| self.manager.active_key().map(|key| key.target_page))
            .unwrap_or(1)
    }

    fn persist(&self) -> Result<()> {
        self.settings.save(&self.remembered)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    use crate::backend::tests::{png_bytes, FakeDecoder};
    use crate::config::{SiteLayout, ViewerConfig};
    use crate::probe::{CapabilityProber, HostEnvironment};
    use crate::session::{ViewerDeps, ViewerEvent};
    use crate::source::tests::MemoryFetcher;
    use crate::source::SourceResolver;
    use crate::store::{MemoryRecordStore, MemorySettingsStore};

    fn viewer(pages: u32, settings: Arc<MemorySettingsStore>) -> Viewer {
        let fetcher = Arc::new(MemoryFetcher::with(vec![
            ("/data/pdfs/2025-40.pdf", b"%PDF".to_vec()),
            ("/data/pdfs/2025-41.pdf", b"%PDF".to_vec()),
            (
                "/data/pages/2025-40/manifest.json",
                br#"{"numPages":1,"images":["a.png"]}"#.to_vec(),
            ),
            ("/data/pages/2025-40/a.png", png_bytes(8, 8)),
        ]));
        let deps = ViewerDeps {
            resolver: SourceResolver::new(
                Arc::new(MemoryRecordStore::new()),
                fetcher.clone(),
                SiteLayout::default(),
            ),
            decoder: Arc::new(FakeDecoder::new(pages)),
            fetcher,
            prober: CapabilityProber::default(),
            host: HostEnvironment::new("test"),
            config: ViewerConfig {
                background_idle_ms: 0,
                ..ViewerConfig::default()
            },
        };
        Viewer::new(LoadSessionManager::new(deps), settings)
    }

    async fn settle(viewer: &Viewer) {
        for _ in 0..1000 {
            let current = viewer.manager().current_token();
            let done = viewer.manager().events().lock().iter().any(|event| {
                matches!(event, ViewerEvent::SweepFinished { token, .. } if Some(*token) == current)
            });
            if done {
                return;
            }
            tokio::time::sleep(Duration::from_millis(2)).await;
        }
        panic!("session never settled");
    }

    #[tokio::test]
    async fn opening_an_issue_remembers_it() {
        let settings = Arc::new(MemorySettingsStore::new());
        let mut viewer = viewer(3, settings.clone());
        viewer.open(DocumentId::new("2025-41"), 1).unwrap();
        assert_eq!(
            settings.load().unwrap().last_issue,
            Some(DocumentId::new("2025-41"))
        );

        let mut again = self::viewer(3, settings);
        let outcome = again.reopen_last(2).unwrap();
        assert!(outcome.is_some());
        assert_eq!(again.document(), Some(&DocumentId::new("2025-41")));
    }

    #[tokio::test]
    async fn toggling_mode_persists_and_reloads() {
        let settings = Arc::new(MemorySettingsStore::new());
        let mut viewer = viewer(3, settings.clone());
        viewer.open(DocumentId::new("2025-40"), 1).unwrap();
        settle(&viewer).await;
        let before = viewer.manager().current_token();

        assert!(viewer.apply(Command::ToggleMode).unwrap());
        assert_eq!(viewer.mode(), RenderMode::Raster);
        assert_eq!(settings.load().unwrap().render_mode, RenderMode::Raster);
        assert_ne!(viewer.manager().current_token(), before);

        settle(&viewer).await;
        assert_eq!(viewer.status().page_count, 1);
        assert_eq!(viewer.status().load_state, LoadState::Ready);
    }

    #[tokio::test]
    async fn goto_mounted_page_only_scrolls() {
        let mut viewer = viewer(10, Arc::new(MemorySettingsStore::new()));
        viewer.open(DocumentId::new("2025-40"), 1).unwrap();
        settle(&viewer).await;
        let token = viewer.manager().current_token();

        assert!(viewer.apply(Command::GotoPage { page: 7 }).unwrap());
        assert_eq!(viewer.current_page(), Some(7));
        assert_eq!(viewer.manager().current_token(), token);

        assert!(viewer.apply(Command::PrevPage { count: 2 }).unwrap());
        assert_eq!(viewer.current_page(), Some(5));
        assert!(viewer.apply(Command::NextPage { count: 1 }).unwrap());
        assert_eq!(viewer.current_page(), Some(6));
        assert!(viewer.apply(Command::LastPage).unwrap());
        assert_eq!(viewer.current_page(), Some(10));
    }

    #[tokio::test]
    async fn goto_unmounted_page_starts_a_new_session() {
        let mut viewer = viewer(10, Arc::new(MemorySettingsStore::new()));
        viewer.open(DocumentId::new("2025-40"), 1).unwrap();
        let token = viewer.manager().current_token();

        // nothing is mounted until the session task runs
        assert!(viewer.apply(Command::GotoPage { page: 4 }).unwrap());
        assert_ne!(viewer.manager().current_token(), token);
        assert_eq!(viewer.manager().active_key().unwrap().target_page, 4);
        settle(&viewer).await;
        assert_eq!(viewer.manager().flow().lock().pinned(), Some(4));
    }

    #[tokio::test]
    async fn scrolling_unpins_target() {
        let mut viewer = viewer(10, Arc::new(MemorySettingsStore::new()));
        viewer.open(DocumentId::new("2025-40"), 3).unwrap();
        settle(&viewer).await;
        let top = viewer.manager().flow().lock().scroll_top();

        viewer.apply(Command::ScrollBy { pixels: 40.0 }).unwrap();
        let flow = viewer.manager().flow();
        assert_eq!(flow.lock().pinned(), None);
        assert!((flow.lock().scroll_top() - top - 40.0).abs() < 1e-9);
    }

    #[test]
    fn commands_without_document_do_nothing() {
        let mut viewer = viewer(3, Arc::new(MemorySettingsStore::new()));
        assert!(!viewer.apply(Command::Reload).unwrap());
        assert!(!viewer.apply(Command::GotoPage { page: 2 }).unwrap());
        assert!(!viewer.apply(Command::NextPage { count: 1 }).unwrap());
        assert_eq!(viewer.status().mounted, 0);
    }
}
