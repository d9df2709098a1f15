use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use parking_lot::Mutex;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, instrument, warn};

use crate::backend::{Backend, DocumentDecoder, DocumentHandle, OpenContext};
use crate::config::ViewerConfig;
use crate::error::ViewerError;
use crate::flow::{FlowLayout, PageFlow};
use crate::probe::{CapabilityProber, HostEnvironment};
use crate::scheduler::{PageScheduler, ScheduleConfig};
use crate::source::{Fetcher, SourceResolver};
use crate::{clamp_page, DocumentId, PageNumber, RenderMode};

pub type EventQueue = Arc<Mutex<Vec<ViewerEvent>>>;

/// Monotonic identifier of one load attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct SessionToken(u64);

impl SessionToken {
    pub fn value(self) -> u64 {
        self.0
    }
}

impl fmt::Display for SessionToken {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}", self.0)
    }
}

/// What every asynchronous step of a session consults before it touches
/// shared state.
#[derive(Debug, Clone)]
pub struct SessionContext {
    token: SessionToken,
    current: Arc<AtomicU64>,
    cancel: CancellationToken,
}

impl SessionContext {
    fn new(token: SessionToken, current: Arc<AtomicU64>) -> Self {
        Self {
            token,
            current,
            cancel: CancellationToken::new(),
        }
    }

    /// A context that is live until cancelled, for driving a scheduler on its own.
    pub fn detached() -> Self {
        Self::new(SessionToken(1), Arc::new(AtomicU64::new(1)))
    }

    pub fn token(&self) -> SessionToken {
        self.token
    }

    pub fn is_live(&self) -> bool {
        !self.cancel.is_cancelled() && self.current.load(Ordering::SeqCst) == self.token.0
    }

    pub fn check(&self) -> Result<(), ViewerError> {
        if self.is_live() {
            Ok(())
        } else {
            Err(ViewerError::Cancelled)
        }
    }

    pub fn cancel(&self) {
        self.cancel.cancel();
    }

    pub async fn cancelled(&self) {
        self.cancel.cancelled().await
    }
}

/// Identity of a load request, used to drop duplicates.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct SessionKey {
    pub document: DocumentId,
    pub target_page: PageNumber,
    pub mode: RenderMode,
}

/// Returned to the caller of [`LoadSessionManager::start_session`].
#[derive(Debug, Clone)]
pub struct SessionHandle {
    token: SessionToken,
    cancel: CancellationToken,
}

impl SessionHandle {
    pub fn token(&self) -> SessionToken {
        self.token
    }

    pub fn cancel(&self) {
        self.cancel.cancel();
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancel.is_cancelled()
    }
}

#[derive(Debug, Clone)]
pub enum StartOutcome {
    Started(SessionHandle),
    /// An identical session is already open or opening.
    Duplicate(SessionToken),
}

impl StartOutcome {
    pub fn token(&self) -> SessionToken {
        match self {
            StartOutcome::Started(handle) => handle.token(),
            StartOutcome::Duplicate(token) => *token,
        }
    }
}

/// Coarse state of the current document, shown by the viewer chrome.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum LoadState {
    #[default]
    Idle,
    Loading,
    Ready,
    /// The document could not be resolved or opened.
    Empty,
    /// Raster mode without a manifest. Stays blank until the reader acts.
    Stalled,
}

#[derive(Debug, Clone)]
pub enum ViewerEvent {
    SessionStarted {
        token: SessionToken,
        key: SessionKey,
    },
    DocumentOpened {
        token: SessionToken,
        page_count: u32,
        mode: RenderMode,
    },
    TargetReady {
        token: SessionToken,
        page: PageNumber,
    },
    PageMounted {
        token: SessionToken,
        page: PageNumber,
    },
    PageFailed {
        token: SessionToken,
        page: PageNumber,
    },
    SweepFinished {
        token: SessionToken,
        rendered: usize,
        failed: usize,
    },
    SessionFailed {
        token: SessionToken,
        error: ViewerError,
    },
    SessionCancelled {
        token: SessionToken,
    },
}

/// Collaborators shared by every session.
pub struct ViewerDeps {
    pub resolver: SourceResolver,
    pub decoder: Arc<dyn DocumentDecoder>,
    pub fetcher: Arc<dyn Fetcher>,
    pub prober: CapabilityProber,
    pub host: HostEnvironment,
    pub config: ViewerConfig,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum HandleState {
    Opening,
    Open,
    Failed,
    Closed,
}

struct ActiveSession {
    key: SessionKey,
    ctx: SessionContext,
    handle: Arc<Mutex<HandleState>>,
}

impl ActiveSession {
    fn is_open_or_opening(&self) -> bool {
        self.ctx.is_live() && matches!(*self.handle.lock(), HandleState::Opening | HandleState::Open)
    }
}

/// Owns the single active load session and everything it renders into.
pub struct LoadSessionManager {
    deps: Arc<ViewerDeps>,
    flow: Arc<Mutex<PageFlow>>,
    events: EventQueue,
    state: Arc<Mutex<LoadState>>,
    current: Arc<AtomicU64>,
    next_token: AtomicU64,
    active: Mutex<Option<ActiveSession>>,
}

impl LoadSessionManager {
    pub fn new(deps: ViewerDeps) -> Self {
        let layout = FlowLayout::from_config(&deps.config);
        Self {
            deps: Arc::new(deps),
            flow: Arc::new(Mutex::new(PageFlow::new(layout))),
            events: EventQueue::default(),
            state: Arc::new(Mutex::new(LoadState::Idle)),
            current: Arc::new(AtomicU64::new(0)),
            next_token: AtomicU64::new(0),
            active: Mutex::new(None),
        }
    }

    pub fn deps(&self) -> &ViewerDeps {
        &self.deps
    }

    pub fn flow(&self) -> Arc<Mutex<PageFlow>> {
        Arc::clone(&self.flow)
    }

    pub fn events(&self) -> EventQueue {
        Arc::clone(&self.events)
    }

    pub fn drain_events(&self) -> Vec<ViewerEvent> {
        std::mem::take(&mut *self.events.lock())
    }

    pub fn load_state(&self) -> LoadState {
        *self.state.lock()
    }

    pub fn active_key(&self) -> Option<SessionKey> {
        self.active.lock().as_ref().map(|session| session.key.clone())
    }

    pub fn current_token(&self) -> Option<SessionToken> {
        self.active.lock().as_ref().map(|session| session.ctx.token())
    }

    /// Starts loading `document`, superseding whatever was loading before.
    /// Must be called from within a tokio runtime.
    #[instrument(skip(self, document), fields(document = %document))]
    pub fn start_session(
        &self,
        document: DocumentId,
        target_page: PageNumber,
        mode: RenderMode,
    ) -> StartOutcome {
        let key = SessionKey {
            document,
            target_page,
            mode,
        };
        let mut active = self.active.lock();
        if let Some(session) = active.as_ref() {
            if session.key == key && session.is_open_or_opening() {
                debug!(token = %session.ctx.token(), "dropping duplicate load request");
                return StartOutcome::Duplicate(session.ctx.token());
            }
        }
        if let Some(previous) = active.take() {
            self.teardown(previous);
        }

        let token = SessionToken(self.next_token.fetch_add(1, Ordering::SeqCst) + 1);
        {
            let mut flow = self.flow.lock();
            self.current.store(token.0, Ordering::SeqCst);
            flow.clear();
        }
        *self.state.lock() = LoadState::Loading;

        let ctx = SessionContext::new(token, Arc::clone(&self.current));
        let handle = Arc::new(Mutex::new(HandleState::Opening));
        info!(%token, page = target_page, %mode, "starting load session");

        tokio::spawn(run_session(SessionTask {
            ctx: ctx.clone(),
            key: key.clone(),
            deps: Arc::clone(&self.deps),
            flow: Arc::clone(&self.flow),
            events: Arc::clone(&self.events),
            state: Arc::clone(&self.state),
            handle: Arc::clone(&handle),
        }));

        let outcome = StartOutcome::Started(SessionHandle {
            token,
            cancel: ctx.cancel.clone(),
        });
        *active = Some(ActiveSession { key, ctx, handle });
        outcome
    }

    /// Re-opens the active document in `mode`, keeping its target page.
    pub fn switch_mode(&self, mode: RenderMode) -> Option<StartOutcome> {
        let key = self.active_key()?;
        if key.mode == mode {
            return None;
        }
        Some(self.start_session(key.document, key.target_page, mode))
    }

    /// Stops the active session. Mounted pages stay where they are.
    pub fn cancel(&self) {
        if let Some(session) = self.active.lock().take() {
            self.teardown(session);
            *self.state.lock() = LoadState::Idle;
        }
    }

    fn teardown(&self, session: ActiveSession) {
        debug!(token = %session.ctx.token(), "cancelling load session");
        session.ctx.cancel();
        self.events.lock().push(ViewerEvent::SessionCancelled {
            token: session.ctx.token(),
        });
    }
}

impl Drop for LoadSessionManager {
    fn drop(&mut self) {
        if let Some(session) = self.active.get_mut().take() {
            session.ctx.cancel();
        }
    }
}

struct SessionTask {
    ctx: SessionContext,
    key: SessionKey,
    deps: Arc<ViewerDeps>,
    flow: Arc<Mutex<PageFlow>>,
    events: EventQueue,
    state: Arc<Mutex<LoadState>>,
    handle: Arc<Mutex<HandleState>>,
}

impl SessionTask {
    fn emit(&self, event: ViewerEvent) {
        if self.ctx.is_live() {
            self.events.lock().push(event);
        }
    }

    fn set_state(&self, state: LoadState) {
        let mut current = self.state.lock();
        if self.ctx.is_live() {
            *current = state;
        }
    }

    async fn open(&self, disable_worker: bool) -> Result<DocumentHandle, ViewerError> {
        let source = self
            .deps
            .resolver
            .resolve(&self.key.document, self.key.mode)
            .await?;
        self.ctx.check()?;

        let backend = Backend::open(
            source,
            OpenContext {
                decoder: self.deps.decoder.as_ref(),
                fetcher: Arc::clone(&self.deps.fetcher),
                config: &self.deps.config,
                disable_worker,
            },
        )
        .await?;
        if let Err(err) = self.ctx.check() {
            backend.dispose();
            return Err(err);
        }
        Ok(DocumentHandle::new(backend, self.deps.config.scale))
    }

    /// Opens once more on the calling task when the worker path fails with a
    /// recoverable error.
    async fn open_with_fallback(&self, disable_worker: bool) -> Result<DocumentHandle, ViewerError> {
        match self.open(disable_worker).await {
            Err(err)
                if !disable_worker
                    && !err.is_session_fatal()
                    && !matches!(err, ViewerError::Cancelled) =>
            {
                info!(token = %self.ctx.token(), %err, "retrying open without the decode worker");
                self.open(true).await
            }
            other => other,
        }
    }

    fn fail(&self, error: ViewerError) {
        let error = error.into_session_failure();
        *self.handle.lock() = HandleState::Failed;
        let state = match &error {
            ViewerError::ManifestUnavailable { .. } => LoadState::Stalled,
            _ => LoadState::Empty,
        };
        warn!(token = %self.ctx.token(), %error, "load session failed");
        self.set_state(state);
        self.emit(ViewerEvent::SessionFailed {
            token: self.ctx.token(),
            error,
        });
    }
}

async fn run_session(task: SessionTask) {
    let token = task.ctx.token();
    task.emit(ViewerEvent::SessionStarted {
        token,
        key: task.key.clone(),
    });

    let disable_worker = !task
        .deps
        .prober
        .can_use_background_decode_worker(&task.deps.host);
    if disable_worker {
        info!(%token, "background decode worker unavailable, decoding inline");
    }

    let handle = match task.open_with_fallback(disable_worker).await {
        Ok(handle) => handle,
        Err(ViewerError::Cancelled) => {
            *task.handle.lock() = HandleState::Closed;
            return;
        }
        Err(err) => {
            task.fail(err);
            return;
        }
    };

    {
        let mut flow = task.flow.lock();
        if !task.ctx.is_live() {
            drop(flow);
            handle.close();
            *task.handle.lock() = HandleState::Closed;
            return;
        }
        flow.set_page_count(handle.page_count);
    }
    *task.handle.lock() = HandleState::Open;
    info!(
        %token,
        pages = handle.page_count,
        mode = ?handle.kind,
        scale = handle.scale,
        "document opened"
    );
    task.set_state(LoadState::Ready);
    task.emit(ViewerEvent::DocumentOpened {
        token,
        page_count: handle.page_count,
        mode: handle.kind,
    });

    let target = clamp_page(task.key.target_page, handle.page_count);
    let mut scheduler = PageScheduler::new(
        task.ctx.clone(),
        Arc::clone(&task.flow),
        Arc::clone(&task.events),
        ScheduleConfig::from_config(&task.deps.config),
    );
    match scheduler.run(&handle.backend, target).await {
        Ok(report) => task.emit(ViewerEvent::SweepFinished {
            token,
            rendered: report.rendered,
            failed: report.failed,
        }),
        Err(ViewerError::Cancelled) => debug!(%token, "sweep stopped by cancellation"),
        Err(err) => warn!(%token, %err, "sweep stopped"),
    }

    // The handle lives as long as the session does.
    task.ctx.cancelled().await;
    handle.close();
    *task.handle.lock() = HandleState::Closed;
    debug!(%token, "document handle disposed");
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    use crate::backend::tests::{png_bytes, FakeDecoder};
    use crate::config::SiteLayout;
    use crate::source::tests::MemoryFetcher;
    use crate::store::MemoryRecordStore;

    fn deps(
        decoder: Arc<FakeDecoder>,
        fetcher: Arc<MemoryFetcher>,
        prober: CapabilityProber,
        host: &str,
    ) -> ViewerDeps {
        let config = ViewerConfig {
            background_idle_ms: 0,
            ..ViewerConfig::default()
        };
        ViewerDeps {
            resolver: SourceResolver::new(
                Arc::new(MemoryRecordStore::new()),
                fetcher.clone(),
                SiteLayout::default(),
            ),
            decoder,
            fetcher,
            prober,
            host: HostEnvironment::new(host),
            config,
        }
    }

    fn pdf_site() -> Arc<MemoryFetcher> {
        Arc::new(MemoryFetcher::with(vec![(
            "/data/pdfs/2025-40.pdf",
            b"%PDF-1.7".to_vec(),
        )]))
    }

    async fn wait_until(mut done: impl FnMut() -> bool) {
        for _ in 0..1000 {
            if done() {
                return;
            }
            tokio::time::sleep(Duration::from_millis(2)).await;
        }
        panic!("condition never became true");
    }

    fn finished(manager: &LoadSessionManager, token: SessionToken) -> bool {
        manager.events().lock().iter().any(|event| {
            matches!(event, ViewerEvent::SweepFinished { token: t, .. } if *t == token)
        })
    }

    #[tokio::test]
    async fn duplicate_request_is_ignored() {
        let decoder = Arc::new(FakeDecoder::new(5));
        let manager = LoadSessionManager::new(deps(
            decoder.clone(),
            pdf_site(),
            CapabilityProber::default(),
            "test",
        ));
        let id = DocumentId::new("2025-40");

        let first = manager.start_session(id.clone(), 1, RenderMode::Vector);
        assert!(matches!(first, StartOutcome::Started(_)));
        let second = manager.start_session(id.clone(), 1, RenderMode::Vector);
        assert!(matches!(second, StartOutcome::Duplicate(token) if token == first.token()));

        wait_until(|| finished(&manager, first.token())).await;
        let third = manager.start_session(id, 1, RenderMode::Vector);
        assert!(matches!(third, StartOutcome::Duplicate(_)));
        assert_eq!(decoder.opened.lock().len(), 1);
        assert_eq!(manager.load_state(), LoadState::Ready);
    }

    #[tokio::test]
    async fn broken_worker_reopens_inline() {
        let decoder = Arc::new(FakeDecoder {
            worker_broken: true,
            ..FakeDecoder::new(4)
        });
        let manager = LoadSessionManager::new(deps(
            decoder.clone(),
            pdf_site(),
            CapabilityProber::default(),
            "test",
        ));

        let outcome = manager.start_session(DocumentId::new("2025-40"), 1, RenderMode::Vector);
        wait_until(|| finished(&manager, outcome.token())).await;

        let inline: Vec<bool> = decoder
            .opened
            .lock()
            .iter()
            .map(|params| params.disable_worker)
            .collect();
        assert_eq!(inline, vec![false, true]);
        assert_eq!(manager.load_state(), LoadState::Ready);
        assert_eq!(manager.flow().lock().len(), 4);
    }

    #[tokio::test]
    async fn session_renders_target_and_clamps_out_of_range_pages() {
        let decoder = Arc::new(FakeDecoder::new(12));
        let manager = LoadSessionManager::new(deps(
            decoder,
            pdf_site(),
            CapabilityProber::default(),
            "test",
        ));

        let outcome = manager.start_session(DocumentId::new("2025-40"), 80, RenderMode::Vector);
        wait_until(|| finished(&manager, outcome.token())).await;

        let events = manager.drain_events();
        let first_mount = events.iter().find_map(|event| match event {
            ViewerEvent::PageMounted { page, .. } => Some(*page),
            _ => None,
        });
        assert_eq!(first_mount, Some(12));
        assert!(events
            .iter()
            .any(|event| matches!(event, ViewerEvent::TargetReady { page: 12, .. })));
        let flow = manager.flow();
        let flow = flow.lock();
        assert_eq!(flow.page_count(), 12);
        assert_eq!(flow.len(), 12);
        assert_eq!(flow.pinned(), Some(12));
    }

    #[tokio::test]
    async fn mode_switch_supersedes_previous_session() {
        let decoder = Arc::new(FakeDecoder::new(3));
        let fetcher = pdf_site();
        fetcher.insert(
            "/data/pages/2025-40/manifest.json",
            br#"{"numPages":2,"images":["a.png","b.png"]}"#.to_vec(),
        );
        fetcher.insert("/data/pages/2025-40/a.png", png_bytes(10, 14));
        fetcher.insert("/data/pages/2025-40/b.png", png_bytes(10, 14));
        let manager = LoadSessionManager::new(deps(
            decoder,
            fetcher,
            CapabilityProber::default(),
            "test",
        ));
        let id = DocumentId::new("2025-40");

        let vector = manager.start_session(id.clone(), 1, RenderMode::Vector);
        wait_until(|| finished(&manager, vector.token())).await;
        assert_eq!(manager.flow().lock().len(), 3);

        let raster = manager.switch_mode(RenderMode::Raster).unwrap();
        assert_ne!(raster.token(), vector.token());
        assert!(manager.flow().lock().is_empty());
        assert!(manager.events().lock().iter().any(|event| {
            matches!(event, ViewerEvent::SessionCancelled { token } if *token == vector.token())
        }));

        wait_until(|| finished(&manager, raster.token())).await;
        let flow = manager.flow();
        let flow = flow.lock();
        assert_eq!(flow.page_numbers(), vec![1, 2]);
        assert!(flow.pages().all(|page| page.surface.image().is_some()));
        assert_eq!(manager.active_key().unwrap().mode, RenderMode::Raster);
        assert!(manager.switch_mode(RenderMode::Raster).is_none());
    }

    #[tokio::test]
    async fn unknown_document_leaves_empty_state() {
        let manager = LoadSessionManager::new(deps(
            Arc::new(FakeDecoder::new(3)),
            Arc::new(MemoryFetcher::default()),
            CapabilityProber::default(),
            "test",
        ));
        manager.start_session(DocumentId::new("nope"), 1, RenderMode::Vector);
        wait_until(|| manager.load_state() == LoadState::Empty).await;
        assert!(manager.events().lock().iter().any(|event| matches!(
            event,
            ViewerEvent::SessionFailed {
                error: ViewerError::DocumentNotFound { .. },
                ..
            }
        )));

        // a failed session may be retried with the same key
        let retry = manager.start_session(DocumentId::new("nope"), 1, RenderMode::Vector);
        assert!(matches!(retry, StartOutcome::Started(_)));
    }

    #[tokio::test]
    async fn missing_manifest_stalls_without_fallback() {
        let decoder = Arc::new(FakeDecoder::new(3));
        let manager = LoadSessionManager::new(deps(
            decoder.clone(),
            pdf_site(),
            CapabilityProber::default(),
            "test",
        ));
        manager.start_session(DocumentId::new("2025-40"), 1, RenderMode::Raster);
        wait_until(|| manager.load_state() == LoadState::Stalled).await;
        assert!(manager.flow().lock().is_empty());
        assert!(decoder.opened.lock().is_empty());
    }

    #[tokio::test]
    async fn malformed_manifest_stalls_as_unavailable() {
        let fetcher = pdf_site();
        fetcher.insert(
            "/data/pages/2025-40/manifest.json",
            br#"{"numPages":3,"images":["a.png"]}"#.to_vec(),
        );
        let manager = LoadSessionManager::new(deps(
            Arc::new(FakeDecoder::new(3)),
            fetcher,
            CapabilityProber::default(),
            "test",
        ));
        manager.start_session(DocumentId::new("2025-40"), 1, RenderMode::Raster);
        wait_until(|| manager.load_state() == LoadState::Stalled).await;

        let failure = manager.drain_events().into_iter().find_map(|event| match event {
            ViewerEvent::SessionFailed { error, .. } => Some(error),
            _ => None,
        });
        assert!(matches!(failure, Some(ViewerError::ManifestUnavailable { .. })));
    }

    #[tokio::test]
    async fn denylisted_host_decodes_without_worker() {
        let decoder = Arc::new(FakeDecoder::new(4));
        let manager = LoadSessionManager::new(deps(
            decoder.clone(),
            pdf_site(),
            CapabilityProber::new(vec!["Kiosk".into()]),
            "linux KioskTerm xterm",
        ));
        let outcome = manager.start_session(DocumentId::new("2025-40"), 2, RenderMode::Vector);
        wait_until(|| finished(&manager, outcome.token())).await;

        assert!(decoder.opened.lock()[0].disable_worker);
        assert_eq!(manager.flow().lock().len(), 4);
    }

    #[tokio::test]
    async fn cancelled_session_stops_mounting() {
        let mut decoder = FakeDecoder::new(8);
        decoder.delays.push((2, Duration::from_millis(40)));
        let manager = LoadSessionManager::new(deps(
            Arc::new(decoder),
            pdf_site(),
            CapabilityProber::default(),
            "test",
        ));
        let outcome = manager.start_session(DocumentId::new("2025-40"), 1, RenderMode::Vector);
        let StartOutcome::Started(handle) = outcome else {
            panic!("expected a fresh session");
        };
        wait_until(|| manager.flow().lock().contains(1)).await;
        manager.cancel();
        assert!(handle.is_cancelled());
        assert_eq!(manager.load_state(), LoadState::Idle);

        tokio::time::sleep(Duration::from_millis(80)).await;
        assert_eq!(manager.flow().lock().page_numbers(), vec![1]);
        assert!(!finished(&manager, handle.token()));
    }
}
