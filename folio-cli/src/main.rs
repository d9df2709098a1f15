use std::fs;
use std::io;
use std::path::PathBuf;
use std::sync::Arc;
use std::thread;
use std::time::Duration;

use anyhow::{anyhow, Context, Result};
use bytes::Bytes;
use clap::{Args, Parser, Subcommand};
use crossterm::cursor;
use crossterm::event::{self, Event};
use crossterm::terminal;
use directories::ProjectDirs;
use folio_core::{
    parse_target_page, CapabilityProber, DirectoryRecordStore, DocumentDecoder, DocumentId,
    Fetcher, FileSettingsStore, HostEnvironment, IssueIndex, LoadSessionManager, Manifest,
    OutlineEntry, RecordStore, RenderMode, SettingsStore, SourceResolver, Viewer, ViewerConfig, ViewerDeps,
    ViewerEvent,
};
use folio_render::{default_decoder, HttpFetcher, StaticSiteFetcher, UnsupportedDecoder};
use folio_tty::{
    format_status, write_status_line, DrawParams, EventMapper, InputMode, KittyRenderer,
    OutlineOverlay, UiEvent,
};
use tokio::sync::mpsc;
use tracing::{debug, info, warn};
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::{prelude::*, EnvFilter};

#[derive(Debug, Parser)]
#[command(
    name = "folio",
    version,
    about = "progressive reader for scanned magazine issues"
)]
struct Cli {
    #[command(flatten)]
    site: SiteArgs,

    /// Config file, defaults to config.toml in the platform config directory
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: CliCommand,
}

#[derive(Debug, Args)]
struct SiteArgs {
    /// Directory holding a static deploy of the issue site
    #[arg(long, global = true, conflicts_with = "url")]
    site: Option<PathBuf>,

    /// Origin of a web deploy, e.g. https://example.org
    #[arg(long, global = true)]
    url: Option<String>,
}

#[derive(Debug, Subcommand)]
enum CliCommand {
    /// Open an issue and scroll through it
    Read {
        /// Issue id, e.g. 2025-40. Defaults to the issue read last
        issue: Option<String>,

        /// Page to start on (1-based)
        #[arg(short = 'p', long = "page")]
        page: Option<String>,

        /// vector or raster
        #[arg(short = 'm', long = "mode")]
        mode: Option<RenderMode>,
    },
    /// Store a local document so vector mode finds it first
    Import {
        file: PathBuf,

        #[arg(long)]
        id: String,
    },
    /// Delete a document stored with `import`
    Remove { id: String },
    /// List the issues a site publishes, newest first
    Issues,
    /// Print the page manifest and outline of an issue
    Manifest { issue: String },
}

struct RawModeGuard;

impl RawModeGuard {
    fn new() -> anyhow::Result<Self> {
        terminal::enable_raw_mode()?;
        Ok(Self)
    }
}

impl Drop for RawModeGuard {
    fn drop(&mut self) {
        let _ = terminal::disable_raw_mode();
        let mut stdout = io::stdout();
        let _ = crossterm::execute!(stdout, cursor::Show);
    }
}

#[tokio::main(flavor = "current_thread")]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let project_dirs = ProjectDirs::from("net", "folio", "folio")
        .ok_or_else(|| anyhow!("unable to resolve platform data directories"))?;
    let _log_guard = init_logging(&project_dirs)?;

    let config_path = cli
        .config
        .clone()
        .unwrap_or_else(|| project_dirs.config_dir().join("config.toml"));
    let config = ViewerConfig::load(&config_path)?;
    let records: Arc<dyn RecordStore> = Arc::new(DirectoryRecordStore::new(
        project_dirs.data_local_dir().join("records"),
    )?);

    match cli.command {
        CliCommand::Import { file, id } => import(records.as_ref(), file, id).await,
        CliCommand::Remove { id } => remove(records.as_ref(), id).await,
        CliCommand::Issues => {
            let fetcher = build_fetcher(&cli.site, &config)?;
            let lines = list_issues(fetcher.as_ref(), &config).await?;
            for line in lines {
                println!("{}", line);
            }
            Ok(())
        }
        CliCommand::Manifest { issue } => {
            let fetcher = build_fetcher(&cli.site, &config)?;
            print_manifest(fetcher.as_ref(), &config, &DocumentId::new(issue)).await
        }
        CliCommand::Read { issue, page, mode } => {
            let fetcher = build_fetcher(&cli.site, &config)?;
            let settings: Arc<dyn SettingsStore> = Arc::new(FileSettingsStore::new(
                project_dirs.data_local_dir().join("state"),
            )?);
            let decoder = build_decoder(Arc::clone(&fetcher));
            let deps = ViewerDeps {
                resolver: SourceResolver::new(records, Arc::clone(&fetcher), config.site.clone()),
                decoder,
                fetcher,
                prober: CapabilityProber::new(config.worker_denylist.clone()),
                host: HostEnvironment::detect(),
                config,
            };
            let mut viewer = Viewer::new(LoadSessionManager::new(deps), settings);
            if let Some(mode) = mode {
                viewer.set_mode(mode)?;
            }
            let page = parse_target_page(page.as_deref());
            let outcome = match issue {
                Some(issue) => viewer.open(DocumentId::new(issue), page)?,
                None => viewer
                    .reopen_last(page)?
                    .ok_or_else(|| anyhow!("no issue given and none was read before"))?,
            };
            info!(token = %outcome.token(), "reading");
            run_reader(viewer).await
        }
    }
}

fn build_fetcher(site: &SiteArgs, config: &ViewerConfig) -> Result<Arc<dyn Fetcher>> {
    match (&site.site, &site.url) {
        (Some(dir), _) => {
            let dir = dir
                .canonicalize()
                .with_context(|| format!("failed to open site directory {:?}", dir))?;
            Ok(Arc::new(
                StaticSiteFetcher::new(dir).with_mount(&config.site.base_path),
            ))
        }
        (None, Some(origin)) => Ok(Arc::new(HttpFetcher::new(origin))),
        (None, None) => Err(anyhow!("pass --site <DIR> or --url <ORIGIN>")),
    }
}

fn build_decoder(fetcher: Arc<dyn Fetcher>) -> Arc<dyn DocumentDecoder> {
    match default_decoder(fetcher) {
        Ok(decoder) => decoder,
        Err(err) => {
            warn!(%err, "vector decoding unavailable, only raster mode will work");
            Arc::new(UnsupportedDecoder)
        }
    }
}

async fn import(records: &dyn RecordStore, file: PathBuf, id: String) -> Result<()> {
    let blob = tokio::fs::read(&file)
        .await
        .with_context(|| format!("failed to read {:?}", file))?;
    let document = DocumentId::new(id);
    let size = blob.len();
    records.put(&document, Bytes::from(blob)).await?;
    info!(%document, size, "imported document");
    println!("stored {} ({} bytes)", document, size);
    Ok(())
}

async fn remove(records: &dyn RecordStore, id: String) -> Result<()> {
    let document = DocumentId::new(id);
    if records.remove(&document).await? {
        info!(%document, "removed stored document");
        println!("removed {}", document);
    } else {
        println!("{} is not stored", document);
    }
    Ok(())
}

/// One line per issue: id, publish date and title.
async fn list_issues(fetcher: &dyn Fetcher, config: &ViewerConfig) -> Result<Vec<String>> {
    let url = config.site.issues_url();
    let raw = fetcher
        .fetch(&url)
        .await
        .with_context(|| format!("failed to fetch {}", url))?;
    let index =
        IssueIndex::parse(&raw).map_err(|reason| anyhow!("invalid issue index at {}: {}", url, reason))?;
    Ok(index
        .newest_first()
        .into_iter()
        .map(|issue| {
            format!(
                "{:<12}  {:<10}  {}",
                issue.id,
                issue.publish_date.as_deref().unwrap_or("-"),
                issue.title
            )
        })
        .collect())
}

async fn print_manifest(
    fetcher: &dyn Fetcher,
    config: &ViewerConfig,
    document: &DocumentId,
) -> Result<()> {
    let url = config.site.manifest_url(document);
    let raw = fetcher
        .fetch(&url)
        .await
        .with_context(|| format!("failed to fetch {}", url))?;
    let manifest =
        Manifest::parse(&raw).map_err(|reason| anyhow!("invalid manifest at {}: {}", url, reason))?;
    if let Some(title) = &manifest.issue_title {
        println!("{}", title);
    }
    println!("{} pages", manifest.num_pages);
    for entry in manifest.sorted_outline() {
        println!("{:>4}  {}", entry.page_number, entry.title);
    }
    Ok(())
}

/// Article list for the outline overlay: issue detail first, then the manifest.
async fn load_outline(viewer: &Viewer, document: &DocumentId) -> Vec<OutlineEntry> {
    let deps = viewer.manager().deps();
    if let Some(detail) = deps.resolver.issue_detail(document).await {
        let mut articles = detail.articles;
        articles.sort_by_key(|article| (article.order, article.page_number));
        if !articles.is_empty() {
            return articles
                .into_iter()
                .map(|article| OutlineEntry {
                    title: article.title,
                    page_number: article.page_number,
                    order: Some(article.order),
                })
                .collect();
        }
    }
    let url = deps.resolver.site().manifest_url(document);
    match deps.fetcher.fetch(&url).await {
        Ok(raw) => Manifest::parse(&raw)
            .map(|manifest| manifest.sorted_outline())
            .unwrap_or_default(),
        Err(err) => {
            debug!(%err, "no manifest outline");
            Vec::new()
        }
    }
}

enum LoopAction {
    Continue,
    ContinueRedraw,
    Quit,
}

async fn run_reader(mut viewer: Viewer) -> Result<()> {
    let _raw = RawModeGuard::new()?;
    let mut stdout = io::stdout();
    crossterm::execute!(stdout, cursor::Hide)?;
    let mut renderer = KittyRenderer::new(stdout);
    let mut mapper = EventMapper::new();
    let mut overlay: Option<OutlineOverlay> = None;
    let mut input = spawn_input_thread();
    let mut tick = tokio::time::interval(Duration::from_millis(100));
    let mut dirty = true;

    loop {
        tokio::select! {
            Some(event) = input.recv() => {
                if matches!(event, Event::Resize(..)) {
                    dirty = true;
                    continue;
                }
                let ui_event = mapper.map_event(event);
                match handle_event(ui_event, &mut viewer, &mut overlay, &mut mapper).await? {
                    LoopAction::ContinueRedraw => dirty = true,
                    LoopAction::Continue => {}
                    LoopAction::Quit => break,
                }
            }
            _ = tick.tick() => {
                for event in viewer.manager().drain_events() {
                    debug!(?event, "viewer event");
                    if let ViewerEvent::SessionFailed { error, .. } = &event {
                        warn!(%error, "load failed");
                    }
                    dirty = true;
                }
            }
        }

        if dirty {
            redraw(&mut renderer, &viewer, &mapper, overlay.as_ref())?;
            dirty = false;
        }
    }

    renderer.clear_all()?;
    viewer.manager().cancel();
    Ok(())
}

/// crossterm input blocks, so it is read on its own thread.
fn spawn_input_thread() -> mpsc::UnboundedReceiver<Event> {
    let (tx, rx) = mpsc::unbounded_channel();
    thread::spawn(move || loop {
        match event::read() {
            Ok(event) => {
                if tx.send(event).is_err() {
                    break;
                }
            }
            Err(err) => {
                warn!(%err, "failed to read terminal input");
                break;
            }
        }
    });
    rx
}

async fn handle_event(
    event: UiEvent,
    viewer: &mut Viewer,
    overlay: &mut Option<OutlineOverlay>,
    mapper: &mut EventMapper,
) -> Result<LoopAction> {
    match event {
        UiEvent::Command(command) => {
            if viewer.apply(command)? {
                Ok(LoopAction::ContinueRedraw)
            } else {
                Ok(LoopAction::Continue)
            }
        }
        UiEvent::OpenOutline => {
            let Some(document) = viewer.document().cloned() else {
                return Ok(LoopAction::Continue);
            };
            let outline = OutlineOverlay::new(load_outline(viewer, &document).await);
            if outline.is_empty() {
                return Ok(LoopAction::Continue);
            }
            *overlay = Some(outline);
            mapper.set_mode(InputMode::Outline);
            Ok(LoopAction::ContinueRedraw)
        }
        UiEvent::CloseOverlay => {
            *overlay = None;
            mapper.set_mode(InputMode::Normal);
            Ok(LoopAction::ContinueRedraw)
        }
        UiEvent::OutlineMoveSelection { delta } => {
            if let Some(outline) = overlay {
                outline.move_selection(delta);
                return Ok(LoopAction::ContinueRedraw);
            }
            Ok(LoopAction::Continue)
        }
        UiEvent::OutlineActivateSelection => {
            let page = overlay.as_ref().and_then(OutlineOverlay::selected_page);
            *overlay = None;
            mapper.set_mode(InputMode::Normal);
            if let Some(page) = page {
                viewer.apply(folio_core::Command::GotoPage { page })?;
            }
            Ok(LoopAction::ContinueRedraw)
        }
        UiEvent::Quit => Ok(LoopAction::Quit),
        UiEvent::None => Ok(LoopAction::ContinueRedraw),
    }
}

fn redraw(
    renderer: &mut KittyRenderer<io::Stdout>,
    viewer: &Viewer,
    mapper: &EventMapper,
    overlay: Option<&OutlineOverlay>,
) -> Result<()> {
    let window = terminal::window_size()?;
    let columns = window.columns.max(1);
    let rows = window.rows.max(1);
    let image_rows = rows.saturating_sub(1).max(1);

    {
        let flow = viewer.manager().flow();
        let mut flow = flow.lock();
        let width = flow.layout().content_width;
        flow.set_viewport_height(viewport_height(width, &window));
    }

    renderer.begin_sync_update()?;
    renderer.delete_image()?;
    renderer.clear_all()?;

    if let Some(outline) = overlay {
        outline.draw(renderer.writer(), columns, image_rows)?;
    } else if let Some(page) = viewer.current_page() {
        let image = {
            let flow = viewer.manager().flow();
            let flow = flow.lock();
            flow.get(page).map(|mounted| {
                (
                    mounted.surface.image().cloned(),
                    mounted.surface.is_broken(),
                )
            })
        };
        match image {
            Some((Some(image), _)) => {
                let params = DrawParams::fit(
                    &image,
                    u32::from(columns),
                    u32::from(image_rows),
                    cell_aspect(&window),
                );
                renderer.draw(&image, params)?;
            }
            Some((None, true)) => {
                write_status_line(renderer.writer(), 0, &format!("page {} is unavailable", page))?;
            }
            _ => {
                write_status_line(renderer.writer(), 0, &format!("page {} is loading", page))?;
            }
        }
    }

    let pending = mapper.pending_input();
    let status = format_status(&viewer.status(), pending.as_deref());
    write_status_line(renderer.writer(), rows - 1, &status)?;
    renderer.end_sync_update()?;
    Ok(())
}

/// Cell height over cell width, 2.0 when the terminal does not report pixels.
fn cell_aspect(window: &terminal::WindowSize) -> f64 {
    if window.width == 0 || window.height == 0 || window.columns == 0 || window.rows == 0 {
        return 2.0;
    }
    let cell_width = f64::from(window.width) / f64::from(window.columns);
    let cell_height = f64::from(window.height) / f64::from(window.rows);
    cell_height / cell_width
}

/// Viewport height in layout pixels for a terminal showing `content_width` across.
fn viewport_height(content_width: f64, window: &terminal::WindowSize) -> f64 {
    let columns = f64::from(window.columns.max(1));
    let rows = f64::from(window.rows.saturating_sub(1).max(1));
    content_width * rows * cell_aspect(window) / columns
}

fn init_logging(project_dirs: &ProjectDirs) -> Result<WorkerGuard> {
    let log_dir = project_dirs.data_local_dir().join("logs");
    fs::create_dir_all(&log_dir)?;

    let file_appender = tracing_appender::rolling::never(log_dir, "folio.log");
    let (file_writer, guard) = tracing_appender::non_blocking(file_appender);
    let env_filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));

    let file_layer = tracing_subscriber::fmt::layer()
        .with_ansi(false)
        .with_writer(file_writer);

    tracing_subscriber::registry()
        .with(env_filter)
        .with(file_layer)
        .try_init()
        .map_err(|err| anyhow!(err))?;

    Ok(guard)
}
