use std::sync::Arc;

use async_trait::async_trait;
use bytes::Bytes;
use tracing::{debug, instrument, warn};

use crate::config::{SiteLayout, ViewerConfig};
use crate::error::{FetchError, ViewerError};
use crate::manifest::Manifest;
use crate::source::{DocumentSource, Fetcher};
use crate::{PageNumber, RenderImage, RenderMode};

/// Parameters handed to the document decoder when opening a vector document.
#[derive(Debug, Clone)]
pub struct OpenParams {
    pub source: DocumentSource,
    pub disable_worker: bool,
    pub range_chunk_size: usize,
}

/// The external page-description decoder.
#[async_trait]
pub trait DocumentDecoder: Send + Sync {
    async fn open(&self, params: OpenParams) -> Result<Arc<dyn DecodedDocument>, ViewerError>;
}

#[async_trait]
pub trait DecodedDocument: Send + Sync {
    fn page_count(&self) -> u32;

    async fn render_page(&self, page: PageNumber, scale: f32) -> Result<RenderImage, ViewerError>;

    fn close(&self) {}
}

/// What gets mounted into the page flow.
#[derive(Debug, Clone, PartialEq)]
pub enum PageSurface {
    Painted(RenderImage),
    Image(ImageSurface),
}

#[derive(Debug, Clone, PartialEq)]
pub struct ImageSurface {
    pub src: String,
    pub alternate_src: Option<String>,
    /// Height over width reserved before the image decodes.
    pub reserved_aspect: f64,
    pub state: ImageState,
}

#[derive(Debug, Clone, PartialEq)]
pub enum ImageState {
    Pending,
    Loaded {
        image: RenderImage,
        from_alternate: bool,
    },
    Broken,
}

impl PageSurface {
    pub fn layout_height(&self, width: f64) -> f64 {
        let aspect = match self {
            PageSurface::Painted(image) => image.aspect_ratio().unwrap_or(0.0),
            PageSurface::Image(surface) => match &surface.state {
                ImageState::Loaded { image, .. } => {
                    image.aspect_ratio().unwrap_or(surface.reserved_aspect)
                }
                ImageState::Pending | ImageState::Broken => surface.reserved_aspect,
            },
        };
        width * aspect
    }

    pub fn image(&self) -> Option<&RenderImage> {
        match self {
            PageSurface::Painted(image) => Some(image),
            PageSurface::Image(ImageSurface {
                state: ImageState::Loaded { image, .. },
                ..
            }) => Some(image),
            PageSurface::Image(_) => None,
        }
    }

    pub fn is_pending(&self) -> bool {
        matches!(
            self,
            PageSurface::Image(ImageSurface {
                state: ImageState::Pending,
                ..
            })
        )
    }

    pub fn is_broken(&self) -> bool {
        matches!(
            self,
            PageSurface::Image(ImageSurface {
                state: ImageState::Broken,
                ..
            })
        )
    }
}

pub struct VectorBackend {
    document: Arc<dyn DecodedDocument>,
    scale: f32,
}

impl VectorBackend {
    pub async fn open(
        decoder: &dyn DocumentDecoder,
        source: DocumentSource,
        disable_worker: bool,
        range_chunk_size: usize,
        scale: f32,
    ) -> Result<Self, ViewerError> {
        let document = decoder
            .open(OpenParams {
                source,
                disable_worker,
                range_chunk_size,
            })
            .await?;
        Ok(Self { document, scale })
    }

    async fn render_page(&self, page: PageNumber) -> Result<PageSurface, ViewerError> {
        let image = self.document.render_page(page, self.scale).await?;
        Ok(PageSurface::Painted(image))
    }
}

pub struct RasterBackend {
    fetcher: Arc<dyn Fetcher>,
    manifest: Manifest,
    base: String,
    alternate_base: Option<String>,
    default_aspect: f64,
}

impl RasterBackend {
    pub async fn open(
        fetcher: Arc<dyn Fetcher>,
        url: &str,
        site: &SiteLayout,
        default_aspect: f64,
    ) -> Result<Self, ViewerError> {
        let raw = fetcher
            .fetch(url)
            .await
            .map_err(|err| ViewerError::manifest(url, err))?;
        let manifest = Manifest::parse(&raw).map_err(|reason| ViewerError::InvalidManifest {
            url: url.to_string(),
            reason,
        })?;
        let base = match url.rfind('/') {
            Some(idx) => url[..=idx].to_string(),
            None => String::new(),
        };
        let alternate_base = site.alternate_base(&base);
        debug!(%base, ?alternate_base, pages = manifest.num_pages, "opened raster manifest");
        Ok(Self {
            fetcher,
            manifest,
            base,
            alternate_base,
            default_aspect,
        })
    }

    fn render_page(&self, page: PageNumber) -> Result<PageSurface, ViewerError> {
        let name = self
            .manifest
            .image_for(page)
            .ok_or_else(|| ViewerError::page(page, "page is not listed in the manifest"))?;
        Ok(PageSurface::Image(ImageSurface {
            src: format!("{}{}", self.base, name),
            alternate_src: self
                .alternate_base
                .as_ref()
                .map(|base| format!("{}{}", base, name)),
            reserved_aspect: self
                .manifest
                .aspect_ratio(page)
                .unwrap_or(self.default_aspect),
            state: ImageState::Pending,
        }))
    }

    /// Loads from the primary source and, failing that, once from the alternate.
    async fn load_image(&self, surface: &ImageSurface) -> ImageState {
        match self.fetch_decoded(&surface.src).await {
            Ok(image) => {
                return ImageState::Loaded {
                    image,
                    from_alternate: false,
                }
            }
            Err(reason) => warn!(src = %surface.src, %reason, "page image failed to load"),
        }
        let Some(alternate) = surface.alternate_src.as_deref() else {
            return ImageState::Broken;
        };
        match self.fetch_decoded(alternate).await {
            Ok(image) => ImageState::Loaded {
                image,
                from_alternate: true,
            },
            Err(reason) => {
                warn!(src = %alternate, %reason, "alternate page image failed to load");
                ImageState::Broken
            }
        }
    }

    async fn fetch_decoded(&self, url: &str) -> Result<RenderImage, String> {
        let raw = self
            .fetcher
            .fetch(url)
            .await
            .map_err(|err: FetchError| err.to_string())?;
        decode_image(&raw)
    }
}

fn decode_image(raw: &Bytes) -> Result<RenderImage, String> {
    let decoded = image::load_from_memory(raw).map_err(|err| err.to_string())?;
    let rgba = decoded.to_rgba8();
    Ok(RenderImage {
        width: rgba.width(),
        height: rgba.height(),
        pixels: rgba.into_raw(),
    })
}

/// Collaborators a backend may need when it is opened.
pub struct OpenContext<'a> {
    pub decoder: &'a dyn DocumentDecoder,
    pub fetcher: Arc<dyn Fetcher>,
    pub config: &'a ViewerConfig,
    pub disable_worker: bool,
}

/// The two ways of turning a page number into a surface. Chosen once per session.
pub enum Backend {
    Vector(VectorBackend),
    Raster(RasterBackend),
}

impl Backend {
    #[instrument(skip_all, fields(mode = %source.mode()))]
    pub async fn open(source: DocumentSource, cx: OpenContext<'_>) -> Result<Self, ViewerError> {
        match source {
            DocumentSource::Manifest { url } => {
                let backend = RasterBackend::open(
                    cx.fetcher,
                    &url,
                    &cx.config.site,
                    cx.config.default_aspect_ratio,
                )
                .await?;
                Ok(Backend::Raster(backend))
            }
            source => {
                let backend = VectorBackend::open(
                    cx.decoder,
                    source,
                    cx.disable_worker,
                    cx.config.range_chunk_size,
                    cx.config.scale,
                )
                .await?;
                Ok(Backend::Vector(backend))
            }
        }
    }

    pub fn kind(&self) -> RenderMode {
        match self {
            Backend::Vector(_) => RenderMode::Vector,
            Backend::Raster(_) => RenderMode::Raster,
        }
    }

    pub fn page_count(&self) -> u32 {
        match self {
            Backend::Vector(backend) => backend.document.page_count(),
            Backend::Raster(backend) => backend.manifest.num_pages,
        }
    }

    pub async fn render_page(&self, page: PageNumber) -> Result<PageSurface, ViewerError> {
        if page == 0 || page > self.page_count() {
            return Err(ViewerError::page(page, "page out of range"));
        }
        match self {
            Backend::Vector(backend) => backend.render_page(page).await,
            Backend::Raster(backend) => backend.render_page(page),
        }
    }

    /// Completes a surface whose content arrives after it was mounted.
    pub async fn load_surface(&self, surface: &PageSurface) -> Option<ImageState> {
        match (self, surface) {
            (Backend::Raster(backend), PageSurface::Image(image)) => {
                Some(backend.load_image(image).await)
            }
            _ => None,
        }
    }

    pub fn dispose(self) {
        if let Backend::Vector(backend) = self {
            backend.document.close();
        }
    }
}

/// An opened document, owned by exactly one load session.
pub struct DocumentHandle {
    pub backend: Backend,
    pub page_count: u32,
    pub kind: RenderMode,
    pub scale: f32,
}

impl DocumentHandle {
    pub fn new(backend: Backend, scale: f32) -> Self {
        Self {
            page_count: backend.page_count(),
            kind: backend.kind(),
            backend,
            scale,
        }
    }

    pub fn close(self) {
        self.backend.dispose();
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use std::collections::HashSet;
    use std::io::Cursor;
    use std::time::Duration;

    use parking_lot::Mutex;

    use crate::source::tests::MemoryFetcher;

    /// Decoder yielding solid pages; individual pages can be told to fail or lag.
    #[derive(Default)]
    pub(crate) struct FakeDecoder {
        pub(crate) page_count: u32,
        pub(crate) failing: HashSet<PageNumber>,
        pub(crate) delays: Vec<(PageNumber, Duration)>,
        pub(crate) opened: Mutex<Vec<OpenParams>>,
        pub(crate) rendered: Arc<Mutex<Vec<PageNumber>>>,
        /// Opens that ask for the background worker fail.
        pub(crate) worker_broken: bool,
    }

    impl FakeDecoder {
        pub(crate) fn new(page_count: u32) -> Self {
            Self {
                page_count,
                ..Self::default()
            }
        }
    }

    struct FakeDocument {
        page_count: u32,
        failing: HashSet<PageNumber>,
        delays: Vec<(PageNumber, Duration)>,
        rendered: Arc<Mutex<Vec<PageNumber>>>,
    }

    #[async_trait]
    impl DocumentDecoder for FakeDecoder {
        async fn open(&self, params: OpenParams) -> Result<Arc<dyn DecodedDocument>, ViewerError> {
            let inline = params.disable_worker;
            self.opened.lock().push(params);
            if self.worker_broken && !inline {
                return Err(ViewerError::WorkerUnavailable);
            }
            Ok(Arc::new(FakeDocument {
                page_count: self.page_count,
                failing: self.failing.clone(),
                delays: self.delays.clone(),
                rendered: Arc::clone(&self.rendered),
            }))
        }
    }

    #[async_trait]
    impl DecodedDocument for FakeDocument {
        fn page_count(&self) -> u32 {
            self.page_count
        }

        async fn render_page(
            &self,
            page: PageNumber,
            _scale: f32,
        ) -> Result<RenderImage, ViewerError> {
            if let Some((_, delay)) = self.delays.iter().find(|(p, _)| *p == page) {
                tokio::time::sleep(*delay).await;
            }
            self.rendered.lock().push(page);
            if self.failing.contains(&page) {
                return Err(ViewerError::page(page, "corrupt page"));
            }
            Ok(RenderImage {
                width: 10,
                height: 10 + page,
                pixels: vec![page as u8; (10 * (10 + page) * 4) as usize],
            })
        }
    }

    pub(crate) fn png_bytes(width: u32, height: u32) -> Vec<u8> {
        let image = image::RgbaImage::from_pixel(width, height, image::Rgba([9, 9, 9, 255]));
        let mut out = Cursor::new(Vec::new());
        image
            .write_to(&mut out, image::ImageFormat::Png)
            .unwrap();
        out.into_inner()
    }

    fn raster_site() -> SiteLayout {
        SiteLayout {
            base_path: "/caixinweekly/".into(),
            alternate_strip: Some("caixinweekly".into()),
            ..SiteLayout::default()
        }
    }

    const MANIFEST_URL: &str = "/caixinweekly/data/pages/2025-40/manifest.json";

    fn manifest_body() -> Vec<u8> {
        br#"{"numPages":3,"images":["p001.jpg","p002.jpg","p003.jpg"],"pageHeights":[20,20,20],"width":10}"#
            .to_vec()
    }

    #[tokio::test]
    async fn raster_surface_reserves_manifest_aspect() {
        let fetcher = Arc::new(MemoryFetcher::with(vec![(MANIFEST_URL, manifest_body())]));
        let backend = RasterBackend::open(fetcher, MANIFEST_URL, &raster_site(), 1.414)
            .await
            .unwrap();
        let surface = backend.render_page(2).unwrap();
        match &surface {
            PageSurface::Image(image) => {
                assert_eq!(image.src, "/caixinweekly/data/pages/2025-40/p002.jpg");
                assert_eq!(
                    image.alternate_src.as_deref(),
                    Some("/data/pages/2025-40/p002.jpg")
                );
                assert_eq!(image.state, ImageState::Pending);
            }
            other => panic!("unexpected surface: {:?}", other),
        }
        assert!((surface.layout_height(100.0) - 200.0).abs() < 1e-9);
    }

    #[tokio::test]
    async fn raster_asset_tries_alternate_base_exactly_once() {
        let fetcher = Arc::new(MemoryFetcher::with(vec![(MANIFEST_URL, manifest_body())]));
        let backend = RasterBackend::open(fetcher.clone(), MANIFEST_URL, &raster_site(), 1.414)
            .await
            .unwrap();
        let PageSurface::Image(surface) = backend.render_page(3).unwrap() else {
            panic!("raster backend must produce image surfaces");
        };

        let state = backend.load_image(&surface).await;
        assert_eq!(state, ImageState::Broken);
        assert_eq!(
            fetcher.request_count("/caixinweekly/data/pages/2025-40/p003.jpg"),
            1
        );
        assert_eq!(fetcher.request_count("/data/pages/2025-40/p003.jpg"), 1);

        fetcher.insert("/data/pages/2025-40/p003.jpg", png_bytes(10, 25));
        match backend.load_image(&surface).await {
            ImageState::Loaded {
                image,
                from_alternate,
            } => {
                assert!(from_alternate);
                assert_eq!((image.width, image.height), (10, 25));
            }
            other => panic!("unexpected state: {:?}", other),
        }
    }

    #[tokio::test]
    async fn sub_path_deploy_retries_without_the_prefix() {
        let site = SiteLayout {
            base_path: "/caixinweekly/".into(),
            ..SiteLayout::default()
        };
        let fetcher = Arc::new(MemoryFetcher::with(vec![(MANIFEST_URL, manifest_body())]));
        let backend = RasterBackend::open(fetcher.clone(), MANIFEST_URL, &site, 1.414)
            .await
            .unwrap();
        let PageSurface::Image(surface) = backend.render_page(3).unwrap() else {
            panic!("raster backend must produce image surfaces");
        };
        assert_eq!(
            surface.alternate_src.as_deref(),
            Some("/data/pages/2025-40/p003.jpg")
        );

        assert_eq!(backend.load_image(&surface).await, ImageState::Broken);
        assert_eq!(fetcher.request_count("/data/pages/2025-40/p003.jpg"), 1);
    }

    #[tokio::test]
    async fn missing_manifest_is_unavailable() {
        let fetcher: Arc<dyn Fetcher> = Arc::new(MemoryFetcher::default());
        let decoder = FakeDecoder::new(1);
        let config = ViewerConfig::default();
        let err = Backend::open(
            DocumentSource::Manifest {
                url: "/data/pages/x/manifest.json".into(),
            },
            OpenContext {
                decoder: &decoder,
                fetcher,
                config: &config,
                disable_worker: false,
            },
        )
        .await
        .err()
        .unwrap();
        assert!(matches!(err, ViewerError::ManifestUnavailable { .. }));
    }

    #[tokio::test]
    async fn malformed_manifest_is_invalid() {
        let fetcher: Arc<dyn Fetcher> = Arc::new(MemoryFetcher::with(vec![(
            "/data/pages/x/manifest.json",
            br#"{"numPages":2,"images":["a.jpg"]}"#.to_vec(),
        )]));
        let decoder = FakeDecoder::new(1);
        let config = ViewerConfig::default();
        let err = Backend::open(
            DocumentSource::Manifest {
                url: "/data/pages/x/manifest.json".into(),
            },
            OpenContext {
                decoder: &decoder,
                fetcher,
                config: &config,
                disable_worker: false,
            },
        )
        .await
        .err()
        .unwrap();
        assert!(
            matches!(&err, ViewerError::InvalidManifest { url, .. } if url == "/data/pages/x/manifest.json")
        );
    }

    #[tokio::test]
    async fn vector_backend_forwards_worker_flag_and_chunk_size() {
        let fetcher: Arc<dyn Fetcher> = Arc::new(MemoryFetcher::default());
        let decoder = FakeDecoder::new(4);
        let config = ViewerConfig::default();
        let backend = Backend::open(
            DocumentSource::Stream {
                url: "/data/pdfs/a.pdf".into(),
            },
            OpenContext {
                decoder: &decoder,
                fetcher,
                config: &config,
                disable_worker: true,
            },
        )
        .await
        .unwrap();

        assert_eq!(backend.kind(), RenderMode::Vector);
        assert_eq!(backend.page_count(), 4);
        let opened = decoder.opened.lock();
        assert!(opened[0].disable_worker);
        assert_eq!(opened[0].range_chunk_size, config.range_chunk_size);
        drop(opened);

        assert!(backend.render_page(0).await.is_err());
        assert!(backend.render_page(5).await.is_err());
        let surface = backend.render_page(2).await.unwrap();
        assert!(surface.image().is_some());
        assert!(backend.load_surface(&surface).await.is_none());
    }

    #[test]
    fn loaded_image_overrides_reserved_height() {
        let mut surface = ImageSurface {
            src: "/a.jpg".into(),
            alternate_src: None,
            reserved_aspect: 1.5,
            state: ImageState::Pending,
        };
        assert_eq!(PageSurface::Image(surface.clone()).layout_height(100.0), 150.0);
        surface.state = ImageState::Loaded {
            image: RenderImage {
                width: 50,
                height: 100,
                pixels: Vec::new(),
            },
            from_alternate: false,
        };
        assert_eq!(PageSurface::Image(surface.clone()).layout_height(100.0), 200.0);
        surface.state = ImageState::Broken;
        let broken = PageSurface::Image(surface);
        assert!(broken.is_broken());
        assert_eq!(broken.layout_height(100.0), 150.0);
    }
}
