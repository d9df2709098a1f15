use std::mem;
use std::sync::Arc;

use anyhow::{anyhow, Result};
use async_trait::async_trait;
use bytes::Bytes;
use folio_core::source::fetch_chunked;
use folio_core::{
    DecodedDocument, DocumentDecoder, DocumentSource, Fetcher, OpenParams, PageNumber, RenderImage,
    ViewerError,
};
use parking_lot::Mutex;
use pdfium_render::prelude::*;
use tracing::{debug, instrument, warn};

use crate::worker::run_decode;

/// Decodes vector documents with pdfium. Remote documents are pulled through
/// the fetcher in fixed size ranges before they are parsed.
pub struct PdfiumDecoder {
    pdfium: Arc<Pdfium>,
    fetcher: Arc<dyn Fetcher>,
}

impl PdfiumDecoder {
    pub fn new(fetcher: Arc<dyn Fetcher>) -> Result<Self> {
        let pdfium = match bind_pdfium_from_build_hint() {
            Some(pdfium) => pdfium,
            None => bind_pdfium_default()?,
        };
        Ok(Self {
            pdfium: Arc::new(pdfium),
            fetcher,
        })
    }

    async fn source_bytes(&self, params: &OpenParams) -> Result<Bytes, ViewerError> {
        match &params.source {
            DocumentSource::Bytes(bytes) => Ok(bytes.clone()),
            DocumentSource::Stream { url } => {
                let bytes =
                    fetch_chunked(self.fetcher.as_ref(), url, params.range_chunk_size).await?;
                debug!(%url, bytes = bytes.len(), "downloaded document");
                Ok(bytes)
            }
            DocumentSource::Manifest { url } => Err(ViewerError::Decode(format!(
                "{} is a page manifest, not a document",
                url
            ))),
        }
    }
}

#[async_trait]
impl DocumentDecoder for PdfiumDecoder {
    #[instrument(skip_all, fields(inline = params.disable_worker))]
    async fn open(&self, params: OpenParams) -> Result<Arc<dyn DecodedDocument>, ViewerError> {
        let bytes = self.source_bytes(&params).await?;
        let pdfium = Arc::clone(&self.pdfium);
        let inline = params.disable_worker;
        let loaded = run_decode(inline, move || LoadedDocument::load(pdfium, &bytes)).await?;
        debug!(pages = loaded.page_count, "document opened");
        Ok(Arc::new(PdfiumDocument {
            loaded: Arc::new(loaded),
            inline,
        }))
    }
}

struct PdfiumDocument {
    loaded: Arc<LoadedDocument>,
    inline: bool,
}

#[async_trait]
impl DecodedDocument for PdfiumDocument {
    fn page_count(&self) -> u32 {
        self.loaded.page_count
    }

    async fn render_page(&self, page: PageNumber, scale: f32) -> Result<RenderImage, ViewerError> {
        let loaded = Arc::clone(&self.loaded);
        run_decode(self.inline, move || loaded.render(page, scale)).await
    }

    fn close(&self) {
        if self.loaded.document.lock().take().is_some() {
            debug!("document closed");
        }
    }
}

struct LoadedDocument {
    document: Mutex<Option<PdfDocument<'static>>>,
    page_count: u32,
    pdfium: Arc<Pdfium>,
}

impl LoadedDocument {
    fn load(pdfium: Arc<Pdfium>, bytes: &Bytes) -> Result<Self, ViewerError> {
        let document = pdfium
            .load_pdf_from_byte_vec(bytes.to_vec(), None)
            .map_err(|err| ViewerError::Decode(err.to_string()))?;
        // SAFETY: the document borrows the bindings owned by `pdfium`. It is
        // stored in `self.document`, which is declared before `self.pdfium` and
        // therefore dropped first, and `close` only ever drops it earlier.
        let document = unsafe { mem::transmute::<PdfDocument<'_>, PdfDocument<'static>>(document) };
        let page_count = u32::try_from(document.pages().len()).unwrap_or_default();
        Ok(Self {
            document: Mutex::new(Some(document)),
            page_count,
            pdfium,
        })
    }

    fn render(&self, page: PageNumber, scale: f32) -> Result<RenderImage, ViewerError> {
        let guard = self.document.lock();
        let document = guard
            .as_ref()
            .ok_or_else(|| ViewerError::page(page, "document already closed"))?;
        let index = page
            .checked_sub(1)
            .and_then(|index| PdfPageIndex::try_from(index).ok())
            .ok_or_else(|| ViewerError::page(page, "page is out of supported range"))?;
        let pdf_page = document
            .pages()
            .get(index)
            .map_err(|err| ViewerError::page(page, err))?;

        let config = PdfRenderConfig::new().scale_page_by_factor(scale.max(0.1));
        let bitmap = pdf_page
            .render_with_config(&config)
            .map_err(|err| ViewerError::page(page, err))?;
        let image = bitmap.as_image().to_rgba8();
        Ok(RenderImage {
            width: image.width(),
            height: image.height(),
            pixels: image.into_raw(),
        })
    }
}

fn bind_pdfium_from_build_hint() -> Option<Pdfium> {
    match option_env!("FOLIO_PDFIUM_LIBRARY_PATH") {
        Some(path) if !path.is_empty() => match Pdfium::bind_to_library(path) {
            Ok(bindings) => Some(Pdfium::new(bindings)),
            Err(err) => {
                warn!(%path, %err, "failed to load pdfium from the build-provided path");
                None
            }
        },
        _ => None,
    }
}

fn bind_pdfium_default() -> Result<Pdfium> {
    let local = Pdfium::pdfium_platform_library_name_at_path("./");
    let local_err = match Pdfium::bind_to_library(&local) {
        Ok(bindings) => return Ok(Pdfium::new(bindings)),
        Err(err) => format!("{}: {}", local.display(), err),
    };
    match Pdfium::bind_to_system_library() {
        Ok(bindings) => Ok(Pdfium::new(bindings)),
        Err(err) => Err(anyhow!(
            "failed to bind to a pdfium library; ensure it is installed ({}, system: {})",
            local_err,
            err
        )),
    }
}
