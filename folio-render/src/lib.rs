//! Concrete document decoding and data access for folio.

use std::sync::Arc;

use anyhow::Result;
use async_trait::async_trait;
use folio_core::{DecodedDocument, DocumentDecoder, Fetcher, OpenParams, ViewerError};

pub mod fetch;
#[cfg(feature = "pdf")]
mod pdfium;
pub mod worker;

pub use fetch::{HttpFetcher, StaticSiteFetcher};
#[cfg(feature = "pdf")]
pub use pdfium::PdfiumDecoder;

/// Stand-in decoder for builds without the `pdf` feature. Raster mode keeps working.
pub struct UnsupportedDecoder;

#[async_trait]
impl DocumentDecoder for UnsupportedDecoder {
    async fn open(&self, _params: OpenParams) -> Result<Arc<dyn DecodedDocument>, ViewerError> {
        Err(ViewerError::Decode(
            "this build has no vector document support; use raster mode".into(),
        ))
    }
}

/// The best decoder this build offers.
pub fn default_decoder(fetcher: Arc<dyn Fetcher>) -> Result<Arc<dyn DocumentDecoder>> {
    #[cfg(feature = "pdf")]
    {
        Ok(Arc::new(PdfiumDecoder::new(fetcher)?))
    }
    #[cfg(not(feature = "pdf"))]
    {
        let _ = fetcher;
        Ok(Arc::new(UnsupportedDecoder))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use folio_core::DocumentSource;

    #[tokio::test]
    async fn unsupported_decoder_reports_decode_error() {
        let err = UnsupportedDecoder
            .open(OpenParams {
                source: DocumentSource::Bytes(bytes::Bytes::from_static(b"%PDF")),
                disable_worker: false,
                range_chunk_size: 1024,
            })
            .await
            .err()
            .unwrap();
        assert!(matches!(err, ViewerError::Decode(_)));
    }
}
