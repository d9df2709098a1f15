use serde::{Deserialize, Serialize};

use crate::PageNumber;

/// Description of a pre-rendered issue, served next to its page images.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Manifest {
    pub num_pages: u32,
    /// File names, index `i` holds page `i + 1`.
    pub images: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub page_heights: Option<Vec<u32>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub width: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub issue_title: Option<String>,
    #[serde(default)]
    pub outline: Vec<OutlineEntry>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct OutlineEntry {
    pub title: String,
    pub page_number: PageNumber,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub order: Option<u32>,
}

impl Manifest {
    pub fn parse(raw: &[u8]) -> Result<Self, String> {
        let manifest: Manifest = serde_json::from_slice(raw).map_err(|err| err.to_string())?;
        manifest.validate()?;
        Ok(manifest)
    }

    pub fn validate(&self) -> Result<(), String> {
        if self.images.len() != self.num_pages as usize {
            return Err(format!(
                "manifest lists {} images for {} pages",
                self.images.len(),
                self.num_pages
            ));
        }
        if let Some(heights) = &self.page_heights {
            if heights.len() != self.num_pages as usize {
                return Err(format!(
                    "manifest lists {} page heights for {} pages",
                    heights.len(),
                    self.num_pages
                ));
            }
        }
        Ok(())
    }

    pub fn image_for(&self, page: PageNumber) -> Option<&str> {
        let index = page.checked_sub(1)? as usize;
        self.images.get(index).map(String::as_str)
    }

    /// Height over width for `page`, when both are recorded.
    pub fn aspect_ratio(&self, page: PageNumber) -> Option<f64> {
        let width = self.width.filter(|&w| w > 0)? as f64;
        let index = page.checked_sub(1)? as usize;
        let height = *self.page_heights.as_ref()?.get(index)?;
        (height > 0).then(|| height as f64 / width)
    }

    /// Outline sorted by `order`, then by page.
    pub fn sorted_outline(&self) -> Vec<OutlineEntry> {
        let mut outline = self.outline.clone();
        outline.sort_by_key(|entry| (entry.order.unwrap_or(u32::MAX), entry.page_number));
        outline
    }
}
