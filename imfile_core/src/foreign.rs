//! Boundary for adapters that expose other image formats through the same
//! session API.
//!
//! A probe either recognises a file and returns a populated
//! [`ForeignImage`], or returns `Ok(None)` so the opener can try the next
//! probe and finally the native format. Foreign images are read-only.

use std::fs::File;
use std::path::Path;

use serde::Serialize;

use crate::error::Result;
use crate::format::Shape;
use crate::info::InfoFields;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum SourceFormat {
    Native,
    /// Tag-structured medical formats.
    ForeignTagBased,
    /// Text-header formats.
    ForeignTextBased,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AccessMode {
    Read,
    Update,
}

/// Descriptor content produced by a foreign-format probe.
///
/// `pixel_offset` locates raw, uncompressed pixels in `file`, laid out like
/// native pixels. Set `byte_swap` when they are stored in foreign order.
pub struct ForeignImage {
    pub file: File,
    pub source: SourceFormat,
    pub shape: Shape,
    pub pixel_offset: u64,
    pub byte_swap: bool,
    pub title: String,
    pub info: InfoFields,
}

pub trait FormatProbe: Send + Sync {
    fn name(&self) -> &'static str;

    fn probe(&self, path: &Path, mode: AccessMode) -> Result<Option<ForeignImage>>;
}
