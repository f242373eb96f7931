use std::fmt;
use std::str::FromStr;

use serde::Serialize;

use crate::error::{ImageError, Result};
use crate::swap::swap_words;

/// Every header integer is a native-endian 32-bit word.
pub const INT_SIZE: usize = 4;

/// Number of slots in the address block.
pub const ADDRESS_SLOTS: usize = 9;

/// Size of the address block at the start of every file.
pub const ADDRESS_BLOCK_SIZE: usize = ADDRESS_SLOTS * INT_SIZE;

/// Title capacity, including the terminating NUL.
pub const TITLE_LEN: usize = 81;

/// Number of histogram buckets.
pub const HISTOGRAM_LEN: usize = 1024;

/// Maximum dimension count; the on-disk extent vector always has this many slots.
pub const MAX_DIMS: usize = 10;

/// Unused span between the histogram block and the pixel-format field.
/// Existing files depend on its exact size.
pub const UNUSED_GAP: u64 = 4092;

/// Smallest and largest Grey pixel values.
pub const MIN_GREY: i32 = -32768;
pub const MAX_GREY: i32 = 32767;

/// Permission bits used when the caller has no preference.
pub const DEFAULT_PERMISSIONS: u32 = 0o644;

// ── Address slots ──────────────────────────────────────────────────────────
//
// Slot order on disk is not offset order: the title sits first in the file
// but third in the table.

const SLOT_MAX_MIN: usize = 0;
const SLOT_HISTOGRAM: usize = 1;
const SLOT_TITLE: usize = 2;
const SLOT_PIXEL_FORMAT: usize = 3;
const SLOT_DIM_COUNT: usize = 4;
const SLOT_DIM_VECTOR: usize = 5;
const SLOT_PIXELS: usize = 6;
const SLOT_INFO: usize = 7;
const SLOT_VERSION: usize = 8;

// ── Pixel formats ──────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum PixelFormat {
    Grey,
    Color,
    ColorPacked,
    Byte,
    Short,
    Long,
    Real,
    Complex,
    UserPacked,
}

impl PixelFormat {
    pub const ALL: [PixelFormat; 9] = [
        PixelFormat::Grey,
        PixelFormat::Color,
        PixelFormat::ColorPacked,
        PixelFormat::Byte,
        PixelFormat::Short,
        PixelFormat::Long,
        PixelFormat::Real,
        PixelFormat::Complex,
        PixelFormat::UserPacked,
    ];

    /// Integer code persisted in the pixel-format field.
    pub fn code(self) -> i32 {
        match self {
            PixelFormat::Grey => 0o10,
            PixelFormat::Color => 0o20,
            PixelFormat::ColorPacked => 0o40,
            PixelFormat::UserPacked => 0o200,
            PixelFormat::Byte => 1,
            PixelFormat::Short => 2,
            PixelFormat::Long => 3,
            PixelFormat::Real => 4,
            PixelFormat::Complex => 5,
        }
    }

    pub fn from_code(code: i32) -> Option<Self> {
        PixelFormat::ALL.into_iter().find(|f| f.code() == code)
    }

    /// Bytes per pixel.
    pub fn element_size(self) -> usize {
        match self {
            PixelFormat::Byte => 1,
            PixelFormat::Grey | PixelFormat::Color | PixelFormat::Short => 2,
            PixelFormat::ColorPacked
            | PixelFormat::Long
            | PixelFormat::Real
            | PixelFormat::UserPacked => 4,
            PixelFormat::Complex => 8,
        }
    }

    /// Word width used when normalizing byte order. Complex pixels swap each
    /// float half; packed RGBA and bytes are never swapped.
    pub fn swap_width(self) -> usize {
        match self {
            PixelFormat::Byte | PixelFormat::ColorPacked => 1,
            PixelFormat::Grey | PixelFormat::Color | PixelFormat::Short => 2,
            PixelFormat::Long | PixelFormat::Real | PixelFormat::Complex | PixelFormat::UserPacked => 4,
        }
    }

    pub fn name(self) -> &'static str {
        match self {
            PixelFormat::Grey => "grey",
            PixelFormat::Color => "color",
            PixelFormat::ColorPacked => "colorpacked",
            PixelFormat::Byte => "byte",
            PixelFormat::Short => "short",
            PixelFormat::Long => "long",
            PixelFormat::Real => "real",
            PixelFormat::Complex => "complex",
            PixelFormat::UserPacked => "userpacked",
        }
    }
}

impl fmt::Display for PixelFormat {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

impl FromStr for PixelFormat {
    type Err = ImageError;

    fn from_str(s: &str) -> Result<Self> {
        let lower = s.to_ascii_lowercase();
        PixelFormat::ALL
            .into_iter()
            .find(|f| f.name() == lower)
            .ok_or_else(|| ImageError::param(format!("Invalid pixel format '{}'", s)))
    }
}

// ── Shape ──────────────────────────────────────────────────────────────────

/// Pixel format plus per-dimension extents, slowest dimension first.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Shape {
    pub format: PixelFormat,
    pub extents: Vec<usize>,
}

impl Shape {
    /// Validate 1..=[`MAX_DIMS`] dimensions, each at least 1.
    pub fn new(format: PixelFormat, extents: &[usize]) -> Result<Self> {
        if extents.is_empty() || extents.len() > MAX_DIMS {
            return Err(ImageError::param(format!(
                "Invalid dimension count {}",
                extents.len()
            )));
        }
        if let Some(dim) = extents.iter().position(|&e| e == 0 || e > i32::MAX as usize) {
            return Err(ImageError::param(format!(
                "Invalid extent {} for dimension {}",
                extents[dim], dim
            )));
        }
        let shape = Self {
            format,
            extents: extents.to_vec(),
        };
        shape
            .checked_pixel_bytes()
            .ok_or_else(|| ImageError::param("Image too large"))?;
        Ok(shape)
    }

    fn checked_pixel_bytes(&self) -> Option<u64> {
        self.extents
            .iter()
            .try_fold(self.format.element_size() as u64, |acc, &e| acc.checked_mul(e as u64))
    }

    pub fn element_size(&self) -> usize {
        self.format.element_size()
    }

    pub fn pixel_count(&self) -> u64 {
        self.extents.iter().map(|&e| e as u64).product()
    }

    pub fn pixel_bytes(&self) -> u64 {
        self.pixel_count() * self.element_size() as u64
    }
}

// ── Version / flags word ───────────────────────────────────────────────────

/// The packed version-flags word.
///
/// Bit 0 marks "written in native byte order". Compression sets the
/// 65536 bit and adds `method * 4096` on top of it. Decoding subtracts the
/// compressed bit and divides by the stride, which drops bit 0.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct VersionFlags(i32);

impl VersionFlags {
    pub const NATIVE_ORDER: i32 = 1;
    pub const COMPRESSED: i32 = 65536;
    pub const METHOD_STRIDE: i32 = 4096;

    /// Flags of a freshly created, uncompressed image.
    pub fn native() -> Self {
        VersionFlags(Self::NATIVE_ORDER)
    }

    pub fn from_raw(raw: i32) -> Self {
        VersionFlags(raw)
    }

    pub fn raw(self) -> i32 {
        self.0
    }

    pub fn is_native_order(self) -> bool {
        self.0 & Self::NATIVE_ORDER != 0
    }

    pub fn is_compressed(self) -> bool {
        self.0 & Self::COMPRESSED != 0
    }

    /// Compression method index, if the compressed bit is set.
    pub fn method(self) -> Option<usize> {
        if !self.is_compressed() {
            return None;
        }
        let index = (self.0 - Self::COMPRESSED) / Self::METHOD_STRIDE;
        usize::try_from(index).ok()
    }

    /// Re-encode the compression state. Applying the same state twice yields
    /// the same word.
    pub fn with_compression(self, method: Option<usize>) -> Self {
        let mut raw = self.0;
        if let Some(old) = self.method() {
            raw -= Self::COMPRESSED + old as i32 * Self::METHOD_STRIDE;
        }
        if let Some(new) = method {
            raw += Self::COMPRESSED + new as i32 * Self::METHOD_STRIDE;
        }
        VersionFlags(raw)
    }
}

// ── Address table ──────────────────────────────────────────────────────────

/// Byte offsets of every header section plus the flags word.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AddressTable {
    pub title: u64,
    pub max_min: u64,
    pub histogram: u64,
    pub pixel_format: u64,
    pub dim_count: u64,
    pub dim_vector: u64,
    pub pixels: u64,
    pub info: u64,
    pub flags: VersionFlags,
}

/// Size of the validity int plus the min/max pair.
pub const MAX_MIN_BLOCK_SIZE: u64 = (INT_SIZE * 3) as u64;

/// Size of the validity int plus the bucket array.
pub const HISTOGRAM_BLOCK_SIZE: u64 = (INT_SIZE * (HISTOGRAM_LEN + 1)) as u64;

impl AddressTable {
    /// Lay out a new file whose pixel region holds `pixel_bytes` bytes.
    pub fn compute(pixel_bytes: u64) -> Result<Self> {
        let title = ADDRESS_BLOCK_SIZE as u64;
        let max_min = title + TITLE_LEN as u64;
        let histogram = max_min + MAX_MIN_BLOCK_SIZE;
        let pixel_format = histogram + UNUSED_GAP + HISTOGRAM_BLOCK_SIZE;
        let dim_count = pixel_format + INT_SIZE as u64;
        let dim_vector = dim_count + INT_SIZE as u64;
        let pixels = dim_vector + (INT_SIZE * MAX_DIMS) as u64;
        let info = pixels
            .checked_add(pixel_bytes)
            .filter(|end| *end <= i32::MAX as u64)
            .ok_or_else(|| ImageError::param("Image too large for 32-bit address table"))?;
        Ok(Self {
            title,
            max_min,
            histogram,
            pixel_format,
            dim_count,
            dim_vector,
            pixels,
            info,
            flags: VersionFlags::native(),
        })
    }

    /// Offsets in file order, for inspection and invariant checks.
    pub fn offsets(&self) -> [u64; 8] {
        [
            self.title,
            self.max_min,
            self.histogram,
            self.pixel_format,
            self.dim_count,
            self.dim_vector,
            self.pixels,
            self.info,
        ]
    }

    /// Serialize to the on-disk block, byte-swapping every word when the file
    /// is in foreign order.
    pub fn to_bytes(&self, swap: bool) -> Result<[u8; ADDRESS_BLOCK_SIZE]> {
        let mut slots = [0i32; ADDRESS_SLOTS];
        slots[SLOT_MAX_MIN] = offset_to_i32(self.max_min)?;
        slots[SLOT_HISTOGRAM] = offset_to_i32(self.histogram)?;
        slots[SLOT_TITLE] = offset_to_i32(self.title)?;
        slots[SLOT_PIXEL_FORMAT] = offset_to_i32(self.pixel_format)?;
        slots[SLOT_DIM_COUNT] = offset_to_i32(self.dim_count)?;
        slots[SLOT_DIM_VECTOR] = offset_to_i32(self.dim_vector)?;
        slots[SLOT_PIXELS] = offset_to_i32(self.pixels)?;
        slots[SLOT_INFO] = offset_to_i32(self.info)?;
        slots[SLOT_VERSION] = self.flags.raw();

        let mut buf = [0u8; ADDRESS_BLOCK_SIZE];
        buf.copy_from_slice(&encode_ints(&slots, swap));
        Ok(buf)
    }

    /// Deserialize the on-disk block. Returns the table and whether the file
    /// is in foreign byte order.
    ///
    /// The order bit is tested on the raw word before anything is swapped.
    pub fn from_bytes(buf: &[u8; ADDRESS_BLOCK_SIZE]) -> Result<(Self, bool)> {
        let start = SLOT_VERSION * INT_SIZE;
        let raw_flags = VersionFlags::from_raw(i32::from_ne_bytes(
            buf[start..start + INT_SIZE]
                .try_into()
                .map_err(|_| ImageError::format("address block too short"))?,
        ));
        let swap = !raw_flags.is_native_order();
        let slots = decode_ints(buf, swap);

        let table = Self {
            max_min: offset_from_i32(slots[SLOT_MAX_MIN], "max/min")?,
            histogram: offset_from_i32(slots[SLOT_HISTOGRAM], "histogram")?,
            title: offset_from_i32(slots[SLOT_TITLE], "title")?,
            pixel_format: offset_from_i32(slots[SLOT_PIXEL_FORMAT], "pixel format")?,
            dim_count: offset_from_i32(slots[SLOT_DIM_COUNT], "dimension count")?,
            dim_vector: offset_from_i32(slots[SLOT_DIM_VECTOR], "dimension vector")?,
            pixels: offset_from_i32(slots[SLOT_PIXELS], "pixels")?,
            info: offset_from_i32(slots[SLOT_INFO], "info")?,
            flags: VersionFlags::from_raw(slots[SLOT_VERSION]),
        };
        Ok((table, swap))
    }

    /// Stored pixel bytes over raw pixel bytes.
    pub fn compression_ratio(&self, pixel_bytes: u64) -> f32 {
        if pixel_bytes == 0 {
            return 1.0;
        }
        self.info.saturating_sub(self.pixels) as f32 / pixel_bytes as f32
    }
}

fn offset_to_i32(offset: u64) -> Result<i32> {
    i32::try_from(offset).map_err(|_| ImageError::param(format!("offset {} exceeds 32-bit address table", offset)))
}

fn offset_from_i32(value: i32, section: &str) -> Result<u64> {
    u64::try_from(value).map_err(|_| ImageError::format(format!("negative {} offset {}", section, value)))
}

// ── Header integer codecs ──────────────────────────────────────────────────

/// Encode native-endian 32-bit words, optionally byte-swapped.
pub fn encode_ints(values: &[i32], swap: bool) -> Vec<u8> {
    let mut buf: Vec<u8> = values.iter().flat_map(|v| v.to_ne_bytes()).collect();
    if swap {
        swap_words(&mut buf, INT_SIZE);
    }
    buf
}

/// Decode native-endian 32-bit words, optionally byte-swapped first.
pub fn decode_ints(buf: &[u8], swap: bool) -> Vec<i32> {
    buf.chunks_exact(INT_SIZE)
        .map(|chunk| {
            let mut word = [0u8; INT_SIZE];
            word.copy_from_slice(chunk);
            if swap {
                word.reverse();
            }
            i32::from_ne_bytes(word)
        })
        .collect()
}

/// Encode a title into its fixed NUL-padded field.
pub fn encode_title(title: &str) -> Result<[u8; TITLE_LEN]> {
    let bytes = title.as_bytes();
    if bytes.len() + 1 > TITLE_LEN {
        return Err(ImageError::param("Title too long"));
    }
    if bytes.contains(&0) {
        return Err(ImageError::param("Title contains a NUL byte"));
    }
    let mut buf = [0u8; TITLE_LEN];
    buf[..bytes.len()].copy_from_slice(bytes);
    Ok(buf)
}

/// Decode a title field up to its first NUL.
pub fn decode_title(buf: &[u8]) -> String {
    let end = buf.iter().position(|b| *b == 0).unwrap_or(buf.len());
    String::from_utf8_lossy(&buf[..end]).into_owned()
}
