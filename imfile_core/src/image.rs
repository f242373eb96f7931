use std::fmt;
use std::fs::{self, File, OpenOptions};
use std::io::{self, Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};
use std::sync::Arc;

use serde::Serialize;
use tracing::{debug, warn};

use crate::compression::{self, copy_exact, CompressionState, Shadow, COMPRESSION_FIELD};
use crate::context::Context;
use crate::error::{alloc_bytes, ImageError, IoContext, Result};
use crate::foreign::{AccessMode, ForeignImage, SourceFormat};
use crate::format::{
    decode_ints, decode_title, encode_ints, encode_title, AddressTable, PixelFormat, Shape,
    VersionFlags, ADDRESS_BLOCK_SIZE, DEFAULT_PERMISSIONS, HISTOGRAM_LEN, INT_SIZE, MAX_DIMS,
    TITLE_LEN,
};
use crate::info::InfoFields;
use crate::stats::{GreySource, StatKind, Statistics};
use crate::swap::swap_words;
use crate::window::{plan_runs, Run, Window};

/// Summary returned by [`Image::header`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Header {
    pub format: PixelFormat,
    pub element_size: usize,
    pub pixel_count: u64,
    pub extents: Vec<usize>,
    /// Exact `(min, max)`, Grey images only.
    pub max_min: Option<(i32, i32)>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct CompressionInfo {
    pub compressed: bool,
    pub method: Option<usize>,
    pub method_name: Option<String>,
    /// Stored pixel bytes over raw pixel bytes.
    pub ratio: f32,
}

#[derive(Debug, Clone, Copy)]
enum Conversion {
    Policy,
    Compress,
    Decompress,
}

/// An open image session.
///
/// Header sections live in memory while the session is open and are written
/// back only by one of the close methods. Dropping an updatable image
/// without closing it discards those changes.
pub struct Image {
    ctx: Arc<Context>,
    file: File,
    path: PathBuf,
    mode: AccessMode,
    source: SourceFormat,
    shape: Shape,
    title: String,
    stats: Statistics,
    table: AddressTable,
    swap: bool,
    info: InfoFields,
    compression: Option<CompressionState>,
    closed: bool,
}

impl fmt::Debug for Image {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Image")
            .field("path", &self.path)
            .field("mode", &self.mode)
            .field("source", &self.source)
            .field("shape", &self.shape)
            .field("compressed", &self.table.flags.is_compressed())
            .finish_non_exhaustive()
    }
}

impl Image {
    // ── Session lifecycle ──────────────────────────────────────────────────

    /// Create a new native image with zeroed pixels.
    ///
    /// Fails if `path` exists unless the context policy allows clobbering.
    /// With `Policy::compress_method` set the image starts out compressed.
    pub fn create(
        ctx: &Arc<Context>,
        path: impl AsRef<Path>,
        permissions: u32,
        format: PixelFormat,
        extents: &[usize],
    ) -> Result<Image> {
        ctx.track(Self::create_inner(ctx, path.as_ref(), permissions, format, extents))
    }

    fn create_inner(
        ctx: &Arc<Context>,
        path: &Path,
        permissions: u32,
        format: PixelFormat,
        extents: &[usize],
    ) -> Result<Image> {
        let shape = Shape::new(format, extents)?;
        let table = AddressTable::compute(shape.pixel_bytes())?;

        let mut options = OpenOptions::new();
        options.read(true).write(true);
        if ctx.policy().clobber {
            options.create(true).truncate(true);
        } else {
            options.create_new(true);
        }
        #[cfg(unix)]
        {
            use std::os::unix::fs::OpenOptionsExt;
            options.mode(permissions);
        }
        #[cfg(not(unix))]
        let _ = permissions;

        let file = options.open(path).map_err(|e| {
            if e.kind() == io::ErrorKind::AlreadyExists {
                ImageError::param(format!("Image file {} already exists", path.display()))
            } else {
                ImageError::Io {
                    context: format!("Can not create image file {}", path.display()),
                    source: e,
                }
            }
        })?;
        if let Err(e) = file
            .set_len(table.info)
            .io_context("Image pixel region allocation failed")
        {
            drop(file);
            discard_partial(path);
            return Err(e);
        }

        let mut image = Image {
            ctx: Arc::clone(ctx),
            file,
            path: path.to_path_buf(),
            mode: AccessMode::Update,
            source: SourceFormat::Native,
            shape,
            title: String::new(),
            stats: Statistics::new(),
            table,
            swap: false,
            info: InfoFields::new(),
            compression: None,
            closed: false,
        };

        if let Err(e) = image.initialise() {
            image.closed = true;
            drop(image);
            discard_partial(path);
            return Err(e);
        }
        debug!(
            path = %path.display(),
            format = %format,
            extents = ?image.shape.extents,
            compressed = image.table.flags.is_compressed(),
            "image created"
        );
        Ok(image)
    }

    fn initialise(&mut self) -> Result<()> {
        let requested = self.ctx.policy().compress_method;
        if let Some(requested) = requested {
            // zero-filled pixels, compressed up front
            let mut shadow = Shadow::create(&self.ctx.policy().shadow_dir())?;
            shadow
                .file
                .set_len(self.shape.pixel_bytes())
                .io_context("Could not size temp file")?;
            let method = self.compress_shadow(&mut shadow, Some(requested))?;
            let mut state = CompressionState::new(method);
            state.shadow = Some(shadow);
            state.accessed = true;
            self.compression = Some(state);
        }
        self.write_header()
    }

    /// Open an existing image. Registered foreign-format probes are tried
    /// first, the native format last.
    pub fn open(ctx: &Arc<Context>, path: impl AsRef<Path>, mode: AccessMode) -> Result<Image> {
        ctx.track(Self::open_inner(ctx, path.as_ref(), mode))
    }

    fn open_inner(ctx: &Arc<Context>, path: &Path, mode: AccessMode) -> Result<Image> {
        for probe in ctx.probes() {
            if let Some(foreign) = probe.probe(path, mode)? {
                debug!(probe = probe.name(), path = %path.display(), "opened foreign image");
                return Ok(Self::from_foreign(ctx, path, mode, foreign));
            }
        }
        Self::open_native(ctx, path, mode)
    }

    fn from_foreign(ctx: &Arc<Context>, path: &Path, mode: AccessMode, foreign: ForeignImage) -> Image {
        let pixels = foreign.pixel_offset;
        let table = AddressTable {
            title: 0,
            max_min: 0,
            histogram: 0,
            pixel_format: 0,
            dim_count: 0,
            dim_vector: 0,
            pixels,
            info: pixels + foreign.shape.pixel_bytes(),
            flags: VersionFlags::native(),
        };
        Image {
            ctx: Arc::clone(ctx),
            file: foreign.file,
            path: path.to_path_buf(),
            mode,
            source: foreign.source,
            shape: foreign.shape,
            title: foreign.title,
            stats: Statistics::new(),
            table,
            swap: foreign.byte_swap,
            info: foreign.info,
            compression: None,
            closed: false,
        }
    }

    fn open_native(ctx: &Arc<Context>, path: &Path, mode: AccessMode) -> Result<Image> {
        let mut file = OpenOptions::new()
            .read(true)
            .write(mode == AccessMode::Update)
            .open(path)
            .map_err(|e| ImageError::Io {
                context: format!("Can not open image file {}", path.display()),
                source: e,
            })?;

        let mut block = [0u8; ADDRESS_BLOCK_SIZE];
        file.read_exact(&mut block)
            .io_context("Image address read failed")?;
        let (table, swap) = AddressTable::from_bytes(&block)?;
        let (title, stats, shape) = read_header(&mut file, &table, swap)?;

        let file_len = file
            .metadata()
            .io_context("Image file stat failed")?
            .len();
        if table.info >= file_len {
            return Err(ImageError::format("missing info region"));
        }
        if table.info < table.pixels
            || (!table.flags.is_compressed() && table.pixels + shape.pixel_bytes() > table.info)
        {
            return Err(ImageError::format("pixel region truncated"));
        }

        let info_len = usize::try_from(file_len - table.info)
            .map_err(|_| ImageError::format("info region too large"))?;
        let mut info_bytes = alloc_bytes(info_len)?;
        read_at(&mut file, table.info, &mut info_bytes, "Image info read failed")?;
        let info = InfoFields::parse(&info_bytes);

        let compression = if table.flags.is_compressed() {
            let method = table
                .flags
                .method()
                .ok_or_else(|| ImageError::format("invalid compression method"))?;
            Some(CompressionState::new(method))
        } else {
            None
        };

        debug!(
            path = %path.display(),
            format = %shape.format,
            extents = ?shape.extents,
            swap,
            compressed = compression.is_some(),
            "image opened"
        );
        Ok(Image {
            ctx: Arc::clone(ctx),
            file,
            path: path.to_path_buf(),
            mode,
            source: SourceFormat::Native,
            shape,
            title,
            stats,
            table,
            swap,
            info,
            compression,
            closed: false,
        })
    }

    /// Close the image, applying the context's forced conversion policy.
    pub fn close(self) -> Result<()> {
        self.finish(Conversion::Policy)
    }

    /// Close the image, storing its pixels compressed.
    pub fn close_compressed(self) -> Result<()> {
        self.finish(Conversion::Compress)
    }

    /// Close the image, storing its pixels uncompressed.
    pub fn close_uncompressed(self) -> Result<()> {
        self.finish(Conversion::Decompress)
    }

    fn finish(mut self, conversion: Conversion) -> Result<()> {
        self.closed = true;
        let result = self.finish_inner(conversion);
        self.ctx.track(result)
    }

    fn finish_inner(&mut self, conversion: Conversion) -> Result<()> {
        if self.source != SourceFormat::Native || self.mode == AccessMode::Read {
            debug!(path = %self.path.display(), "read-only image closed");
            return Ok(());
        }

        let compressed = self.compression.is_some();
        let (force_compress, force_decompress, requested) = {
            let policy = self.ctx.policy();
            (policy.force_compress, policy.force_decompress, policy.compress_method)
        };
        let store_compressed = match conversion {
            Conversion::Compress => true,
            Conversion::Decompress => false,
            Conversion::Policy if force_decompress => false,
            Conversion::Policy if force_compress => true,
            Conversion::Policy => compressed,
        };

        match (compressed, store_compressed) {
            (false, true) => self.convert_to_compressed(requested)?,
            (true, false) => self.convert_to_uncompressed()?,
            (true, true) => self.recompress_if_modified()?,
            (false, false) => {}
        }
        self.compression = None;
        self.write_header()?;

        debug!(
            path = %self.path.display(),
            compressed = self.table.flags.is_compressed(),
            "image closed"
        );
        Ok(())
    }

    // ── Compression conversions ────────────────────────────────────────────

    /// Compress `shadow` into the container with the resolved method and
    /// record the method in the flags word and info fields.
    fn compress_shadow(&mut self, shadow: &mut Shadow, requested: Option<usize>) -> Result<usize> {
        let registry = self.ctx.registry()?;
        let method = compression::resolve_method(registry, requested);
        let name = registry
            .get(method)
            .map(|m| m.name.clone())
            .unwrap_or_default();

        compression::compress(&self.ctx, method, shadow, &mut self.file, &mut self.table, &self.shape)?;
        self.table.flags = self.table.flags.with_compression(Some(method));
        self.info.put(COMPRESSION_FIELD, &name)?;
        Ok(method)
    }

    fn convert_to_compressed(&mut self, requested: Option<usize>) -> Result<()> {
        let mut shadow = Shadow::create(&self.ctx.policy().shadow_dir())?;
        self.file
            .seek(SeekFrom::Start(self.table.pixels))
            .io_context("Uncompressed pixel read failed")?;
        copy_exact(
            &mut self.file,
            &mut shadow.file,
            self.shape.pixel_bytes(),
            "Uncompressed pixel read failed",
        )?;
        self.compress_shadow(&mut shadow, requested.or(Some(0)))?;
        Ok(())
    }

    fn convert_to_uncompressed(&mut self) -> Result<()> {
        pixel_view(&self.ctx, &mut self.file, &mut self.compression, &self.table, &self.shape, self.swap)?;

        let bytes = self.shape.pixel_bytes();
        let shadow = self
            .compression
            .as_mut()
            .and_then(|state| state.shadow.as_mut())
            .ok_or_else(|| ImageError::state("Shadow file missing"))?;
        shadow
            .file
            .seek(SeekFrom::Start(0))
            .io_context("Uncompressed pixel read failed")?;
        self.file
            .seek(SeekFrom::Start(self.table.pixels))
            .io_context("Uncompressed Image pixel write failed")?;
        copy_exact(
            &mut shadow.file,
            &mut self.file,
            bytes,
            "Uncompressed Image pixel write failed",
        )?;

        self.table.info = self.table.pixels + bytes;
        self.table.flags = self.table.flags.with_compression(None);
        self.info.remove(COMPRESSION_FIELD);
        Ok(())
    }

    fn recompress_if_modified(&mut self) -> Result<()> {
        let Some(state) = self.compression.as_mut() else {
            return Ok(());
        };
        if !state.modified {
            return Ok(());
        }
        let method = state.method;
        let mut shadow = state
            .shadow
            .take()
            .ok_or_else(|| ImageError::state("Shadow file missing"))?;

        let name = self.ctx.registry()?.get(method).map(|m| m.name.clone());
        compression::compress(&self.ctx, method, &mut shadow, &mut self.file, &mut self.table, &self.shape)?;
        if let Some(name) = name {
            self.info.put(COMPRESSION_FIELD, &name)?;
        }
        Ok(())
    }

    // ── Header persistence ─────────────────────────────────────────────────

    fn write_header(&mut self) -> Result<()> {
        let swap = self.swap;
        let table = &self.table;
        let file = &mut self.file;

        write_at(file, table.title, &encode_title(&self.title)?, "Image title write failed")?;

        let stats = &self.stats;
        let max_min = [i32::from(stats.max_min_valid), stats.min, stats.max];
        write_at(file, table.max_min, &encode_ints(&max_min, swap), "Image max/min write failed")?;

        let mut histogram = Vec::with_capacity(HISTOGRAM_LEN + 1);
        histogram.push(i32::from(stats.histogram_valid));
        histogram.extend_from_slice(&stats.histogram);
        write_at(file, table.histogram, &encode_ints(&histogram, swap), "Image histogram write failed")?;

        let code = [self.shape.format.code()];
        write_at(file, table.pixel_format, &encode_ints(&code, swap), "Image pixel format write failed")?;

        let dims = &self.shape.extents;
        write_at(file, table.dim_count, &encode_ints(&[dims.len() as i32], swap), "Image dimension write failed")?;
        let mut dimv = [0i32; MAX_DIMS];
        for (slot, &extent) in dimv.iter_mut().zip(dims) {
            *slot = extent as i32;
        }
        write_at(file, table.dim_vector, &encode_ints(&dimv, swap), "Image dimension write failed")?;

        let info = self.info.to_bytes();
        write_at(file, table.info, &info, "Image info write failed")?;
        file.set_len(table.info + info.len() as u64)
            .io_context("Image truncate failed")?;

        write_at(file, 0, &table.to_bytes(swap)?, "Image address write failed")?;
        file.flush().io_context("Image flush failed")
    }

    // ── Pixel access ───────────────────────────────────────────────────────

    fn ensure_writable(&self) -> Result<()> {
        if self.source != SourceFormat::Native {
            return Err(ImageError::state("Can not write this format image file"));
        }
        if self.mode != AccessMode::Update {
            return Err(ImageError::state("Image opened read-only"));
        }
        Ok(())
    }

    fn check_range(&self, lo: u64, hi: u64) -> Result<()> {
        if lo > hi || hi >= self.shape.pixel_count() {
            return Err(ImageError::param("Invalid pixel index"));
        }
        Ok(())
    }

    fn flat_run(&self, lo: u64, hi: u64, buf_len: usize) -> Result<Vec<Run>> {
        self.check_range(lo, hi)?;
        let elem = self.shape.element_size();
        let len = (hi - lo + 1) as usize * elem;
        check_buffer(buf_len, len)?;
        Ok(vec![Run {
            offset: lo * elem as u64,
            len,
        }])
    }

    fn window_runs(&self, window: &Window, buf_len: usize) -> Result<Vec<Run>> {
        let elem = self.shape.element_size();
        let runs = plan_runs(&self.shape.extents, window, elem)?;
        check_buffer(buf_len, window.pixel_count() as usize * elem)?;
        debug!(runs = runs.len(), "window planned");
        Ok(runs)
    }

    fn read_runs(&mut self, runs: &[Run], buf: &mut [u8]) -> Result<()> {
        let mut view = pixel_view(&self.ctx, &mut self.file, &mut self.compression, &self.table, &self.shape, self.swap)?;
        view.read_runs(runs, buf)
    }

    fn write_runs(&mut self, runs: &[Run], buf: &[u8]) -> Result<()> {
        let mut view = pixel_view(&self.ctx, &mut self.file, &mut self.compression, &self.table, &self.shape, self.swap)?;
        view.write_runs(runs, buf)?;

        self.stats.invalidate();
        if self.shape.format == PixelFormat::Grey {
            self.stats
                .observe_written(buf.chunks_exact(2).map(|c| i16::from_ne_bytes([c[0], c[1]])));
        }
        if let Some(state) = self.compression.as_mut() {
            state.modified = true;
        }
        Ok(())
    }

    /// Read pixels `lo..=hi` of the flattened array, in native byte order.
    pub fn read(&mut self, lo: u64, hi: u64, buf: &mut [u8]) -> Result<()> {
        let result = self
            .flat_run(lo, hi, buf.len())
            .and_then(|runs| self.read_runs(&runs, buf));
        self.ctx.track(result)
    }

    /// Write pixels `lo..=hi` of the flattened array from native-order bytes.
    pub fn write(&mut self, lo: u64, hi: u64, buf: &[u8]) -> Result<()> {
        let result = self
            .ensure_writable()
            .and_then(|_| self.flat_run(lo, hi, buf.len()))
            .and_then(|runs| self.write_runs(&runs, buf));
        self.ctx.track(result)
    }

    pub fn read_window(&mut self, window: &Window, buf: &mut [u8]) -> Result<()> {
        let result = self
            .window_runs(window, buf.len())
            .and_then(|runs| self.read_runs(&runs, buf));
        self.ctx.track(result)
    }

    pub fn write_window(&mut self, window: &Window, buf: &[u8]) -> Result<()> {
        let result = self
            .ensure_writable()
            .and_then(|_| self.window_runs(window, buf.len()))
            .and_then(|runs| self.write_runs(&runs, buf));
        self.ctx.track(result)
    }

    // 16-bit convenience wrappers

    fn require_16bit(&self) -> Result<()> {
        if self.shape.element_size() != 2 {
            return Err(ImageError::param(format!(
                "Pixel format {} is not 16-bit",
                self.shape.format
            )));
        }
        Ok(())
    }

    pub fn read_grey(&mut self, lo: u64, hi: u64) -> Result<Vec<i16>> {
        let result = self.require_16bit().and_then(|_| {
            self.check_range(lo, hi)?;
            let count = (hi - lo + 1) as usize;
            let runs = self.flat_run(lo, hi, count * 2)?;
            let mut out = vec![0i16; count];
            self.read_runs(&runs, bytemuck::cast_slice_mut(&mut out))?;
            Ok(out)
        });
        self.ctx.track(result)
    }

    pub fn write_grey(&mut self, lo: u64, pixels: &[i16]) -> Result<()> {
        if let Err(e) = self.require_16bit() {
            return self.ctx.track(Err(e));
        }
        let hi = match (pixels.len() as u64).checked_sub(1).and_then(|n| lo.checked_add(n)) {
            Some(hi) => hi,
            None => return self.ctx.track(Err(ImageError::param("Invalid pixel index"))),
        };
        self.write(lo, hi, bytemuck::cast_slice(pixels))
    }

    pub fn read_grey_window(&mut self, window: &Window) -> Result<Vec<i16>> {
        let result = self.require_16bit().and_then(|_| {
            let runs = plan_runs(&self.shape.extents, window, 2)?;
            let mut out = vec![0i16; window.pixel_count() as usize];
            self.read_runs(&runs, bytemuck::cast_slice_mut(&mut out))?;
            Ok(out)
        });
        self.ctx.track(result)
    }

    pub fn write_grey_window(&mut self, window: &Window, pixels: &[i16]) -> Result<()> {
        if let Err(e) = self.require_16bit() {
            return self.ctx.track(Err(e));
        }
        self.write_window(window, bytemuck::cast_slice(pixels))
    }

    // ── Statistics and header queries ──────────────────────────────────────

    fn require_grey(&self) -> Result<()> {
        if self.shape.format != PixelFormat::Grey {
            return Err(ImageError::param("Image type is not GREY"));
        }
        Ok(())
    }

    fn max_min_inner(&mut self) -> Result<(i32, i32)> {
        self.require_grey()?;
        if self.stats.is_valid(StatKind::MaxMin) {
            return Ok(self.stats.bounds());
        }
        let mut view = pixel_view(&self.ctx, &mut self.file, &mut self.compression, &self.table, &self.shape, self.swap)?;
        self.stats.max_min(&mut view)
    }

    /// Exact `(min, max)` of a Grey image, scanning if the cache is stale.
    pub fn max_min(&mut self) -> Result<(i32, i32)> {
        let result = self.max_min_inner();
        self.ctx.track(result)
    }

    /// Histogram of a Grey image, bucketed from the exact minimum.
    pub fn histogram(&mut self) -> Result<Vec<i32>> {
        let result = self.require_grey().and_then(|_| {
            if self.stats.is_valid(StatKind::Histogram) {
                return Ok(self.stats.histogram.clone());
            }
            let mut view = pixel_view(&self.ctx, &mut self.file, &mut self.compression, &self.table, &self.shape, self.swap)?;
            Ok(self.stats.histogram(&mut view)?.to_vec())
        });
        self.ctx.track(result)
    }

    pub fn stats_valid(&self, kind: StatKind) -> bool {
        self.stats.is_valid(kind)
    }

    pub fn header(&mut self) -> Result<Header> {
        let result = if self.shape.format == PixelFormat::Grey {
            self.max_min_inner().map(Some)
        } else {
            Ok(None)
        };
        let max_min = self.ctx.track(result)?;
        Ok(Header {
            format: self.shape.format,
            element_size: self.shape.element_size(),
            pixel_count: self.shape.pixel_count(),
            extents: self.shape.extents.clone(),
            max_min,
        })
    }

    pub fn compression_info(&self) -> CompressionInfo {
        CompressionInfo {
            compressed: self.table.flags.is_compressed(),
            method: self.table.flags.method(),
            method_name: self.info.get(COMPRESSION_FIELD).map(str::to_string),
            ratio: self.table.compression_ratio(self.shape.pixel_bytes()),
        }
    }

    // ── Title and info fields ──────────────────────────────────────────────

    pub fn title(&self) -> &str {
        &self.title
    }

    pub fn set_title(&mut self, title: &str) -> Result<()> {
        let result = self
            .ensure_writable()
            .and_then(|_| encode_title(title))
            .map(|_| self.title = title.to_string());
        self.ctx.track(result)
    }

    pub fn info(&self, name: &str) -> Option<&str> {
        self.info.get(name)
    }

    /// Insert or replace an info field. An empty `value` removes it.
    pub fn put_info(&mut self, name: &str, value: &str) -> Result<()> {
        let result = self
            .ensure_writable()
            .and_then(|_| self.info.put(name, value));
        self.ctx.track(result)
    }

    pub fn remove_info(&mut self, name: &str) -> Result<bool> {
        let result = self.ensure_writable().map(|_| self.info.remove(name));
        self.ctx.track(result)
    }

    /// Replace every info field with those of `other`.
    pub fn copy_info_from(&mut self, other: &Image) -> Result<()> {
        let result = self
            .ensure_writable()
            .map(|_| self.info.copy_from(&other.info));
        self.ctx.track(result)
    }

    pub fn info_names(&self) -> Vec<&str> {
        self.info.names().collect()
    }

    pub fn info_fields(&self) -> &InfoFields {
        &self.info
    }

    // ── Accessors ──────────────────────────────────────────────────────────

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn context(&self) -> &Arc<Context> {
        &self.ctx
    }

    pub fn address_table(&self) -> &AddressTable {
        &self.table
    }

    pub fn byte_swap_required(&self) -> bool {
        self.swap
    }

    pub fn is_compressed(&self) -> bool {
        self.table.flags.is_compressed()
    }

    /// Shadow file backing pixel access, once a compressed image has been
    /// decompressed this session.
    pub fn shadow_path(&self) -> Option<&Path> {
        self.compression
            .as_ref()
            .and_then(|state| state.shadow.as_ref())
            .map(Shadow::path)
    }

    pub fn pixel_format(&self) -> PixelFormat {
        self.shape.format
    }

    pub fn dims(&self) -> &[usize] {
        &self.shape.extents
    }

    pub fn pixel_count(&self) -> u64 {
        self.shape.pixel_count()
    }

    pub fn element_size(&self) -> usize {
        self.shape.element_size()
    }

    pub fn source_format(&self) -> SourceFormat {
        self.source
    }

    pub fn access_mode(&self) -> AccessMode {
        self.mode
    }

    // ── Snapshot ───────────────────────────────────────────────────────────

    /// Write a complete `height` x `width` image in one call, refreshing
    /// Grey statistics before closing.
    pub fn snapshot(
        ctx: &Arc<Context>,
        path: impl AsRef<Path>,
        width: usize,
        height: usize,
        format: PixelFormat,
        pixels: &[u8],
        title: Option<&str>,
    ) -> Result<()> {
        let mut image = Image::create(ctx, path, DEFAULT_PERMISSIONS, format, &[height, width])?;
        let last = image.pixel_count() - 1;
        image.write(0, last, pixels)?;
        if format == PixelFormat::Grey {
            image.max_min()?;
            image.histogram()?;
        }
        if let Some(title) = title {
            image.set_title(title)?;
        }
        image.close()
    }
}

impl Drop for Image {
    fn drop(&mut self) {
        if !self.closed && self.source == SourceFormat::Native && self.mode == AccessMode::Update {
            warn!(path = %self.path.display(), "image dropped without close, header changes discarded");
        }
    }
}

/// Remove a file left behind by a create that failed part way.
fn discard_partial(path: &Path) {
    if let Err(e) = fs::remove_file(path) {
        warn!(path = %path.display(), error = %e, "could not remove partially created image");
    }
}

fn check_buffer(actual: usize, expected: usize) -> Result<()> {
    if actual != expected {
        return Err(ImageError::param(format!(
            "Pixel buffer holds {} bytes, {} required",
            actual, expected
        )));
    }
    Ok(())
}

// ── Pixel view ─────────────────────────────────────────────────────────────

/// Pixel storage of one session: the container's pixel region, or the
/// shadow file of a compressed image.
struct PixelView<'a> {
    file: &'a mut File,
    base: u64,
    elem: usize,
    swap_width: Option<usize>,
    count: u64,
}

/// Resolve pixel storage, decompressing into a shadow file on first access.
fn pixel_view<'a>(
    ctx: &Context,
    file: &'a mut File,
    state: &'a mut Option<CompressionState>,
    table: &AddressTable,
    shape: &Shape,
    swap: bool,
) -> Result<PixelView<'a>> {
    let (target, base) = match state {
        Some(state) => {
            if !state.accessed {
                state.shadow = Some(compression::decompress(ctx, state.method, file, table, shape)?);
                state.accessed = true;
            }
            let shadow = state
                .shadow
                .as_mut()
                .ok_or_else(|| ImageError::state("Shadow file missing"))?;
            (&mut shadow.file, 0)
        }
        None => (file, table.pixels),
    };
    let width = shape.format.swap_width();
    Ok(PixelView {
        file: target,
        base,
        elem: shape.element_size(),
        swap_width: (swap && width > 1).then_some(width),
        count: shape.pixel_count(),
    })
}

impl PixelView<'_> {
    fn read_runs(&mut self, runs: &[Run], buf: &mut [u8]) -> Result<()> {
        let mut at = 0;
        for run in runs {
            let chunk = &mut buf[at..at + run.len];
            self.file
                .seek(SeekFrom::Start(self.base + run.offset))
                .io_context("Image pixel seek failed")?;
            self.file
                .read_exact(chunk)
                .io_context("Image pixel read failed")?;
            if let Some(width) = self.swap_width {
                swap_words(chunk, width);
            }
            at += run.len;
        }
        Ok(())
    }

    fn write_runs(&mut self, runs: &[Run], buf: &[u8]) -> Result<()> {
        let mut scratch = Vec::new();
        let mut at = 0;
        for run in runs {
            let mut chunk = &buf[at..at + run.len];
            if let Some(width) = self.swap_width {
                scratch.clear();
                scratch.extend_from_slice(chunk);
                swap_words(&mut scratch, width);
                chunk = &scratch;
            }
            self.file
                .seek(SeekFrom::Start(self.base + run.offset))
                .io_context("Image pixel seek failed")?;
            self.file
                .write_all(chunk)
                .io_context("Image pixel write failed")?;
            at += run.len;
        }
        Ok(())
    }
}

impl GreySource for PixelView<'_> {
    fn pixel_count(&self) -> u64 {
        self.count
    }

    fn read_grey(&mut self, first: u64, out: &mut [i16]) -> Result<()> {
        let run = Run {
            offset: first * self.elem as u64,
            len: out.len() * self.elem,
        };
        self.read_runs(&[run], bytemuck::cast_slice_mut(out))
    }
}

// ── Header section I/O ─────────────────────────────────────────────────────

fn read_at(file: &mut File, offset: u64, buf: &mut [u8], context: &str) -> Result<()> {
    file.seek(SeekFrom::Start(offset)).io_context(context)?;
    file.read_exact(buf).io_context(context)
}

fn write_at(file: &mut File, offset: u64, buf: &[u8], context: &str) -> Result<()> {
    file.seek(SeekFrom::Start(offset)).io_context(context)?;
    file.write_all(buf).io_context(context)
}

fn read_ints(file: &mut File, offset: u64, count: usize, swap: bool, context: &str) -> Result<Vec<i32>> {
    let mut buf = vec![0u8; count * INT_SIZE];
    read_at(file, offset, &mut buf, context)?;
    Ok(decode_ints(&buf, swap))
}

fn read_header(file: &mut File, table: &AddressTable, swap: bool) -> Result<(String, Statistics, Shape)> {
    let mut title = [0u8; TITLE_LEN];
    read_at(file, table.title, &mut title, "Image title read failed")?;

    let max_min = read_ints(file, table.max_min, 3, swap, "Image max/min read failed")?;
    let histogram = read_ints(file, table.histogram, HISTOGRAM_LEN + 1, swap, "Image histogram read failed")?;
    let code = read_ints(file, table.pixel_format, 1, swap, "Image pixel format read failed")?[0];
    let dimc = read_ints(file, table.dim_count, 1, swap, "Image dimension read failed")?[0];
    let dimv = read_ints(file, table.dim_vector, MAX_DIMS, swap, "Image dimension read failed")?;

    let format = PixelFormat::from_code(code)
        .ok_or_else(|| ImageError::format(format!("unknown pixel format code {}", code)))?;
    let dimc = usize::try_from(dimc)
        .ok()
        .filter(|n| (1..=MAX_DIMS).contains(n))
        .ok_or_else(|| ImageError::format(format!("invalid dimension count {}", dimc)))?;
    let extents = dimv[..dimc]
        .iter()
        .map(|&e| {
            usize::try_from(e)
                .ok()
                .filter(|&e| e > 0)
                .ok_or_else(|| ImageError::format(format!("invalid extent {}", e)))
        })
        .collect::<Result<Vec<_>>>()?;
    let shape = Shape::new(format, &extents).map_err(|e| ImageError::format(e.to_string()))?;

    let stats = Statistics {
        max_min_valid: max_min[0] != 0,
        min: max_min[1],
        max: max_min[2],
        histogram_valid: histogram[0] != 0,
        histogram: histogram[1..].to_vec(),
    };
    Ok((decode_title(&title), stats, shape))
}
