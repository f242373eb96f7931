//! Compressed pixel storage presented through an uncompressed shadow file.
//!
//! A compressed image keeps its pixel region in the container as the output
//! of an external compressor. On first pixel access the region is piped
//! through the method's decompress command into a shadow file, which then
//! takes every pixel read and write for the rest of the session. On close a
//! modified shadow is piped back through the compress command into the
//! container, and the info region moves to sit right after the compressed
//! bytes.

use std::fs::{File, OpenOptions};
use std::io::{self, Read, Seek, SeekFrom, Write};
use std::path::Path;

use tempfile::TempPath;
use tracing::{info, warn};

use crate::context::Context;
use crate::error::{ImageError, IoContext, Result};
use crate::format::{AddressTable, Shape};
use crate::registry::{fill_template, uses_placeholder, CompressionMethod, CompressionRegistry, TemplateVars};

/// Info field naming the method that compressed the pixel region.
pub const COMPRESSION_FIELD: &str = "Pixel Compression Method";

/// Uncompressed working copy of a compressed pixel region. The file is
/// removed when this value is dropped.
pub struct Shadow {
    pub(crate) file: File,
    path: TempPath,
}

impl Shadow {
    pub fn create(dir: &Path) -> Result<Self> {
        let temp = tempfile::Builder::new()
            .prefix("tempim")
            .tempfile_in(dir)
            .io_context("Could not open temp file")?;
        let (file, path) = temp.into_parts();
        Ok(Self { file, path })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Re-open the path, for commands that replaced the file themselves.
    fn reopen(&mut self) -> Result<()> {
        self.file = OpenOptions::new()
            .read(true)
            .write(true)
            .open(&self.path)
            .io_context("Could not reopen temp file")?;
        Ok(())
    }

    fn len(&self) -> Result<u64> {
        Ok(self.file.metadata().io_context("Could not stat temp file")?.len())
    }
}

/// Per-session compression bookkeeping of a compressed image.
pub struct CompressionState {
    pub method: usize,
    pub shadow: Option<Shadow>,
    /// Pixels have been decompressed into `shadow` this session.
    pub accessed: bool,
    pub modified: bool,
}

impl CompressionState {
    pub fn new(method: usize) -> Self {
        Self {
            method,
            shadow: None,
            accessed: false,
            modified: false,
        }
    }
}

/// Pick `requested` if the registry defines it, otherwise method 0.
pub fn resolve_method(registry: &CompressionRegistry, requested: Option<usize>) -> usize {
    match requested {
        Some(index) if index < registry.len() => index,
        Some(index) => {
            warn!(
                method = index,
                defined = registry.len(),
                "compression method out of bounds, defaulting to method 0"
            );
            0
        }
        None => 0,
    }
}

fn method<'a>(registry: &'a CompressionRegistry, index: usize) -> Result<&'a CompressionMethod> {
    registry.get(index).ok_or_else(|| {
        ImageError::compression(format!(
            "compression method {} not defined (only {} methods)",
            index,
            registry.len()
        ))
    })
}

fn vars<'a>(shape: &'a Shape, input: &'a str, output: &'a str) -> TemplateVars<'a> {
    TemplateVars {
        extents: &shape.extents,
        format_code: shape.format.code(),
        input,
        output,
    }
}

/// Decompress the container's pixel region into a fresh shadow file.
pub fn decompress(
    ctx: &Context,
    method_index: usize,
    container: &mut File,
    table: &AddressTable,
    shape: &Shape,
) -> Result<Shadow> {
    let registry = ctx.registry()?;
    let method = method(registry, method_index)?;

    let mut shadow = Shadow::create(&ctx.policy().shadow_dir())?;
    let shadow_path = shadow.path().to_string_lossy().into_owned();
    let command = fill_template(&method.decompress, &vars(shape, "", &shadow_path));

    let compressed_len = table.info.saturating_sub(table.pixels);
    container
        .seek(SeekFrom::Start(table.pixels))
        .io_context("Compressed pixel seek failed")?;
    let mut input = (&mut *container).take(compressed_len);

    if uses_placeholder(&method.decompress, 'o') {
        ctx.runner().run(&command, &mut input, &mut io::sink())?;
        shadow.reopen()?;
    } else {
        ctx.runner().run(&command, &mut input, &mut shadow.file)?;
    }

    let produced = shadow.len()?;
    let expected = shape.pixel_bytes();
    if produced != expected {
        return Err(ImageError::compression(format!(
            "Image decompression failed: {} bytes produced, {} expected",
            produced, expected
        )));
    }

    info!(
        method = %method.name,
        compressed = compressed_len,
        bytes = expected,
        "decompressed pixels into shadow file"
    );
    Ok(shadow)
}

/// Compress the shadow file into the container's pixel region and move the
/// info offset to follow it. Returns the compressed length.
pub fn compress(
    ctx: &Context,
    method_index: usize,
    shadow: &mut Shadow,
    container: &mut File,
    table: &mut AddressTable,
    shape: &Shape,
) -> Result<u64> {
    let registry = ctx.registry()?;
    let method = method(registry, method_index)?;

    let shadow_path = shadow.path().to_string_lossy().into_owned();
    let command = fill_template(&method.compress, &vars(shape, &shadow_path, ""));

    shadow.file.flush().io_context("Shadow flush failed")?;
    shadow
        .file
        .seek(SeekFrom::Start(0))
        .io_context("Shadow seek failed")?;

    let mut output = Vec::new();
    if uses_placeholder(&method.compress, 'i') {
        ctx.runner().run(&command, &mut io::empty(), &mut output)?;
    } else {
        ctx.runner().run(&command, &mut shadow.file, &mut output)?;
    }
    if output.is_empty() {
        return Err(ImageError::compression(format!(
            "compressor `{}` produced no output",
            method.name
        )));
    }

    let end = table.pixels + output.len() as u64;
    if end > i32::MAX as u64 {
        return Err(ImageError::compression("compressed pixels exceed 32-bit address table"));
    }
    container
        .seek(SeekFrom::Start(table.pixels))
        .io_context("Image pixel seek failed")?;
    container
        .write_all(&output)
        .io_context("Image pixel write failed")?;
    table.info = end;

    info!(
        method = %method.name,
        bytes = shape.pixel_bytes(),
        compressed = output.len(),
        "compressed shadow file into container"
    );
    Ok(output.len() as u64)
}

/// Copy `len` bytes from the current position of `src` to that of `dst`,
/// failing unless every byte arrives.
pub fn copy_exact(src: &mut File, dst: &mut File, len: u64, context: &str) -> Result<()> {
    let copied = io::copy(&mut src.take(len), dst).io_context(context)?;
    if copied != len {
        return Err(ImageError::Io {
            context: context.to_string(),
            source: io::Error::new(
                io::ErrorKind::UnexpectedEof,
                format!("{} of {} bytes", copied, len),
            ),
        });
    }
    Ok(())
}
