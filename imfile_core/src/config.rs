use std::path::PathBuf;

/// Session policy consulted at creation and close time.
///
/// The engine never reads the environment itself; front ends map their own
/// settings (for `imtool`, the `IMAGE_*` variables) onto this struct.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Policy {
    /// Allow `create` to replace an existing file.
    pub clobber: bool,
    /// Registry method used when compressing new or converted images.
    pub compress_method: Option<usize>,
    /// Compress uncompressed images when they are closed.
    pub force_compress: bool,
    /// Store compressed images uncompressed when they are closed.
    pub force_decompress: bool,
    /// Directory for shadow files. Defaults to the platform temp dir.
    pub temp_dir: Option<PathBuf>,
}

impl Policy {
    pub fn shadow_dir(&self) -> PathBuf {
        self.temp_dir.clone().unwrap_or_else(std::env::temp_dir)
    }
}
