use thiserror::Error;

/// Broad category of an [`ImageError`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    Parameter,
    Io,
    Allocation,
    Format,
    Compression,
    State,
}

/// Errors produced by the image container engine.
#[derive(Debug, Error)]
pub enum ImageError {
    /// Invalid argument: bad window, wrong pixel format, oversize title, ...
    #[error("{0}")]
    Parameter(String),

    /// Short read/write or failed seek on the container or shadow file.
    #[error("{context}: {source}")]
    Io {
        context: String,
        #[source]
        source: std::io::Error,
    },

    /// A variable-length buffer could not be reserved.
    #[error("Allocation error ({0} bytes)")]
    Allocation(usize),

    /// Malformed or truncated header.
    #[error("Invalid image header: {0}")]
    Format(String),

    /// Registry load failure or a failed compressor/decompressor run.
    #[error("Compression error: {0}")]
    Compression(String),

    /// Operation not permitted on this descriptor.
    #[error("{0}")]
    State(String),
}

impl ImageError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            ImageError::Parameter(_) => ErrorKind::Parameter,
            ImageError::Io { .. } => ErrorKind::Io,
            ImageError::Allocation(_) => ErrorKind::Allocation,
            ImageError::Format(_) => ErrorKind::Format,
            ImageError::Compression(_) => ErrorKind::Compression,
            ImageError::State(_) => ErrorKind::State,
        }
    }

    pub(crate) fn param(msg: impl Into<String>) -> Self {
        ImageError::Parameter(msg.into())
    }

    pub(crate) fn format(msg: impl Into<String>) -> Self {
        ImageError::Format(msg.into())
    }

    pub(crate) fn state(msg: impl Into<String>) -> Self {
        ImageError::State(msg.into())
    }

    pub(crate) fn compression(msg: impl Into<String>) -> Self {
        ImageError::Compression(msg.into())
    }
}

pub type Result<T> = std::result::Result<T, ImageError>;

/// Attach a short context message to an `io::Result`.
pub(crate) trait IoContext<T> {
    fn io_context(self, context: &str) -> Result<T>;
}

impl<T> IoContext<T> for std::io::Result<T> {
    fn io_context(self, context: &str) -> Result<T> {
        self.map_err(|source| ImageError::Io {
            context: context.to_string(),
            source,
        })
    }
}

/// Reserve a zeroed byte buffer, reporting failure as [`ImageError::Allocation`].
pub(crate) fn alloc_bytes(len: usize) -> Result<Vec<u8>> {
    let mut buf = Vec::new();
    buf.try_reserve_exact(len)
        .map_err(|_| ImageError::Allocation(len))?;
    buf.resize(len, 0);
    Ok(buf)
}
