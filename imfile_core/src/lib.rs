pub mod command;
pub mod compression;
pub mod config;
pub mod context;
pub mod error;
pub mod foreign;
pub mod format;
pub mod image;
pub mod info;
pub mod registry;
pub mod stats;
pub mod swap;
pub mod window;

pub use command::{CommandRunner, ShellRunner};
pub use compression::COMPRESSION_FIELD;
pub use config::Policy;
pub use context::{Context, ContextBuilder};
pub use error::{ErrorKind, ImageError, Result};
pub use foreign::{AccessMode, ForeignImage, FormatProbe, SourceFormat};
pub use format::{AddressTable, PixelFormat, Shape, VersionFlags, DEFAULT_PERMISSIONS, HISTOGRAM_LEN, MAX_DIMS};
pub use image::{CompressionInfo, Header, Image};
pub use info::{InfoFields, MAX_INFO_FIELDS};
pub use registry::{CompressionMethod, CompressionRegistry};
pub use stats::StatKind;
pub use window::Window;
