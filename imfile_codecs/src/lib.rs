mod codec;
mod gzip_codec;
mod lz4_codec;
mod passthrough;
mod runner;
mod zstd_codec;

pub use codec::{Codec, Direction};
pub use gzip_codec::GzipCodec;
pub use lz4_codec::Lz4Codec;
pub use passthrough::PassThroughCodec;
pub use runner::{CodecRunner, HybridRunner, Invocation};
pub use zstd_codec::ZstdCodec;

/// Resolve a codec and direction from the program name of a command.
///
/// `level` comes from a `-N` flag on the command line, if any. Returns
/// `None` for programs that have no in-process equivalent.
pub fn codec_by_program(program: &str, level: Option<i32>) -> Option<(Box<dyn Codec>, Direction)> {
    let name = program.rsplit('/').next().unwrap_or(program);
    let found: (Box<dyn Codec>, Direction) = match name {
        "zstd" => (Box::new(zstd(level)), Direction::Compress),
        "unzstd" | "zstdcat" => (Box::new(zstd(level)), Direction::Decompress),
        "lz4" => (Box::new(Lz4Codec), Direction::Compress),
        "unlz4" | "lz4cat" => (Box::new(Lz4Codec), Direction::Decompress),
        "gzip" => (Box::new(gzip(level)), Direction::Compress),
        "gunzip" | "zcat" => (Box::new(gzip(level)), Direction::Decompress),
        "cat" => (Box::new(PassThroughCodec), Direction::Compress),
        _ => return None,
    };
    Some(found)
}

fn zstd(level: Option<i32>) -> ZstdCodec {
    level.map(ZstdCodec::new).unwrap_or_default()
}

fn gzip(level: Option<i32>) -> GzipCodec {
    level.map(GzipCodec::new).unwrap_or_default()
}
