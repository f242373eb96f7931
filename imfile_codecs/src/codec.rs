/// Which way a command transforms its input.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Direction {
    Compress,
    Decompress,
}

/// Whole-buffer compressor matching the stream format of a command-line
/// program, so output is interchangeable with running that program.
pub trait Codec: Send + Sync {
    /// Program name this codec stands in for.
    fn name(&self) -> &'static str;

    fn compress(&self, raw: &[u8]) -> anyhow::Result<Vec<u8>>;

    fn decompress(&self, compressed: &[u8]) -> anyhow::Result<Vec<u8>>;

    fn apply(&self, direction: Direction, data: &[u8]) -> anyhow::Result<Vec<u8>> {
        match direction {
            Direction::Compress => self.compress(data),
            Direction::Decompress => self.decompress(data),
        }
    }
}
