use std::io::{Read, Write};

use lz4_flex::frame::{FrameDecoder, FrameEncoder};

use crate::codec::Codec;

/// LZ4 frame format, as written by the `lz4` program.
///
/// Fastest decode of the bundled codecs; use it for scratch images that are
/// reopened often.
pub struct Lz4Codec;

impl Codec for Lz4Codec {
    fn name(&self) -> &'static str {
        "lz4"
    }

    fn compress(&self, raw: &[u8]) -> anyhow::Result<Vec<u8>> {
        let mut encoder = FrameEncoder::new(Vec::with_capacity(raw.len() / 2));
        encoder.write_all(raw)?;
        let compressed = encoder
            .finish()
            .map_err(|e| anyhow::anyhow!("lz4 compress error: {}", e))?;
        Ok(compressed)
    }

    fn decompress(&self, compressed: &[u8]) -> anyhow::Result<Vec<u8>> {
        let mut raw = Vec::new();
        FrameDecoder::new(compressed)
            .read_to_end(&mut raw)
            .map_err(|e| anyhow::anyhow!("lz4 decompress error: {}", e))?;
        Ok(raw)
    }
}
