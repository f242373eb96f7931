/// Integration tests: whole image sessions against real files.
///
/// Compressed images run through the in-process codecs of `imfile_codecs`,
/// so these tests need no compressor binaries on the host.
use std::fs::{self, File};
use std::io::{Read, Write};
use std::path::{Path, PathBuf};
use std::sync::Arc;

use imfile_codecs::CodecRunner;
use imfile_core::format::ADDRESS_BLOCK_SIZE;
use imfile_core::swap::swap_words;
use imfile_core::{
    AccessMode, AddressTable, CommandRunner, Context, ErrorKind, ForeignImage, FormatProbe, Image, InfoFields,
    PixelFormat, Policy, Shape, SourceFormat, StatKind, Window, COMPRESSION_FIELD,
    DEFAULT_PERMISSIONS, HISTOGRAM_LEN,
};

const METHODS: &str = "\
# name:compress:decompress
gzip:gzip -c %i:gunzip -c > %o
zstd:zstd -q -c:unzstd -q -c
";

// ── helpers ───────────────────────────────────────────────────────────────

fn temp_path(name: &str) -> PathBuf {
    let path = std::env::temp_dir().join(format!("imfile_test_{}_{}.im", name, std::process::id()));
    let _ = fs::remove_file(&path);
    path
}

/// Context with the bundled codecs and shadow files under `shadow_dir`.
fn codec_context(shadow_dir: &Path, policy: Policy) -> Arc<Context> {
    Context::builder()
        .config_text(METHODS)
        .runner(CodecRunner)
        .policy(Policy {
            temp_dir: Some(shadow_dir.to_path_buf()),
            ..policy
        })
        .build()
}

fn ramp(count: usize) -> Vec<i16> {
    (0..count).map(|i| (i as i16).wrapping_mul(7).wrapping_sub(300)).collect()
}

fn write_grey_image(ctx: &Arc<Context>, path: &Path, dims: &[usize]) -> Vec<i16> {
    let mut image = Image::create(ctx, path, DEFAULT_PERMISSIONS, PixelFormat::Grey, dims).unwrap();
    let pixels = ramp(dims.iter().product());
    image.write_grey_window(&Window::full(dims), &pixels).unwrap();
    image.close().unwrap();
    pixels
}

/// Rewrite a closed native file as if it had been produced on a host of the
/// opposite byte order.
fn flip_byte_order(path: &Path, swap_width: usize) {
    let mut bytes = fs::read(path).unwrap();
    let mut block = [0u8; ADDRESS_BLOCK_SIZE];
    block.copy_from_slice(&bytes[..ADDRESS_BLOCK_SIZE]);
    let (table, swapped) = AddressTable::from_bytes(&block).unwrap();
    assert!(!swapped, "fixture should start in native order");

    let int_regions = [
        (0, ADDRESS_BLOCK_SIZE as u64),
        (table.max_min, table.histogram),
        (table.histogram, table.histogram + 4 * (HISTOGRAM_LEN as u64 + 1)),
        (table.pixel_format, table.dim_count),
        (table.dim_count, table.dim_vector),
        (table.dim_vector, table.pixels),
    ];
    for (start, end) in int_regions {
        swap_words(&mut bytes[start as usize..end as usize], 4);
    }
    if swap_width > 1 {
        swap_words(&mut bytes[table.pixels as usize..table.info as usize], swap_width);
    }
    fs::write(path, bytes).unwrap();
}

// ── round trips ───────────────────────────────────────────────────────────

#[test]
fn test_roundtrip_grey_3d() {
    let ctx = Context::new();
    let path = temp_path("roundtrip_grey");
    let dims = [4, 5, 6];
    let pixels = write_grey_image(&ctx, &path, &dims);

    let mut image = Image::open(&ctx, &path, AccessMode::Read).unwrap();
    assert_eq!(image.dims(), &dims);
    assert_eq!(image.pixel_format(), PixelFormat::Grey);
    assert_eq!(image.source_format(), SourceFormat::Native);
    assert!(!image.byte_swap_required());
    assert!(!image.is_compressed());
    assert_eq!(image.read_grey_window(&Window::full(&dims)).unwrap(), pixels);

    // interior block: rows 1..=2, cols 2..=4 of plane 3
    let window = Window::new(vec![(3, 3), (1, 2), (2, 4)]);
    let expected: Vec<i16> = [1usize, 2]
        .iter()
        .flat_map(|&r| (2..=4).map(move |c| (3 * 5 + r) * 6 + c))
        .map(|i| pixels[i])
        .collect();
    assert_eq!(image.read_grey_window(&window).unwrap(), expected);

    let table = image.address_table().clone();
    assert_eq!(table.pixels, 8369);
    assert_eq!(table.info, table.pixels + 4 * 5 * 6 * 2);
    assert_eq!(fs::metadata(&path).unwrap().len(), table.info + 1);
    image.close().unwrap();
    fs::remove_file(&path).unwrap();
}

#[test]
fn test_flat_range_access() {
    let ctx = Context::new();
    let path = temp_path("flat_range");
    let mut image = Image::create(&ctx, &path, DEFAULT_PERMISSIONS, PixelFormat::Long, &[3, 4]).unwrap();

    let values: Vec<i32> = vec![10, -20, 30, i32::MAX];
    let bytes: Vec<u8> = values.iter().flat_map(|v| v.to_ne_bytes()).collect();
    image.write(5, 8, &bytes).unwrap();

    let mut back = vec![0u8; 6 * 4];
    image.read(4, 9, &mut back).unwrap();
    let back: Vec<i32> = back
        .chunks_exact(4)
        .map(|c| i32::from_ne_bytes([c[0], c[1], c[2], c[3]]))
        .collect();
    assert_eq!(back, vec![0, 10, -20, 30, i32::MAX, 0]);

    let err = image.read(10, 12, &mut [0u8; 12]).unwrap_err();
    assert_eq!(err.kind(), ErrorKind::Parameter);
    let err = image.write(2, 1, &[]).unwrap_err();
    assert_eq!(err.kind(), ErrorKind::Parameter);
    assert_eq!(ctx.last_error(), "Invalid pixel index");

    // Long images have no 16-bit helpers
    assert_eq!(image.read_grey(0, 1).unwrap_err().kind(), ErrorKind::Parameter);
    image.close().unwrap();
    fs::remove_file(&path).unwrap();
}

#[test]
fn test_extreme_indices_are_parameter_errors() {
    let ctx = Context::new();
    let path = temp_path("extreme_indices");
    let mut image = Image::create(&ctx, &path, DEFAULT_PERMISSIONS, PixelFormat::Grey, &[2, 2]).unwrap();

    assert_eq!(image.read_grey(0, u64::MAX).unwrap_err().kind(), ErrorKind::Parameter);
    assert_eq!(image.read_grey(u64::MAX, u64::MAX).unwrap_err().kind(), ErrorKind::Parameter);
    assert_eq!(image.read_grey(3, 2).unwrap_err().kind(), ErrorKind::Parameter);
    assert_eq!(image.write_grey(u64::MAX, &[1, 2]).unwrap_err().kind(), ErrorKind::Parameter);
    assert_eq!(image.write_grey(3, &[1, 2]).unwrap_err().kind(), ErrorKind::Parameter);
    assert_eq!(image.write_grey(0, &[]).unwrap_err().kind(), ErrorKind::Parameter);
    assert_eq!(ctx.last_error(), "Invalid pixel index");

    image.write_grey(2, &[8, 9]).unwrap();
    assert_eq!(image.read_grey(1, 3).unwrap(), vec![0, 8, 9]);
    image.close().unwrap();
    fs::remove_file(&path).unwrap();
}

#[test]
fn test_high_rank_window() {
    let ctx = Context::new();
    let path = temp_path("high_rank");
    let dims = [2, 3, 2, 4, 3];
    let pixels = write_grey_image(&ctx, &path, &dims);

    let mut image = Image::open(&ctx, &path, AccessMode::Update).unwrap();
    let ranges = vec![(1, 1), (0, 2), (1, 1), (1, 2), (0, 2)];
    let flat = |idx: [usize; 5]| {
        idx.iter()
            .zip(&dims)
            .fold(0usize, |acc, (&i, &extent)| acc * extent + i)
    };
    let mut expected = Vec::new();
    for b in 0..=2 {
        for d in 1..=2 {
            for e in 0..=2 {
                expected.push(pixels[flat([1, b, 1, d, e])]);
            }
        }
    }
    let window = Window::new(ranges);
    assert_eq!(image.read_grey_window(&window).unwrap(), expected);

    let patch = vec![42i16; expected.len()];
    image.write_grey_window(&window, &patch).unwrap();
    image.close().unwrap();

    let mut image = Image::open(&ctx, &path, AccessMode::Read).unwrap();
    let all = image.read_grey_window(&Window::full(&dims)).unwrap();
    assert!(all.iter().filter(|&&p| p == 42).count() >= patch.len());
    assert_eq!(all[flat([1, 2, 1, 2, 2])], 42);
    assert_eq!(all[flat([0, 2, 1, 2, 2])], pixels[flat([0, 2, 1, 2, 2])]);
    image.close().unwrap();
    fs::remove_file(&path).unwrap();
}

#[test]
fn test_snapshot_writes_complete_image() {
    let ctx = Context::new();
    let path = temp_path("snapshot");
    let pixels: Vec<i16> = vec![5, -3, 9, 0, 7, 1];
    Image::snapshot(
        &ctx,
        &path,
        3,
        2,
        PixelFormat::Grey,
        bytemuck_bytes(&pixels),
        Some("snap"),
    )
    .unwrap();

    let mut image = Image::open(&ctx, &path, AccessMode::Read).unwrap();
    assert_eq!(image.dims(), &[2, 3]);
    assert_eq!(image.title(), "snap");
    assert!(image.stats_valid(StatKind::MaxMin));
    assert!(image.stats_valid(StatKind::Histogram));
    assert_eq!(image.max_min().unwrap(), (-3, 9));
    assert_eq!(image.read_grey(0, 5).unwrap(), pixels);
    image.close().unwrap();
    fs::remove_file(&path).unwrap();
}

fn bytemuck_bytes(pixels: &[i16]) -> &[u8] {
    bytemuck::cast_slice(pixels)
}

// ── byte order ────────────────────────────────────────────────────────────

#[test]
fn test_foreign_byte_order_is_normalized() {
    let ctx = Context::new();
    let path = temp_path("byte_order");
    let dims = [3, 7];
    let pixels = {
        let mut image = Image::create(&ctx, &path, DEFAULT_PERMISSIONS, PixelFormat::Grey, &dims).unwrap();
        let pixels = ramp(21);
        image.write_grey(0, &pixels).unwrap();
        image.set_title("swapped").unwrap();
        image.max_min().unwrap();
        image.close().unwrap();
        pixels
    };
    flip_byte_order(&path, 2);

    let mut image = Image::open(&ctx, &path, AccessMode::Update).unwrap();
    assert!(image.byte_swap_required());
    assert_eq!(image.dims(), &dims);
    assert_eq!(image.title(), "swapped");
    assert!(image.stats_valid(StatKind::MaxMin));
    let (min, max) = image.max_min().unwrap();
    assert_eq!(min, i32::from(*pixels.iter().min().unwrap()));
    assert_eq!(max, i32::from(*pixels.iter().max().unwrap()));
    assert_eq!(image.read_grey(0, 20).unwrap(), pixels);

    // updates stay in the file's own order
    image.write_grey(3, &[1234, -1234]).unwrap();
    image.close().unwrap();

    let mut image = Image::open(&ctx, &path, AccessMode::Read).unwrap();
    assert!(image.byte_swap_required());
    assert_eq!(image.read_grey(2, 5).unwrap(), vec![pixels[2], 1234, -1234, pixels[5]]);
    image.close().unwrap();
    fs::remove_file(&path).unwrap();
}

#[test]
fn test_four_byte_words_swap_per_word() {
    let ctx = Context::new();
    let dims = [3, 4];
    for format in [PixelFormat::Real, PixelFormat::Long, PixelFormat::Complex] {
        let path = temp_path(&format!("byte_order_{}", format));
        let elem = format.element_size();
        let words = 12 * elem / 4;
        let values: Vec<f32> = (0..words).map(|i| i as f32 * 1.5 - 4.0).collect();
        let bytes: Vec<u8> = bytemuck::cast_slice(&values).to_vec();

        let mut image = Image::create(&ctx, &path, DEFAULT_PERMISSIONS, format, &dims).unwrap();
        image.write(0, 11, &bytes).unwrap();
        image.close().unwrap();
        flip_byte_order(&path, 4);

        let mut image = Image::open(&ctx, &path, AccessMode::Update).unwrap();
        assert!(image.byte_swap_required(), "{}", format);
        assert_eq!(image.pixel_format(), format);
        let mut back = vec![0u8; bytes.len()];
        image.read(0, 11, &mut back).unwrap();
        assert_eq!(back, bytes, "{}", format);

        // complex pixels reverse each float half, not the whole pair
        let raw = fs::read(&path).unwrap();
        let at = image.address_table().pixels as usize;
        let mut first_word = bytes[..4].to_vec();
        first_word.reverse();
        assert_eq!(&raw[at..at + 4], &first_word[..], "{}", format);

        image.write(11, 11, &bytes[..elem]).unwrap();
        image.close().unwrap();

        let mut image = Image::open(&ctx, &path, AccessMode::Read).unwrap();
        assert!(image.byte_swap_required());
        let mut last = vec![0u8; elem];
        image.read(11, 11, &mut last).unwrap();
        assert_eq!(last, &bytes[..elem], "{}", format);
        image.close().unwrap();
        fs::remove_file(&path).unwrap();
    }
}

// ── compression lifecycle ─────────────────────────────────────────────────

#[test]
fn test_create_compressed_and_reopen() {
    let shadow_dir = tempfile::tempdir().unwrap();
    let ctx = codec_context(
        shadow_dir.path(),
        Policy {
            compress_method: Some(1),
            ..Policy::default()
        },
    );
    let path = temp_path("create_compressed");
    let dims = [64, 64];

    let mut image = Image::create(&ctx, &path, DEFAULT_PERMISSIONS, PixelFormat::Grey, &dims).unwrap();
    assert!(image.is_compressed());
    assert_eq!(image.info(COMPRESSION_FIELD), Some("zstd"));
    let shadow = image.shadow_path().unwrap().to_path_buf();
    assert!(shadow.exists());

    let pixels: Vec<i16> = (0..64 * 64).map(|i| (i / 64) as i16).collect();
    image.write_grey(0, &pixels).unwrap();
    image.close().unwrap();
    assert!(!shadow.exists(), "shadow file should be removed on close");

    let mut image = Image::open(&ctx, &path, AccessMode::Read).unwrap();
    let info = image.compression_info();
    assert!(info.compressed);
    assert_eq!(info.method, Some(1));
    assert_eq!(info.method_name.as_deref(), Some("zstd"));
    assert!(info.ratio < 0.5, "ramp rows should compress well, got {}", info.ratio);
    assert!(image.shadow_path().is_none(), "no decompression before first access");

    assert_eq!(image.read_grey(0, 64 * 64 - 1).unwrap(), pixels);
    assert!(image.shadow_path().is_some());
    image.close().unwrap();
    fs::remove_file(&path).unwrap();
}

#[test]
fn test_forced_close_conversions() {
    let shadow_dir = tempfile::tempdir().unwrap();
    let ctx = codec_context(shadow_dir.path(), Policy::default());
    let path = temp_path("forced_close");
    let dims = [16, 32];
    let pixels = write_grey_image(&ctx, &path, &dims);

    let mut image = Image::open(&ctx, &path, AccessMode::Update).unwrap();
    image.put_info("Operator", "rig 4").unwrap();
    image.close_compressed().unwrap();

    let mut image = Image::open(&ctx, &path, AccessMode::Update).unwrap();
    assert!(image.is_compressed());
    assert_eq!(image.compression_info().method, Some(0));
    assert_eq!(image.info(COMPRESSION_FIELD), Some("gzip"));
    assert_eq!(image.info("Operator"), Some("rig 4"));
    assert_eq!(image.read_grey_window(&Window::full(&dims)).unwrap(), pixels);
    image.close_uncompressed().unwrap();

    let info_len = {
        let mut fields = InfoFields::new();
        fields.put("Operator", "rig 4").unwrap();
        fields.to_bytes().len() as u64
    };
    let mut image = Image::open(&ctx, &path, AccessMode::Read).unwrap();
    assert!(!image.is_compressed());
    assert_eq!(image.info(COMPRESSION_FIELD), None);
    assert_eq!(image.info_names(), vec!["Operator"]);
    let table = image.address_table().clone();
    assert_eq!(table.info, table.pixels + 16 * 32 * 2);
    assert_eq!(fs::metadata(&path).unwrap().len(), table.info + info_len);
    assert_eq!(image.read_grey_window(&Window::full(&dims)).unwrap(), pixels);
    image.close().unwrap();
    fs::remove_file(&path).unwrap();
}

#[test]
fn test_policy_forces_decompress_over_compress() {
    let shadow_dir = tempfile::tempdir().unwrap();
    let path = temp_path("policy_force");
    let dims = [8, 8];
    let plain = codec_context(shadow_dir.path(), Policy::default());
    let pixels = write_grey_image(&plain, &path, &dims);

    let compressing = codec_context(
        shadow_dir.path(),
        Policy {
            force_compress: true,
            compress_method: Some(1),
            ..Policy::default()
        },
    );
    Image::open(&compressing, &path, AccessMode::Update)
        .unwrap()
        .close()
        .unwrap();
    let image = Image::open(&plain, &path, AccessMode::Read).unwrap();
    assert_eq!(image.compression_info().method, Some(1));
    image.close().unwrap();

    let both = codec_context(
        shadow_dir.path(),
        Policy {
            force_compress: true,
            force_decompress: true,
            ..Policy::default()
        },
    );
    Image::open(&both, &path, AccessMode::Update)
        .unwrap()
        .close()
        .unwrap();

    let mut image = Image::open(&plain, &path, AccessMode::Read).unwrap();
    assert!(!image.is_compressed());
    assert_eq!(image.read_grey(0, 63).unwrap(), pixels);
    image.close().unwrap();
    fs::remove_file(&path).unwrap();
}

#[test]
fn test_unmodified_compressed_image_keeps_its_bytes() {
    let shadow_dir = tempfile::tempdir().unwrap();
    let ctx = codec_context(
        shadow_dir.path(),
        Policy {
            compress_method: Some(0),
            ..Policy::default()
        },
    );
    let path = temp_path("unmodified_compressed");
    write_grey_image(&ctx, &path, &[10, 10]);
    let before = fs::read(&path).unwrap();

    let mut image = Image::open(&ctx, &path, AccessMode::Update).unwrap();
    image.read_grey(0, 99).unwrap();
    image.close().unwrap();
    assert_eq!(fs::read(&path).unwrap(), before);
    fs::remove_file(&path).unwrap();
}

#[test]
fn test_coarseness_rejected_before_decompression() {
    let shadow_dir = tempfile::tempdir().unwrap();
    let ctx = codec_context(
        shadow_dir.path(),
        Policy {
            compress_method: Some(0),
            ..Policy::default()
        },
    );
    let path = temp_path("coarseness");
    let dims = [6, 6];
    write_grey_image(&ctx, &path, &dims);

    let mut image = Image::open(&ctx, &path, AccessMode::Update).unwrap();
    let coarse = Window::full(&dims).with_coarseness(vec![1, 2]);
    let err = image.read_window(&coarse, &mut [0u8; 36 * 2]).unwrap_err();
    assert_eq!(err.kind(), ErrorKind::Parameter);
    assert_eq!(ctx.last_error(), "Coarseness not implemented");
    let err = image.write_grey_window(&coarse, &[0; 36]).unwrap_err();
    assert_eq!(err.kind(), ErrorKind::Parameter);
    assert!(image.shadow_path().is_none(), "rejected window must not decompress");

    let err = image
        .read_grey_window(&Window::new(vec![(0, 6), (0, 5)]))
        .unwrap_err();
    assert_eq!(err.kind(), ErrorKind::Parameter);
    assert!(image.shadow_path().is_none());
    image.close().unwrap();
    fs::remove_file(&path).unwrap();
}

#[test]
fn test_missing_registry_is_a_compression_error() {
    let ctx = Context::builder()
        .policy(Policy {
            compress_method: Some(0),
            ..Policy::default()
        })
        .build();
    let path = temp_path("missing_registry");
    let err = Image::create(&ctx, &path, DEFAULT_PERMISSIONS, PixelFormat::Grey, &[2, 2]).unwrap_err();
    assert_eq!(err.kind(), ErrorKind::Compression);
    assert!(ctx.last_error().starts_with("Compression error"));
    assert!(!path.exists(), "failed create must not leave a partial file");

    // the path is free again for a create without clobber
    let image = Image::create(&Context::new(), &path, DEFAULT_PERMISSIONS, PixelFormat::Grey, &[2, 2]).unwrap();
    image.close().unwrap();
    fs::remove_file(&path).unwrap();
}

/// Runner for scripted compressor failures:
/// `copy` passes bytes through, `short` emits three bytes, `nothing` emits none.
struct ScriptedRunner;

impl CommandRunner for ScriptedRunner {
    fn run(
        &self,
        command: &str,
        input: &mut (dyn Read + Send),
        output: &mut dyn Write,
    ) -> imfile_core::Result<u64> {
        let mut data = Vec::new();
        input.read_to_end(&mut data).unwrap();
        let produced: &[u8] = match command.trim() {
            "copy" => &data,
            "short" => b"abc",
            "nothing" => b"",
            other => panic!("unexpected command {}", other),
        };
        output.write_all(produced).unwrap();
        Ok(produced.len() as u64)
    }
}

fn scripted_context(shadow_dir: &Path, compress_method: Option<usize>) -> Arc<Context> {
    Context::builder()
        .config_text("truncating:copy:short\nsilent:nothing:copy\n")
        .runner(ScriptedRunner)
        .policy(Policy {
            compress_method,
            temp_dir: Some(shadow_dir.to_path_buf()),
            ..Policy::default()
        })
        .build()
}

fn shadow_files(dir: &Path) -> usize {
    fs::read_dir(dir).unwrap().count()
}

#[test]
fn test_short_decompression_is_rejected() {
    let shadow_dir = tempfile::tempdir().unwrap();
    let ctx = scripted_context(shadow_dir.path(), Some(0));
    let path = temp_path("short_decompression");
    write_grey_image(&ctx, &path, &[4, 4]);
    assert_eq!(shadow_files(shadow_dir.path()), 0);

    let mut image = Image::open(&ctx, &path, AccessMode::Read).unwrap();
    assert!(image.is_compressed());
    let err = image.read_grey(0, 15).unwrap_err();
    assert_eq!(err.kind(), ErrorKind::Compression);
    assert!(
        ctx.last_error().contains("3 bytes produced, 32 expected"),
        "{}",
        ctx.last_error()
    );
    assert!(image.shadow_path().is_none());
    assert_eq!(shadow_files(shadow_dir.path()), 0, "failed shadow must be removed");
    image.close().unwrap();
    fs::remove_file(&path).unwrap();
}

#[test]
fn test_empty_compressor_output_is_rejected() {
    let shadow_dir = tempfile::tempdir().unwrap();
    let path = temp_path("empty_compression");

    let err = Image::create(
        &scripted_context(shadow_dir.path(), Some(1)),
        &path,
        DEFAULT_PERMISSIONS,
        PixelFormat::Grey,
        &[3, 3],
    )
    .unwrap_err();
    assert_eq!(err.kind(), ErrorKind::Compression);
    assert!(err.to_string().contains("produced no output"), "{}", err);
    assert!(!path.exists());

    // forced compression of an existing image fails and leaves it readable
    let ctx = scripted_context(shadow_dir.path(), Some(1));
    let pixels = write_grey_image(&Context::new(), &path, &[3, 3]);
    let image = Image::open(&ctx, &path, AccessMode::Update).unwrap();
    assert_eq!(image.close_compressed().unwrap_err().kind(), ErrorKind::Compression);
    assert_eq!(shadow_files(shadow_dir.path()), 0);

    let mut image = Image::open(&ctx, &path, AccessMode::Read).unwrap();
    assert!(!image.is_compressed());
    assert_eq!(image.read_grey(0, 8).unwrap(), pixels);
    image.close().unwrap();
    fs::remove_file(&path).unwrap();
}

#[cfg(unix)]
#[test]
fn test_shell_runner_with_cat_method() {
    let shadow_dir = tempfile::tempdir().unwrap();
    let ctx = Context::builder()
        .config_text("copy:cat %i:cat > %o\n")
        .policy(Policy {
            compress_method: Some(0),
            temp_dir: Some(shadow_dir.path().to_path_buf()),
            ..Policy::default()
        })
        .build();
    let path = temp_path("shell_cat");
    let pixels = write_grey_image(&ctx, &path, &[5, 9]);

    let mut image = Image::open(&ctx, &path, AccessMode::Read).unwrap();
    assert!(image.is_compressed());
    assert!((image.compression_info().ratio - 1.0).abs() < f32::EPSILON);
    assert_eq!(image.read_grey(0, 44).unwrap(), pixels);
    image.close().unwrap();
    fs::remove_file(&path).unwrap();
}

// ── statistics ────────────────────────────────────────────────────────────

#[test]
fn test_statistics_cache_and_invalidation() {
    let ctx = Context::new();
    let path = temp_path("statistics");
    let mut image = Image::create(&ctx, &path, DEFAULT_PERMISSIONS, PixelFormat::Grey, &[2, 5]).unwrap();
    assert!(!image.stats_valid(StatKind::MaxMin));

    image.write_grey(0, &[-7, 0, 3, 3, 100, 2, 1, 0, 0, 9]).unwrap();
    assert_eq!(image.max_min().unwrap(), (-7, 100));
    let histogram = image.histogram().unwrap();
    assert_eq!(histogram.len(), HISTOGRAM_LEN);
    assert_eq!(histogram.iter().sum::<i32>(), 10);
    assert_eq!(histogram[0], 1);
    assert!(image.stats_valid(StatKind::MaxMin));
    assert!(image.stats_valid(StatKind::Histogram));

    image.write_grey(4, &[0]).unwrap();
    assert!(!image.stats_valid(StatKind::MaxMin));
    assert!(!image.stats_valid(StatKind::Histogram));
    assert_eq!(image.max_min().unwrap(), (-7, 9));
    image.close().unwrap();

    let mut image = Image::open(&ctx, &path, AccessMode::Read).unwrap();
    assert!(image.stats_valid(StatKind::MaxMin));
    assert!(!image.stats_valid(StatKind::Histogram));
    let header = image.header().unwrap();
    assert_eq!(header.max_min, Some((-7, 9)));
    assert_eq!(header.pixel_count, 10);
    image.close().unwrap();
    fs::remove_file(&path).unwrap();
}

#[test]
fn test_statistics_require_grey() {
    let ctx = Context::new();
    let path = temp_path("stats_grey_only");
    let mut image = Image::create(&ctx, &path, DEFAULT_PERMISSIONS, PixelFormat::Short, &[4]).unwrap();
    assert_eq!(image.max_min().unwrap_err().kind(), ErrorKind::Parameter);
    assert_eq!(ctx.last_error(), "Image type is not GREY");
    assert_eq!(image.header().unwrap().max_min, None);
    image.close().unwrap();
    fs::remove_file(&path).unwrap();
}

// ── title and info fields ─────────────────────────────────────────────────

#[test]
fn test_info_fields_persist_in_order() {
    let ctx = Context::new();
    let path = temp_path("info_fields");
    let mut image = Image::create(&ctx, &path, DEFAULT_PERMISSIONS, PixelFormat::Byte, &[4, 4]).unwrap();
    image.put_info("Instrument", "CCD-2").unwrap();
    image.put_info("Exposure", "12.5").unwrap();
    image.put_info("Filter", "red").unwrap();
    image.put_info("Exposure", "30").unwrap();
    assert!(image.remove_info("Filter").unwrap());
    assert!(!image.remove_info("Filter").unwrap());
    image.set_title("dark frame").unwrap();
    assert_eq!(
        image.set_title(&"x".repeat(81)).unwrap_err().kind(),
        ErrorKind::Parameter
    );
    image.close().unwrap();

    let source = Image::open(&ctx, &path, AccessMode::Read).unwrap();
    assert_eq!(source.title(), "dark frame");
    assert_eq!(source.info_names(), vec!["Instrument", "Exposure"]);
    assert_eq!(source.info("Exposure"), Some("30"));

    let other = temp_path("info_fields_copy");
    let mut target = Image::create(&ctx, &other, DEFAULT_PERMISSIONS, PixelFormat::Byte, &[1]).unwrap();
    target.put_info("Stale", "yes").unwrap();
    target.copy_info_from(&source).unwrap();
    assert_eq!(target.info_fields(), source.info_fields());
    target.close().unwrap();
    source.close().unwrap();

    let target = Image::open(&ctx, &other, AccessMode::Read).unwrap();
    assert_eq!(target.info_names(), vec!["Instrument", "Exposure"]);
    target.close().unwrap();
    fs::remove_file(&path).unwrap();
    fs::remove_file(&other).unwrap();
}

// ── access rules ──────────────────────────────────────────────────────────

#[test]
fn test_create_respects_clobber_policy() {
    let path = temp_path("clobber");
    let ctx = Context::new();
    Image::create(&ctx, &path, DEFAULT_PERMISSIONS, PixelFormat::Grey, &[2])
        .unwrap()
        .close()
        .unwrap();

    let err = Image::create(&ctx, &path, DEFAULT_PERMISSIONS, PixelFormat::Grey, &[2]).unwrap_err();
    assert_eq!(err.kind(), ErrorKind::Parameter);
    assert!(ctx.last_error().contains("already exists"));

    let clobber = Context::builder()
        .policy(Policy {
            clobber: true,
            ..Policy::default()
        })
        .build();
    let image = Image::create(&clobber, &path, DEFAULT_PERMISSIONS, PixelFormat::Real, &[3, 3]).unwrap();
    image.close().unwrap();
    let image = Image::open(&ctx, &path, AccessMode::Read).unwrap();
    assert_eq!(image.pixel_format(), PixelFormat::Real);
    image.close().unwrap();
    fs::remove_file(&path).unwrap();
}

#[test]
fn test_read_only_session_rejects_writes() {
    let ctx = Context::new();
    let path = temp_path("read_only");
    write_grey_image(&ctx, &path, &[3, 3]);
    let before = fs::read(&path).unwrap();

    let mut image = Image::open(&ctx, &path, AccessMode::Read).unwrap();
    assert_eq!(image.write_grey(0, &[1]).unwrap_err().kind(), ErrorKind::State);
    assert_eq!(ctx.last_error(), "Image opened read-only");
    assert_eq!(image.put_info("a", "b").unwrap_err().kind(), ErrorKind::State);
    assert_eq!(image.set_title("t").unwrap_err().kind(), ErrorKind::State);
    image.max_min().unwrap();
    image.close_compressed().unwrap();
    assert_eq!(fs::read(&path).unwrap(), before, "read-only close writes nothing");
    fs::remove_file(&path).unwrap();
}

#[test]
fn test_open_rejects_malformed_files() {
    let ctx = Context::new();
    let short = temp_path("malformed_short");
    fs::write(&short, [1u8; 20]).unwrap();
    assert_eq!(
        Image::open(&ctx, &short, AccessMode::Read).unwrap_err().kind(),
        ErrorKind::Io
    );

    let zeros = temp_path("malformed_zeros");
    fs::write(&zeros, vec![0u8; 9000]).unwrap();
    assert_eq!(
        Image::open(&ctx, &zeros, AccessMode::Read).unwrap_err().kind(),
        ErrorKind::Format
    );

    let truncated = temp_path("malformed_truncated");
    write_grey_image(&ctx, &truncated, &[20, 20]);
    let len = fs::metadata(&truncated).unwrap().len();
    let file = fs::OpenOptions::new().write(true).open(&truncated).unwrap();
    file.set_len(len - 200).unwrap();
    drop(file);
    assert_eq!(
        Image::open(&ctx, &truncated, AccessMode::Read).unwrap_err().kind(),
        ErrorKind::Format
    );

    for path in [short, zeros, truncated] {
        fs::remove_file(path).unwrap();
    }
}

// ── foreign formats ───────────────────────────────────────────────────────

/// Headerless 2x3 Grey scans with a `.raw` extension.
struct RawProbe;

impl FormatProbe for RawProbe {
    fn name(&self) -> &'static str {
        "raw"
    }

    fn probe(&self, path: &Path, _mode: AccessMode) -> imfile_core::Result<Option<ForeignImage>> {
        if path.extension().and_then(|e| e.to_str()) != Some("raw") {
            return Ok(None);
        }
        let file = File::open(path).map_err(|source| imfile_core::ImageError::Io {
            context: "raw open failed".into(),
            source,
        })?;
        Ok(Some(ForeignImage {
            file,
            source: SourceFormat::ForeignTextBased,
            shape: Shape::new(PixelFormat::Grey, &[2, 3])?,
            pixel_offset: 0,
            byte_swap: false,
            title: "raw scan".into(),
            info: InfoFields::new(),
        }))
    }
}

#[test]
fn test_foreign_probe_is_read_only() {
    let ctx = Context::builder().probe(RawProbe).build();
    let path = std::env::temp_dir().join(format!("imfile_test_probe_{}.raw", std::process::id()));
    let pixels: Vec<i16> = vec![4, 8, 15, 16, 23, 42];
    fs::write(&path, bytemuck_bytes(&pixels)).unwrap();

    let mut image = Image::open(&ctx, &path, AccessMode::Update).unwrap();
    assert_eq!(image.source_format(), SourceFormat::ForeignTextBased);
    assert_eq!(image.title(), "raw scan");
    assert_eq!(image.read_grey(0, 5).unwrap(), pixels);
    assert_eq!(image.max_min().unwrap(), (4, 42));

    let err = image.write_grey(0, &[1]).unwrap_err();
    assert_eq!(err.kind(), ErrorKind::State);
    assert_eq!(ctx.last_error(), "Can not write this format image file");
    assert_eq!(image.put_info("k", "v").unwrap_err().kind(), ErrorKind::State);
    image.close().unwrap();
    assert_eq!(fs::read(&path).unwrap(), bytemuck_bytes(&pixels));

    // native files still open through the same context
    let native = temp_path("probe_native");
    write_grey_image(&ctx, &native, &[2]);
    let image = Image::open(&ctx, &native, AccessMode::Read).unwrap();
    assert_eq!(image.source_format(), SourceFormat::Native);
    image.close().unwrap();
    fs::remove_file(&path).unwrap();
    fs::remove_file(&native).unwrap();
}
