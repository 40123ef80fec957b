//! Native files, rewinds, in-place edits and foreign formats.

use rasterkit::prelude::*;
use std::path::Path;
use std::sync::Arc;

fn registry() -> Arc<Registry> {
    Registry::new(CoreConfig::default().with_tile_height(3))
}

fn ushort_values(width: u32, height: u32) -> Vec<u16> {
    (0..width * height).map(|v| (v * 257 + 3) as u16).collect()
}

fn write_native(path: &Path, order: ByteOrder, width: u32, height: u32, values: &[u16]) {
    let header = NativeHeader {
        byte_order: order,
        width,
        height,
        bands: 1,
        format: BandFormat::UShort,
        coding: Coding::None,
        interpretation: Interpretation::Grey16,
        xres: 2.0,
        yres: 2.0,
        xoffset: 0,
        yoffset: 0,
    };
    let mut bytes = header.encode().to_vec();
    for value in values {
        match order {
            ByteOrder::Little => bytes.extend_from_slice(&value.to_le_bytes()),
            ByteOrder::Big => bytes.extend_from_slice(&value.to_be_bytes()),
        }
    }
    std::fs::write(path, bytes).unwrap();
}

fn host_bytes(values: &[u16]) -> Vec<u8> {
    values.iter().flat_map(|v| v.to_ne_bytes()).collect()
}

#[test]
fn test_either_byte_order_reads_the_same() {
    let dir = tempfile::tempdir().unwrap();
    let registry = registry();
    let values = ushort_values(7, 5);

    let little = dir.path().join("little.v");
    let big = dir.path().join("big.v");
    write_native(&little, ByteOrder::Little, 7, 5, &values);
    write_native(&big, ByteOrder::Big, 7, 5, &values);

    let a = Image::new_from_file(&registry, little.to_str().unwrap()).unwrap();
    let b = Image::new_from_file(&registry, big.to_str().unwrap()).unwrap();
    assert_eq!(a.width(), 7);
    assert_eq!(b.format(), BandFormat::UShort);
    assert_eq!(b.byte_order(), ByteOrder::host());

    let expected = host_bytes(&values);
    assert_eq!(a.pixels().unwrap().to_vec(), expected);
    assert_eq!(b.pixels().unwrap().to_vec(), expected);
    assert_eq!(b.mode(), StorageMode::MemoryOwned);
}

#[test]
fn test_region_read_through_window() {
    let dir = tempfile::tempdir().unwrap();
    let registry = registry();
    let values = ushort_values(6, 4);
    let path = dir.path().join("windowed.v");
    write_native(&path, ByteOrder::host(), 6, 4, &values);

    let image = Image::new_from_file(&registry, path.to_str().unwrap()).unwrap();
    assert_eq!(image.mode(), StorageMode::FileOpenRead);

    let region = Region::new(&image);
    let pixels = region.fetch(Rect::new(2, 1, 3, 2)).unwrap();
    let expected: Vec<u16> = vec![values[8], values[9], values[10], values[14], values[15], values[16]];
    assert_eq!(pixels, host_bytes(&expected));
    assert_eq!(image.mode(), StorageMode::FileOpenRead);
    assert_eq!(registry.window_count(image.id()), 0);
}

#[test]
fn test_file_too_short() {
    let dir = tempfile::tempdir().unwrap();
    let registry = registry();
    let values = ushort_values(4, 4);
    let path = dir.path().join("short.v");
    write_native(&path, ByteOrder::host(), 4, 4, &values);

    let bytes = std::fs::read(&path).unwrap();
    std::fs::write(&path, &bytes[..bytes.len() - 1]).unwrap();

    let err = Image::new_from_file(&registry, path.to_str().unwrap()).unwrap_err();
    assert!(matches!(
        err,
        ImageError::Construction(ConstructionError::FileTooShort { .. })
    ));
    assert!(registry.is_empty());
}

#[test]
fn test_temp_file_rewinds_and_unlinks() {
    let registry = registry();
    let image = Image::new_temp_file(&registry, "%s.v").unwrap();
    image.init_fields(
        4,
        3,
        1,
        BandFormat::UChar,
        Coding::None,
        Interpretation::BW,
        1.0,
        1.0,
    );
    let path = image.filename();
    assert_eq!(image.mode(), StorageMode::FileOpenWrite);

    for y in 0..3u8 {
        image.write_line(y as u32, &[y, y + 1, y + 2, y + 3]).unwrap();
    }
    assert!(Path::new(&path).exists());

    let pixels = image.pixels().unwrap().to_vec();
    assert_eq!(pixels, vec![0, 1, 2, 3, 1, 2, 3, 4, 2, 3, 4, 5]);
    assert_eq!(image.mode(), StorageMode::MappedRead);
    assert_eq!(image.mode_string(), "v");
    assert!(image.delete_on_close().is_none());
    assert!(!Path::new(&path).exists());
}

#[test]
fn test_failed_rewind_leaves_image_disposed() {
    let dir = tempfile::tempdir().unwrap();
    let registry = registry();
    let path = dir.path().join("cut.v");
    let image = Image::new_mode(&registry, path.to_str().unwrap(), "w").unwrap();
    image.init_fields(4, 2, 1, BandFormat::UChar, Coding::None, Interpretation::BW, 1.0, 1.0);
    image.write_line(0, &[0; 4]).unwrap();
    image.write_line(1, &[1; 4]).unwrap();

    // Drop the pixels so the reopen finds a header and nothing else.
    std::fs::OpenOptions::new()
        .write(true)
        .open(&path)
        .unwrap()
        .set_len(64)
        .unwrap();

    let err = image.pio_input().unwrap_err();
    assert!(matches!(
        err,
        ImageError::Execution(ExecutionError::RewindFailed { .. })
    ));
    assert_eq!(image.lifecycle(), Lifecycle::Disposed);
    assert!(matches!(
        image.wio_input().unwrap_err(),
        ImageError::Mode(ModeError::Lifecycle { .. })
    ));
}

#[test]
fn test_native_write_then_read() {
    let dir = tempfile::tempdir().unwrap();
    let registry = registry();
    let path = dir.path().join("matrix.v");

    let matrix = Image::new_matrix_from_array(&registry, 3, 2, &[1.0, 2.0, 3.0, 4.0, 5.0, 6.5]).unwrap();
    matrix.write_to_file(&path).unwrap();

    let back = Image::new_from_file(&registry, path.to_str().unwrap()).unwrap();
    assert_eq!(back.format(), BandFormat::Double);
    assert_eq!(back.interpretation(), Interpretation::Matrix);
    assert_eq!(back.header_size(), 64);
    assert_eq!(
        back.write_to_memory().unwrap(),
        matrix.write_to_memory().unwrap()
    );
}

#[test]
fn test_read_write_edits_persist() {
    let dir = tempfile::tempdir().unwrap();
    let registry = registry();
    let path = dir.path().join("edit.v");
    write_native(&path, ByteOrder::host(), 2, 2, &[1, 2, 3, 4]);

    {
        let image = Image::new_from_file_rw(&registry, path.to_str().unwrap()).unwrap();
        assert_eq!(image.mode(), StorageMode::MappedReadWrite);
        image
            .with_pixels_mut(|pixels| pixels[..2].copy_from_slice(&9u16.to_ne_bytes()))
            .unwrap();
    }

    let image = Image::new_from_file(&registry, path.to_str().unwrap()).unwrap();
    assert_eq!(image.pixels().unwrap().to_vec(), host_bytes(&[9, 2, 3, 4]));
}

#[test]
fn test_inplace_remaps_read_only_file() {
    let dir = tempfile::tempdir().unwrap();
    let registry = registry();
    let path = dir.path().join("inplace.v");
    write_native(&path, ByteOrder::host(), 2, 1, &[5, 6]);

    let image = Image::new_from_file(&registry, path.to_str().unwrap()).unwrap();
    let events = image.subscribe();
    image.inplace().unwrap();
    assert_eq!(image.mode(), StorageMode::MappedReadWrite);
    assert_eq!(events.try_iter().filter(|e| *e == ImageEvent::Invalidate).count(), 1);
}

#[test]
fn test_raw_file() {
    let dir = tempfile::tempdir().unwrap();
    let registry = registry();
    let path = dir.path().join("pixels.raw");
    let mut bytes = vec![0xff; 10];
    bytes.extend((0..12u8).collect::<Vec<_>>());
    std::fs::write(&path, &bytes).unwrap();

    let raw = Image::new_from_file_raw(&registry, path.to_str().unwrap(), 4, 1, 3, 10).unwrap();
    assert_eq!(raw.interpretation(), Interpretation::Srgb);
    assert_eq!(raw.pixels().unwrap().to_vec(), (0..12u8).collect::<Vec<_>>());
    assert!(raw.sanity().is_empty());
}

#[test]
fn test_png_round_trip() {
    let dir = tempfile::tempdir().unwrap();
    let registry = registry();
    let path = dir.path().join("rgb.png");

    let image = Image::new_memory(&registry).unwrap();
    image.init_fields(
        2,
        2,
        3,
        BandFormat::UChar,
        Coding::None,
        Interpretation::Srgb,
        1.0,
        1.0,
    );
    image.write_line(0, &[255, 0, 0, 0, 255, 0]).unwrap();
    image.write_line(1, &[0, 0, 255, 10, 20, 30]).unwrap();
    image.write_to_file(&path).unwrap();

    let back = Image::new_from_file(&registry, path.to_str().unwrap()).unwrap();
    assert_eq!(back.bands(), 3);
    assert_eq!(back.width(), 2);
    assert_eq!(
        back.pixels().unwrap().to_vec(),
        vec![255, 0, 0, 0, 255, 0, 0, 0, 255, 10, 20, 30]
    );
}

#[test]
fn test_deferred_save_on_written() {
    let dir = tempfile::tempdir().unwrap();
    let registry = registry();
    let path = dir.path().join("grey.png");

    let grey = Image::new_memory(&registry).unwrap();
    grey.init_fields(
        2,
        1,
        1,
        BandFormat::UChar,
        Coding::None,
        Interpretation::BW,
        1.0,
        1.0,
    );
    grey.write_line(0, &[7, 200]).unwrap();

    let out = Image::new_mode(&registry, path.to_str().unwrap(), "w").unwrap();
    assert_eq!(out.mode(), StorageMode::Lazy);
    assert!(!path.exists());

    grey.write(&out).unwrap();
    assert!(path.exists());

    let back = Image::new_from_file(&registry, path.to_str().unwrap()).unwrap();
    assert_eq!(back.pixels().unwrap().to_vec(), vec![7, 200]);
}
