//! Native file header.
//!
//! A native file is a fixed 64-byte header followed by the pixels,
//! band-interleaved and row-major with no padding. The first four bytes are
//! the magic, always stored big-endian; the magic value says which byte order
//! the remaining header fields and the pixel data use.

use crate::core::error::{ConstructionError, ImageError, ImageResult};
use crate::core::types::{BandFormat, Coding, Interpretation};
use std::fs::File;
use std::io::{Read, Write};
use std::path::Path;

/// Size of the native header in bytes.
pub const SIZEOF_HEADER: usize = 64;

/// Largest header size accepted for raw files.
pub const MAX_HEADER_SIZE: u64 = 1_000_000;

/// Magic of a file whose payload is little-endian.
pub const MAGIC_INTEL: u32 = 0xb6a6f208;

/// Magic of a file whose payload is big-endian.
pub const MAGIC_SPARC: u32 = 0x08f2a6b6;

/// Byte order of a native payload.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, serde::Serialize, serde::Deserialize)]
pub enum ByteOrder {
    Little,
    Big,
}

impl ByteOrder {
    /// Byte order of the running machine.
    pub fn host() -> Self {
        if cfg!(target_endian = "big") {
            ByteOrder::Big
        } else {
            ByteOrder::Little
        }
    }

    pub fn magic(self) -> u32 {
        match self {
            ByteOrder::Little => MAGIC_INTEL,
            ByteOrder::Big => MAGIC_SPARC,
        }
    }

    pub fn from_magic(magic: u32) -> Option<Self> {
        match magic {
            MAGIC_INTEL => Some(ByteOrder::Little),
            MAGIC_SPARC => Some(ByteOrder::Big),
            _ => None,
        }
    }

    pub fn is_host(self) -> bool {
        self == Self::host()
    }

    fn put_u32(self, buf: &mut [u8], value: u32) {
        let bytes = match self {
            ByteOrder::Little => value.to_le_bytes(),
            ByteOrder::Big => value.to_be_bytes(),
        };
        buf[..4].copy_from_slice(&bytes);
    }

    fn get_u32(self, buf: &[u8]) -> u32 {
        let mut bytes = [0u8; 4];
        bytes.copy_from_slice(&buf[..4]);
        match self {
            ByteOrder::Little => u32::from_le_bytes(bytes),
            ByteOrder::Big => u32::from_be_bytes(bytes),
        }
    }
}

/// The fields stored in a native header.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct NativeHeader {
    pub byte_order: ByteOrder,
    pub width: u32,
    pub height: u32,
    pub bands: u32,
    pub format: BandFormat,
    pub coding: Coding,
    pub interpretation: Interpretation,
    pub xres: f32,
    pub yres: f32,
    pub xoffset: i32,
    pub yoffset: i32,
}

impl NativeHeader {
    /// Bytes of pixel data that follow this header.
    pub fn sizeof_image(&self) -> u64 {
        self.width as u64 * self.height as u64 * self.bands as u64 * self.format.sizeof() as u64
    }

    /// Serialize into the 64 header bytes.
    pub fn encode(&self) -> [u8; SIZEOF_HEADER] {
        let mut buf = [0u8; SIZEOF_HEADER];
        let order = self.byte_order;

        buf[0..4].copy_from_slice(&order.magic().to_be_bytes());
        order.put_u32(&mut buf[4..], self.width);
        order.put_u32(&mut buf[8..], self.height);
        order.put_u32(&mut buf[12..], self.bands);
        order.put_u32(&mut buf[16..], self.format.code());
        order.put_u32(&mut buf[20..], self.coding.code());
        order.put_u32(&mut buf[24..], self.interpretation.code());
        order.put_u32(&mut buf[28..], self.xres.to_bits());
        order.put_u32(&mut buf[32..], self.yres.to_bits());
        order.put_u32(&mut buf[36..], self.xoffset as u32);
        order.put_u32(&mut buf[40..], self.yoffset as u32);

        buf
    }

    /// Parse 64 header bytes. `path` is only used for error messages.
    pub fn decode(buf: &[u8], path: &str) -> Result<Self, ConstructionError> {
        if buf.len() < SIZEOF_HEADER {
            return Err(ConstructionError::BadHeader {
                path: path.to_string(),
                reason: format!("only {} header bytes", buf.len()),
            });
        }

        let magic = u32::from_be_bytes([buf[0], buf[1], buf[2], buf[3]]);
        let order = ByteOrder::from_magic(magic).ok_or_else(|| ConstructionError::NotNative {
            path: path.to_string(),
        })?;

        let bad = |reason: String| ConstructionError::BadHeader {
            path: path.to_string(),
            reason,
        };

        let width = order.get_u32(&buf[4..]);
        let height = order.get_u32(&buf[8..]);
        let bands = order.get_u32(&buf[12..]);
        if width == 0 || height == 0 || bands == 0 {
            return Err(bad(format!("bad dimensions {}x{}x{}", width, height, bands)));
        }

        let code = order.get_u32(&buf[16..]);
        let format = BandFormat::from_code(code).ok_or_else(|| bad(format!("bad format {}", code)))?;
        let code = order.get_u32(&buf[20..]);
        let coding = Coding::from_code(code).ok_or_else(|| bad(format!("bad coding {}", code)))?;
        // Unknown interpretations are only advisory.
        let interpretation =
            Interpretation::from_code(order.get_u32(&buf[24..])).unwrap_or_default();

        Ok(Self {
            byte_order: order,
            width,
            height,
            bands,
            format,
            coding,
            interpretation,
            xres: f32::from_bits(order.get_u32(&buf[28..])),
            yres: f32::from_bits(order.get_u32(&buf[32..])),
            xoffset: order.get_u32(&buf[36..]) as i32,
            yoffset: order.get_u32(&buf[40..]) as i32,
        })
    }

    /// Read a header from the current position of `reader`.
    pub fn read_from<R: Read>(reader: &mut R, path: &str) -> ImageResult<Self> {
        let mut buf = [0u8; SIZEOF_HEADER];
        reader
            .read_exact(&mut buf)
            .map_err(ImageError::io_with(format!("read header of \"{}\"", path)))?;
        Ok(Self::decode(&buf, path)?)
    }

    /// Write this header at the current position of `writer`.
    pub fn write_to<W: Write>(&self, writer: &mut W, path: &str) -> ImageResult<()> {
        writer
            .write_all(&self.encode())
            .map_err(ImageError::io_with(format!("write header of \"{}\"", path)))
    }
}

/// Byte order of a native file, or `None` if `path` is not one.
pub fn sniff_magic(path: &Path) -> ImageResult<Option<ByteOrder>> {
    let mut file = File::open(path)
        .map_err(ImageError::io_with(format!("open \"{}\"", path.display())))?;
    let mut magic = [0u8; 4];
    match file.read_exact(&mut magic) {
        Ok(()) => Ok(ByteOrder::from_magic(u32::from_be_bytes(magic))),
        Err(e) if e.kind() == std::io::ErrorKind::UnexpectedEof => Ok(None),
        Err(e) => Err(ImageError::io(format!("read \"{}\"", path.display()), e)),
    }
}

/// Swap the byte order of every element of `data` in place.
///
/// Complex formats swap each component separately. 8-bit and coded data
/// have no byte order and are left alone.
pub fn byteswap(format: BandFormat, coding: Coding, data: &mut [u8]) {
    if coding != Coding::None || format.is_8bit() {
        return;
    }
    let unit = format.swap_unit();
    for element in data.chunks_exact_mut(unit) {
        element.reverse();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample(order: ByteOrder) -> NativeHeader {
        NativeHeader {
            byte_order: order,
            width: 640,
            height: 480,
            bands: 3,
            format: BandFormat::UShort,
            coding: Coding::None,
            interpretation: Interpretation::Rgb16,
            xres: 2.5,
            yres: 2.5,
            xoffset: -3,
            yoffset: 7,
        }
    }

    #[test]
    fn test_magic_is_big_endian_on_disc() {
        let little = sample(ByteOrder::Little).encode();
        assert_eq!(&little[0..4], &[0xb6, 0xa6, 0xf2, 0x08]);
        assert_eq!(&little[4..8], &640u32.to_le_bytes());

        let big = sample(ByteOrder::Big).encode();
        assert_eq!(&big[0..4], &[0x08, 0xf2, 0xa6, 0xb6]);
        assert_eq!(&big[4..8], &640u32.to_be_bytes());
    }

    #[test]
    fn test_decode_either_order() {
        for order in [ByteOrder::Little, ByteOrder::Big] {
            let header = sample(order);
            let decoded = NativeHeader::decode(&header.encode(), "x.v").unwrap();
            assert_eq!(decoded, header);
        }
    }

    #[test]
    fn test_decode_rejects_garbage() {
        let buf = [0u8; SIZEOF_HEADER];
        assert!(matches!(
            NativeHeader::decode(&buf, "x.v"),
            Err(ConstructionError::NotNative { .. })
        ));

        let mut buf = sample(ByteOrder::Little).encode();
        buf[16..20].copy_from_slice(&99u32.to_le_bytes());
        assert!(matches!(
            NativeHeader::decode(&buf, "x.v"),
            Err(ConstructionError::BadHeader { .. })
        ));
    }

    #[test]
    fn test_byteswap() {
        let mut data = vec![1, 2, 3, 4, 5, 6, 7, 8];
        byteswap(BandFormat::Short, Coding::None, &mut data);
        assert_eq!(data, vec![2, 1, 4, 3, 6, 5, 8, 7]);

        let mut data = vec![1, 2, 3, 4, 5, 6, 7, 8];
        byteswap(BandFormat::Complex, Coding::None, &mut data);
        assert_eq!(data, vec![4, 3, 2, 1, 8, 7, 6, 5]);

        let mut data = vec![1, 2, 3, 4];
        byteswap(BandFormat::UChar, Coding::LabQ, &mut data);
        assert_eq!(data, vec![1, 2, 3, 4]);
    }

    #[test]
    fn test_sniff() {
        let dir = tempfile::tempdir().unwrap();
        let native = dir.path().join("a.v");
        std::fs::write(&native, sample(ByteOrder::Big).encode()).unwrap();
        assert_eq!(sniff_magic(&native).unwrap(), Some(ByteOrder::Big));

        let short = dir.path().join("b.v");
        std::fs::write(&short, [1u8, 2]).unwrap();
        assert_eq!(sniff_magic(&short).unwrap(), None);
    }
}
