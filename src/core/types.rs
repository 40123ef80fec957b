//! Core value types carried by every image descriptor.
//!
//! The enums here are closed sets:
//! - band formats and codings decide how many bytes a pixel takes
//! - interpretation is an advisory tag that is carried, never enforced
//! - storage mode names which physical representation backs a descriptor
//!
//! Numeric codes match the native file header, so they must not be reordered.

use serde::{Deserialize, Serialize};
use std::fmt;

/// Element type of one band of one pixel.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum BandFormat {
    #[default]
    UChar,
    Char,
    UShort,
    Short,
    UInt,
    Int,
    Float,
    Complex,
    Double,
    DpComplex,
}

/// Packed pixel encodings.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum Coding {
    #[default]
    None,
    LabQ,
    Rad,
}

/// Advisory hint saying how pixel values should be read.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum Interpretation {
    #[default]
    Multiband,
    BW,
    Histogram,
    Xyz,
    Lab,
    Cmyk,
    LabQ,
    Rgb,
    Cmc,
    Lch,
    LabS,
    Srgb,
    Yxy,
    Fourier,
    Rgb16,
    Grey16,
    Matrix,
    ScRgb,
}

/// Preferred geometry of demand, from least to most restrictive.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum DemandStyle {
    #[default]
    Any,
    SmallTile,
    FatStrip,
    ThinStrip,
}

/// Which physical representation currently backs a descriptor.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum StorageMode {
    None,
    MemoryOwned,
    MemoryForeign,
    FileOpenRead,
    FileOpenWrite,
    MappedRead,
    MappedReadWrite,
    Lazy,
}

// ============================================================================
// BandFormat
// ============================================================================

impl BandFormat {
    /// All formats in header-code order.
    pub const ALL: [BandFormat; 10] = [
        BandFormat::UChar,
        BandFormat::Char,
        BandFormat::UShort,
        BandFormat::Short,
        BandFormat::UInt,
        BandFormat::Int,
        BandFormat::Float,
        BandFormat::Complex,
        BandFormat::Double,
        BandFormat::DpComplex,
    ];

    /// Size in bytes of one band element.
    pub fn sizeof(self) -> usize {
        match self {
            BandFormat::UChar | BandFormat::Char => 1,
            BandFormat::UShort | BandFormat::Short => 2,
            BandFormat::UInt | BandFormat::Int | BandFormat::Float => 4,
            BandFormat::Complex | BandFormat::Double => 8,
            BandFormat::DpComplex => 16,
        }
    }

    /// Size in bytes of the unit a byte swap acts on.
    ///
    /// Complex formats are a pair of reals, each swapped separately.
    pub fn swap_unit(self) -> usize {
        match self {
            BandFormat::Complex => 4,
            BandFormat::DpComplex => 8,
            other => other.sizeof(),
        }
    }

    pub fn is_int(self) -> bool {
        matches!(
            self,
            BandFormat::UChar
                | BandFormat::Char
                | BandFormat::UShort
                | BandFormat::Short
                | BandFormat::UInt
                | BandFormat::Int
        )
    }

    pub fn is_uint(self) -> bool {
        matches!(self, BandFormat::UChar | BandFormat::UShort | BandFormat::UInt)
    }

    pub fn is_8bit(self) -> bool {
        matches!(self, BandFormat::UChar | BandFormat::Char)
    }

    pub fn is_float(self) -> bool {
        matches!(self, BandFormat::Float | BandFormat::Double)
    }

    pub fn is_complex(self) -> bool {
        matches!(self, BandFormat::Complex | BandFormat::DpComplex)
    }

    /// Numeric code used in the native header.
    pub fn code(self) -> u32 {
        Self::ALL.iter().position(|f| *f == self).unwrap_or(0) as u32
    }

    pub fn from_code(code: u32) -> Option<Self> {
        Self::ALL.get(code as usize).copied()
    }
}

// ============================================================================
// Coding
// ============================================================================

impl Coding {
    pub fn code(self) -> u32 {
        match self {
            Coding::None => 0,
            Coding::LabQ => 2,
            Coding::Rad => 6,
        }
    }

    pub fn from_code(code: u32) -> Option<Self> {
        match code {
            0 => Some(Coding::None),
            2 => Some(Coding::LabQ),
            6 => Some(Coding::Rad),
            _ => None,
        }
    }

    /// Whether (`format`, `bands`) may carry this coding.
    ///
    /// Packed codings are four uchar bands; uncoded images may be anything.
    pub fn is_legal(self, format: BandFormat, bands: u32) -> bool {
        match self {
            Coding::None => true,
            Coding::LabQ | Coding::Rad => format == BandFormat::UChar && bands == 4,
        }
    }

    /// The (bands, format) an image with this coding unpacks to.
    pub fn decode_predict(self, bands: u32, format: BandFormat) -> (u32, BandFormat) {
        match self {
            Coding::None => (bands, format),
            Coding::LabQ | Coding::Rad => (3, BandFormat::Float),
        }
    }
}

// ============================================================================
// Interpretation
// ============================================================================

const INTERPRETATION_CODES: [(Interpretation, u32); 18] = [
    (Interpretation::Multiband, 0),
    (Interpretation::BW, 1),
    (Interpretation::Histogram, 10),
    (Interpretation::Xyz, 12),
    (Interpretation::Lab, 13),
    (Interpretation::Cmyk, 15),
    (Interpretation::LabQ, 16),
    (Interpretation::Rgb, 17),
    (Interpretation::Cmc, 18),
    (Interpretation::Lch, 19),
    (Interpretation::LabS, 21),
    (Interpretation::Srgb, 22),
    (Interpretation::Yxy, 23),
    (Interpretation::Fourier, 24),
    (Interpretation::Rgb16, 25),
    (Interpretation::Grey16, 26),
    (Interpretation::Matrix, 27),
    (Interpretation::ScRgb, 28),
];

impl Interpretation {
    pub fn code(self) -> u32 {
        INTERPRETATION_CODES
            .iter()
            .find(|(i, _)| *i == self)
            .map(|(_, c)| *c)
            .unwrap_or(0)
    }

    pub fn from_code(code: u32) -> Option<Self> {
        INTERPRETATION_CODES
            .iter()
            .find(|(_, c)| *c == code)
            .map(|(i, _)| *i)
    }

    /// Default guess for uninterpreted data of a given band count.
    pub fn guess_from_bands(bands: u32) -> Self {
        match bands {
            1 => Interpretation::BW,
            3 => Interpretation::Srgb,
            _ => Interpretation::Multiband,
        }
    }
}

// ============================================================================
// DemandStyle
// ============================================================================

impl DemandStyle {
    fn rank(self) -> u8 {
        match self {
            DemandStyle::Any => 0,
            DemandStyle::ThinStrip => 1,
            DemandStyle::FatStrip => 2,
            DemandStyle::SmallTile => 3,
        }
    }

    /// The more restrictive of two hints.
    pub fn most_restrictive(self, other: DemandStyle) -> DemandStyle {
        if other.rank() > self.rank() {
            other
        } else {
            self
        }
    }
}

// ============================================================================
// StorageMode
// ============================================================================

impl StorageMode {
    /// Whether this mode is backed by a file on disc in some way.
    pub fn is_file(self) -> bool {
        matches!(
            self,
            StorageMode::FileOpenRead
                | StorageMode::FileOpenWrite
                | StorageMode::MappedRead
                | StorageMode::MappedReadWrite
        )
    }
}

impl fmt::Display for StorageMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            StorageMode::None => "none",
            StorageMode::MemoryOwned => "memory",
            StorageMode::MemoryForeign => "foreign-memory",
            StorageMode::FileOpenRead => "file-read",
            StorageMode::FileOpenWrite => "file-write",
            StorageMode::MappedRead => "mapped",
            StorageMode::MappedReadWrite => "mapped-rw",
            StorageMode::Lazy => "lazy",
        };
        f.write_str(name)
    }
}

// ============================================================================
// Rect
// ============================================================================

/// A rectangular region within an image.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Rect {
    /// X offset from the image origin
    pub left: u32,
    /// Y offset from the image origin
    pub top: u32,
    pub width: u32,
    pub height: u32,
}

impl Rect {
    pub fn new(left: u32, top: u32, width: u32, height: u32) -> Self {
        Self {
            left,
            top,
            width,
            height,
        }
    }

    /// Get the right edge coordinate (exclusive).
    pub fn right(&self) -> u32 {
        self.left + self.width
    }

    /// Get the bottom edge coordinate (exclusive).
    pub fn bottom(&self) -> u32 {
        self.top + self.height
    }

    /// Area of this rect in pixels.
    pub fn area(&self) -> u64 {
        self.width as u64 * self.height as u64
    }

    pub fn is_empty(&self) -> bool {
        self.width == 0 || self.height == 0
    }

    /// Check if this rect is entirely within the given bounds.
    pub fn is_within_bounds(&self, width: u32, height: u32) -> bool {
        self.left as u64 + self.width as u64 <= width as u64
            && self.top as u64 + self.height as u64 <= height as u64
    }
}

/// Iterator over tiles covering an image, left-to-right then top-to-bottom.
///
/// With a tile width equal to the image width this yields horizontal strips,
/// which is how sinks walk their output.
pub struct TileIterator {
    image_width: u32,
    image_height: u32,
    tile_width: u32,
    tile_height: u32,
    current_x: u32,
    current_y: u32,
}

impl TileIterator {
    pub fn new(image_width: u32, image_height: u32, tile_width: u32, tile_height: u32) -> Self {
        Self {
            image_width,
            image_height,
            tile_width: tile_width.max(1),
            tile_height: tile_height.max(1),
            current_x: 0,
            current_y: 0,
        }
    }

    /// Full-width strips `strip_height` lines high.
    pub fn strips(image_width: u32, image_height: u32, strip_height: u32) -> Self {
        Self::new(image_width, image_height, image_width, strip_height)
    }

    /// Get the total number of tiles.
    pub fn tile_count(&self) -> usize {
        if self.image_width == 0 || self.image_height == 0 {
            return 0;
        }
        let tiles_x = self.image_width.div_ceil(self.tile_width);
        let tiles_y = self.image_height.div_ceil(self.tile_height);
        (tiles_x as usize) * (tiles_y as usize)
    }
}

impl Iterator for TileIterator {
    type Item = Rect;

    fn next(&mut self) -> Option<Self::Item> {
        if self.image_width == 0 || self.current_y >= self.image_height {
            return None;
        }

        let x = self.current_x;
        let y = self.current_y;
        let width = self.tile_width.min(self.image_width - x);
        let height = self.tile_height.min(self.image_height - y);

        self.current_x += self.tile_width;
        if self.current_x >= self.image_width {
            self.current_x = 0;
            self.current_y += self.tile_height;
        }

        Some(Rect::new(x, y, width, height))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_format_sizes() {
        assert_eq!(BandFormat::UChar.sizeof(), 1);
        assert_eq!(BandFormat::Short.sizeof(), 2);
        assert_eq!(BandFormat::Float.sizeof(), 4);
        assert_eq!(BandFormat::Complex.sizeof(), 8);
        assert_eq!(BandFormat::DpComplex.sizeof(), 16);
        assert_eq!(BandFormat::DpComplex.swap_unit(), 8);
    }

    #[test]
    fn test_format_predicates() {
        assert!(BandFormat::Char.is_int());
        assert!(!BandFormat::Char.is_uint());
        assert!(BandFormat::UInt.is_uint());
        assert!(BandFormat::UChar.is_8bit());
        assert!(BandFormat::Double.is_float());
        assert!(!BandFormat::Complex.is_float());
        assert!(BandFormat::Complex.is_complex());
    }

    #[test]
    fn test_codes_round_trip() {
        for format in BandFormat::ALL {
            assert_eq!(BandFormat::from_code(format.code()), Some(format));
        }
        assert_eq!(Coding::from_code(Coding::Rad.code()), Some(Coding::Rad));
        assert_eq!(Coding::from_code(1), None);
        assert_eq!(
            Interpretation::from_code(Interpretation::Srgb.code()),
            Some(Interpretation::Srgb)
        );
    }

    #[test]
    fn test_coding_legality() {
        assert!(Coding::None.is_legal(BandFormat::Double, 7));
        assert!(Coding::LabQ.is_legal(BandFormat::UChar, 4));
        assert!(!Coding::LabQ.is_legal(BandFormat::UChar, 3));
        assert!(!Coding::Rad.is_legal(BandFormat::Float, 4));
        assert_eq!(
            Coding::LabQ.decode_predict(4, BandFormat::UChar),
            (3, BandFormat::Float)
        );
    }

    #[test]
    fn test_demand_style_ordering() {
        assert_eq!(
            DemandStyle::Any.most_restrictive(DemandStyle::SmallTile),
            DemandStyle::SmallTile
        );
        assert_eq!(
            DemandStyle::ThinStrip.most_restrictive(DemandStyle::FatStrip),
            DemandStyle::FatStrip
        );
    }

    #[test]
    fn test_rect() {
        let rect = Rect::new(10, 20, 100, 200);
        assert_eq!(rect.right(), 110);
        assert_eq!(rect.bottom(), 220);
        assert_eq!(rect.area(), 20000);
        assert!(rect.is_within_bounds(110, 220));
        assert!(!rect.is_within_bounds(109, 220));
    }

    #[test]
    fn test_tile_iterator() {
        let iter = TileIterator::new(1000, 1000, 256, 256);
        assert_eq!(iter.tile_count(), 16);

        let tiles: Vec<_> = TileIterator::new(100, 100, 64, 64).collect();
        assert_eq!(tiles.len(), 4);
        assert_eq!(tiles[3], Rect::new(64, 64, 36, 36));
    }

    #[test]
    fn test_strips_cover_image() {
        let strips: Vec<_> = TileIterator::strips(7, 10, 4).collect();
        assert_eq!(strips.len(), 3);
        assert_eq!(strips[2], Rect::new(0, 8, 7, 2));
        let total: u64 = strips.iter().map(Rect::area).sum();
        assert_eq!(total, 70);
    }
}
