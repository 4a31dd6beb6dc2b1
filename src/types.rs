//! Core data types for rasterbridge

use std::fmt;

use num_traits::NumCast;
use serde::{Deserialize, Serialize};

/// Represents pixel data types
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum DataType {
    /// Unsigned 8-bit integer
    U8,
    /// Signed 8-bit integer
    I8,
    /// Unsigned 16-bit integer
    U16,
    /// Signed 16-bit integer
    I16,
    /// Unsigned 32-bit integer
    U32,
    /// Signed 32-bit integer
    I32,
    /// 32-bit floating point
    F32,
    /// 64-bit floating point
    F64,
}

impl DataType {
    pub const ALL: [DataType; 8] = [
        DataType::U8,
        DataType::I8,
        DataType::U16,
        DataType::I16,
        DataType::U32,
        DataType::I32,
        DataType::F32,
        DataType::F64,
    ];

    /// Returns the size in bytes for this data type
    pub fn size(&self) -> usize {
        match self {
            DataType::U8 | DataType::I8 => 1,
            DataType::U16 | DataType::I16 => 2,
            DataType::U32 | DataType::I32 | DataType::F32 => 4,
            DataType::F64 => 8,
        }
    }

    /// Returns the name of this data type
    pub fn name(&self) -> &'static str {
        match self {
            DataType::U8 => "uint8",
            DataType::I8 => "int8",
            DataType::U16 => "uint16",
            DataType::I16 => "int16",
            DataType::U32 => "uint32",
            DataType::I32 => "int32",
            DataType::F32 => "float32",
            DataType::F64 => "float64",
        }
    }

    /// Looks up a data type by name (case-insensitive, "byte" is an alias of uint8)
    pub fn from_name(name: &str) -> Option<Self> {
        match name.to_ascii_lowercase().as_str() {
            "uint8" | "byte" => Some(DataType::U8),
            "int8" => Some(DataType::I8),
            "uint16" => Some(DataType::U16),
            "int16" => Some(DataType::I16),
            "uint32" => Some(DataType::U32),
            "int32" => Some(DataType::I32),
            "float32" => Some(DataType::F32),
            "float64" => Some(DataType::F64),
            _ => None,
        }
    }

    /// Returns the numeric type code used by the native transfer calls
    pub fn code(&self) -> i32 {
        match self {
            DataType::U8 => 1,
            DataType::U16 => 2,
            DataType::I16 => 3,
            DataType::U32 => 4,
            DataType::I32 => 5,
            DataType::F32 => 6,
            DataType::F64 => 7,
            DataType::I8 => 14,
        }
    }

    /// Looks up a data type by native type code
    pub fn from_code(code: i32) -> Option<Self> {
        DataType::ALL.iter().copied().find(|dt| dt.code() == code)
    }

    pub fn is_float(&self) -> bool {
        matches!(self, DataType::F32 | DataType::F64)
    }

    /// Returns the (min, max) representable values
    pub fn range(&self) -> (f64, f64) {
        match self {
            DataType::U8 => (u8::MIN as f64, u8::MAX as f64),
            DataType::I8 => (i8::MIN as f64, i8::MAX as f64),
            DataType::U16 => (u16::MIN as f64, u16::MAX as f64),
            DataType::I16 => (i16::MIN as f64, i16::MAX as f64),
            DataType::U32 => (u32::MIN as f64, u32::MAX as f64),
            DataType::I32 => (i32::MIN as f64, i32::MAX as f64),
            DataType::F32 => (f32::MIN as f64, f32::MAX as f64),
            DataType::F64 => (f64::MIN, f64::MAX),
        }
    }

    /// Returns true if `value` can be stored in this type without clamping.
    ///
    /// NaN and infinities are accepted by the float types only.
    pub fn contains(&self, value: f64) -> bool {
        if !value.is_finite() {
            return self.is_float();
        }
        let (min, max) = self.range();
        value >= min && value <= max
    }

    /// Converts `value` the way a native copy into this type would:
    /// integers round to nearest and clamp, NaN becomes zero, float32 loses precision.
    pub fn coerce(&self, value: f64) -> f64 {
        match self {
            DataType::F64 => value,
            DataType::F32 => value as f32 as f64,
            _ => {
                if value.is_nan() {
                    return 0.0;
                }
                let (min, max) = self.range();
                value.round().clamp(min, max)
            }
        }
    }
}

impl fmt::Display for DataType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.name())
    }
}

/// Element types that can be moved between buffers and bands
pub trait Pixel: Copy + Default + PartialEq + fmt::Debug + Send + Sync + 'static {
    const DATA_TYPE: DataType;

    fn to_f64(self) -> f64;

    fn from_f64(value: f64) -> Self;
}

macro_rules! impl_pixel {
    ($($t:ty => $dt:expr),* $(,)?) => {
        $(
            impl Pixel for $t {
                const DATA_TYPE: DataType = $dt;

                fn to_f64(self) -> f64 {
                    self as f64
                }

                fn from_f64(value: f64) -> Self {
                    <$t as NumCast>::from($dt.coerce(value)).unwrap_or_default()
                }
            }
        )*
    };
}

impl_pixel! {
    u8 => DataType::U8,
    i8 => DataType::I8,
    u16 => DataType::U16,
    i16 => DataType::I16,
    u32 => DataType::U32,
    i32 => DataType::I32,
    f32 => DataType::F32,
    f64 => DataType::F64,
}

/// Represents image dimensions
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Dimensions {
    /// Width in pixels
    pub width: usize,
    /// Height in pixels
    pub height: usize,
}

impl Dimensions {
    /// Creates new dimensions
    pub fn new(width: usize, height: usize) -> Self {
        Self { width, height }
    }

    /// Returns the total number of pixels
    pub fn pixel_count(&self) -> usize {
        self.width * self.height
    }
}

/// A rectangular pixel/line region of a band
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Window {
    pub x_offset: usize,
    pub y_offset: usize,
    pub width: usize,
    pub height: usize,
}

impl Window {
    pub fn new(x_offset: usize, y_offset: usize, width: usize, height: usize) -> Self {
        Self {
            x_offset,
            y_offset,
            width,
            height,
        }
    }

    /// A window covering a whole band of the given size
    pub fn full(dims: Dimensions) -> Self {
        Self::new(0, 0, dims.width, dims.height)
    }

    /// Returns true if the window lies inside a band of the given size
    pub fn fits(&self, dims: Dimensions) -> bool {
        self.x_offset
            .checked_add(self.width)
            .is_some_and(|end| end <= dims.width)
            && self
                .y_offset
                .checked_add(self.height)
                .is_some_and(|end| end <= dims.height)
    }
}

/// Six-coefficient affine transform from pixel/line to CRS coordinates.
///
/// `x = gt[0] + px * gt[1] + line * gt[2]`, `y = gt[3] + px * gt[4] + line * gt[5]`
pub type GeoTransform = [f64; 6];

/// Operations on a [`GeoTransform`]
pub trait GeoTransformEx {
    fn apply(&self, pixel: f64, line: f64) -> (f64, f64);

    fn invert(&self) -> Option<GeoTransform>;

    fn is_identity(&self) -> bool;
}

impl GeoTransformEx for GeoTransform {
    fn apply(&self, pixel: f64, line: f64) -> (f64, f64) {
        (
            self[0] + pixel * self[1] + line * self[2],
            self[3] + pixel * self[4] + line * self[5],
        )
    }

    fn invert(&self) -> Option<GeoTransform> {
        let det = self[1] * self[5] - self[2] * self[4];
        if det.abs() < 1e-15 {
            return None;
        }
        let inv_det = 1.0 / det;

        Some([
            (self[2] * self[3] - self[0] * self[5]) * inv_det,
            self[5] * inv_det,
            -self[2] * inv_det,
            (-self[1] * self[3] + self[0] * self[4]) * inv_det,
            -self[4] * inv_det,
            self[1] * inv_det,
        ])
    }

    fn is_identity(&self) -> bool {
        *self == IDENTITY_GEO_TRANSFORM
    }
}

pub const IDENTITY_GEO_TRANSFORM: GeoTransform = [0.0, 1.0, 0.0, 0.0, 0.0, 1.0];

/// A ground control point
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Gcp {
    pub id: String,
    pub pixel: f64,
    pub line: f64,
    pub x: f64,
    pub y: f64,
    pub z: f64,
}

impl Gcp {
    pub fn new(pixel: f64, line: f64, x: f64, y: f64, z: f64) -> Self {
        Self {
            id: String::new(),
            pixel,
            line,
            x,
            y,
            z,
        }
    }
}

/// Axis-aligned extent in CRS units
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Bounds {
    pub left: f64,
    pub bottom: f64,
    pub right: f64,
    pub top: f64,
}

impl Bounds {
    pub fn new(left: f64, bottom: f64, right: f64, top: f64) -> Self {
        Self {
            left,
            bottom,
            right,
            top,
        }
    }

    pub fn width(&self) -> f64 {
        self.right - self.left
    }

    pub fn height(&self) -> f64 {
        self.top - self.bottom
    }

    /// Geotransform of a north-up grid of `width` x `height` pixels covering these bounds
    pub fn to_geo_transform(&self, width: usize, height: usize) -> GeoTransform {
        [
            self.left,
            self.width() / width as f64,
            0.0,
            self.top,
            0.0,
            -self.height() / height as f64,
        ]
    }
}
