use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

/// Channel count of the image-shaped buffers the engine hands back.
pub const RGBA_CHANNELS: usize = 4;

/// Interleaved 8-bit pixels (`R G B [A]` per pixel, row-major).
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ImageData {
    pub data: Vec<u8>,
    pub width: usize,
    pub height: usize,
    pub channels: usize,
}

impl ImageData {
    pub fn new(data: Vec<u8>, width: usize, height: usize, channels: usize) -> Self {
        Self {
            data,
            width,
            height,
            channels,
        }
    }

    pub fn rgba(data: Vec<u8>, width: usize, height: usize) -> Self {
        Self::new(data, width, height, RGBA_CHANNELS)
    }

    pub fn expected_len(&self) -> usize {
        self.width * self.height * self.channels
    }

    pub fn is_consistent(&self) -> bool {
        self.data.len() == self.expected_len()
    }
}

/// One axis of an image tensor.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Axis {
    N,
    C,
    H,
    W,
}

impl Axis {
    fn from_char(c: char) -> Option<Self> {
        match c.to_ascii_uppercase() {
            'N' => Some(Self::N),
            'C' => Some(Self::C),
            'H' => Some(Self::H),
            'W' => Some(Self::W),
            _ => None,
        }
    }

    fn as_char(self) -> char {
        match self {
            Self::N => 'N',
            Self::C => 'C',
            Self::H => 'H',
            Self::W => 'W',
        }
    }
}

/// Axis ordering of an image tensor, e.g. `NCHW` or `NHWC`.
///
/// Any permutation of the four axes is accepted.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct Layout([Axis; 4]);

impl Layout {
    pub const NCHW: Layout = Layout([Axis::N, Axis::C, Axis::H, Axis::W]);
    pub const NHWC: Layout = Layout([Axis::N, Axis::H, Axis::W, Axis::C]);

    /// Parse a permutation token (case-insensitive).
    pub fn parse(token: &str) -> Option<Self> {
        let token = token.trim();
        if token.chars().count() != 4 {
            return None;
        }
        let mut axes = [Axis::N; 4];
        for (slot, c) in axes.iter_mut().zip(token.chars()) {
            *slot = Axis::from_char(c)?;
        }
        for axis in [Axis::N, Axis::C, Axis::H, Axis::W] {
            if !axes.contains(&axis) {
                return None;
            }
        }
        Some(Self(axes))
    }

    pub fn axes(&self) -> [Axis; 4] {
        self.0
    }

    pub fn index_of(&self, axis: Axis) -> usize {
        self.0.iter().position(|a| *a == axis).unwrap_or(0)
    }

    /// Dimension vector with each extent placed at its axis position.
    pub fn dims(&self, n: usize, c: usize, h: usize, w: usize) -> [usize; 4] {
        let mut dims = [0usize; 4];
        dims[self.index_of(Axis::N)] = n;
        dims[self.index_of(Axis::C)] = c;
        dims[self.index_of(Axis::H)] = h;
        dims[self.index_of(Axis::W)] = w;
        dims
    }

    /// Extent of `axis` within a dimension vector laid out by `self`.
    pub fn extent(&self, dims: &[usize; 4], axis: Axis) -> usize {
        dims[self.index_of(axis)]
    }

    /// Row-major element strides for `(n, c, h, w)` under this layout.
    pub fn strides(&self, dims: &[usize; 4]) -> AxisStrides {
        let mut positional = [1usize; 4];
        for i in (0..3).rev() {
            positional[i] = positional[i + 1] * dims[i + 1];
        }
        AxisStrides {
            n: positional[self.index_of(Axis::N)],
            c: positional[self.index_of(Axis::C)],
            h: positional[self.index_of(Axis::H)],
            w: positional[self.index_of(Axis::W)],
        }
    }
}

impl Default for Layout {
    fn default() -> Self {
        Self::NCHW
    }
}

/// Element strides per named axis.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AxisStrides {
    pub n: usize,
    pub c: usize,
    pub h: usize,
    pub w: usize,
}

impl AxisStrides {
    pub fn offset(&self, n: usize, c: usize, h: usize, w: usize) -> usize {
        n * self.n + c * self.c + h * self.h + w * self.w
    }
}

impl fmt::Display for Layout {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for axis in self.0 {
            write!(f, "{}", axis.as_char())?;
        }
        Ok(())
    }
}

impl FromStr for Layout {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::parse(s).ok_or_else(|| format!("invalid tensor layout '{s}'"))
    }
}

impl TryFrom<String> for Layout {
    type Error = String;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        value.parse()
    }
}

impl From<Layout> for String {
    fn from(layout: Layout) -> Self {
        layout.to_string()
    }
}

/// Numeric element type a model consumes.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DataType {
    #[default]
    Float32,
    Float16,
    Float64,
    Int8,
    Uint8,
    Uint16,
    Int32,
    Uint32,
}

impl DataType {
    pub fn from_token(token: &str) -> Option<Self> {
        match token.trim().to_ascii_lowercase().as_str() {
            "float32" | "fp32" | "f32" => Some(Self::Float32),
            "float16" | "fp16" | "f16" => Some(Self::Float16),
            "float64" | "fp64" | "f64" => Some(Self::Float64),
            "int8" | "i8" => Some(Self::Int8),
            "uint8" | "u8" => Some(Self::Uint8),
            "uint16" | "u16" => Some(Self::Uint16),
            "int32" | "i32" => Some(Self::Int32),
            "uint32" | "u32" => Some(Self::Uint32),
            _ => None,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Float32 => "float32",
            Self::Float16 => "float16",
            Self::Float64 => "float64",
            Self::Int8 => "int8",
            Self::Uint8 => "uint8",
            Self::Uint16 => "uint16",
            Self::Int32 => "int32",
            Self::Uint32 => "uint32",
        }
    }
}

impl fmt::Display for DataType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Fixed-width storage for tensor elements.
///
/// `Float16` tensors are held as `F32` on the host side and narrowed by the
/// engine binding.
#[derive(Debug, Clone, PartialEq)]
pub enum TensorBuffer {
    F32(Vec<f32>),
    F64(Vec<f64>),
    I8(Vec<i8>),
    U8(Vec<u8>),
    U16(Vec<u16>),
    I32(Vec<i32>),
    U32(Vec<u32>),
}

/// Apply the same expression to the inner vector of every variant.
macro_rules! with_buffer {
    ($buf:expr, $v:ident => $body:expr) => {
        match $buf {
            TensorBuffer::F32($v) => $body,
            TensorBuffer::F64($v) => $body,
            TensorBuffer::I8($v) => $body,
            TensorBuffer::U8($v) => $body,
            TensorBuffer::U16($v) => $body,
            TensorBuffer::I32($v) => $body,
            TensorBuffer::U32($v) => $body,
        }
    };
}

pub(crate) use with_buffer;

impl TensorBuffer {
    /// Zero-filled buffer of the array kind `data_type` maps to.
    pub fn zeros(data_type: DataType, len: usize) -> Self {
        match data_type {
            DataType::Float32 | DataType::Float16 => Self::F32(vec![0.0; len]),
            DataType::Float64 => Self::F64(vec![0.0; len]),
            DataType::Int8 => Self::I8(vec![0; len]),
            DataType::Uint8 => Self::U8(vec![0; len]),
            DataType::Uint16 => Self::U16(vec![0; len]),
            DataType::Int32 => Self::I32(vec![0; len]),
            DataType::Uint32 => Self::U32(vec![0; len]),
        }
    }

    pub fn len(&self) -> usize {
        with_buffer!(self, v => v.len())
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn kind(&self) -> &'static str {
        match self {
            Self::F32(_) => "f32",
            Self::F64(_) => "f64",
            Self::I8(_) => "i8",
            Self::U8(_) => "u8",
            Self::U16(_) => "u16",
            Self::I32(_) => "i32",
            Self::U32(_) => "u32",
        }
    }

    /// Whether this buffer is the storage kind `data_type` maps to.
    pub fn matches(&self, data_type: DataType) -> bool {
        self.kind() == Self::zeros(data_type, 0).kind()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_layout_parse_permutations() {
        assert_eq!(Layout::parse("nchw"), Some(Layout::NCHW));
        assert_eq!(Layout::parse("NHWC"), Some(Layout::NHWC));
        assert!(Layout::parse("NCHH").is_none());
        assert!(Layout::parse("NCH").is_none());
        assert!(Layout::parse("NCHWX").is_none());
        assert_eq!(Layout::parse("CHWN").map(|l| l.to_string()).as_deref(), Some("CHWN"));
    }

    #[test]
    fn test_layout_dims() {
        assert_eq!(Layout::NCHW.dims(1, 3, 20, 10), [1, 3, 20, 10]);
        assert_eq!(Layout::NHWC.dims(1, 3, 20, 10), [1, 20, 10, 3]);
        assert_eq!(Layout::NHWC.extent(&[1, 20, 10, 3], Axis::C), 3);
    }

    #[test]
    fn test_layout_strides() {
        let dims = Layout::NCHW.dims(1, 3, 4, 5);
        let s = Layout::NCHW.strides(&dims);
        assert_eq!((s.n, s.c, s.h, s.w), (60, 20, 5, 1));

        let dims = Layout::NHWC.dims(1, 3, 4, 5);
        let s = Layout::NHWC.strides(&dims);
        assert_eq!((s.n, s.c, s.h, s.w), (60, 1, 15, 3));
    }

    #[test]
    fn test_layout_serde_as_string() {
        let json = serde_json::to_string(&Layout::NHWC).expect("layout should serialize");
        assert_eq!(json, "\"NHWC\"");
        let parsed: Layout = serde_json::from_str("\"nchw\"").expect("layout should deserialize");
        assert_eq!(parsed, Layout::NCHW);
        assert!(serde_json::from_str::<Layout>("\"XYZW\"").is_err());
    }

    #[test]
    fn test_data_type_mapping() {
        assert_eq!(DataType::from_token("float16"), Some(DataType::Float16));
        assert_eq!(DataType::from_token("FP32"), Some(DataType::Float32));
        assert_eq!(DataType::from_token("bfloat16"), None);

        assert!(matches!(TensorBuffer::zeros(DataType::Float16, 2), TensorBuffer::F32(_)));
        assert!(matches!(TensorBuffer::zeros(DataType::Float64, 2), TensorBuffer::F64(_)));
        assert!(matches!(TensorBuffer::zeros(DataType::Int8, 2), TensorBuffer::I8(_)));
        assert!(matches!(TensorBuffer::zeros(DataType::Uint8, 2), TensorBuffer::U8(_)));
        assert!(matches!(TensorBuffer::zeros(DataType::Uint16, 2), TensorBuffer::U16(_)));
        assert!(matches!(TensorBuffer::zeros(DataType::Int32, 2), TensorBuffer::I32(_)));
        assert!(matches!(TensorBuffer::zeros(DataType::Uint32, 2), TensorBuffer::U32(_)));
    }

    #[test]
    fn test_tensor_buffer_matches() {
        let buf = TensorBuffer::zeros(DataType::Float16, 4);
        assert!(buf.matches(DataType::Float32));
        assert!(buf.matches(DataType::Float16));
        assert!(!buf.matches(DataType::Uint8));
        assert_eq!(buf.len(), 4);
    }
}
