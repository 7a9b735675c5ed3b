use std::fmt;

use half::f16;

/// Element types an array can hold on a device.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum DType {
    /// 8-bit signed integer
    I8,
    /// 16-bit signed integer
    I16,
    /// 32-bit signed integer
    I32,
    /// 64-bit signed integer
    I64,
    /// 16-bit IEEE 754 half-precision float
    F16,
    /// 32-bit IEEE 754 single-precision float
    F32,
    /// 64-bit IEEE 754 double-precision float
    F64,
}

impl DType {
    pub const ALL: [DType; 7] = [
        DType::I8,
        DType::I16,
        DType::I32,
        DType::I64,
        DType::F16,
        DType::F32,
        DType::F64,
    ];

    /// Size in bytes of a single element.
    pub fn element_size(&self) -> usize {
        match self {
            DType::I8 => 1,
            DType::I16 | DType::F16 => 2,
            DType::I32 | DType::F32 => 4,
            DType::I64 | DType::F64 => 8,
        }
    }

    /// Number of bytes needed to store `n` elements of this type.
    pub fn storage_bytes(&self, n: usize) -> usize {
        self.element_size() * n
    }

    /// Whether this is a floating-point type.
    pub fn is_float(&self) -> bool {
        matches!(self, DType::F16 | DType::F32 | DType::F64)
    }

    /// Whether this is an integer type.
    pub fn is_integer(&self) -> bool {
        !self.is_float()
    }

    /// Name of the matching scalar type in kernel source text.
    ///
    /// Kernel entry points are specialised per element type and carry this
    /// name as a suffix, e.g. `plus_float`.
    pub fn kernel_type_name(&self) -> &'static str {
        match self {
            DType::I8 => "char",
            DType::I16 => "short",
            DType::I32 => "int",
            DType::I64 => "long",
            DType::F16 => "half",
            DType::F32 => "float",
            DType::F64 => "double",
        }
    }
}

impl fmt::Display for DType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            DType::I8 => "i8",
            DType::I16 => "i16",
            DType::I32 => "i32",
            DType::I64 => "i64",
            DType::F16 => "f16",
            DType::F32 => "f32",
            DType::F64 => "f64",
        };
        f.write_str(name)
    }
}

/// A Rust scalar type that maps onto a [`DType`].
///
/// The arithmetic here is what host kernels execute per element. Integer
/// arithmetic wraps, and integer division by zero yields zero instead of
/// trapping the queue.
pub trait Element:
    bytemuck::Pod + Copy + Send + Sync + PartialEq + fmt::Debug + 'static
{
    const DTYPE: DType;

    fn from_f64(value: f64) -> Self;
    fn to_f64(self) -> f64;

    fn zero() -> Self;
    fn one() -> Self;

    fn add(self, rhs: Self) -> Self;
    fn sub(self, rhs: Self) -> Self;
    fn mul(self, rhs: Self) -> Self;
    fn div(self, rhs: Self) -> Self;
    fn neg(self) -> Self;
}

macro_rules! impl_element_int {
    ($($t:ty => $d:ident),*) => {
        $(
            impl Element for $t {
                const DTYPE: DType = DType::$d;

                fn from_f64(value: f64) -> Self {
                    value as $t
                }
                fn to_f64(self) -> f64 {
                    self as f64
                }
                fn zero() -> Self {
                    0
                }
                fn one() -> Self {
                    1
                }
                fn add(self, rhs: Self) -> Self {
                    self.wrapping_add(rhs)
                }
                fn sub(self, rhs: Self) -> Self {
                    self.wrapping_sub(rhs)
                }
                fn mul(self, rhs: Self) -> Self {
                    self.wrapping_mul(rhs)
                }
                fn div(self, rhs: Self) -> Self {
                    self.checked_div(rhs).unwrap_or(0)
                }
                fn neg(self) -> Self {
                    self.wrapping_neg()
                }
            }
        )*
    };
}

macro_rules! impl_element_float {
    ($($t:ty => $d:ident),*) => {
        $(
            impl Element for $t {
                const DTYPE: DType = DType::$d;

                fn from_f64(value: f64) -> Self {
                    value as $t
                }
                fn to_f64(self) -> f64 {
                    self as f64
                }
                fn zero() -> Self {
                    0.0
                }
                fn one() -> Self {
                    1.0
                }
                fn add(self, rhs: Self) -> Self {
                    self + rhs
                }
                fn sub(self, rhs: Self) -> Self {
                    self - rhs
                }
                fn mul(self, rhs: Self) -> Self {
                    self * rhs
                }
                fn div(self, rhs: Self) -> Self {
                    self / rhs
                }
                fn neg(self) -> Self {
                    -self
                }
            }
        )*
    };
}

impl_element_int!(i8 => I8, i16 => I16, i32 => I32, i64 => I64);
impl_element_float!(f32 => F32, f64 => F64);

impl Element for f16 {
    const DTYPE: DType = DType::F16;

    fn from_f64(value: f64) -> Self {
        f16::from_f64(value)
    }
    fn to_f64(self) -> f64 {
        f16::to_f64(self)
    }
    fn zero() -> Self {
        f16::ZERO
    }
    fn one() -> Self {
        f16::ONE
    }
    fn add(self, rhs: Self) -> Self {
        self + rhs
    }
    fn sub(self, rhs: Self) -> Self {
        self - rhs
    }
    fn mul(self, rhs: Self) -> Self {
        self * rhs
    }
    fn div(self, rhs: Self) -> Self {
        self / rhs
    }
    fn neg(self) -> Self {
        -self
    }
}

/// Expands `$body` once per element type, with `$t` bound to the Rust type
/// matching the runtime `DType` value.
#[macro_export]
macro_rules! dispatch_dtype {
    ($dtype:expr, $t:ident => $body:expr) => {
        match $dtype {
            $crate::DType::I8 => {
                type $t = i8;
                $body
            }
            $crate::DType::I16 => {
                type $t = i16;
                $body
            }
            $crate::DType::I32 => {
                type $t = i32;
                $body
            }
            $crate::DType::I64 => {
                type $t = i64;
                $body
            }
            $crate::DType::F16 => {
                type $t = $crate::half::f16;
                $body
            }
            $crate::DType::F32 => {
                type $t = f32;
                $body
            }
            $crate::DType::F64 => {
                type $t = f64;
                $body
            }
        }
    };
}

/// Convert host values of one element type into the bytes of another.
pub fn cast_to_bytes<T: Element>(data: &[T], target: DType) -> Vec<u8> {
    if T::DTYPE == target {
        return bytemuck::cast_slice(data).to_vec();
    }
    dispatch_dtype!(target, U => {
        let converted: Vec<U> = data.iter().map(|v| U::from_f64(v.to_f64())).collect();
        bytemuck::cast_slice(&converted).to_vec()
    })
}

/// Decode raw little-endian device bytes of `dtype` into `f64` values.
pub fn bytes_to_f64(bytes: &[u8], dtype: DType) -> Vec<f64> {
    dispatch_dtype!(dtype, U => {
        let values: Vec<U> = bytemuck::pod_collect_to_vec(bytes);
        values.into_iter().map(Element::to_f64).collect()
    })
}
