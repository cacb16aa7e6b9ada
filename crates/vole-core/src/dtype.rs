use std::fmt;

// DType — Element kind of a node's value and gradient
//
// Storage cells are always f32 on the CPU reference backend. The dtype
// decides two things:
//
//   1. The element size used for byte addressing (view offsets, memory size,
//      allocator budgets).
//   2. The precision values are rounded to when they are stored. F16 and BF16
//      tensors round every store through the `half` crate, so a half tensor
//      behaves numerically like real half storage.

/// Enum of all supported element data types.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum DType {
    F16,
    BF16,
    #[default]
    F32,
}

impl DType {
    /// Size of one element in bytes.
    pub fn size_in_bytes(&self) -> usize {
        match self {
            DType::F16 => 2,
            DType::BF16 => 2,
            DType::F32 => 4,
        }
    }

    /// Whether this is a half-precision type (F16 or BF16).
    pub fn is_half(&self) -> bool {
        matches!(self, DType::F16 | DType::BF16)
    }

    /// Round a value to the precision of this dtype.
    pub fn round(&self, v: f32) -> f32 {
        match self {
            DType::F32 => v,
            DType::F16 => half::f16::from_f32(v).to_f32(),
            DType::BF16 => half::bf16::from_f32(v).to_f32(),
        }
    }
}

impl fmt::Display for DType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            DType::F16 => "f16",
            DType::BF16 => "bf16",
            DType::F32 => "f32",
        };
        write!(f, "{}", s)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_dtype_size() {
        assert_eq!(DType::F16.size_in_bytes(), 2);
        assert_eq!(DType::BF16.size_in_bytes(), 2);
        assert_eq!(DType::F32.size_in_bytes(), 4);
    }

    #[test]
    fn test_dtype_round() {
        assert_eq!(DType::F32.round(0.1), 0.1);
        // 1/3 is not representable in 10 mantissa bits
        let third = 1.0f32 / 3.0;
        assert_ne!(DType::F16.round(third), third);
        assert!((DType::F16.round(third) - third).abs() < 1e-3);
        assert_eq!(DType::BF16.round(2.0), 2.0);
    }
}
