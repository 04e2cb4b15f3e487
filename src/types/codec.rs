//! Fixed-width little-endian encoding for page records.
//!
//! Leaf and internal pages store arrays of fixed-size records, so both
//! key and value types must encode to a known width. All integers are
//! little-endian on disk regardless of host order.

use crate::types::PageId;

/// A type with a fixed-width byte encoding.
pub trait FixedBytes: Clone {
    /// Encoded width in bytes
    const WIDTH: usize;

    /// Encode into `buf`, which is exactly `WIDTH` bytes
    fn write_to(&self, buf: &mut [u8]);

    /// Decode from `buf`, which is exactly `WIDTH` bytes
    fn read_from(buf: &[u8]) -> Self;
}

macro_rules! impl_fixed_bytes_int {
    ($($ty:ty),*) => {
        $(
            impl FixedBytes for $ty {
                const WIDTH: usize = std::mem::size_of::<$ty>();

                fn write_to(&self, buf: &mut [u8]) {
                    buf[..Self::WIDTH].copy_from_slice(&self.to_le_bytes());
                }

                fn read_from(buf: &[u8]) -> Self {
                    let mut raw = [0u8; std::mem::size_of::<$ty>()];
                    raw.copy_from_slice(&buf[..Self::WIDTH]);
                    <$ty>::from_le_bytes(raw)
                }
            }
        )*
    };
}

impl_fixed_bytes_int!(i32, u32, i64, u64);

impl FixedBytes for PageId {
    const WIDTH: usize = 4;

    fn write_to(&self, buf: &mut [u8]) {
        self.value().write_to(buf);
    }

    fn read_from(buf: &[u8]) -> Self {
        PageId::new(i32::read_from(buf))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_int_roundtrip() {
        let mut buf = [0u8; 8];
        0x1122_3344_5566_7788u64.write_to(&mut buf);
        assert_eq!(u64::read_from(&buf), 0x1122_3344_5566_7788);

        let mut buf = [0u8; 4];
        (-5i32).write_to(&mut buf);
        assert_eq!(i32::read_from(&buf), -5);
    }

    #[test]
    fn test_little_endian_layout() {
        let mut buf = [0u8; 4];
        0x0102_0304i32.write_to(&mut buf);
        assert_eq!(buf, [0x04, 0x03, 0x02, 0x01]);
    }

    #[test]
    fn test_page_id_roundtrip() {
        let mut buf = [0u8; 4];
        PageId::INVALID.write_to(&mut buf);
        assert_eq!(PageId::read_from(&buf), PageId::INVALID);
    }
}
