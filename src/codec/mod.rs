//! # Key/Value Codec Contract
//!
//! This module defines the serialization contract between user-supplied key
//! and value types and the rest of the engine. The engine treats encoded
//! bytes as opaque: it only ever asks a type to write itself to a byte sink,
//! read a fresh instance back from a byte source, and report how many bytes
//! its encoding occupies. Payload bytes are produced and consumed exclusively
//! by the data file; the tree file never sees them.
//!
//! ## Wire Formats
//!
//! The provided implementations fix the following byte-level encodings. They
//! are part of the on-disk format: changing any of them breaks compatibility
//! with existing data files.
//!
//! | Type            | Encoding                                        |
//! |-----------------|-------------------------------------------------|
//! | `u32`/`i32`/... | raw little-endian bytes, fixed width            |
//! | `String`        | u64-LE byte length, then the UTF-8 bytes        |
//! | `Vec<T>`        | u64-LE element count, then each element in turn |
//!
//! All length/count prefixes use the same 8-byte little-endian word the
//! tree-file format uses.
//!
//! ## Writing Your Own
//!
//! `read_from` must consume exactly the bytes `write_to` produced, and
//! `serialized_size` must report exactly that count. The engine reads
//! payloads at offsets recorded during writes, so an encoding that
//! over-reads will land the next read in the middle of a neighbour's bytes.
//!
//! ## Error Handling
//!
//! Decode errors (truncated input, invalid UTF-8) surface as `eyre` errors
//! and are treated by callers as data-file corruption.

use std::io::{Read, Write};

use eyre::{Result, WrapErr};

/// Serialization contract for keys and values stored in the tree.
///
/// Implementations must be deterministic and self-delimiting: the byte count
/// written by `write_to`, consumed by `read_from`, and reported by
/// `serialized_size` must all agree.
pub trait Codec: Clone {
    fn write_to<W: Write>(&self, w: &mut W) -> Result<()>;

    fn read_from<R: Read>(r: &mut R) -> Result<Self>;

    /// Exact number of bytes `write_to` produces for this value.
    fn serialized_size(&self) -> usize;
}

macro_rules! impl_codec_for_int {
    ($($ty:ty),* $(,)?) => {
        $(
            impl Codec for $ty {
                fn write_to<W: Write>(&self, w: &mut W) -> Result<()> {
                    w.write_all(&self.to_le_bytes())
                        .wrap_err(concat!("failed to write ", stringify!($ty)))
                }

                fn read_from<R: Read>(r: &mut R) -> Result<Self> {
                    let mut buf = [0u8; std::mem::size_of::<$ty>()];
                    r.read_exact(&mut buf)
                        .wrap_err(concat!("failed to read ", stringify!($ty)))?;
                    Ok(<$ty>::from_le_bytes(buf))
                }

                fn serialized_size(&self) -> usize {
                    std::mem::size_of::<$ty>()
                }
            }
        )*
    };
}

impl_codec_for_int!(u8, u16, u32, u64, i8, i16, i32, i64);

impl Codec for String {
    fn write_to<W: Write>(&self, w: &mut W) -> Result<()> {
        (self.len() as u64).write_to(w)?;
        w.write_all(self.as_bytes())
            .wrap_err("failed to write string bytes")
    }

    fn read_from<R: Read>(r: &mut R) -> Result<Self> {
        let len = u64::read_from(r)? as usize;
        let mut buf = vec![0u8; len];
        r.read_exact(&mut buf)
            .wrap_err_with(|| format!("failed to read {} string bytes", len))?;
        String::from_utf8(buf).wrap_err("string payload is not valid UTF-8")
    }

    fn serialized_size(&self) -> usize {
        std::mem::size_of::<u64>() + self.len()
    }
}

impl<T: Codec> Codec for Vec<T> {
    fn write_to<W: Write>(&self, w: &mut W) -> Result<()> {
        (self.len() as u64).write_to(w)?;
        for elem in self {
            elem.write_to(w)?;
        }
        Ok(())
    }

    fn read_from<R: Read>(r: &mut R) -> Result<Self> {
        let count = u64::read_from(r)? as usize;
        let mut out = Vec::with_capacity(count.min(1024));
        for _ in 0..count {
            out.push(T::read_from(r)?);
        }
        Ok(out)
    }

    fn serialized_size(&self) -> usize {
        std::mem::size_of::<u64>() + self.iter().map(Codec::serialized_size).sum::<usize>()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn round_trip<T: Codec + PartialEq + std::fmt::Debug>(value: T) {
        let mut buf = Vec::new();
        value.write_to(&mut buf).unwrap();
        assert_eq!(buf.len(), value.serialized_size());

        let decoded = T::read_from(&mut buf.as_slice()).unwrap();
        assert_eq!(decoded, value);
    }

    #[test]
    fn int_round_trips() {
        round_trip(0u32);
        round_trip(u32::MAX);
        round_trip(-1i32);
        round_trip(i64::MIN);
        round_trip(0xDEAD_BEEF_u64);
    }

    #[test]
    fn int_encoding_is_little_endian() {
        let mut buf = Vec::new();
        0x0102_0304_u32.write_to(&mut buf).unwrap();
        assert_eq!(buf, [0x04, 0x03, 0x02, 0x01]);
    }

    #[test]
    fn string_round_trips() {
        round_trip(String::new());
        round_trip("hello".to_string());
        round_trip("ключ".to_string());
    }

    #[test]
    fn string_encoding_is_length_prefixed() {
        let mut buf = Vec::new();
        "ab".to_string().write_to(&mut buf).unwrap();
        assert_eq!(buf, [2, 0, 0, 0, 0, 0, 0, 0, b'a', b'b']);
    }

    #[test]
    fn vec_round_trips() {
        round_trip(Vec::<u32>::new());
        round_trip(vec![1u32, 2, 3]);
        round_trip(vec!["a".to_string(), String::new(), "ccc".to_string()]);
    }

    #[test]
    fn truncated_input_is_an_error() {
        let mut buf = Vec::new();
        "hello".to_string().write_to(&mut buf).unwrap();
        buf.truncate(buf.len() - 1);

        assert!(String::read_from(&mut buf.as_slice()).is_err());
    }

    #[test]
    fn invalid_utf8_is_an_error() {
        let mut buf = Vec::new();
        (2u64).write_to(&mut buf).unwrap();
        buf.extend_from_slice(&[0xFF, 0xFE]);

        assert!(String::read_from(&mut buf.as_slice()).is_err());
    }
}
