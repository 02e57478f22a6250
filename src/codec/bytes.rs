//! Codecs for plain-old-data, byte strings and UTF-8 strings.

use std::marker::PhantomData;
use std::mem;

use bytemuck::Pod;

use crate::codec::{hash64, KeyCodec, PersistKey, PersistValue, ValueCodec};
use crate::status::Status;

/// Codec that copies the in-memory representation of a `Pod` type.
pub struct BlittableCodec<T>(PhantomData<T>);

fn decode_pod<T: Pod>(encoded: &[u8]) -> Result<T, Status> {
    if encoded.len() != mem::size_of::<T>() {
        return Err(Status::Corruption);
    }
    Ok(bytemuck::pod_read_unaligned(encoded))
}

impl<T: Pod + Send + Sync> KeyCodec<T> for BlittableCodec<T> {
    const IS_FIXED: bool = true;
    const FIXED_LEN: usize = mem::size_of::<T>();

    fn encoded_len(_key: &T) -> Result<usize, Status> {
        Ok(mem::size_of::<T>())
    }

    fn encode_into(key: &T, dst: &mut [u8]) -> Result<(), Status> {
        dst.copy_from_slice(bytemuck::bytes_of(key));
        Ok(())
    }

    fn equals_encoded(encoded: &[u8], key: &T) -> Result<bool, Status> {
        Ok(encoded == bytemuck::bytes_of(key))
    }

    fn decode(encoded: &[u8]) -> Result<T, Status> {
        decode_pod(encoded)
    }

    #[inline]
    fn hash(key: &T) -> Result<u64, Status> {
        Ok(hash64(bytemuck::bytes_of(key)))
    }
}

impl<T: Pod + Send + Sync> ValueCodec<T> for BlittableCodec<T> {
    const IS_FIXED: bool = true;
    const FIXED_LEN: usize = mem::size_of::<T>();

    fn encoded_len(_value: &T) -> Result<usize, Status> {
        Ok(mem::size_of::<T>())
    }

    fn encode_into(value: &T, dst: &mut [u8]) -> Result<(), Status> {
        dst.copy_from_slice(bytemuck::bytes_of(value));
        Ok(())
    }

    fn decode(encoded: &[u8]) -> Result<T, Status> {
        decode_pod(encoded)
    }
}

impl<T: Pod + Eq + Send + Sync> PersistKey for T {
    type Codec = BlittableCodec<T>;
}

impl<T: Pod + Send + Sync> PersistValue for T {
    type Codec = BlittableCodec<T>;
}

/// Opaque byte string stored without an envelope.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Default)]
pub struct RawBytes(pub bytes::Bytes);

impl RawBytes {
    /// Borrow the bytes.
    pub fn as_slice(&self) -> &[u8] {
        &self.0
    }

    /// Length in bytes.
    pub fn len(&self) -> usize {
        self.0.len()
    }

    /// True for an empty byte string.
    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

impl From<Vec<u8>> for RawBytes {
    fn from(value: Vec<u8>) -> Self {
        Self(bytes::Bytes::from(value))
    }
}

impl From<&[u8]> for RawBytes {
    fn from(value: &[u8]) -> Self {
        Self(bytes::Bytes::copy_from_slice(value))
    }
}

/// UTF-8 string stored as its bytes.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Default)]
pub struct Utf8(pub String);

impl Utf8 {
    /// Borrow the string.
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl From<&str> for Utf8 {
    fn from(value: &str) -> Self {
        Self(value.to_string())
    }
}

impl From<String> for Utf8 {
    fn from(value: String) -> Self {
        Self(value)
    }
}

/// Codec for [`RawBytes`].
pub struct RawBytesCodec;

/// Codec for [`Utf8`].
pub struct Utf8Codec;

// Both wrappers are variable-length and encode as their underlying bytes; only decoding
// differs.
macro_rules! byte_string_codec {
    ($codec:ty, $ty:ty, |$bytes:ident| $decode:expr) => {
        impl KeyCodec<$ty> for $codec {
            const IS_FIXED: bool = false;
            const FIXED_LEN: usize = 0;

            fn encoded_len(key: &$ty) -> Result<usize, Status> {
                Ok(key.0.len())
            }

            fn encode_into(key: &$ty, dst: &mut [u8]) -> Result<(), Status> {
                dst.copy_from_slice(key.0.as_ref());
                Ok(())
            }

            fn equals_encoded(encoded: &[u8], key: &$ty) -> Result<bool, Status> {
                let raw: &[u8] = key.0.as_ref();
                Ok(encoded == raw)
            }

            fn decode($bytes: &[u8]) -> Result<$ty, Status> {
                $decode
            }

            fn hash(key: &$ty) -> Result<u64, Status> {
                Ok(hash64(key.0.as_ref()))
            }
        }

        impl ValueCodec<$ty> for $codec {
            const IS_FIXED: bool = false;
            const FIXED_LEN: usize = 0;

            fn encoded_len(value: &$ty) -> Result<usize, Status> {
                Ok(value.0.len())
            }

            fn encode_into(value: &$ty, dst: &mut [u8]) -> Result<(), Status> {
                dst.copy_from_slice(value.0.as_ref());
                Ok(())
            }

            fn decode($bytes: &[u8]) -> Result<$ty, Status> {
                $decode
            }
        }

        impl PersistKey for $ty {
            type Codec = $codec;
        }

        impl PersistValue for $ty {
            type Codec = $codec;
        }
    };
}

byte_string_codec!(RawBytesCodec, RawBytes, |bytes| Ok(RawBytes::from(bytes)));
byte_string_codec!(Utf8Codec, Utf8, |bytes| std::str::from_utf8(bytes)
    .map(Utf8::from)
    .map_err(|_| Status::Corruption));

#[cfg(test)]
mod tests {
    use super::*;

    #[derive(Clone, Copy, PartialEq, Eq, Debug, bytemuck::Pod, bytemuck::Zeroable)]
    #[repr(C)]
    struct Pair {
        a: i64,
        b: i64,
    }

    #[test]
    fn test_pod_struct_codec() {
        let pair = Pair { a: 13, b: -4 };
        let mut buf = [0u8; 16];
        <BlittableCodec<Pair> as KeyCodec<Pair>>::encode_into(&pair, &mut buf).unwrap();
        assert!(<BlittableCodec<Pair> as KeyCodec<Pair>>::equals_encoded(&buf, &pair).unwrap());
        let back = <BlittableCodec<Pair> as KeyCodec<Pair>>::decode(&buf).unwrap();
        assert_eq!(back, pair);
    }

    #[test]
    fn test_pod_decode_rejects_wrong_length() {
        let res = <BlittableCodec<u64> as ValueCodec<u64>>::decode(&[0u8; 5]);
        assert_eq!(res, Err(Status::Corruption));
    }

    #[test]
    fn test_utf8_rejects_invalid_bytes() {
        assert_eq!(
            <Utf8Codec as ValueCodec<Utf8>>::decode(&[0xff, 0xfe]),
            Err(Status::Corruption)
        );
        let ok = <Utf8Codec as ValueCodec<Utf8>>::decode(b"log").unwrap();
        assert_eq!(ok.as_str(), "log");
    }

    #[test]
    fn test_raw_bytes_equality() {
        let key = RawBytes::from(&b"abc"[..]);
        assert!(<RawBytesCodec as KeyCodec<RawBytes>>::equals_encoded(b"abc", &key).unwrap());
        assert!(!<RawBytesCodec as KeyCodec<RawBytes>>::equals_encoded(b"abd", &key).unwrap());
        assert_eq!(key.len(), 3);
    }
}
