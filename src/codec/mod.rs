//! Key and value serialization.
//!
//! Every key and value crosses the persistence boundary as bytes. A type picks its
//! codec through [`PersistKey`] / [`PersistValue`]. Fixed-size codecs store values inline
//! in the hybrid log and allow in-place updates; variable-size values are routed to the
//! object log and only a reference is stored inline.

mod bincode;
mod bytes;
mod hash;

pub use self::bincode::{Bincode, BincodeCodec};
pub use self::bytes::{BlittableCodec, RawBytes, RawBytesCodec, Utf8, Utf8Codec};
pub use self::hash::hash64;

use crate::status::Status;

/// Binds a key type to its codec.
pub trait PersistKey: Clone + Eq + Send + Sync + 'static {
    /// Codec used for this key type.
    type Codec: KeyCodec<Self>;
}

/// Binds a value type to its codec.
pub trait PersistValue: Clone + Send + Sync + 'static {
    /// Codec used for this value type.
    type Codec: ValueCodec<Self>;
}

/// Encoding, equality and hashing for keys.
pub trait KeyCodec<K>: Send + Sync + 'static {
    /// True when every key encodes to `FIXED_LEN` bytes.
    const IS_FIXED: bool;
    /// Encoded length when `IS_FIXED`, zero otherwise.
    const FIXED_LEN: usize;

    /// Number of bytes `encode_into` will write.
    fn encoded_len(key: &K) -> Result<usize, Status>;

    /// Write the key into `dst`, which is exactly `encoded_len(key)` bytes long.
    fn encode_into(key: &K, dst: &mut [u8]) -> Result<(), Status>;

    /// Compare a key stored in the log against `key`.
    fn equals_encoded(encoded: &[u8], key: &K) -> Result<bool, Status>;

    /// Rebuild a key from its stored bytes.
    fn decode(encoded: &[u8]) -> Result<K, Status>;

    /// Hash of a typed key. Must agree with `hash64` over the encoded bytes.
    fn hash(key: &K) -> Result<u64, Status> {
        Ok(hash64(&encode_key::<K, Self>(key)?))
    }
}

/// Encoding for values.
pub trait ValueCodec<V>: Send + Sync + 'static {
    /// True when every value encodes to `FIXED_LEN` bytes.
    const IS_FIXED: bool;
    /// Encoded length when `IS_FIXED`, zero otherwise.
    const FIXED_LEN: usize;

    /// Number of bytes `encode_into` will write.
    fn encoded_len(value: &V) -> Result<usize, Status>;

    /// Write the value into `dst`, which is exactly `encoded_len(value)` bytes long.
    fn encode_into(value: &V, dst: &mut [u8]) -> Result<(), Status>;

    /// Rebuild a value from its stored bytes.
    fn decode(encoded: &[u8]) -> Result<V, Status>;
}

/// Encode a key into a fresh buffer.
pub fn encode_key<K, C: KeyCodec<K> + ?Sized>(key: &K) -> Result<Vec<u8>, Status> {
    let mut buf = vec![0u8; C::encoded_len(key)?];
    C::encode_into(key, &mut buf)?;
    Ok(buf)
}

/// Encode a value into a fresh buffer.
pub fn encode_value<V, C: ValueCodec<V> + ?Sized>(value: &V) -> Result<Vec<u8>, Status> {
    let mut buf = vec![0u8; C::encoded_len(value)?];
    C::encode_into(value, &mut buf)?;
    Ok(buf)
}
