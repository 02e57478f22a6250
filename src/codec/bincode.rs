//! Serde types persisted through bincode.

use std::marker::PhantomData;

use serde::de::DeserializeOwned;
use serde::Serialize;

use crate::codec::{hash64, KeyCodec, PersistKey, PersistValue, ValueCodec};
use crate::status::Status;

/// Wrapper that stores any serde type as its bincode encoding.
///
/// Values wrapped this way are variable-size and live in the object log.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Default)]
pub struct Bincode<T>(pub T);

/// Codec behind [`Bincode`].
pub struct BincodeCodec<T>(PhantomData<T>);

fn serialized_len<T: Serialize>(value: &T) -> Result<usize, Status> {
    let len = bincode::serialized_size(value).map_err(|_| Status::InvalidArgument)?;
    usize::try_from(len).map_err(|_| Status::OutOfMemory)
}

fn serialize_exact<T: Serialize>(value: &T, dst: &mut [u8]) -> Result<(), Status> {
    if dst.len() != serialized_len(value)? {
        return Err(Status::InvalidArgument);
    }
    let mut cursor = std::io::Cursor::new(dst);
    bincode::serialize_into(&mut cursor, value).map_err(|_| Status::InvalidArgument)
}

impl<T> KeyCodec<Bincode<T>> for BincodeCodec<T>
where
    T: Serialize + DeserializeOwned + Eq + Send + Sync + 'static,
{
    const IS_FIXED: bool = false;
    const FIXED_LEN: usize = 0;

    fn encoded_len(key: &Bincode<T>) -> Result<usize, Status> {
        serialized_len(&key.0)
    }

    fn encode_into(key: &Bincode<T>, dst: &mut [u8]) -> Result<(), Status> {
        serialize_exact(&key.0, dst)
    }

    fn equals_encoded(encoded: &[u8], key: &Bincode<T>) -> Result<bool, Status> {
        let stored: T = bincode::deserialize(encoded).map_err(|_| Status::Corruption)?;
        Ok(stored == key.0)
    }

    fn decode(encoded: &[u8]) -> Result<Bincode<T>, Status> {
        bincode::deserialize(encoded)
            .map(Bincode)
            .map_err(|_| Status::Corruption)
    }

    fn hash(key: &Bincode<T>) -> Result<u64, Status> {
        let bytes = bincode::serialize(&key.0).map_err(|_| Status::InvalidArgument)?;
        Ok(hash64(&bytes))
    }
}

impl<T> ValueCodec<Bincode<T>> for BincodeCodec<T>
where
    T: Serialize + DeserializeOwned + Send + Sync + 'static,
{
    const IS_FIXED: bool = false;
    const FIXED_LEN: usize = 0;

    fn encoded_len(value: &Bincode<T>) -> Result<usize, Status> {
        serialized_len(&value.0)
    }

    fn encode_into(value: &Bincode<T>, dst: &mut [u8]) -> Result<(), Status> {
        serialize_exact(&value.0, dst)
    }

    fn decode(encoded: &[u8]) -> Result<Bincode<T>, Status> {
        bincode::deserialize(encoded)
            .map(Bincode)
            .map_err(|_| Status::Corruption)
    }
}

impl<T> PersistKey for Bincode<T>
where
    T: Serialize + DeserializeOwned + Clone + Eq + Send + Sync + 'static,
{
    type Codec = BincodeCodec<T>;
}

impl<T> PersistValue for Bincode<T>
where
    T: Serialize + DeserializeOwned + Clone + Send + Sync + 'static,
{
    type Codec = BincodeCodec<T>;
}
