//! `index.dat` image of the hash table.
//!
//! Layout, all little-endian `u64`:
//!
//! ```text
//! table_size | table_size buckets | overflow_count | overflow_count buckets
//! ```
//!
//! A bucket is eight words: seven entries then the overflow link. The image is fuzzy:
//! entries may change while it is written. Recovery repairs it from the log.

use std::io::{self, Read, Write};

use crate::index::{GrowConfig, HashBucket, InternalHashTable};
use crate::status::Status;

use super::MemHashIndex;

/// What was written by [`MemHashIndex::checkpoint`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct IndexCheckpointInfo {
    pub table_size: u64,
    pub overflow_buckets: u64,
    pub bytes_written: u64,
}

fn write_bucket<W: Write>(writer: &mut W, bucket: &HashBucket) -> io::Result<()> {
    for word in bucket.to_words() {
        writer.write_all(&word.to_le_bytes())?;
    }
    Ok(())
}

fn read_word<R: Read>(reader: &mut R) -> io::Result<u64> {
    let mut buf = [0u8; 8];
    reader.read_exact(&mut buf)?;
    Ok(u64::from_le_bytes(buf))
}

fn read_bucket<R: Read>(reader: &mut R) -> io::Result<[u64; 8]> {
    let mut words = [0u64; 8];
    for word in words.iter_mut() {
        *word = read_word(reader)?;
    }
    Ok(words)
}

impl MemHashIndex {
    /// Write a fuzzy image of the table.
    pub fn checkpoint<W: Write>(&self, mut writer: W) -> io::Result<IndexCheckpointInfo> {
        let table = self.table();
        writer.write_all(&table.size().to_le_bytes())?;
        for index in 0..table.size() {
            write_bucket(&mut writer, table.bucket_at(index))?;
        }

        // Buckets allocated after this point are not in the image; links to them are
        // cut on recovery.
        let overflow_count = table.overflow_buckets();
        writer.write_all(&overflow_count.to_le_bytes())?;
        for number in 1..=overflow_count {
            match table.overflow_bucket(number) {
                Some(bucket) => write_bucket(&mut writer, bucket)?,
                None => writer.write_all(&[0u8; 64])?,
            }
        }
        writer.flush()?;

        Ok(IndexCheckpointInfo {
            table_size: table.size(),
            overflow_buckets: overflow_count,
            bytes_written: 16 + (table.size() + overflow_count) * 64,
        })
    }

    /// Rebuild an index from an image written by [`Self::checkpoint`].
    pub fn recover<R: Read>(mut reader: R, grow_config: GrowConfig) -> Result<Self, Status> {
        let table_size = read_word(&mut reader)?;
        let table = InternalHashTable::new(table_size).map_err(|_| Status::Corruption)?;

        let mut main = Vec::with_capacity(table_size as usize);
        for _ in 0..table_size {
            main.push(read_bucket(&mut reader)?);
        }
        let overflow_count = read_word(&mut reader)?;
        table.extend_overflow(overflow_count);

        let cut_dangling = |mut words: [u64; 8]| {
            if words[7] > overflow_count {
                words[7] = 0;
            }
            words
        };
        for (index, words) in main.into_iter().enumerate() {
            table.bucket_at(index as u64).load_words(&cut_dangling(words));
        }
        for number in 1..=overflow_count {
            let words = cut_dangling(read_bucket(&mut reader)?);
            let bucket = table.overflow_bucket(number).ok_or(Status::Corruption)?;
            bucket.load_words(&words);
        }

        let index = Self::from_table(table, grow_config);
        index.clear_tentative_entries();
        let stats = index.stats();
        tracing::debug!(
            table_size,
            overflow_count,
            used_entries = stats.used_entries,
            "hash index image loaded"
        );
        Ok(index)
    }
}
