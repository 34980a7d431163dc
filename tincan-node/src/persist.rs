//! Serialization of persisted sub objects
//!
//! Stored data is a sequence of records:
//!
//! | bytes | content |
//! |---|---|
//! | 2 | record length, not counting these two bytes |
//! | 1 | record kind, 1 for a sub object value |
//! | 2 | object index |
//! | 1 | sub index |
//! | n | value |
//!
//! The serializer is an `async fn` which produces one byte per poll, so a backend can pull the
//! data through [`embedded_io::Read`] in whatever chunk size suits its flash pages, without the
//! whole image ever existing in RAM.

use core::{
    cell::Cell,
    convert::Infallible,
    future::Future,
    pin::{pin, Pin},
    task::{Context, Poll},
};

use defmt_or_log::{info, warn};
use futures::{pending, task::noop_waker_ref};
use tincan_common::{objects::SubInfo, sdo::AbortCode};

use crate::{
    object_dict::{find_object, ODEntry, ObjectAccess},
    storage::StorageRegion,
};

const RECORD_OBJECT_VALUE: u8 = 1;
/// Kind, index and sub index
const RECORD_HEADER_LEN: usize = 4;

/// Visit every persisted sub object of `region`
fn persisted_subs<'a>(
    od: &'a [ODEntry<'a>],
    region: StorageRegion,
) -> impl Iterator<Item = (&'a ODEntry<'a>, u8, SubInfo)> + 'a {
    od.iter()
        .filter(move |entry| region.contains(entry.index))
        .flat_map(|entry| {
            // Sub 0 of arrays and records is the sub count, which is never stored
            let (first, last) = match entry.data.max_sub_number() {
                0 => (0, 0),
                max => (1, max),
            };
            (first..=last).filter_map(move |sub| {
                let info = entry.data.sub_info(sub).ok()?;
                info.storage.is_persisted().then_some((entry, sub, info))
            })
        })
}

/// The number of bytes [`serialize`] produces for `region`
pub fn serialized_size(od: &[ODEntry], region: StorageRegion) -> usize {
    persisted_subs(od, region)
        .map(|(entry, sub, _)| entry.data.current_size(sub).unwrap_or(0) + RECORD_HEADER_LEN + 2)
        .sum()
}

async fn write_bytes(bytes: &[u8], out: &Cell<u8>) {
    for b in bytes {
        out.set(*b);
        pending!()
    }
}

async fn serialize_sub(entry: &ODEntry<'_>, sub: u8, out: &Cell<u8>) {
    let size = entry.data.current_size(sub).unwrap_or(0);
    let record_len = (size + RECORD_HEADER_LEN) as u16;
    write_bytes(&record_len.to_le_bytes(), out).await;
    write_bytes(&[RECORD_OBJECT_VALUE], out).await;
    write_bytes(&entry.index.to_le_bytes(), out).await;
    write_bytes(&[sub], out).await;

    let mut chunk = [0u8; 8];
    let mut offset = 0;
    while offset < size {
        let want = (size - offset).min(chunk.len());
        // A value which shrank while being read is padded with zeros, so the length stays valid
        let n = entry
            .data
            .read(sub, offset, &mut chunk[..want])
            .unwrap_or(0);
        chunk[n..want].fill(0);
        write_bytes(&chunk[..want], out).await;
        offset += want;
    }
}

async fn serialize_region(od: &[ODEntry<'_>], region: StorageRegion, out: &Cell<u8>) {
    for (entry, sub, _) in persisted_subs(od, region) {
        serialize_sub(entry, sub, out).await;
    }
}

struct Serializer<'a, 'b, F: Future> {
    fut: Pin<&'a mut F>,
    out: &'b Cell<u8>,
    done: bool,
}

impl<F: Future> embedded_io::ErrorType for Serializer<'_, '_, F> {
    type Error = Infallible;
}

impl<F: Future> embedded_io::Read for Serializer<'_, '_, F> {
    fn read(&mut self, buf: &mut [u8]) -> Result<usize, Infallible> {
        let mut cx = Context::from_waker(noop_waker_ref());
        let mut pos = 0;
        while pos < buf.len() && !self.done {
            match self.fut.as_mut().poll(&mut cx) {
                Poll::Ready(_) => self.done = true,
                Poll::Pending => {
                    buf[pos] = self.out.get();
                    pos += 1;
                }
            }
        }
        Ok(pos)
    }
}

/// Serialize the persisted sub objects of `region`
///
/// `f` receives a reader returning the serialized data, and its total size.
pub fn serialize<R>(
    od: &[ODEntry<'_>],
    region: StorageRegion,
    f: impl FnOnce(&mut dyn embedded_io::Read<Error = Infallible>, usize) -> R,
) -> R {
    let out = Cell::new(0);
    let fut = pin!(serialize_region(od, region, &out));
    let mut reader = Serializer {
        fut,
        out: &out,
        done: false,
    };
    f(&mut reader, serialized_size(od, region))
}

/// One record of stored data
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StoredRecord<'a> {
    /// The value of a sub object
    ObjectValue {
        /// Object index
        index: u16,
        /// Sub index
        sub: u8,
        /// The stored bytes
        data: &'a [u8],
    },
    /// A record kind this version does not know, including the kind byte
    Unknown(&'a [u8]),
}

/// Iterates over the records in stored data
///
/// Iteration stops at the first truncated record.
#[derive(Debug, Clone)]
pub struct StoredRecords<'a> {
    buf: &'a [u8],
}

impl<'a> StoredRecords<'a> {
    /// Read records from `buf`
    pub fn new(buf: &'a [u8]) -> Self {
        Self { buf }
    }
}

impl<'a> Iterator for StoredRecords<'a> {
    type Item = StoredRecord<'a>;

    fn next(&mut self) -> Option<Self::Item> {
        let (len, rest) = self.buf.split_first_chunk::<2>()?;
        let len = u16::from_le_bytes(*len) as usize;
        if rest.len() < len || len == 0 {
            self.buf = &[];
            return None;
        }
        let (record, rest) = rest.split_at(len);
        self.buf = rest;

        if record[0] == RECORD_OBJECT_VALUE && record.len() >= RECORD_HEADER_LEN {
            Some(StoredRecord::ObjectValue {
                index: u16::from_le_bytes([record[1], record[2]]),
                sub: record[3],
                data: &record[RECORD_HEADER_LEN..],
            })
        } else {
            Some(StoredRecord::Unknown(record))
        }
    }
}

fn restore_value(obj: &dyn ObjectAccess, sub: u8, data: &[u8]) -> Result<(), AbortCode> {
    let info = obj.sub_info(sub)?;
    if !info.storage.is_persisted() {
        return Err(AbortCode::UnsupportedAccess);
    }
    // Strings are stored without their terminator
    if info.data_type.is_str() && data.len() < info.size {
        return match obj.write(sub, data) {
            Err(AbortCode::DataTypeMismatchLengthLow) => {
                obj.begin_partial(sub)?;
                obj.write_partial(sub, data)?;
                obj.end_partial(sub)
            }
            other => other,
        };
    }
    obj.write(sub, data)
}

/// Load values saved by [`serialize`] into the object dictionary
///
/// Records for objects missing from `od`, or which are no longer persisted, are skipped with a
/// warning. Returns the number of values restored.
pub fn restore_stored_objects(od: &[ODEntry<'_>], stored: &[u8]) -> usize {
    let mut restored = 0;
    for record in StoredRecords::new(stored) {
        match record {
            StoredRecord::ObjectValue { index, sub, data } => {
                let Some(obj) = find_object(od, index) else {
                    warn!("Stored object 0x{:x} not in the dictionary", index);
                    continue;
                };
                match restore_value(obj, sub, data) {
                    Ok(()) => {
                        info!("Restored 0x{:x}sub{}", index, sub);
                        restored += 1;
                    }
                    Err(abort_code) => warn!(
                        "Failed restoring 0x{:x}sub{}: 0x{:x}",
                        index, sub, abort_code as u32
                    ),
                }
            }
            StoredRecord::Unknown(record) => {
                warn!("Unknown stored record kind {}", record[0]);
            }
        }
    }
    restored
}
