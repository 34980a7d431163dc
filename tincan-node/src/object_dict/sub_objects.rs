//! Storage types for individual sub objects

use core::cell::UnsafeCell;

use tincan_common::{sdo::AbortCode, AtomicCell};

/// Byte level access to the storage behind one sub object
///
/// Access type checks are done by the owning object, so implementations only move bytes and
/// validate lengths and values.
pub trait SubObjectAccess: Sync + Send {
    /// Copy bytes starting at `offset` into `buf`, returning how many were copied
    ///
    /// Partial reads must be supported. Reading at or past the end returns `Ok(0)`.
    fn read(&self, offset: usize, buf: &mut [u8]) -> Result<usize, AbortCode>;

    /// The number of bytes a full read returns
    fn read_size(&self) -> usize;

    /// Replace the value
    ///
    /// Fixed size values require `data.len()` to match exactly. Strings and domains accept shorter
    /// data.
    fn write(&self, data: &[u8]) -> Result<(), AbortCode>;

    /// Begin a write split into several pieces
    ///
    /// The sequence is always one `begin_partial`, any number of `write_partial`, one
    /// `end_partial`. The caller must not interleave other writes.
    fn begin_partial(&self) -> Result<(), AbortCode> {
        Err(AbortCode::UnsupportedAccess)
    }

    /// Append the next piece of a partial write
    fn write_partial(&self, _buf: &[u8]) -> Result<(), AbortCode> {
        Err(AbortCode::UnsupportedAccess)
    }

    /// Finish a partial write
    fn end_partial(&self) -> Result<(), AbortCode> {
        Err(AbortCode::UnsupportedAccess)
    }
}

pub(crate) fn copy_from_offset(src: &[u8], offset: usize, buf: &mut [u8]) -> usize {
    if offset >= src.len() {
        return 0;
    }
    let n = buf.len().min(src.len() - offset);
    buf[..n].copy_from_slice(&src[offset..offset + n]);
    n
}

fn length_error(expected: usize, actual: usize) -> AbortCode {
    if actual < expected {
        AbortCode::DataTypeMismatchLengthLow
    } else {
        AbortCode::DataTypeMismatchLengthHigh
    }
}

pub(crate) fn decode_u32(data: &[u8]) -> Result<u32, AbortCode> {
    let bytes = data.try_into().map_err(|_| length_error(4, data.len()))?;
    Ok(u32::from_le_bytes(bytes))
}

pub(crate) fn decode_u16(data: &[u8]) -> Result<u16, AbortCode> {
    let bytes = data.try_into().map_err(|_| length_error(2, data.len()))?;
    Ok(u16::from_le_bytes(bytes))
}

pub(crate) fn decode_u8(data: &[u8]) -> Result<u8, AbortCode> {
    match data {
        [b] => Ok(*b),
        _ => Err(length_error(1, data.len())),
    }
}

/// A sub object holding one primitive value
#[allow(missing_debug_implementations)]
pub struct ScalarField<T: Copy> {
    value: AtomicCell<T>,
}

impl<T: Send + Copy> ScalarField<T> {
    /// Read the value
    pub fn load(&self) -> T {
        self.value.load()
    }

    /// Replace the value
    pub fn store(&self, value: T) {
        self.value.store(value);
    }
}

impl<T: Copy + Default + Send> Default for ScalarField<T> {
    fn default() -> Self {
        Self {
            value: AtomicCell::default(),
        }
    }
}

macro_rules! impl_scalar_field {
    ($($rust_type: ty),*) => {$(
        impl ScalarField<$rust_type> {
            /// Create a field holding `value`
            pub const fn new(value: $rust_type) -> Self {
                Self {
                    value: AtomicCell::new(value),
                }
            }
        }

        impl SubObjectAccess for ScalarField<$rust_type> {
            fn read(&self, offset: usize, buf: &mut [u8]) -> Result<usize, AbortCode> {
                Ok(copy_from_offset(&self.value.load().to_le_bytes(), offset, buf))
            }

            fn read_size(&self) -> usize {
                core::mem::size_of::<$rust_type>()
            }

            fn write(&self, data: &[u8]) -> Result<(), AbortCode> {
                const N: usize = core::mem::size_of::<$rust_type>();
                let bytes: [u8; N] = data.try_into().map_err(|_| length_error(N, data.len()))?;
                self.value.store(<$rust_type>::from_le_bytes(bytes));
                Ok(())
            }
        }
    )*};
}

impl_scalar_field!(u8, u16, u32, i8, i16, i32, f32);

impl ScalarField<bool> {
    /// Create a field holding `value`
    pub const fn new(value: bool) -> Self {
        Self {
            value: AtomicCell::new(value),
        }
    }
}

impl SubObjectAccess for ScalarField<bool> {
    fn read(&self, offset: usize, buf: &mut [u8]) -> Result<usize, AbortCode> {
        Ok(copy_from_offset(&[self.value.load() as u8], offset, buf))
    }

    fn read_size(&self) -> usize {
        1
    }

    fn write(&self, data: &[u8]) -> Result<(), AbortCode> {
        match data {
            [0] => self.value.store(false),
            [1] => self.value.store(true),
            [_] => return Err(AbortCode::InvalidValue),
            _ => return Err(length_error(1, data.len())),
        }
        Ok(())
    }
}

/// A fixed size byte array, used for octet strings and domains
///
/// Writes may be shorter than `N`, in which case the trailing bytes keep their old value.
#[allow(clippy::len_without_is_empty, missing_debug_implementations)]
pub struct ByteField<const N: usize> {
    value: UnsafeCell<[u8; N]>,
    write_offset: AtomicCell<Option<usize>>,
}

// Safety: every access to `value` happens inside a critical section
unsafe impl<const N: usize> Sync for ByteField<N> {}

impl<const N: usize> ByteField<N> {
    /// Create a field holding `value`
    pub const fn new(value: [u8; N]) -> Self {
        Self {
            value: UnsafeCell::new(value),
            write_offset: AtomicCell::new(None),
        }
    }

    /// The allocated size
    pub fn len(&self) -> usize {
        N
    }

    /// Replace the whole array, cancelling any partial write
    pub fn store(&self, value: [u8; N]) {
        self.write_offset.store(None);
        critical_section::with(|_| unsafe { *self.value.get() = value });
    }

    /// Copy out the whole array
    pub fn load(&self) -> [u8; N] {
        critical_section::with(|_| unsafe { *self.value.get() })
    }

    fn with_bytes<R>(&self, f: impl FnOnce(&mut [u8; N]) -> R) -> R {
        critical_section::with(|_| f(unsafe { &mut *self.value.get() }))
    }
}

impl<const N: usize> Default for ByteField<N> {
    fn default() -> Self {
        Self::new([0; N])
    }
}

impl<const N: usize> SubObjectAccess for ByteField<N> {
    fn read(&self, offset: usize, buf: &mut [u8]) -> Result<usize, AbortCode> {
        Ok(self.with_bytes(|bytes| copy_from_offset(bytes, offset, buf)))
    }

    fn read_size(&self) -> usize {
        N
    }

    fn write(&self, data: &[u8]) -> Result<(), AbortCode> {
        if data.len() > N {
            return Err(AbortCode::DataTypeMismatchLengthHigh);
        }
        self.with_bytes(|bytes| bytes[..data.len()].copy_from_slice(data));
        Ok(())
    }

    fn begin_partial(&self) -> Result<(), AbortCode> {
        self.write_offset.store(Some(0));
        Ok(())
    }

    fn write_partial(&self, buf: &[u8]) -> Result<(), AbortCode> {
        let offset = self
            .write_offset
            .fetch_update(|old| old.map(|x| Some(x + buf.len())))
            .map_err(|_| AbortCode::GeneralError)?
            .ok_or(AbortCode::GeneralError)?;
        if offset + buf.len() > N {
            self.write_offset.store(None);
            return Err(AbortCode::DataTypeMismatchLengthHigh);
        }
        self.with_bytes(|bytes| bytes[offset..offset + buf.len()].copy_from_slice(buf));
        Ok(())
    }

    fn end_partial(&self) -> Result<(), AbortCode> {
        self.write_offset.store(None);
        Ok(())
    }
}

/// A string field where a zero byte marks the end of a shorter value
#[allow(clippy::len_without_is_empty, missing_debug_implementations)]
pub struct NullTermByteField<const N: usize>(ByteField<N>);

impl<const N: usize> NullTermByteField<N> {
    /// Create a field holding `value`
    pub const fn new(value: [u8; N]) -> Self {
        Self(ByteField::new(value))
    }

    /// The allocated size
    pub fn len(&self) -> usize {
        N
    }

    /// Copy out the whole array, including anything after the terminator
    pub fn load(&self) -> [u8; N] {
        self.0.load()
    }

    /// Replace the whole array
    pub fn store(&self, value: [u8; N]) {
        self.0.store(value);
    }

    /// Store a string, terminating it if it is shorter than the field
    pub fn set_str(&self, value: &[u8]) -> Result<(), AbortCode> {
        SubObjectAccess::write(self, value)
    }
}

impl<const N: usize> Default for NullTermByteField<N> {
    fn default() -> Self {
        Self(ByteField::default())
    }
}

impl<const N: usize> SubObjectAccess for NullTermByteField<N> {
    fn read(&self, offset: usize, buf: &mut [u8]) -> Result<usize, AbortCode> {
        let size = self.read_size();
        if offset >= size {
            return Ok(0);
        }
        let n = buf.len().min(size - offset);
        self.0.read(offset, &mut buf[..n])
    }

    fn read_size(&self) -> usize {
        self.0
            .with_bytes(|bytes| bytes.iter().position(|b| *b == 0).unwrap_or(N))
    }

    fn write(&self, data: &[u8]) -> Result<(), AbortCode> {
        if data.len() > N {
            return Err(AbortCode::DataTypeMismatchLengthHigh);
        }
        self.0.with_bytes(|bytes| {
            bytes[..data.len()].copy_from_slice(data);
            if data.len() < N {
                bytes[data.len()] = 0;
            }
        });
        Ok(())
    }

    fn begin_partial(&self) -> Result<(), AbortCode> {
        self.0.begin_partial()
    }

    fn write_partial(&self, data: &[u8]) -> Result<(), AbortCode> {
        self.0.write_partial(data)
    }

    fn end_partial(&self) -> Result<(), AbortCode> {
        if let Some(written) = self.0.write_offset.load() {
            if written < N {
                self.0.with_bytes(|bytes| bytes[written] = 0);
            }
        }
        self.0.end_partial()
    }
}

/// A read-only sub object holding its bytes inline
///
/// Build it from `to_le_bytes()` of the value.
#[derive(Clone, Copy, Debug)]
pub struct ConstField<const N: usize> {
    bytes: [u8; N],
}

impl<const N: usize> ConstField<N> {
    /// Create a const field
    pub const fn new(bytes: [u8; N]) -> Self {
        Self { bytes }
    }
}

impl<const N: usize> SubObjectAccess for ConstField<N> {
    fn read(&self, offset: usize, buf: &mut [u8]) -> Result<usize, AbortCode> {
        Ok(copy_from_offset(&self.bytes, offset, buf))
    }

    fn read_size(&self) -> usize {
        N
    }

    fn write(&self, _data: &[u8]) -> Result<(), AbortCode> {
        Err(AbortCode::ReadOnly)
    }
}
