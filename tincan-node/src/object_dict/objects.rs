//! The object level access traits and the dictionary table

use tincan_common::{
    objects::{AccessType, DataType, ObjectCode, SubInfo},
    sdo::AbortCode,
};

use super::{ObjectFlagAccess, SubObjectAccess};

/// Byte level access to one object in the dictionary
///
/// Every entry in the dictionary implements this trait. Most implementations get it through
/// [`ProvidesSubObjects`]; communication objects implement it directly so they can validate
/// values before accepting them.
pub trait ObjectAccess: Sync + Send {
    /// Read bytes from a sub object, starting at `offset`
    ///
    /// Returns the number of bytes copied into `buf`, which may be less than `buf.len()` when the
    /// value is shorter. Reading past the end returns 0 bytes.
    fn read(&self, sub: u8, offset: usize, buf: &mut [u8]) -> Result<usize, AbortCode>;

    /// The number of bytes a full read of the sub object returns
    fn read_size(&self, sub: u8) -> Result<usize, AbortCode>;

    /// Write a complete value to a sub object
    ///
    /// # Errors
    ///
    /// - [`AbortCode::NoSuchSubIndex`] if the sub object does not exist
    /// - [`AbortCode::ReadOnly`] if it cannot be written
    /// - [`AbortCode::DataTypeMismatchLengthLow`] or [`AbortCode::DataTypeMismatchLengthHigh`]
    ///   when `data` has the wrong length
    /// - range and consistency errors such as [`AbortCode::InvalidValue`] for validated objects
    fn write(&self, sub: u8, data: &[u8]) -> Result<(), AbortCode>;

    /// Start a write which is delivered in several pieces
    ///
    /// Only large objects (strings, domains) support this. The default reports why the write is
    /// not possible.
    fn begin_partial(&self, sub: u8) -> Result<(), AbortCode> {
        match self.sub_info(sub) {
            Ok(info) if info.access_type.is_writable() => Err(AbortCode::UnsupportedAccess),
            Ok(_) => Err(AbortCode::ReadOnly),
            Err(_) => Err(AbortCode::NoSuchSubIndex),
        }
    }

    /// Write the next piece of a partial write
    ///
    /// Pieces arrive in order and only after a successful `begin_partial`.
    fn write_partial(&self, _sub: u8, _buf: &[u8]) -> Result<(), AbortCode> {
        Err(AbortCode::GeneralError)
    }

    /// Complete a partial write
    fn end_partial(&self, _sub: u8) -> Result<(), AbortCode> {
        Err(AbortCode::GeneralError)
    }

    /// The object code (VAR, ARRAY, RECORD...)
    fn object_code(&self) -> ObjectCode;

    /// Metadata of a sub object
    fn sub_info(&self, sub: u8) -> Result<SubInfo, AbortCode>;

    /// The highest sub index implemented by this object
    fn max_sub_number(&self) -> u8 {
        match self.object_code() {
            ObjectCode::Array | ObjectCode::Record => self.read_u8(0).unwrap_or(0),
            _ => 0,
        }
    }

    /// Mark a sub object as changed, for event driven TPDOs
    fn set_event_flag(&self, _sub: u8) -> Result<(), AbortCode> {
        Err(AbortCode::UnsupportedAccess)
    }

    /// Check whether a sub object was marked as changed before the last flag toggle
    fn read_event_flag(&self, _sub: u8) -> bool {
        false
    }

    /// Clear all event flags on this object
    fn clear_events(&self) {}

    /// Access type of a sub object
    fn access_type(&self, sub: u8) -> Result<AccessType, AbortCode> {
        Ok(self.sub_info(sub)?.access_type)
    }

    /// Data type of a sub object
    fn data_type(&self, sub: u8) -> Result<DataType, AbortCode> {
        Ok(self.sub_info(sub)?.data_type)
    }

    /// The allocated size of a sub object
    fn size(&self, sub: u8) -> Result<usize, AbortCode> {
        Ok(self.sub_info(sub)?.size)
    }

    /// The size of the value currently held by a sub object
    ///
    /// Only differs from [`ObjectAccess::size`] for strings, which end at the first zero byte.
    fn current_size(&self, sub: u8) -> Result<usize, AbortCode> {
        let size = self.size(sub)?;
        if !self.data_type(sub)?.is_str() {
            return Ok(size);
        }
        let mut chunk = [0u8; 8];
        let mut offset = 0;
        while offset < size {
            let n = self.read(sub, offset, &mut chunk[..(size - offset).min(8)])?;
            if let Some(pos) = chunk[..n].iter().position(|b| *b == 0) {
                return Ok(offset + pos);
            }
            if n == 0 {
                return Ok(offset);
            }
            offset += n;
        }
        Ok(size)
    }

    /// Read a sub object as a u32
    fn read_u32(&self, sub: u8) -> Result<u32, AbortCode> {
        let mut buf = [0; 4];
        self.read(sub, 0, &mut buf)?;
        Ok(u32::from_le_bytes(buf))
    }

    /// Read a sub object as a u16
    fn read_u16(&self, sub: u8) -> Result<u16, AbortCode> {
        let mut buf = [0; 2];
        self.read(sub, 0, &mut buf)?;
        Ok(u16::from_le_bytes(buf))
    }

    /// Read a sub object as a u8
    fn read_u8(&self, sub: u8) -> Result<u8, AbortCode> {
        let mut buf = [0; 1];
        self.read(sub, 0, &mut buf)?;
        Ok(buf[0])
    }

    /// Read a sub object as an i32
    fn read_i32(&self, sub: u8) -> Result<i32, AbortCode> {
        Ok(self.read_u32(sub)? as i32)
    }

    /// Read a sub object as an i16
    fn read_i16(&self, sub: u8) -> Result<i16, AbortCode> {
        Ok(self.read_u16(sub)? as i16)
    }

    /// Read a sub object as an i8
    fn read_i8(&self, sub: u8) -> Result<i8, AbortCode> {
        Ok(self.read_u8(sub)? as i8)
    }
}

/// Build an object out of individual sub objects
///
/// Anything implementing this trait (and `Sync + Send`) implements [`ObjectAccess`]. Access type
/// checks are done using the returned [`SubInfo`], so the sub objects themselves only deal with
/// bytes.
pub trait ProvidesSubObjects {
    /// Look up a sub object, returning its metadata and its storage
    fn get_sub_object(&self, sub: u8) -> Option<(SubInfo, &dyn SubObjectAccess)>;

    /// The event flags of this object, if it has any
    fn flags(&self) -> Option<&dyn ObjectFlagAccess> {
        None
    }

    /// The object code
    fn object_code(&self) -> ObjectCode;
}

impl<T: ProvidesSubObjects + Sync + Send> ObjectAccess for T {
    fn read(&self, sub: u8, offset: usize, buf: &mut [u8]) -> Result<usize, AbortCode> {
        let (info, field) = self.get_sub_object(sub).ok_or(AbortCode::NoSuchSubIndex)?;
        if !info.access_type.is_readable() {
            return Err(AbortCode::WriteOnly);
        }
        field.read(offset, buf)
    }

    fn read_size(&self, sub: u8) -> Result<usize, AbortCode> {
        let (_, field) = self.get_sub_object(sub).ok_or(AbortCode::NoSuchSubIndex)?;
        Ok(field.read_size())
    }

    fn write(&self, sub: u8, data: &[u8]) -> Result<(), AbortCode> {
        let (info, field) = self.get_sub_object(sub).ok_or(AbortCode::NoSuchSubIndex)?;
        if !info.access_type.is_writable() {
            return Err(AbortCode::ReadOnly);
        }
        field.write(data)
    }

    fn begin_partial(&self, sub: u8) -> Result<(), AbortCode> {
        let (info, field) = self.get_sub_object(sub).ok_or(AbortCode::NoSuchSubIndex)?;
        if !info.access_type.is_writable() {
            return Err(AbortCode::ReadOnly);
        }
        field.begin_partial()
    }

    fn write_partial(&self, sub: u8, buf: &[u8]) -> Result<(), AbortCode> {
        let (_, field) = self.get_sub_object(sub).ok_or(AbortCode::NoSuchSubIndex)?;
        field.write_partial(buf)
    }

    fn end_partial(&self, sub: u8) -> Result<(), AbortCode> {
        let (_, field) = self.get_sub_object(sub).ok_or(AbortCode::NoSuchSubIndex)?;
        field.end_partial()
    }

    fn object_code(&self) -> ObjectCode {
        ProvidesSubObjects::object_code(self)
    }

    fn sub_info(&self, sub: u8) -> Result<SubInfo, AbortCode> {
        self.get_sub_object(sub)
            .map(|(info, _)| info)
            .ok_or(AbortCode::NoSuchSubIndex)
    }

    fn set_event_flag(&self, sub: u8) -> Result<(), AbortCode> {
        let flags = self.flags().ok_or(AbortCode::UnsupportedAccess)?;
        flags.set_flag(sub);
        Ok(())
    }

    fn read_event_flag(&self, sub: u8) -> bool {
        self.flags().map(|f| f.get_flag(sub)).unwrap_or(false)
    }

    fn clear_events(&self) {
        if let Some(flags) = self.flags() {
            flags.clear();
        }
    }
}

/// One row of the object dictionary table
#[allow(missing_debug_implementations)]
#[derive(Clone, Copy)]
pub struct ODEntry<'a> {
    /// The object index
    pub index: u16,
    /// The object implementation
    pub data: &'a dyn ObjectAccess,
}

/// Look up an object by index
///
/// `table` must be sorted by index.
pub fn find_object<'a>(table: &[ODEntry<'a>], index: u16) -> Option<&'a dyn ObjectAccess> {
    find_object_entry(table, index).map(|entry| entry.data)
}

/// Look up a table row by index
///
/// `table` must be sorted by index.
pub fn find_object_entry<'a, 'b>(table: &'b [ODEntry<'a>], index: u16) -> Option<&'b ODEntry<'a>> {
    table
        .binary_search_by_key(&index, |e| e.index)
        .ok()
        .map(|i| &table[i])
}

/// Returns true if every index in `table` is larger than the one before it
pub fn is_sorted(table: &[ODEntry]) -> bool {
    table.windows(2).all(|w| w[0].index < w[1].index)
}
