//! Single value objects and write interception

use tincan_common::{
    objects::{ObjectCode, SubInfo},
    sdo::AbortCode,
};

use super::{ObjectAccess, ObjectFlagAccess, ProvidesSubObjects, SubObjectAccess};

/// A VAR object made of one sub object field
#[allow(missing_debug_implementations)]
pub struct VarObject<T> {
    info: SubInfo,
    field: T,
    flags: Option<&'static dyn ObjectFlagAccess>,
}

impl<T: SubObjectAccess> VarObject<T> {
    /// Create a VAR object described by `info`
    pub const fn new(info: SubInfo, field: T) -> Self {
        Self {
            info,
            field,
            flags: None,
        }
    }

    /// Create a VAR object with event flags, allowing it to trigger TPDOs
    pub const fn new_with_flags(
        info: SubInfo,
        field: T,
        flags: &'static dyn ObjectFlagAccess,
    ) -> Self {
        Self {
            info,
            field,
            flags: Some(flags),
        }
    }

    /// Access the underlying field
    pub fn field(&self) -> &T {
        &self.field
    }
}

impl<T: SubObjectAccess> ProvidesSubObjects for VarObject<T> {
    fn get_sub_object(&self, sub: u8) -> Option<(SubInfo, &dyn SubObjectAccess)> {
        (sub == 0).then_some((self.info, &self.field as &dyn SubObjectAccess))
    }

    fn flags(&self) -> Option<&dyn ObjectFlagAccess> {
        self.flags
    }

    fn object_code(&self) -> ObjectCode {
        ObjectCode::Var
    }
}

/// Intercepts writes to a [`HookedObject`]
///
/// This is how special actions tied to an object are implemented: the hook sees every complete
/// write before it reaches the object, and an error rejects the write with that abort code.
pub trait AccessHook: Sync + Send {
    /// Called before `data` is written to `sub`
    fn before_write(&self, sub: u8, data: &[u8]) -> Result<(), AbortCode>;

    /// Called after a write to `sub` succeeded
    fn after_write(&self, _sub: u8) {}
}

/// Wraps an object so that writes pass through an [`AccessHook`]
#[allow(missing_debug_implementations)]
pub struct HookedObject<'a> {
    inner: &'a dyn ObjectAccess,
    hook: &'a dyn AccessHook,
}

impl<'a> HookedObject<'a> {
    /// Hook writes to `inner`
    pub const fn new(inner: &'a dyn ObjectAccess, hook: &'a dyn AccessHook) -> Self {
        Self { inner, hook }
    }
}

impl ObjectAccess for HookedObject<'_> {
    fn read(&self, sub: u8, offset: usize, buf: &mut [u8]) -> Result<usize, AbortCode> {
        self.inner.read(sub, offset, buf)
    }

    fn read_size(&self, sub: u8) -> Result<usize, AbortCode> {
        self.inner.read_size(sub)
    }

    fn write(&self, sub: u8, data: &[u8]) -> Result<(), AbortCode> {
        if !self.inner.access_type(sub)?.is_writable() {
            return Err(AbortCode::ReadOnly);
        }
        self.hook.before_write(sub, data)?;
        self.inner.write(sub, data)?;
        self.hook.after_write(sub);
        Ok(())
    }

    // Streamed writes never become a complete value the hook could inspect
    fn begin_partial(&self, sub: u8) -> Result<(), AbortCode> {
        self.inner.access_type(sub)?;
        Err(AbortCode::UnsupportedAccess)
    }

    fn object_code(&self) -> ObjectCode {
        self.inner.object_code()
    }

    fn sub_info(&self, sub: u8) -> Result<SubInfo, AbortCode> {
        self.inner.sub_info(sub)
    }

    fn set_event_flag(&self, sub: u8) -> Result<(), AbortCode> {
        self.inner.set_event_flag(sub)
    }

    fn read_event_flag(&self, sub: u8) -> bool {
        self.inner.read_event_flag(sub)
    }

    fn clear_events(&self) {
        self.inner.clear_events()
    }
}
