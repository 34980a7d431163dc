//! Object Dictionary
//!
//! The object dictionary is a table of [`ODEntry`] values sorted by index. Every entry points at an
//! object implementing [`ObjectAccess`], and every access from the network (SDO, PDO, storage)
//! goes through that trait. Objects come in three shapes:
//!
//! - VAR: a single value at sub index 0
//! - ARRAY: sub 0 holds the element count, subs 1..=N hold values of one type
//! - RECORD: sub 0 holds the highest sub index, the other subs may have any type
//!
//! # Building objects
//!
//! Plain data objects are usually built from the provided sub object fields:
//!
//! - [`ScalarField<T>`] for numbers and booleans
//! - [`ByteField`] for octet strings and domains
//! - [`NullTermByteField`] for visible strings
//! - [`ConstField`] for values which never change
//!
//! A VAR object wraps one field in a [`VarObject`]. A [`HookedObject`] runs an [`AccessHook`]
//! around every write of another object, for example to mark a storage region dirty. Arrays and records implement
//! [`ProvidesSubObjects`], which gets them an [`ObjectAccess`] implementation for free.
//!
//! The communication objects in 0x1000..=0x1FFF are implemented by the protocol modules (for
//! example [`crate::sync::SyncObject`] or [`crate::pdo::PdoCommObject`]), which validate writes
//! before they take effect.
//!
//! ```rust
//! use tincan_node::object_dict::{ConstField, ODEntry, ProvidesSubObjects, ScalarField, SubObjectAccess, VarObject, find_object};
//! use tincan_node::common::objects::{ObjectCode, PdoMapping, SubInfo};
//!
//! struct Limits {
//!     low: ScalarField<i16>,
//!     high: ScalarField<i16>,
//! }
//!
//! impl ProvidesSubObjects for Limits {
//!     fn get_sub_object(&self, sub: u8) -> Option<(SubInfo, &dyn SubObjectAccess)> {
//!         match sub {
//!             0 => Some((SubInfo::MAX_SUB_NUMBER, const { &ConstField::new([2]) })),
//!             1 => Some((SubInfo::new_i16().rw_access(), &self.low)),
//!             2 => Some((SubInfo::new_i16().rw_access(), &self.high)),
//!             _ => None,
//!         }
//!     }
//!
//!     fn object_code(&self) -> ObjectCode {
//!         ObjectCode::Record
//!     }
//! }
//!
//! static SPEED: VarObject<ScalarField<u16>> = VarObject::new(
//!     SubInfo::new_u16().rw_access().mapping(PdoMapping::Tpdo),
//!     ScalarField::<u16>::new(0),
//! );
//! static LIMITS: Limits = Limits {
//!     low: ScalarField::<i16>::new(-10),
//!     high: ScalarField::<i16>::new(10),
//! };
//! static OD: [ODEntry; 2] = [
//!     ODEntry { index: 0x2000, data: &SPEED },
//!     ODEntry { index: 0x2001, data: &LIMITS },
//! ];
//!
//! let limits = find_object(&OD, 0x2001).unwrap();
//! assert_eq!(2, limits.read_u8(0).unwrap());
//! assert_eq!(10, limits.read_i16(2).unwrap());
//! ```
//!
//! # Concurrency
//!
//! Objects must be `Sync + Send`. Fields guard their storage with `critical_section`, so a single
//! `read` or `write` call is atomic. Transfers larger than the SDO buffer are split into several
//! partial accesses, and those are not atomic as a whole.
//!
//! # Event flags
//!
//! Objects may carry [`ObjectFlags`], one flag per sub object. The application sets a flag to ask
//! for transmission of any event driven TPDO which maps that sub object.

mod hooks;
mod object_flags;
mod objects;
mod sub_objects;

pub use hooks::*;
pub use object_flags::*;
pub use objects::*;
pub use sub_objects::*;

pub(crate) use sub_objects::{copy_from_offset, decode_u16, decode_u32, decode_u8};
