use crate::util::{ceil_page_size, floor_page_size};
use serde::{Deserialize, Serialize};
use std::{
    ffi::c_void,
    fmt::{Display, Formatter, Result},
    ops::{Add, AddAssign, Sub},
};

/// An address in the subject's address space.
///
/// The engine runs inside the subject, so this is also a valid local address,
/// but only dereference it through an `AddressSpace` after the range has been
/// checked against the memory map.
#[derive(
    Copy, Clone, Default, Eq, PartialEq, Ord, PartialOrd, Hash, Debug, Serialize, Deserialize,
)]
pub struct RemotePtr(usize);

impl RemotePtr {
    pub fn null() -> RemotePtr {
        RemotePtr(0)
    }

    pub fn new_from_val(val: usize) -> RemotePtr {
        RemotePtr(val)
    }

    pub fn from_ptr<T>(p: *const T) -> RemotePtr {
        RemotePtr(p as usize)
    }

    pub fn as_usize(&self) -> usize {
        self.0
    }

    pub fn is_null(&self) -> bool {
        self.0 == 0
    }

    pub fn as_ptr<T>(&self) -> *const T {
        self.0 as *const T
    }

    pub fn as_mut_ptr<T>(&self) -> *mut T {
        self.0 as *mut T
    }

    pub fn as_void_ptr(&self) -> *mut c_void {
        self.as_mut_ptr()
    }

    pub fn floor_page(&self) -> RemotePtr {
        RemotePtr(floor_page_size(self.0))
    }

    pub fn ceil_page(&self) -> RemotePtr {
        RemotePtr(ceil_page_size(self.0))
    }
}

impl Display for RemotePtr {
    fn fmt(&self, f: &mut Formatter<'_>) -> Result {
        write!(f, "{:#x}", self.0)
    }
}

impl From<usize> for RemotePtr {
    fn from(addr: usize) -> Self {
        RemotePtr(addr)
    }
}

impl Add<usize> for RemotePtr {
    type Output = Self;

    fn add(self, delta: usize) -> Self::Output {
        // Will automatically deal with overflow in debug mode.
        RemotePtr(self.0 + delta)
    }
}

impl AddAssign<usize> for RemotePtr {
    fn add_assign(&mut self, delta: usize) {
        self.0 += delta;
    }
}

impl Sub<usize> for RemotePtr {
    type Output = Self;

    fn sub(self, delta: usize) -> Self::Output {
        RemotePtr(self.0 - delta)
    }
}

/// Distance in bytes.
impl Sub<RemotePtr> for RemotePtr {
    type Output = usize;

    fn sub(self, rhs: RemotePtr) -> Self::Output {
        self.0 - rhs.0
    }
}
