//! Per-member application context.
//!
//! One owned value of any `Send` type can be attached to a member. Replacing
//! it drops the previous value; removing the member drops the current one.

use std::any::{type_name, Any};
use std::fmt;

use crate::error::constants::ERR_CONTEXT_TYPE;
use crate::error::{NetworkError, Result};

#[derive(Default)]
pub(crate) struct ContextSlot {
    value: Option<Box<dyn Any + Send>>,
}

impl ContextSlot {
    pub(crate) fn is_set(&self) -> bool {
        self.value.is_some()
    }

    /// Attach `value`, returning true if an earlier value was dropped.
    pub(crate) fn set<T: Any + Send>(&mut self, value: T) -> bool {
        self.value.replace(Box::new(value)).is_some()
    }

    /// `Ok(None)` when nothing is attached, `Err` when something of another
    /// type is.
    pub(crate) fn get<T: Any>(&self) -> Result<Option<&T>> {
        match &self.value {
            None => Ok(None),
            Some(boxed) => boxed
                .downcast_ref::<T>()
                .map(Some)
                .ok_or_else(|| mismatch::<T>()),
        }
    }

    pub(crate) fn get_mut<T: Any>(&mut self) -> Result<Option<&mut T>> {
        match &mut self.value {
            None => Ok(None),
            Some(boxed) => boxed
                .downcast_mut::<T>()
                .map(Some)
                .ok_or_else(|| mismatch::<T>()),
        }
    }

    /// Detach and return the value. A value of another type stays attached.
    pub(crate) fn take<T: Any>(&mut self) -> Result<Option<T>> {
        let Some(boxed) = self.value.take() else {
            return Ok(None);
        };
        match boxed.downcast::<T>() {
            Ok(value) => Ok(Some(*value)),
            Err(other) => {
                self.value = Some(other);
                Err(mismatch::<T>())
            }
        }
    }

    /// Drop whatever is attached.
    pub(crate) fn clear(&mut self) -> bool {
        self.value.take().is_some()
    }
}

impl fmt::Debug for ContextSlot {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ContextSlot")
            .field("set", &self.is_set())
            .finish()
    }
}

fn mismatch<T>() -> NetworkError {
    NetworkError::InvalidArgument(format!("{ERR_CONTEXT_TYPE} (requested {})", type_name::<T>()))
}
