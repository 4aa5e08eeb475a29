//! Lazily installed kernel objects.

use std::sync::Arc;

use parking_lot::RwLock;

use crate::error::Result;

/// Holder for a kernel object that may be created on first use, released
/// on destroy, and created again on re-initialisation.
pub struct KernelSlot<T> {
    cell: RwLock<Option<Arc<T>>>,
}

impl<T> KernelSlot<T> {
    #[must_use]
    pub const fn new() -> Self {
        Self {
            cell: parking_lot::const_rwlock(None),
        }
    }

    #[must_use]
    pub fn get(&self) -> Option<Arc<T>> {
        self.cell.read().clone()
    }

    /// Current object, creating it with `create` when empty.
    pub fn get_or_try_init(&self, create: impl FnOnce() -> Result<Arc<T>>) -> Result<Arc<T>> {
        if let Some(obj) = self.get() {
            return Ok(obj);
        }
        let mut cell = self.cell.write();
        if let Some(obj) = cell.as_ref() {
            return Ok(Arc::clone(obj));
        }
        let obj = create()?;
        *cell = Some(Arc::clone(&obj));
        Ok(obj)
    }

    pub fn install(&self, obj: Arc<T>) {
        *self.cell.write() = Some(obj);
    }

    pub fn take(&self) -> Option<Arc<T>> {
        self.cell.write().take()
    }

    #[must_use]
    pub fn is_installed(&self) -> bool {
        self.cell.read().is_some()
    }
}

impl<T> Default for KernelSlot<T> {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::Error;
    use crate::kernel::Event;

    #[test]
    fn creates_once_and_reuses() {
        let slot: KernelSlot<crate::kernel::Event> = KernelSlot::new();
        let a = slot.get_or_try_init(|| Event::new(false, false)).unwrap();
        let b = slot.get_or_try_init(|| Err(Error::Again)).unwrap();
        assert!(Arc::ptr_eq(&a, &b));
        assert!(slot.take().is_some());
        assert!(!slot.is_installed());
    }

    #[test]
    fn failed_creation_leaves_slot_empty() {
        let slot: KernelSlot<Event> = KernelSlot::new();
        assert_eq!(slot.get_or_try_init(|| Err(Error::Again)).err(), Some(Error::Again));
        assert!(slot.get().is_none());
    }
}
