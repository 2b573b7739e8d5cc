use parking_lot::RwLock;
use std::sync::Arc;

/// A read-mostly value replaced wholesale on reload.
///
/// Readers clone the current `Arc` and drop the lock immediately, so a
/// snapshot can be held across awaits while a reload swaps in a new one.
pub struct SharedSnapshot<T> {
    current: RwLock<Arc<T>>,
}

impl<T> SharedSnapshot<T> {
    pub fn new(value: T) -> Self {
        Self {
            current: RwLock::new(Arc::new(value)),
        }
    }

    pub fn load(&self) -> Arc<T> {
        self.current.read().clone()
    }

    /// Install `value`, returning the snapshot it replaced.
    pub fn replace(&self, value: T) -> Arc<T> {
        std::mem::replace(&mut *self.current.write(), Arc::new(value))
    }
}

impl<T: Default> Default for SharedSnapshot<T> {
    fn default() -> Self {
        Self::new(T::default())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_readers_keep_old_snapshot_after_replace() {
        let snapshot = SharedSnapshot::new(vec![1, 2]);
        let before = snapshot.load();

        let old = snapshot.replace(vec![3]);
        assert_eq!(*old, vec![1, 2]);
        assert_eq!(*before, vec![1, 2]);
        assert_eq!(*snapshot.load(), vec![3]);
    }
}
