use arc_swap::ArcSwap;
use ethers::types::U256;
use std::sync::Arc;

/// Latest observed gas price or tip, shared between the refresh task and
/// every sender.
///
/// Readers never block; writers replace the whole value.
#[derive(Debug)]
pub struct SharedCounter {
    value: ArcSwap<U256>,
}

impl Default for SharedCounter {
    fn default() -> Self {
        Self::new(U256::zero())
    }
}

impl SharedCounter {
    pub fn new(value: U256) -> Self {
        Self {
            value: ArcSwap::from_pointee(value),
        }
    }

    pub fn load(&self) -> U256 {
        **self.value.load()
    }

    pub fn store(&self, value: U256) {
        self.value.store(Arc::new(value));
    }

    /// Replaces the value with `new` if it still equals `expected`.
    ///
    /// Retries when another writer swapped in an equal value in between, gives
    /// up as soon as the observed value differs from `expected`.
    pub fn compare_and_swap(&self, expected: U256, new: U256) -> bool {
        let replacement = Arc::new(new);
        loop {
            let current = self.value.load_full();
            if *current != expected {
                return false;
            }
            let previous = self.value.compare_and_swap(&current, replacement.clone());
            if Arc::ptr_eq(&*previous, &current) {
                return true;
            }
        }
    }
}
