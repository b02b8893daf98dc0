pub use triggered::{Listener, Trigger};

/// A shutdown trigger paired with its listener.
///
/// Clones share the same underlying signal, so any clone may fire it and any
/// clone of the listener observes it.
#[derive(Debug, Clone)]
pub struct SingleTrigger {
    pub trigger: Trigger,
    pub listener: Listener,
}

impl SingleTrigger {
    pub fn new() -> SingleTrigger {
        let (trigger, listener) = triggered::trigger();
        SingleTrigger { trigger, listener }
    }

    pub fn is_triggered(&self) -> bool {
        self.listener.is_triggered()
    }
}

impl Default for SingleTrigger {
    fn default() -> Self {
        Self::new()
    }
}
