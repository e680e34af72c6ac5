pub use triggered::{Listener, Trigger};

/// A one-shot signal paired with a cloneable listener, used for shutdown.
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

    pub fn fire(&self) {
        self.trigger.trigger();
    }

    pub fn is_fired(&self) -> bool {
        self.trigger.is_triggered()
    }
}

impl Default for SingleTrigger {
    fn default() -> Self {
        Self::new()
    }
}
