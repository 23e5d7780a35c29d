//! Accumulates streamed fragments for the active turn
//!
//! Appending never notifies anyone. It only marks the buffers dirty; the
//! throttle clock decides when observers hear about it.

/// Content and thinking buffers of the in-flight turn
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct DeltaAggregator {
    content: String,
    thinking: String,
    dirty: bool,
}

impl DeltaAggregator {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn append_content(&mut self, fragment: &str) {
        self.content.push_str(fragment);
        self.dirty = true;
    }

    pub fn append_thinking(&mut self, fragment: &str) {
        self.thinking.push_str(fragment);
        self.dirty = true;
    }

    pub fn content(&self) -> &str {
        &self.content
    }

    pub fn thinking(&self) -> &str {
        &self.thinking
    }

    pub fn is_dirty(&self) -> bool {
        self.dirty
    }

    /// Clear the dirty flag, returning whether it was set
    pub fn take_dirty(&mut self) -> bool {
        std::mem::take(&mut self.dirty)
    }

    /// Empty both buffers for a new turn
    pub fn reset(&mut self) {
        self.content.clear();
        self.thinking.clear();
        self.dirty = false;
    }
}
