//! Adapter configuration

/// How a full-convention handler's `write()` calls are served
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum WriteBridge {
    /// Run write-style handlers as cooperative coroutines
    #[default]
    Cooperative,
    /// Reject `write()` with a not-supported error on first use
    Disabled,
}

/// Settings passed explicitly to [`crate::adapter::lighten_with`]
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct Config {
    write_bridge: WriteBridge,
}

impl Config {
    /// Create a configuration with default settings
    pub fn new() -> Self {
        Self::default()
    }

    /// Choose how `write()` is served
    pub fn with_write_bridge(mut self, write_bridge: WriteBridge) -> Self {
        self.write_bridge = write_bridge;
        self
    }

    /// The configured write bridge mode
    pub fn write_bridge(&self) -> WriteBridge {
        self.write_bridge
    }
}
