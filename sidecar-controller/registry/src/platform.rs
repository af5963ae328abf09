use std::{borrow::Cow, fmt};

/// Identifies the platform backing a registry adapter.
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub struct Platform(Cow<'static, str>);

// === impl Platform ===

impl Platform {
    pub const MEMORY: Self = Self(Cow::Borrowed("memory"));
    pub const FILE: Self = Self(Cow::Borrowed("file"));

    pub fn new(name: impl Into<Cow<'static, str>>) -> Self {
        Self(name.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for Platform {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}
