//! Mount configuration.

use std::time::Duration;

/// When member contents are read from the archive.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Materialization {
    /// Fetch a member on first read and keep it for the mount's lifetime.
    #[default]
    Lazy,
    /// Read every member while building the tree.
    Eager,
}

/// How members that keep their first bytes in the index are served.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum PrefixPolicy {
    /// Serve the whole member: the index prefix followed by the stored bytes.
    #[default]
    Include,
    /// Serve only the bytes stored in the archive body.
    Strip,
}

/// Options for serving and mounting archives.
#[derive(Debug, Clone)]
pub struct MountOptions {
    pub materialization: Materialization,
    pub prefix: PrefixPolicy,
    /// Kernel cache timeout for entries and attributes.
    pub ttl: Duration,
    pub allow_other: bool,
    pub fs_name: String,
}

impl Default for MountOptions {
    fn default() -> Self {
        Self {
            materialization: Materialization::Lazy,
            prefix: PrefixPolicy::Include,
            // Contents never change while mounted.
            ttl: Duration::from_secs(30),
            allow_other: false,
            fs_name: "rptool".to_string(),
        }
    }
}

impl MountOptions {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn materialization(mut self, materialization: Materialization) -> Self {
        self.materialization = materialization;
        self
    }

    pub fn prefix(mut self, prefix: PrefixPolicy) -> Self {
        self.prefix = prefix;
        self
    }

    pub fn ttl(mut self, ttl: Duration) -> Self {
        self.ttl = ttl;
        self
    }

    pub fn allow_other(mut self, allow_other: bool) -> Self {
        self.allow_other = allow_other;
        self
    }

    pub fn fs_name(mut self, fs_name: impl Into<String>) -> Self {
        self.fs_name = fs_name.into();
        self
    }
}
