//! Program-wide option and category flags.
//!
//! Both vectors are fixed arrays of atomics so proxy sessions can consult them
//! on the hot path without locks, and the embedding application can flip them
//! at any time with immediate effect. They are held by the engine instance and
//! passed by reference into tasks, so multiple engines can coexist in one
//! process.

use std::sync::atomic::{AtomicBool, Ordering};

/// Well-known indices into [`ProgramOptions`].
///
/// Writes to indices outside the defined range are silently ignored and reads
/// return `false`, so option vectors can grow without breaking embedders.
pub mod option {
    /// Serve the configured HTML block page for blocked document requests.
    pub const USE_HTML_BLOCK_PAGE: usize = 0;
    /// Filter plain HTTP flows diverted from port 80.
    pub const FILTER_PLAIN_HTTP: usize = 1;
    /// Filter TLS flows diverted from port 443.
    pub const FILTER_HTTPS: usize = 2;
    /// Scan textual response bodies against loaded text triggers.
    pub const FILTER_TEXT_TRIGGERS: usize = 3;
    /// Inject element-hiding CSS into HTML responses.
    pub const FILTER_ELEMENT_HIDING: usize = 4;
    /// Block third-party requests outright. Exception rules still override.
    pub const BLOCK_THIRD_PARTY: usize = 5;
    /// Consult the firewall callback before intercepting a flow.
    pub const REQUIRE_FIREWALL_APPROVAL: usize = 6;
}

/// Number of option slots. Indices beyond the well-known set are reserved.
pub const OPTION_COUNT: usize = 16;

/// Number of category slots. Index 0 is reserved and always reads `false`.
pub const CATEGORY_COUNT: usize = 256;

/// Fixed vector of program-wide option flags.
#[derive(Debug)]
pub struct ProgramOptions {
    flags: [AtomicBool; OPTION_COUNT],
}

impl ProgramOptions {
    /// Creates the option vector with its default values.
    pub fn new() -> Self {
        let opts = Self {
            flags: std::array::from_fn(|_| AtomicBool::new(false)),
        };
        opts.set(option::USE_HTML_BLOCK_PAGE, true);
        opts.set(option::FILTER_PLAIN_HTTP, true);
        opts.set(option::FILTER_HTTPS, true);
        opts.set(option::FILTER_TEXT_TRIGGERS, true);
        opts.set(option::FILTER_ELEMENT_HIDING, true);
        opts.set(option::REQUIRE_FIREWALL_APPROVAL, true);
        opts
    }

    /// Sets an option. Out-of-range indices are a no-op.
    pub fn set(&self, index: usize, enabled: bool) {
        if let Some(flag) = self.flags.get(index) {
            flag.store(enabled, Ordering::SeqCst);
        }
    }

    /// Reads an option. Out-of-range indices read `false`.
    pub fn get(&self, index: usize) -> bool {
        self.flags
            .get(index)
            .map(|flag| flag.load(Ordering::SeqCst))
            .unwrap_or(false)
    }
}

impl Default for ProgramOptions {
    fn default() -> Self {
        Self::new()
    }
}

/// Fixed vector of per-category enable flags.
///
/// The engine is agnostic to what a category means; it only checks whether
/// rules loaded under a category id should currently take effect. Category 0
/// denotes "unfiltered" and can never be enabled.
#[derive(Debug)]
pub struct CategorySet {
    flags: [AtomicBool; CATEGORY_COUNT],
}

impl CategorySet {
    /// Creates the category vector with every category disabled.
    pub fn new() -> Self {
        Self {
            flags: std::array::from_fn(|_| AtomicBool::new(false)),
        }
    }

    /// Enables or disables a category. Writes to category 0 are ignored.
    pub fn set(&self, category: u8, enabled: bool) {
        if category == 0 {
            return;
        }
        self.flags[category as usize].store(enabled, Ordering::SeqCst);
    }

    /// Reads a category flag. Category 0 always reads `false`.
    pub fn get(&self, category: u8) -> bool {
        if category == 0 {
            return false;
        }
        self.flags[category as usize].load(Ordering::SeqCst)
    }

    /// Returns true if any category is currently enabled.
    pub fn any_enabled(&self) -> bool {
        self.flags[1..].iter().any(|f| f.load(Ordering::SeqCst))
    }
}

impl Default for CategorySet {
    fn default() -> Self {
        Self::new()
    }
}
