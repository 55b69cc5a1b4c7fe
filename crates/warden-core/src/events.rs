//! User-supplied callback plumbing.
//!
//! The engine reports noteworthy activity through optional callbacks supplied
//! at construction. All callbacks fire on worker threads and must be
//! thread-safe; none of them can be swapped after the engine is built.

use std::sync::Arc;

/// Decides whether the binary at the given absolute path is permitted to have
/// internet access. Flows from unapproved binaries are never intercepted.
///
/// Invoked from the diverter; implementations must return quickly.
pub type FirewallCheck = Arc<dyn Fn(&str) -> bool + Send + Sync>;

/// Assigns a category to a response payload the built-in filters passed.
/// Receives the body bytes and the declared content type; returns a category
/// id, where 0 means "no category".
pub type ClassifyContent = Arc<dyn Fn(&[u8], &str) -> u8 + Send + Sync>;

/// Receives informational, warning, or error messages.
pub type MessageCallback = Arc<dyn Fn(&str) + Send + Sync>;

/// Receives `(category, rule_text, url, payload_size)` for each blocked
/// request or replaced response.
pub type RequestBlockedCallback = Arc<dyn Fn(u8, &str, &str, u64) + Send + Sync>;

/// Receives `(selector_count, url, category)` whenever element-hiding CSS is
/// injected into a response.
pub type ElementsBlockedCallback = Arc<dyn Fn(u32, &str, u8) + Send + Sync>;

/// Bundle of optional event callbacks.
///
/// Every reporting method is a no-op when the corresponding callback is
/// absent; messages are always mirrored to `tracing`.
#[derive(Clone, Default)]
pub struct EventSink {
    pub on_info: Option<MessageCallback>,
    pub on_warn: Option<MessageCallback>,
    pub on_error: Option<MessageCallback>,
    pub on_request_blocked: Option<RequestBlockedCallback>,
    pub on_elements_blocked: Option<ElementsBlockedCallback>,
}

impl EventSink {
    pub fn info(&self, msg: &str) {
        tracing::info!("{msg}");
        if let Some(cb) = &self.on_info {
            cb(msg);
        }
    }

    pub fn warn(&self, msg: &str) {
        tracing::warn!("{msg}");
        if let Some(cb) = &self.on_warn {
            cb(msg);
        }
    }

    pub fn error(&self, msg: &str) {
        tracing::error!("{msg}");
        if let Some(cb) = &self.on_error {
            cb(msg);
        }
    }

    pub fn request_blocked(&self, category: u8, rule: &str, url: &str, payload_size: u64) {
        tracing::info!(category, rule, url, payload_size, "request blocked");
        if let Some(cb) = &self.on_request_blocked {
            cb(category, rule, url, payload_size);
        }
    }

    pub fn elements_blocked(&self, count: u32, url: &str, category: u8) {
        tracing::info!(count, url, category, "elements hidden");
        if let Some(cb) = &self.on_elements_blocked {
            cb(count, url, category);
        }
    }
}

impl std::fmt::Debug for EventSink {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EventSink")
            .field("on_info", &self.on_info.is_some())
            .field("on_warn", &self.on_warn.is_some())
            .field("on_error", &self.on_error.is_some())
            .field("on_request_blocked", &self.on_request_blocked.is_some())
            .field("on_elements_blocked", &self.on_elements_blocked.is_some())
            .finish()
    }
}
