//! Warden core - the filtering engine behind the transparent proxy.
//!
//! This crate holds everything that decides *what* to do with traffic; the
//! companion `warden-proxy` crate moves the bytes. Nothing here is async.
//!
//! ## Modules
//!
//! - [`rules`] - Adblock Plus rule parsing, indexing, and URL classification,
//!   plus cosmetic (element-hiding) rules and CSS injection helpers
//! - [`triggers`] - text keyword triggers for response payloads
//! - [`options`] - program-wide option flags and category enable flags
//! - [`events`] - callback types used to report engine activity
//! - [`error`] - core error types

pub mod error;
pub mod events;
pub mod options;
pub mod rules;
pub mod triggers;

pub use error::{CoreError, RuleParseError};
pub use events::EventSink;
pub use options::{CategorySet, ProgramOptions};
pub use rules::{Decision, FilterStore, LoadSummary, RequestContext, ResourceType};
pub use triggers::{TriggerHit, TriggerStore};

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn store_can_be_created() {
        let store = FilterStore::new();
        assert_eq!(store.rule_count(), 0);
    }

    #[test]
    fn end_to_end_block_decision() {
        let store = FilterStore::new();
        let categories = CategorySet::new();
        categories.set(1, true);
        store
            .load_from_text("||ads.example.com^$third-party", 1, true)
            .unwrap();

        let ctx = RequestContext {
            url: "http://ads.example.com/banner.gif",
            host: "ads.example.com",
            referer_host: Some("news.example.org"),
            resource_type: ResourceType::Image,
        };
        assert!(store.query_url(&ctx, &categories).is_block());
    }
}
