//! Builtin actor names and actor naming rules
//!
//! Actor names are `module.name`. Routing only looks at the module, so every
//! node hosting module `crawler` can handle `crawler.fetch`.

/// Module hosting the housekeeping actors on every node
pub const BUILTIN_MODULE: &str = "actor";

pub const ACTOR_SYSTEM: &str = "actor.system";
pub const ACTOR_INIT: &str = "actor.init";
pub const ACTOR_HEALTH: &str = "actor.health";
pub const ACTOR_UPDATE_REGISTRY: &str = "actor.update_registry";
pub const ACTOR_MESSAGE_FETCHER: &str = "actor.message_fetcher";
pub const ACTOR_MESSAGE_EXPORTER: &str = "actor.message_exporter";
pub const ACTOR_MESSAGE_ACKER: &str = "actor.message_acker";
pub const ACTOR_MESSAGE_NOTIFY_SENDER: &str = "actor.message_notify_sender";
pub const ACTOR_MESSAGE_NOTIFY_RECEIVER: &str = "actor.message_notify_receiver";
pub const ACTOR_MESSAGE_MONITOR: &str = "actor.message_monitor";
pub const ACTOR_STORAGE_COMPACTOR: &str = "actor.storage_compactor";

/// Module part of an actor name
pub fn module_of(name: &str) -> &str {
    name.split('.').next().unwrap_or(name)
}

/// `module.name` with lowercase ascii words, digits and underscores
pub fn is_valid_actor_name(name: &str) -> bool {
    let parts: Vec<&str> = name.split('.').collect();
    parts.len() >= 2
        && parts.iter().all(|part| {
            !part.is_empty()
                && part
                    .chars()
                    .all(|c| c.is_ascii_lowercase() || c.is_ascii_digit() || c == '_')
        })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_module_of() {
        assert_eq!(module_of("crawler.fetch"), "crawler");
        assert_eq!(module_of("actor.message_fetcher"), BUILTIN_MODULE);
        assert_eq!(module_of("plain"), "plain");
    }

    #[test]
    fn test_actor_name_rules() {
        assert!(is_valid_actor_name("crawler.fetch_feed"));
        assert!(is_valid_actor_name("a.b.c2"));
        assert!(!is_valid_actor_name("crawler"));
        assert!(!is_valid_actor_name("crawler."));
        assert!(!is_valid_actor_name("Crawler.fetch"));
        assert!(!is_valid_actor_name("crawler.fetch-feed"));
    }
}
