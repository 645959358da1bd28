//! Scenes: personas bound to their own agent credential.
//!
//! A reply that carries the switch marker together with a `[<scene name>]`
//! tag moves the chat to that scene. Each scene talks to a different agent
//! app, so switching replaces the credential and starts a fresh conversation.

use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Scene {
    /// Location name; also the tag text the agent emits, e.g. `[Lakeside]`.
    pub name: String,
    /// Name of the entry in `api_keys` used while this scene is active.
    pub api_key: String,
    pub persona: String,
    #[serde(default)]
    pub intro: String,
    #[serde(default)]
    pub background: Option<String>,
    #[serde(default)]
    pub avatar: Option<String>,
}

impl Scene {
    fn tag(&self) -> String {
        format!("[{}]", self.name)
    }
}

#[derive(Debug, Clone, Default)]
pub struct SceneCatalog {
    scenes: Vec<Scene>,
}

impl SceneCatalog {
    pub fn new(scenes: Vec<Scene>) -> Self {
        Self { scenes }
    }

    pub fn get(&self, name: &str) -> Option<&Scene> {
        self.scenes.iter().find(|s| s.name == name)
    }

    pub fn is_empty(&self) -> bool {
        self.scenes.is_empty()
    }

    /// Find the scene a reply asks to move to.
    ///
    /// Catalog order decides when several tags appear.
    pub fn detect(&self, raw_text: &str, switch_marker: &str) -> Option<&Scene> {
        if switch_marker.is_empty() || !raw_text.contains(switch_marker) {
            return None;
        }

        let preview: String = raw_text.chars().take(100).collect();
        tracing::debug!("Checking reply for scene switch: {}", preview);

        let found = self.scenes.iter().find(|s| raw_text.contains(&s.tag()));
        if found.is_none() {
            tracing::info!("Switch marker present but no known location tag found");
        }
        found
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const MARKER: &str = "*切换地点*";

    fn scene(name: &str, key: &str) -> Scene {
        Scene {
            name: name.to_string(),
            api_key: key.to_string(),
            persona: format!("{} guide", name),
            intro: String::new(),
            background: None,
            avatar: None,
        }
    }

    fn catalog() -> SceneCatalog {
        SceneCatalog::new(vec![scene("燕南园", "yannanyuan"), scene("勺园", "shaoyuan")])
    }

    #[test]
    fn test_detect_requires_switch_marker() {
        let catalog = catalog();
        assert!(catalog.detect("Let's go to [勺园]", MARKER).is_none());
    }

    #[test]
    fn test_detect_matches_tag() {
        let catalog = catalog();
        let found = catalog
            .detect("*切换地点* heading to [勺园] now", MARKER)
            .unwrap();
        assert_eq!(found.api_key, "shaoyuan");
    }

    #[test]
    fn test_detect_uses_catalog_order() {
        let catalog = catalog();
        let found = catalog
            .detect("*切换地点* [勺园] or maybe [燕南园]", MARKER)
            .unwrap();
        assert_eq!(found.name, "燕南园");
    }

    #[test]
    fn test_detect_unknown_location() {
        let catalog = catalog();
        assert!(catalog.detect("*切换地点* [未知]", MARKER).is_none());
    }

    #[test]
    fn test_detect_ignores_bare_name_without_brackets() {
        let catalog = catalog();
        assert!(catalog.detect("*切换地点* 勺园", MARKER).is_none());
    }

    #[test]
    fn test_get_by_name() {
        let catalog = catalog();
        assert!(catalog.get("勺园").is_some());
        assert!(catalog.get("nowhere").is_none());
        assert!(!catalog.is_empty());
    }
}
