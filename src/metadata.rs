// The taxonomy is a literal: changing labels means editing config::taxonomy, there is no discovery.

use serde::{Deserialize, Serialize};

use crate::config;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct IntentMetadata {
    pub categories: Vec<String>,
    pub location_intents: Vec<String>,
    pub time_intents: Vec<String>,
    pub max_sequence_length: usize,
}

impl IntentMetadata {
    pub fn taxonomy() -> Self {
        let owned = |labels: &[&str]| -> Vec<String> { labels.iter().map(|s| s.to_string()).collect() };
        Self {
            categories: owned(&config::taxonomy::CATEGORIES),
            location_intents: owned(&config::taxonomy::LOCATION_INTENTS),
            time_intents: owned(&config::taxonomy::TIME_INTENTS),
            max_sequence_length: config::export::MAX_SEQUENCE_LENGTH,
        }
    }

    /// Pretty JSON with two-space indent.
    pub fn to_json(&self) -> anyhow::Result<Vec<u8>> {
        Ok(serde_json::to_vec_pretty(self)?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_taxonomy_is_fixed() {
        let m = IntentMetadata::taxonomy();
        assert_eq!(m.max_sequence_length, 128);
        assert_eq!(m.categories.len(), 8);
        assert_eq!(m.categories[0], "Social & Networking");
        assert_eq!(m.categories[7], "Community & Charity");
        assert_eq!(m.location_intents, vec!["near_me", "specific_location", "online", "any"]);
        assert_eq!(
            m.time_intents,
            vec!["today", "tomorrow", "this_week", "this_weekend", "next_week", "any"]
        );
    }

    #[test]
    fn test_json_is_deterministic_and_ordered() {
        let a = IntentMetadata::taxonomy().to_json().unwrap();
        let b = IntentMetadata::taxonomy().to_json().unwrap();
        assert_eq!(a, b);

        let text = String::from_utf8(a).unwrap();
        assert!(text.starts_with("{\n  \"categories\": [\n    \"Social & Networking\","));
        assert!(text.contains("\"max_sequence_length\": 128"));

        let back: IntentMetadata = serde_json::from_str(&text).unwrap();
        assert_eq!(back, IntentMetadata::taxonomy());
    }
}
