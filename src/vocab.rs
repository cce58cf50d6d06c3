use std::collections::HashMap;

use serde::ser::{Serialize, SerializeMap, Serializer};
use tokenizers::Tokenizer;

/// Vocabulary entries ordered by id, so repeated runs write byte-identical files.
pub struct Vocabulary {
    entries: Vec<(String, u32)>,
}

impl Vocabulary {
    pub fn from_tokenizer(tokenizer: &Tokenizer) -> Self {
        Self::from_map(tokenizer.get_vocab(true))
    }

    pub fn from_map(map: HashMap<String, u32>) -> Self {
        let mut entries: Vec<(String, u32)> = map.into_iter().collect();
        entries.sort_by(|a, b| a.1.cmp(&b.1).then_with(|| a.0.cmp(&b.0)));
        Self { entries }
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn to_json(&self) -> anyhow::Result<Vec<u8>> {
        Ok(serde_json::to_vec(self)?)
    }
}

impl Serialize for Vocabulary {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        let mut map = serializer.serialize_map(Some(self.entries.len()))?;
        for (token, id) in &self.entries {
            map.serialize_entry(token, id)?;
        }
        map.end()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_entries_written_in_id_order() {
        let map: HashMap<String, u32> = [("b", 2), ("[PAD]", 0), ("a", 1)]
            .into_iter()
            .map(|(t, i)| (t.to_string(), i))
            .collect();
        let vocab = Vocabulary::from_map(map);
        assert_eq!(vocab.len(), 3);
        let json = String::from_utf8(vocab.to_json().unwrap()).unwrap();
        assert_eq!(json, r#"{"[PAD]":0,"a":1,"b":2}"#);

        let parsed: HashMap<String, u32> = serde_json::from_str(&json).unwrap();
        assert_eq!(parsed["b"], 2);
    }
}
