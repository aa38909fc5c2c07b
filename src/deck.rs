//! Owner ("deck") lookup.
//!
//! Decks are managed by the surrounding IDE; the terminal engine only needs
//! to know whether one exists and which directory its shells start in.

use std::collections::HashMap;
use std::path::PathBuf;

use parking_lot::RwLock;
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Deck {
    pub id: String,
    /// Working directory for shells started in this deck.
    pub root: PathBuf,
}

pub trait DeckDirectory: Send + Sync {
    fn resolve(&self, deck_id: &str) -> Option<Deck>;
}

/// Deck table held in memory, seeded from the config file.
#[derive(Default)]
pub struct StaticDecks {
    decks: RwLock<HashMap<String, Deck>>,
}

impl StaticDecks {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn from_decks(decks: impl IntoIterator<Item = Deck>) -> Self {
        let this = Self::new();
        for deck in decks {
            this.insert(deck);
        }
        this
    }

    pub fn insert(&self, deck: Deck) {
        self.decks.write().insert(deck.id.clone(), deck);
    }

    pub fn remove(&self, deck_id: &str) -> Option<Deck> {
        self.decks.write().remove(deck_id)
    }

    pub fn len(&self) -> usize {
        self.decks.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl DeckDirectory for StaticDecks {
    fn resolve(&self, deck_id: &str) -> Option<Deck> {
        self.decks.read().get(deck_id).cloned()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn resolve_known_and_unknown() {
        let decks = StaticDecks::from_decks([Deck {
            id: "deck-1".into(),
            root: PathBuf::from("/tmp"),
        }]);
        assert_eq!(decks.resolve("deck-1").unwrap().root, PathBuf::from("/tmp"));
        assert!(decks.resolve("deck-2").is_none());
    }

    #[test]
    fn insert_replaces_and_remove_forgets() {
        let decks = StaticDecks::new();
        decks.insert(Deck { id: "a".into(), root: "/one".into() });
        decks.insert(Deck { id: "a".into(), root: "/two".into() });
        assert_eq!(decks.len(), 1);
        assert_eq!(decks.resolve("a").unwrap().root, PathBuf::from("/two"));
        assert!(decks.remove("a").is_some());
        assert!(decks.is_empty());
    }
}
