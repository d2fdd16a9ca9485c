//! Match and player registries
//!
//! A match is a scope within a container grouping entities and sessions.
//! Players are container-scoped opaque identities; ownership semantics only.

use ahash::AHashMap;
use serde::{Deserialize, Serialize};

use crate::error::{EngineError, Result};

/// A match scope
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Match {
    pub id: u64,
    pub container_id: u64,
    pub enabled_modules: Vec<String>,
    pub enabled_ais: Vec<String>,
}

/// Container-scoped match table with monotonically assigned ids.
#[derive(Debug, Default)]
pub struct MatchRegistry {
    matches: AHashMap<u64, Match>,
    next_id: u64,
}

impl MatchRegistry {
    pub fn new() -> Self {
        Self { matches: AHashMap::new(), next_id: 1 }
    }

    pub fn create(
        &mut self,
        container_id: u64,
        enabled_modules: Vec<String>,
        enabled_ais: Vec<String>,
    ) -> u64 {
        let id = self.next_id;
        self.next_id += 1;
        self.matches.insert(
            id,
            Match { id, container_id, enabled_modules, enabled_ais },
        );
        id
    }

    pub fn get(&self, id: u64) -> Result<&Match> {
        self.matches.get(&id).ok_or(EngineError::MatchNotFound(id))
    }

    pub fn contains(&self, id: u64) -> bool {
        self.matches.contains_key(&id)
    }

    /// Remove a match record; the container cascades entity and session
    /// teardown around this call.
    pub fn remove(&mut self, id: u64) -> Result<Match> {
        self.matches.remove(&id).ok_or(EngineError::MatchNotFound(id))
    }

    pub fn list(&self) -> Vec<&Match> {
        let mut out: Vec<&Match> = self.matches.values().collect();
        out.sort_by_key(|m| m.id);
        out
    }

    pub fn ids(&self) -> Vec<u64> {
        let mut out: Vec<u64> = self.matches.keys().copied().collect();
        out.sort_unstable();
        out
    }

    pub fn len(&self) -> usize {
        self.matches.len()
    }

    pub fn is_empty(&self) -> bool {
        self.matches.is_empty()
    }
}

/// Container-scoped player identities.
#[derive(Debug, Default)]
pub struct PlayerRegistry {
    players: AHashMap<u64, ()>,
    next_id: u64,
}

impl PlayerRegistry {
    pub fn new() -> Self {
        Self { players: AHashMap::new(), next_id: 1 }
    }

    pub fn create(&mut self) -> u64 {
        let id = self.next_id;
        self.next_id += 1;
        self.players.insert(id, ());
        id
    }

    pub fn contains(&self, id: u64) -> bool {
        self.players.contains_key(&id)
    }

    pub fn remove(&mut self, id: u64) -> Result<()> {
        self.players
            .remove(&id)
            .map(|_| ())
            .ok_or(EngineError::PlayerNotFound(id))
    }

    pub fn list(&self) -> Vec<u64> {
        let mut out: Vec<u64> = self.players.keys().copied().collect();
        out.sort_unstable();
        out
    }

    pub fn len(&self) -> usize {
        self.players.len()
    }

    pub fn is_empty(&self) -> bool {
        self.players.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_match_lifecycle() -> Result<()> {
        let mut registry = MatchRegistry::new();
        let id = registry.create(1, vec!["movement".to_string()], Vec::new());
        assert!(registry.contains(id));
        assert_eq!(registry.get(id)?.enabled_modules, vec!["movement"]);

        let removed = registry.remove(id)?;
        assert_eq!(removed.id, id);
        assert!(matches!(registry.get(id), Err(EngineError::MatchNotFound(_))));
        Ok(())
    }

    #[test]
    fn test_match_ids_monotonic() {
        let mut registry = MatchRegistry::new();
        let a = registry.create(1, Vec::new(), Vec::new());
        registry.remove(a).unwrap();
        let b = registry.create(1, Vec::new(), Vec::new());
        assert!(b > a);
    }

    #[test]
    fn test_player_lifecycle() -> Result<()> {
        let mut registry = PlayerRegistry::new();
        let p = registry.create();
        assert!(registry.contains(p));
        registry.remove(p)?;
        assert!(matches!(registry.remove(p), Err(EngineError::PlayerNotFound(_))));
        Ok(())
    }
}
