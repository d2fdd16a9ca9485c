//! Player session state machine
//!
//! One session per (player, match) pair. Command authority and snapshot
//! subscriptions are gated on the session being Active.

use std::time::{Duration, Instant};

use ahash::AHashMap;
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::error::{EngineError, Result};

/// Session lifecycle state
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum SessionState {
    Active,
    Disconnected,
    /// Terminal
    Abandoned,
}

/// A (player, match) participation record
#[derive(Debug, Clone)]
pub struct PlayerSession {
    pub player_id: u64,
    pub match_id: u64,
    pub state: SessionState,
    pub last_heartbeat: Instant,
}

/// Wire-facing session view
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SessionInfo {
    pub player_id: u64,
    pub match_id: u64,
    pub state: SessionState,
    pub heartbeat_age_ms: u64,
}

/// Container-scoped session table.
pub struct SessionService {
    sessions: AHashMap<(u64, u64), PlayerSession>,
    reconnect_window: Duration,
}

impl SessionService {
    pub fn new(reconnect_window: Duration) -> Self {
        Self {
            sessions: AHashMap::new(),
            reconnect_window,
        }
    }

    /// Connect a player to a match.
    ///
    /// No session -> Active. Active -> no-op. Disconnected -> Active
    /// (reconnection). Abandoned -> a fresh Active session replaces the
    /// terminal record.
    pub fn connect(&mut self, player_id: u64, match_id: u64) -> SessionState {
        let now = Instant::now();
        let session = self
            .sessions
            .entry((player_id, match_id))
            .or_insert_with(|| PlayerSession {
                player_id,
                match_id,
                state: SessionState::Active,
                last_heartbeat: now,
            });

        match session.state {
            SessionState::Active => {}
            SessionState::Disconnected | SessionState::Abandoned => {
                debug!(player_id, match_id, from = ?session.state, "session reactivated");
                session.state = SessionState::Active;
            }
        }
        session.last_heartbeat = now;
        session.state
    }

    /// Active -> Disconnected, stamping the heartbeat for the reconnect
    /// window. Disconnecting twice is a no-op.
    pub fn disconnect(&mut self, player_id: u64, match_id: u64) -> Result<()> {
        let session = self
            .sessions
            .get_mut(&(player_id, match_id))
            .ok_or(EngineError::SessionNotFound { player_id, match_id })?;

        match session.state {
            SessionState::Active => {
                session.state = SessionState::Disconnected;
                session.last_heartbeat = Instant::now();
                Ok(())
            }
            SessionState::Disconnected => Ok(()),
            SessionState::Abandoned => {
                Err(EngineError::SessionNotFound { player_id, match_id })
            }
        }
    }

    /// Disconnected -> Active, only within the reconnect window.
    pub fn reconnect(&mut self, player_id: u64, match_id: u64) -> Result<()> {
        self.reconnect_at(player_id, match_id, Instant::now())
    }

    pub fn reconnect_at(&mut self, player_id: u64, match_id: u64, now: Instant) -> Result<()> {
        let window = self.reconnect_window;
        let session = self
            .sessions
            .get_mut(&(player_id, match_id))
            .ok_or(EngineError::SessionNotFound { player_id, match_id })?;

        match session.state {
            SessionState::Active => Ok(()),
            SessionState::Disconnected => {
                if now.duration_since(session.last_heartbeat) > window {
                    session.state = SessionState::Abandoned;
                    return Err(EngineError::ReconnectExpired { player_id, match_id });
                }
                session.state = SessionState::Active;
                session.last_heartbeat = now;
                Ok(())
            }
            SessionState::Abandoned => {
                Err(EngineError::ReconnectExpired { player_id, match_id })
            }
        }
    }

    /// Any -> Abandoned (terminal).
    pub fn abandon(&mut self, player_id: u64, match_id: u64) -> Result<()> {
        let session = self
            .sessions
            .get_mut(&(player_id, match_id))
            .ok_or(EngineError::SessionNotFound { player_id, match_id })?;
        session.state = SessionState::Abandoned;
        Ok(())
    }

    /// Abandon every session of a match (match-deletion cascade).
    pub fn abandon_match(&mut self, match_id: u64) {
        for session in self.sessions.values_mut() {
            if session.match_id == match_id {
                session.state = SessionState::Abandoned;
            }
        }
    }

    pub fn can_reconnect(&self, player_id: u64, match_id: u64) -> bool {
        self.can_reconnect_at(player_id, match_id, Instant::now())
    }

    pub fn can_reconnect_at(&self, player_id: u64, match_id: u64, now: Instant) -> bool {
        self.sessions
            .get(&(player_id, match_id))
            .map(|session| {
                session.state == SessionState::Disconnected
                    && now.duration_since(session.last_heartbeat) <= self.reconnect_window
            })
            .unwrap_or(false)
    }

    /// Command/subscription authority check.
    pub fn is_active(&self, player_id: u64, match_id: u64) -> bool {
        self.sessions
            .get(&(player_id, match_id))
            .map(|session| session.state == SessionState::Active)
            .unwrap_or(false)
    }

    pub fn get(&self, player_id: u64, match_id: u64) -> Option<SessionInfo> {
        self.sessions.get(&(player_id, match_id)).map(|session| SessionInfo {
            player_id,
            match_id,
            state: session.state,
            heartbeat_age_ms: session.last_heartbeat.elapsed().as_millis() as u64,
        })
    }

    /// (player, match) pairs with an Active session, sorted for determinism.
    pub fn active_sessions(&self) -> Vec<(u64, u64)> {
        let mut out: Vec<(u64, u64)> = self
            .sessions
            .values()
            .filter(|session| session.state == SessionState::Active)
            .map(|session| (session.player_id, session.match_id))
            .collect();
        out.sort_unstable();
        out
    }

    pub fn len(&self) -> usize {
        self.sessions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.sessions.is_empty()
    }

    /// Time-based sweep: Disconnected sessions past the reconnect window
    /// become Abandoned. Runs once per tick; returns how many were swept.
    pub fn sweep_expired(&mut self, now: Instant) -> usize {
        let window = self.reconnect_window;
        let mut swept = 0;
        for session in self.sessions.values_mut() {
            if session.state == SessionState::Disconnected
                && now.duration_since(session.last_heartbeat) > window
            {
                session.state = SessionState::Abandoned;
                swept += 1;
            }
        }
        if swept > 0 {
            debug!(swept, "expired sessions abandoned");
        }
        swept
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn service() -> SessionService {
        SessionService::new(Duration::from_secs(300))
    }

    #[test]
    fn test_connect_lifecycle() -> Result<()> {
        let mut svc = service();

        assert_eq!(svc.connect(1, 10), SessionState::Active);
        assert!(svc.is_active(1, 10));

        // Connect on Active is a no-op
        assert_eq!(svc.connect(1, 10), SessionState::Active);
        assert_eq!(svc.len(), 1);

        svc.disconnect(1, 10)?;
        assert!(!svc.is_active(1, 10));
        assert!(svc.can_reconnect(1, 10));

        // Connect on Disconnected reconnects
        assert_eq!(svc.connect(1, 10), SessionState::Active);
        Ok(())
    }

    #[test]
    fn test_reconnect_window() -> Result<()> {
        let mut svc = SessionService::new(Duration::from_secs(1));
        svc.connect(1, 10);
        svc.disconnect(1, 10)?;

        let later = Instant::now() + Duration::from_secs(5);
        assert!(!svc.can_reconnect_at(1, 10, later));
        assert_eq!(
            svc.reconnect_at(1, 10, later),
            Err(EngineError::ReconnectExpired { player_id: 1, match_id: 10 })
        );

        // Expired reconnect leaves the session Abandoned
        assert!(matches!(
            svc.reconnect(1, 10),
            Err(EngineError::ReconnectExpired { .. })
        ));
        Ok(())
    }

    #[test]
    fn test_reconnect_within_window() -> Result<()> {
        let mut svc = service();
        svc.connect(1, 10);
        svc.disconnect(1, 10)?;
        svc.reconnect(1, 10)?;
        assert!(svc.is_active(1, 10));
        Ok(())
    }

    #[test]
    fn test_abandon_is_terminal_until_fresh_connect() -> Result<()> {
        let mut svc = service();
        svc.connect(1, 10);
        svc.abandon(1, 10)?;
        assert!(!svc.is_active(1, 10));
        assert!(svc.disconnect(1, 10).is_err());

        // A fresh connect after abandonment starts a new Active session
        assert_eq!(svc.connect(1, 10), SessionState::Active);
        assert!(svc.is_active(1, 10));
        Ok(())
    }

    #[test]
    fn test_sweep_expired() -> Result<()> {
        let mut svc = SessionService::new(Duration::from_secs(1));
        svc.connect(1, 10);
        svc.connect(2, 10);
        svc.disconnect(1, 10)?;

        let later = Instant::now() + Duration::from_secs(5);
        assert_eq!(svc.sweep_expired(later), 1);
        assert!(!svc.can_reconnect_at(1, 10, later));
        // Active session untouched
        assert!(svc.is_active(2, 10));
        Ok(())
    }

    #[test]
    fn test_abandon_match_cascade() {
        let mut svc = service();
        svc.connect(1, 10);
        svc.connect(2, 10);
        svc.connect(1, 11);

        svc.abandon_match(10);
        assert!(!svc.is_active(1, 10));
        assert!(!svc.is_active(2, 10));
        assert!(svc.is_active(1, 11));
    }

    #[test]
    fn test_missing_session_errors() {
        let mut svc = service();
        assert!(matches!(
            svc.disconnect(9, 9),
            Err(EngineError::SessionNotFound { .. })
        ));
        assert!(matches!(
            svc.reconnect(9, 9),
            Err(EngineError::SessionNotFound { .. })
        ));
        assert!(!svc.can_reconnect(9, 9));
    }
}
