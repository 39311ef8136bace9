//! Ready-Up Flow
//!
//! After the matchmaker pairs two players, a short confirmation window
//! opens. Both confirm: the room proceeds to READY. A decline or timeout
//! rewinds the pairing: whoever confirmed goes back to the head of the
//! queue, the other is withdrawn.

use std::time::{Duration, Instant};

use std::collections::BTreeMap;

use tokio::sync::RwLock;
use tracing::debug;

use crate::game::player::PlayerId;
use crate::game::room::{GameMode, RoomId};
use crate::matchmaking::queue::QueueEntry;

/// Lobby configuration.
#[derive(Debug, Clone)]
pub struct LobbyConfig {
    /// Window for both players to confirm.
    pub ready_timeout: Duration,
}

impl Default for LobbyConfig {
    fn default() -> Self {
        Self {
            ready_timeout: Duration::from_secs(10),
        }
    }
}

/// One side of a pending pairing.
#[derive(Debug, Clone)]
struct PendingPlayer {
    entry: QueueEntry,
    confirmed: bool,
}

/// A pairing waiting on confirmations.
#[derive(Debug, Clone)]
pub struct PendingMatch {
    pub room_id: RoomId,
    pub mode: GameMode,
    players: [PendingPlayer; 2],
    opened_at: Instant,
}

impl PendingMatch {
    fn player_mut(&mut self, player_id: &PlayerId) -> Option<&mut PendingPlayer> {
        self.players
            .iter_mut()
            .find(|p| &p.entry.player_id == player_id)
    }

    fn all_confirmed(&self) -> bool {
        self.players.iter().all(|p| p.confirmed)
    }

    /// Entries that had confirmed, for head-of-queue re-insertion.
    fn confirmed_entries(&self) -> Vec<QueueEntry> {
        self.players
            .iter()
            .filter(|p| p.confirmed)
            .map(|p| p.entry.clone())
            .collect()
    }

    fn unconfirmed_ids(&self) -> Vec<PlayerId> {
        self.players
            .iter()
            .filter(|p| !p.confirmed)
            .map(|p| p.entry.player_id.clone())
            .collect()
    }
}

/// Outcome of a ready-up confirmation.
#[derive(Debug)]
pub enum ConfirmOutcome {
    /// Waiting for the other player.
    Waiting { room_id: RoomId },
    /// Both confirmed; the room may start.
    AllConfirmed { room_id: RoomId },
    /// The pairing was rewound by a decline.
    Rewound(RewindOutcome),
    /// The player has no pending pairing.
    NotPending,
}

/// What a rewind produced.
#[derive(Debug)]
pub struct RewindOutcome {
    pub room_id: RoomId,
    /// Re-enqueue these at the head of the queue.
    pub requeue: Vec<QueueEntry>,
    /// Withdrawn players (decliners and timeouts).
    pub withdrawn: Vec<PlayerId>,
}

/// Tracks all pairings inside their ready-up window.
pub struct LobbyManager {
    config: LobbyConfig,
    pending: RwLock<BTreeMap<RoomId, PendingMatch>>,
}

impl LobbyManager {
    pub fn new(config: LobbyConfig) -> Self {
        Self {
            config,
            pending: RwLock::new(BTreeMap::new()),
        }
    }

    pub fn config(&self) -> &LobbyConfig {
        &self.config
    }

    /// Open the ready-up window for a fresh pairing.
    pub async fn open(&self, room_id: RoomId, mode: GameMode, first: QueueEntry, second: QueueEntry) {
        let pending = PendingMatch {
            room_id,
            mode,
            players: [
                PendingPlayer {
                    entry: first,
                    confirmed: false,
                },
                PendingPlayer {
                    entry: second,
                    confirmed: false,
                },
            ],
            opened_at: Instant::now(),
        };
        self.pending.write().await.insert(room_id, pending);
    }

    /// Record a confirmation or decline.
    pub async fn confirm(&self, player_id: &PlayerId, ready: bool) -> ConfirmOutcome {
        let mut pending = self.pending.write().await;
        let room_id = match pending
            .values()
            .find(|m| m.players.iter().any(|p| &p.entry.player_id == player_id))
        {
            Some(m) => m.room_id,
            None => return ConfirmOutcome::NotPending,
        };

        if !ready {
            // Decline rewinds the pairing immediately
            let matched = match pending.remove(&room_id) {
                Some(matched) => matched,
                None => return ConfirmOutcome::NotPending,
            };
            let mut withdrawn = vec![player_id.clone()];
            withdrawn.extend(
                matched
                    .unconfirmed_ids()
                    .into_iter()
                    .filter(|id| id != player_id),
            );
            let requeue = matched
                .confirmed_entries()
                .into_iter()
                .filter(|e| &e.player_id != player_id)
                .collect();
            debug!(room = %room_id, player = %player_id, "ready-up declined");
            return ConfirmOutcome::Rewound(RewindOutcome {
                room_id,
                requeue,
                withdrawn,
            });
        }

        let matched = match pending.get_mut(&room_id) {
            Some(matched) => matched,
            None => return ConfirmOutcome::NotPending,
        };
        if let Some(p) = matched.player_mut(player_id) {
            p.confirmed = true;
        }
        if matched.all_confirmed() {
            pending.remove(&room_id);
            ConfirmOutcome::AllConfirmed { room_id }
        } else {
            ConfirmOutcome::Waiting { room_id }
        }
    }

    /// Expire pairings whose window elapsed. Confirmed players return to
    /// the head of the queue; the rest are withdrawn.
    pub async fn expire(&self) -> Vec<RewindOutcome> {
        let timeout = self.config.ready_timeout;
        let mut pending = self.pending.write().await;
        let stale: Vec<RoomId> = pending
            .values()
            .filter(|m| m.opened_at.elapsed() >= timeout)
            .map(|m| m.room_id)
            .collect();

        let mut outcomes = Vec::with_capacity(stale.len());
        for room_id in stale {
            if let Some(matched) = pending.remove(&room_id) {
                debug!(room = %room_id, "ready-up window expired");
                outcomes.push(RewindOutcome {
                    room_id,
                    requeue: matched.confirmed_entries(),
                    withdrawn: matched.unconfirmed_ids(),
                });
            }
        }
        outcomes
    }

    /// Drop a pending pairing (e.g. a participant disconnected).
    pub async fn remove(&self, room_id: &RoomId) -> Option<RewindOutcome> {
        self.pending.write().await.remove(room_id).map(|matched| RewindOutcome {
            room_id: *room_id,
            requeue: matched.confirmed_entries(),
            withdrawn: matched.unconfirmed_ids(),
        })
    }

    /// Pending pairing for a player, if any.
    pub async fn pending_for(&self, player_id: &PlayerId) -> Option<RoomId> {
        self.pending
            .read()
            .await
            .values()
            .find(|m| m.players.iter().any(|p| &p.entry.player_id == player_id))
            .map(|m| m.room_id)
    }

    pub async fn pending_count(&self) -> usize {
        self.pending.read().await.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use uuid::Uuid;

    fn entry(id: &str) -> QueueEntry {
        QueueEntry::new(
            PlayerId::new(id),
            id.to_string(),
            1200,
            GameMode::Casual,
            None,
        )
    }

    fn lobby() -> LobbyManager {
        LobbyManager::new(LobbyConfig::default())
    }

    #[tokio::test]
    async fn test_both_confirm() {
        let lobby = lobby();
        let room_id = Uuid::new_v4();
        lobby
            .open(room_id, GameMode::Casual, entry("p1"), entry("p2"))
            .await;

        let first = lobby.confirm(&PlayerId::new("p1"), true).await;
        assert!(matches!(first, ConfirmOutcome::Waiting { .. }));

        let second = lobby.confirm(&PlayerId::new("p2"), true).await;
        match second {
            ConfirmOutcome::AllConfirmed { room_id: id } => assert_eq!(id, room_id),
            other => panic!("unexpected outcome {other:?}"),
        }
        assert_eq!(lobby.pending_count().await, 0);
    }

    #[tokio::test]
    async fn test_decline_rewinds_confirmed_player() {
        let lobby = lobby();
        let room_id = Uuid::new_v4();
        lobby
            .open(room_id, GameMode::Casual, entry("p1"), entry("p2"))
            .await;

        lobby.confirm(&PlayerId::new("p1"), true).await;
        let outcome = lobby.confirm(&PlayerId::new("p2"), false).await;
        match outcome {
            ConfirmOutcome::Rewound(rewind) => {
                assert_eq!(rewind.requeue.len(), 1);
                assert_eq!(rewind.requeue[0].player_id, PlayerId::new("p1"));
                assert_eq!(rewind.withdrawn, vec![PlayerId::new("p2")]);
            }
            other => panic!("unexpected outcome {other:?}"),
        }
        assert_eq!(lobby.pending_count().await, 0);
    }

    #[tokio::test]
    async fn test_timeout_requeues_only_confirmed() {
        let config = LobbyConfig {
            ready_timeout: Duration::from_millis(0),
        };
        let lobby = LobbyManager::new(config);
        let room_id = Uuid::new_v4();
        lobby
            .open(room_id, GameMode::Casual, entry("p1"), entry("p2"))
            .await;
        lobby.confirm(&PlayerId::new("p1"), true).await;

        let outcomes = lobby.expire().await;
        assert_eq!(outcomes.len(), 1);
        assert_eq!(outcomes[0].requeue.len(), 1);
        assert_eq!(outcomes[0].requeue[0].player_id, PlayerId::new("p1"));
        assert_eq!(outcomes[0].withdrawn, vec![PlayerId::new("p2")]);
    }

    #[tokio::test]
    async fn test_unknown_player_not_pending() {
        let lobby = lobby();
        let outcome = lobby.confirm(&PlayerId::new("ghost"), true).await;
        assert!(matches!(outcome, ConfirmOutcome::NotPending));
    }

    #[test]
    fn test_pending_for_lookup() {
        tokio_test::block_on(async {
            let lobby = lobby();
            let room_id = Uuid::new_v4();
            lobby
                .open(room_id, GameMode::Ranked, entry("p1"), entry("p2"))
                .await;
            assert_eq!(lobby.pending_for(&PlayerId::new("p1")).await, Some(room_id));
            assert_eq!(lobby.pending_for(&PlayerId::new("p3")).await, None);
        });
    }

    #[tokio::test]
    async fn test_confirm_waiting_keeps_window_open() {
        let lobby = lobby();
        let room_id = Uuid::new_v4();
        lobby
            .open(room_id, GameMode::Casual, entry("p1"), entry("p2"))
            .await;
        lobby.confirm(&PlayerId::new("p1"), true).await;
        assert_eq!(lobby.pending_count().await, 1);
    }
}
