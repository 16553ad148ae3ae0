//! Grid layout derived from the peer set.
//!
//! [`compose_view`] is a pure function of its inputs: the same peers in the
//! same order with the same focus always produce the same [`ViewState`].

use serde::{Deserialize, Serialize};

use super::session::{PeerSession, PeerSummary};

/// Most peers shown at once without focus.
pub const MAX_VISIBLE_PEERS: usize = 6;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ViewState {
    pub cols: u8,
    pub rows: u8,
    /// Peer ids to render, in registry insertion order.
    pub visible_peers: Vec<String>,
    /// Set only when the focus target is a live peer.
    pub focused_peer_id: Option<String>,
    pub overflow_count: usize,
    /// No peers: the local participant fills the screen.
    pub solo_local: bool,
}

/// Anything that occupies a tile.
pub trait Tile {
    fn tile_id(&self) -> &str;
}

impl Tile for PeerSession {
    fn tile_id(&self) -> &str {
        self.id()
    }
}

impl Tile for PeerSummary {
    fn tile_id(&self) -> &str {
        &self.id
    }
}

impl Tile for String {
    fn tile_id(&self) -> &str {
        self
    }
}

impl Tile for &str {
    fn tile_id(&self) -> &str {
        self
    }
}

/// Grid shape for `n` peers.
pub fn grid_shape(n: usize) -> (u8, u8) {
    match n {
        0 | 1 => (1, 1),
        2 => (2, 1),
        3 | 4 => (2, 2),
        _ => (3, 2),
    }
}

pub fn compose_view<T: Tile>(peers: &[T], focused_peer_id: Option<&str>) -> ViewState {
    if let Some(focused) = focused_peer_id.and_then(|id| peers.iter().find(|p| p.tile_id() == id)) {
        return ViewState {
            cols: 1,
            rows: 1,
            visible_peers: vec![focused.tile_id().to_string()],
            focused_peer_id: Some(focused.tile_id().to_string()),
            overflow_count: 0,
            solo_local: false,
        };
    }

    let (cols, rows) = grid_shape(peers.len());
    ViewState {
        cols,
        rows,
        visible_peers: peers
            .iter()
            .take(MAX_VISIBLE_PEERS)
            .map(|p| p.tile_id().to_string())
            .collect(),
        focused_peer_id: None,
        overflow_count: peers.len().saturating_sub(MAX_VISIBLE_PEERS),
        solo_local: peers.is_empty(),
    }
}
