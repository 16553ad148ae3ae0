//! Peer-mesh conference orchestrator.
//!
//! A participant joins a named room through a WebSocket signaling relay and
//! holds one WebRTC connection per remote participant. The [`room::Room`]
//! task drives negotiation, local media switching and the view layout; a
//! presentation layer talks to it through a [`room::RoomHandle`].

pub mod config;
pub mod connection;
pub mod error;
pub mod media;
pub mod room;
pub mod rtc;
pub mod signaling;

pub use config::ConferenceConfig;
pub use error::{ConferenceError, Result};
pub use room::{Intent, Notice, NoticeKind, Room, RoomHandle, RoomPhase, RoomSnapshot};
