//! Server game modules: rooms, players, combat, lag compensation, delta sync

pub mod combat;
pub mod history;
pub mod manager;
pub mod player;
pub mod room;
pub mod snapshot;
pub mod weapon;

pub use manager::{RoomManager, RoomRegistry};
pub use room::{JoinError, Room, RoomCommand, RoomCommandKind, RoomHandle, RoomPhase};
pub use snapshot::{DeltaTracker, SnapshotBuilder, WorldSnapshot};
