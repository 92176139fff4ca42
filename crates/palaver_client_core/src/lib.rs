#![forbid(unsafe_code)]

//! Client-side channel plumbing: a reconnecting WebSocket connection manager,
//! history page merging and local unread-badge state. UI-framework agnostic;
//! owners observe status and last error through watch channels and receive
//! inbound frames on an mpsc receiver.

pub mod badges;
pub mod history;
pub mod manager;
pub mod reconnect;

pub use badges::InboxBadges;
pub use history::HistoryBuffer;
pub use manager::{ConnectionManager, ManagerConfig, Status};
pub use reconnect::ReconnectPolicy;
