/// Event schema shared by the sync hub and its clients
///
/// Defines the two event payloads that travel over the wire:
/// - `Notification`: catalog changes fanned out over UDP
/// - `ProgressUpdate`: per-user reading progress fanned out over TCP
///
/// plus the control envelopes of both transports (`UdpMessage`,
/// `ClientMessage`, `ServerMessage`). Every message is a single JSON object;
/// TCP frames are newline-terminated, UDP datagrams are not.
pub mod notification;
pub mod progress;
pub mod wire;

pub use notification::{Notification, NotificationKind};
pub use progress::ProgressUpdate;
pub use wire::{ClientMessage, ServerMessage, UdpMessage};

/// Current time as Unix milliseconds, the timestamp unit of every event.
pub fn now_millis() -> i64 {
    chrono::Utc::now().timestamp_millis()
}
