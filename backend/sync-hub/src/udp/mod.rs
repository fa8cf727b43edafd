/// UDP catalog notifications
///
/// - `registry`: subscriber set keyed by peer address
/// - `server`: registration handshake and bounded fan-out
/// - `client`: subscriber-side companion used by CLIs and tests
pub mod client;
pub mod registry;
pub mod server;

pub use client::NotificationSubscriber;
pub use registry::SubscriberRegistry;
pub use server::{BroadcastReport, NotificationServer};
