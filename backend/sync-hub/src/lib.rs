pub mod config;
pub mod delivery;
pub mod error;
pub mod fanout;
pub mod handlers;
pub mod logging;
pub mod metrics;
pub mod tcp;
pub mod udp;

pub use config::Config;
pub use delivery::{DeliveryBridge, HttpProgressStore, ProgressStore};
pub use error::{AppError, Result};
pub use tcp::{ConnectionRegistry, ProgressEmitter, ProgressSyncServer};
pub use udp::{NotificationServer, NotificationSubscriber, SubscriberRegistry};
