/// TCP progress synchronisation
///
/// - `connection`: one registered client stream and its liveness state
/// - `registry`: connection set plus the replay backlog, under one lock
/// - `server`: accept / broadcast / reaper loops
/// - `emitter`: client used by the ingestion path to push updates in
pub mod connection;
pub mod emitter;
pub mod registry;
pub mod server;

pub use connection::{Connection, ConnectionId};
pub use emitter::ProgressEmitter;
pub use registry::ConnectionRegistry;
pub use server::ProgressSyncServer;
