/// HTTP handlers for the control server
pub mod control;

pub use control::register_routes;
