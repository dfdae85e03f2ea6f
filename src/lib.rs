//! Moquette - MQTT topic to executable router
//!
//! Subscribes to a message bus and, for every inbound message, runs the
//! executable whose file name encodes a matching topic pattern. Handlers
//! talk back over a private pipe to publish messages or kill siblings
//! working the same topic.

#[cfg(not(unix))]
compile_error!("moquette spawns handlers with unix file descriptor wiring and only builds on unix");

pub mod bus;
pub mod config;
pub mod dispatcher;
pub mod process;
pub mod protocol;
pub mod router;
pub mod utils;
