//! External collaborators: the mux daemon client, the WebSocket relay
//! source, and logging setup.

pub mod logging;
pub mod mux;
pub mod relay;
