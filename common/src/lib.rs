//! Pieces shared by the StreamSockets client and server binaries: the frame
//! formats that ride on the WebSocket carrier, and typed environment-variable
//! helpers both processes configure themselves with.

pub mod env;
pub mod protocol;
