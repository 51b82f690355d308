//! Just enough of the Minecraft wire protocols to impersonate a sleeping
//! server: the Java Edition server-list-ping and login-disconnect exchange,
//! and the Bedrock (RakNet) unconnected ping/pong.
//!
//! Nothing here forwards traffic; every conversation ends with a canned
//! reply and a closed socket.

pub mod bedrock;
pub mod java;
