use serde::{Deserialize, Serialize};

/// Wire envelope exchanged with termite agents.
///
/// The variant tag precedes the payload on the wire; tag names and field
/// layout are part of the agent contract and are not versioned.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", content = "body")]
pub enum Message {
    /// Output (or input) bytes belonging to one remote process.
    Stdio { key: String, data: Vec<u8> },

    /// The remote confirmed a process launch and reports its pid.
    ProcessStarted { key: String, pid: u32 },

    /// The remote process exited with the given code.
    ProcessStopped { key: String, code: i32 },

    /// Server-to-agent notice that this connection was rejected because an
    /// identical fingerprint is already registered.
    DuplicatedClient {},
}
