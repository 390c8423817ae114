//! Decoded-frame and wire-message types for the MAVLink proxy.
//!
//! PAM does not reimplement full MAVLink v2 framing (spec §1 non-goal); what
//! lives here is the subset of the dialect message set PAM's protocol
//! operations actually touch, kept as our own type so the buffer/handler/
//! param logic in this module can be unit-tested against a stand-in codec
//! (see [`super::codec`]) instead of a live dialect implementation.

use serde::Serialize;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum ParamType {
    Uint8,
    Int8,
    Uint16,
    Int16,
    Uint32,
    Int32,
    Uint64,
    Int64,
    Real32,
    Real64,
}

impl ParamType {
    /// Whether two encoded values of this type should be compared with the
    /// float relative-tolerance rule or exact integer equality (spec
    /// §4.3's `set_params_bulk_lossy` verification rule).
    pub fn is_float(self) -> bool {
        matches!(self, ParamType::Real32 | ParamType::Real64)
    }
}

/// A single decoded on-wire value, carried as both its raw encoded bytes
/// (reinterpreted as the parameter's type) and a best-effort float for
/// generic comparisons.
#[derive(Clone, Copy, Debug, PartialEq)]
pub enum ParamValue {
    Int(i64),
    Float(f64),
}

impl ParamValue {
    pub fn as_f64(self) -> f64 {
        match self {
            ParamValue::Int(i) => i as f64,
            ParamValue::Float(f) => f,
        }
    }
}

/// The subset of MAVLink messages PAM's protocol operations send or match
/// against. Grounded on the common dialect's `HEARTBEAT`, `PARAM_VALUE`,
/// `PARAM_SET`, `PARAM_REQUEST_READ`, `COMMAND_LONG`, `COMMAND_ACK`,
/// `SERIAL_CONTROL` and the MAVLink-FTP `FILE_TRANSFER_PROTOCOL` message.
#[derive(Clone, Debug)]
pub enum MavMessage {
    Heartbeat {
        autopilot: u8,
        base_mode: u8,
        system_status: u8,
    },
    ParamValue {
        param_id: String,
        param_value: ParamValue,
        param_type: ParamType,
        param_count: u16,
        param_index: u16,
    },
    ParamSet {
        param_id: String,
        param_value: ParamValue,
        param_type: ParamType,
    },
    ParamRequestRead {
        param_id: String,
    },
    CommandLong {
        command: u16,
        params: [f32; 7],
    },
    CommandAck {
        command: u16,
        result: u8,
    },
    SerialControl {
        device: u8,
        data: Vec<u8>,
    },
    FileTransferProtocol {
        payload: Vec<u8>,
    },
    Other {
        msg_id: u32,
    },
}

impl MavMessage {
    /// The numeric MAVLink message id, used as the dispatch key (as a
    /// string) into the handler registry (spec §3).
    pub fn msg_id(&self) -> u32 {
        match self {
            MavMessage::Heartbeat { .. } => 0,
            MavMessage::SerialControl { .. } => 126,
            MavMessage::ParamRequestRead { .. } => 20,
            MavMessage::ParamSet { .. } => 23,
            MavMessage::ParamValue { .. } => 22,
            MavMessage::CommandLong { .. } => 76,
            MavMessage::CommandAck { .. } => 77,
            MavMessage::FileTransferProtocol { .. } => 110,
            MavMessage::Other { msg_id } => *msg_id,
        }
    }

    pub fn name(&self) -> &'static str {
        match self {
            MavMessage::Heartbeat { .. } => "HEARTBEAT",
            MavMessage::SerialControl { .. } => "SERIAL_CONTROL",
            MavMessage::ParamRequestRead { .. } => "PARAM_REQUEST_READ",
            MavMessage::ParamSet { .. } => "PARAM_SET",
            MavMessage::ParamValue { .. } => "PARAM_VALUE",
            MavMessage::CommandLong { .. } => "COMMAND_LONG",
            MavMessage::CommandAck { .. } => "COMMAND_ACK",
            MavMessage::FileTransferProtocol { .. } => "FILE_TRANSFER_PROTOCOL",
            MavMessage::Other { .. } => "OTHER",
        }
    }
}

/// A frame as it arrives off the wire: source identity plus the decoded
/// message body (spec §3: "Frames carry their source system/component and
/// a decoded type string").
#[derive(Clone, Debug)]
pub struct DecodedFrame {
    pub source_system: u8,
    pub source_component: u8,
    pub message: MavMessage,
}

impl DecodedFrame {
    pub fn dispatch_key(&self) -> String {
        self.message.msg_id().to_string()
    }
}

pub const MAV_CMD_PREFLIGHT_REBOOT_SHUTDOWN: u16 = 246;

/// COMMAND_ACK result codes PAM distinguishes for `reboot_autopilot` (spec
/// §4.3).
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum CommandResult {
    Accepted,
    TemporarilyRejected,
    Denied,
    Unsupported,
    Failed,
    InProgress,
}

impl CommandResult {
    pub fn from_wire(code: u8) -> Self {
        match code {
            0 => CommandResult::Accepted,
            1 => CommandResult::TemporarilyRejected,
            2 => CommandResult::Denied,
            3 => CommandResult::Unsupported,
            4 => CommandResult::Failed,
            5 => CommandResult::InProgress,
            _ => CommandResult::Failed,
        }
    }
}
