//! Minimal encode/decode for the message subset in [`super::message`].
//!
//! Real MAVLink v2 framing (magic byte, sequence, CRC-DATA, signing) is out
//! of scope (spec §1 non-goal: "a wire-compatible codec is assumed
//! available"). This module is the stand-in PAM's own protocol logic
//! (buffer, handlers, params, reboot, ftp) is built and tested against: a
//! flat `[msg_id:u32][sys:u8][comp:u8][body]` framing carried over
//! [`super::transport::MavlinkLink`]'s length-delimited transport, with one
//! `encode_body`/`decode_body` pair per [`MavMessage`] variant.

use super::message::{MavMessage, ParamType, ParamValue};

fn encode_param_value(v: ParamValue, out: &mut Vec<u8>) {
    match v {
        ParamValue::Int(i) => {
            out.push(0);
            out.extend_from_slice(&i.to_le_bytes());
        }
        ParamValue::Float(f) => {
            out.push(1);
            out.extend_from_slice(&f.to_le_bytes());
        }
    }
}

fn decode_param_value(buf: &[u8]) -> Option<(ParamValue, &[u8])> {
    let (tag, rest) = buf.split_first()?;
    match tag {
        0 => {
            let (bytes, rest) = rest.split_at_checked(8)?;
            Some((ParamValue::Int(i64::from_le_bytes(bytes.try_into().ok()?)), rest))
        }
        1 => {
            let (bytes, rest) = rest.split_at_checked(8)?;
            Some((ParamValue::Float(f64::from_le_bytes(bytes.try_into().ok()?)), rest))
        }
        _ => None,
    }
}

fn param_type_code(t: ParamType) -> u8 {
    match t {
        ParamType::Uint8 => 0,
        ParamType::Int8 => 1,
        ParamType::Uint16 => 2,
        ParamType::Int16 => 3,
        ParamType::Uint32 => 4,
        ParamType::Int32 => 5,
        ParamType::Uint64 => 6,
        ParamType::Int64 => 7,
        ParamType::Real32 => 8,
        ParamType::Real64 => 9,
    }
}

fn param_type_from_code(code: u8) -> Option<ParamType> {
    Some(match code {
        0 => ParamType::Uint8,
        1 => ParamType::Int8,
        2 => ParamType::Uint16,
        3 => ParamType::Int16,
        4 => ParamType::Uint32,
        5 => ParamType::Int32,
        6 => ParamType::Uint64,
        7 => ParamType::Int64,
        8 => ParamType::Real32,
        9 => ParamType::Real64,
        _ => return None,
    })
}

fn encode_str(s: &str, out: &mut Vec<u8>) {
    let bytes = s.as_bytes();
    out.extend_from_slice(&(bytes.len() as u16).to_le_bytes());
    out.extend_from_slice(bytes);
}

fn decode_str(buf: &[u8]) -> Option<(String, &[u8])> {
    let (len_bytes, rest) = buf.split_at_checked(2)?;
    let len = u16::from_le_bytes(len_bytes.try_into().ok()?) as usize;
    let (str_bytes, rest) = rest.split_at_checked(len)?;
    Some((String::from_utf8(str_bytes.to_vec()).ok()?, rest))
}

/// Encodes `source_system`/`source_component` plus the message body into a
/// single frame suitable for [`super::transport::MavlinkLink::write_frame`].
pub fn encode_frame(source_system: u8, source_component: u8, msg: &MavMessage) -> Vec<u8> {
    let mut out = Vec::with_capacity(32);
    out.extend_from_slice(&msg.msg_id().to_le_bytes());
    out.push(source_system);
    out.push(source_component);
    match msg {
        MavMessage::Heartbeat {
            autopilot,
            base_mode,
            system_status,
        } => {
            out.push(*autopilot);
            out.push(*base_mode);
            out.push(*system_status);
        }
        MavMessage::ParamValue {
            param_id,
            param_value,
            param_type,
            param_count,
            param_index,
        } => {
            encode_str(param_id, &mut out);
            encode_param_value(*param_value, &mut out);
            out.push(param_type_code(*param_type));
            out.extend_from_slice(&param_count.to_le_bytes());
            out.extend_from_slice(&param_index.to_le_bytes());
        }
        MavMessage::ParamSet {
            param_id,
            param_value,
            param_type,
        } => {
            encode_str(param_id, &mut out);
            encode_param_value(*param_value, &mut out);
            out.push(param_type_code(*param_type));
        }
        MavMessage::ParamRequestRead { param_id } => {
            encode_str(param_id, &mut out);
        }
        MavMessage::CommandLong { command, params } => {
            out.extend_from_slice(&command.to_le_bytes());
            for p in params {
                out.extend_from_slice(&p.to_le_bytes());
            }
        }
        MavMessage::CommandAck { command, result } => {
            out.extend_from_slice(&command.to_le_bytes());
            out.push(*result);
        }
        MavMessage::SerialControl { device, data } => {
            out.push(*device);
            out.extend_from_slice(&(data.len() as u16).to_le_bytes());
            out.extend_from_slice(data);
        }
        MavMessage::FileTransferProtocol { payload } => {
            out.extend_from_slice(&(payload.len() as u16).to_le_bytes());
            out.extend_from_slice(payload);
        }
        MavMessage::Other { .. } => {}
    }
    out
}

/// Inverse of [`encode_frame`]; returns `(source_system, source_component,
/// message)`. `None` on a truncated or unrecognized frame -- the caller
/// logs and drops it rather than propagating a decode error (spec §4.3:
/// reader errors never abort the I/O task).
pub fn decode_frame(buf: &[u8]) -> Option<(u8, u8, MavMessage)> {
    let (id_bytes, rest) = buf.split_at_checked(4)?;
    let msg_id = u32::from_le_bytes(id_bytes.try_into().ok()?);
    let (header, body) = rest.split_at_checked(2)?;
    let source_system = header[0];
    let source_component = header[1];

    let message = match msg_id {
        0 => {
            let (autopilot, base_mode, system_status) = (
                *body.first()?,
                *body.get(1)?,
                *body.get(2)?,
            );
            MavMessage::Heartbeat {
                autopilot,
                base_mode,
                system_status,
            }
        }
        22 => {
            let (param_id, rest) = decode_str(body)?;
            let (param_value, rest) = decode_param_value(rest)?;
            let (type_code, rest) = rest.split_first()?;
            let param_type = param_type_from_code(*type_code)?;
            let (count_bytes, rest) = rest.split_at_checked(2)?;
            let (index_bytes, _) = rest.split_at_checked(2)?;
            MavMessage::ParamValue {
                param_id,
                param_value,
                param_type,
                param_count: u16::from_le_bytes(count_bytes.try_into().ok()?),
                param_index: u16::from_le_bytes(index_bytes.try_into().ok()?),
            }
        }
        23 => {
            let (param_id, rest) = decode_str(body)?;
            let (param_value, rest) = decode_param_value(rest)?;
            let (type_code, _) = rest.split_first()?;
            MavMessage::ParamSet {
                param_id,
                param_value,
                param_type: param_type_from_code(*type_code)?,
            }
        }
        20 => {
            let (param_id, _) = decode_str(body)?;
            MavMessage::ParamRequestRead { param_id }
        }
        76 => {
            let (cmd_bytes, rest) = body.split_at_checked(2)?;
            let command = u16::from_le_bytes(cmd_bytes.try_into().ok()?);
            let mut params = [0f32; 7];
            let mut rest = rest;
            for p in params.iter_mut() {
                let (bytes, next) = rest.split_at_checked(4)?;
                *p = f32::from_le_bytes(bytes.try_into().ok()?);
                rest = next;
            }
            MavMessage::CommandLong { command, params }
        }
        77 => {
            let (cmd_bytes, rest) = body.split_at_checked(2)?;
            MavMessage::CommandAck {
                command: u16::from_le_bytes(cmd_bytes.try_into().ok()?),
                result: *rest.first()?,
            }
        }
        126 => {
            let device = *body.first()?;
            let (len_bytes, rest) = body.get(1..)?.split_at_checked(2)?;
            let len = u16::from_le_bytes(len_bytes.try_into().ok()?) as usize;
            let data = rest.get(..len)?.to_vec();
            MavMessage::SerialControl { device, data }
        }
        110 => {
            let (len_bytes, rest) = body.split_at_checked(2)?;
            let len = u16::from_le_bytes(len_bytes.try_into().ok()?) as usize;
            let payload = rest.get(..len)?.to_vec();
            MavMessage::FileTransferProtocol { payload }
        }
        other => MavMessage::Other { msg_id: other },
    };

    Some((source_system, source_component, message))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn heartbeat_round_trips() {
        let msg = MavMessage::Heartbeat {
            autopilot: 3,
            base_mode: 81,
            system_status: 4,
        };
        let encoded = encode_frame(1, 1, &msg);
        let (sys, comp, decoded) = decode_frame(&encoded).unwrap();
        assert_eq!((sys, comp), (1, 1));
        assert_eq!(decoded.msg_id(), 0);
    }

    #[test]
    fn param_value_round_trips() {
        let msg = MavMessage::ParamValue {
            param_id: "NAV_ACC_RAD".to_string(),
            param_value: ParamValue::Float(2.0),
            param_type: ParamType::Real32,
            param_count: 10,
            param_index: 3,
        };
        let encoded = encode_frame(1, 1, &msg);
        let (_, _, decoded) = decode_frame(&encoded).unwrap();
        match decoded {
            MavMessage::ParamValue { param_id, param_value, .. } => {
                assert_eq!(param_id, "NAV_ACC_RAD");
                assert_eq!(param_value.as_f64(), 2.0);
            }
            _ => panic!("wrong variant"),
        }
    }

    #[test]
    fn truncated_frame_decodes_to_none() {
        assert!(decode_frame(&[1, 2, 3]).is_none());
    }
}
