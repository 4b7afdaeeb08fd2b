//! Frame-level wire format: the varint length prefix used on the reliable
//! channel and the framework messages that share the class-id space with
//! registered application types.

use std::fmt::{Debug, Formatter};

use bytes::{BufMut, BytesMut};
use bytes_varint::try_get_fixed::TryGetFixedSupport;
use bytes_varint::{VarIntSupport, VarIntSupportMut};

use crate::error::SerializationError;
use crate::registry::{NetObject, ObjectRegistry};

/// Maximum encoded size of the length prefix (varint u32).
pub const MAX_LENGTH_PREFIX: usize = 5;

pub(crate) const CLASS_REGISTER_TCP: u32 = 1;
pub(crate) const CLASS_REGISTER_UDP: u32 = 2;
pub(crate) const CLASS_INVOKE_METHOD: u32 = 3;
pub(crate) const CLASS_INVOKE_RESULT: u32 = 4;

/// One decoded frame payload: either a framework message or a registered
/// application object.
pub(crate) enum Frame {
    RegisterTcp { connection_id: u32 },
    RegisterUdp { connection_id: u32 },
    InvokeMethod(InvokeMethodMsg),
    InvokeResult(InvokeResultMsg),
    App(NetObject),
}

/// A marshaled method call. `response_data` packs the 6-bit response id with
/// the caller's transmit flags; 0 in the id bits means no response is
/// expected.
pub(crate) struct InvokeMethodMsg {
    pub object_space_id: u16,
    pub object_id: u32,
    pub method_index: u8,
    pub response_data: u8,
    pub args: Vec<NetObject>,
}

pub(crate) struct InvokeResultMsg {
    pub response_data: u8,
    pub outcome: InvokeOutcome,
}

pub(crate) enum InvokeOutcome {
    NoValue,
    Value(NetObject),
    Exception(String),
}

const OUTCOME_NO_VALUE: u8 = 0;
const OUTCOME_VALUE: u8 = 1;
const OUTCOME_EXCEPTION: u8 = 2;

impl Debug for Frame {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        match self {
            Frame::RegisterTcp { connection_id } => write!(f, "RegisterTcp({})", connection_id),
            Frame::RegisterUdp { connection_id } => write!(f, "RegisterUdp({})", connection_id),
            Frame::InvokeMethod(m) => write!(
                f,
                "InvokeMethod(space {}, object {}, method {}, response_data {:#04x}, {} args)",
                m.object_space_id,
                m.object_id,
                m.method_index,
                m.response_data,
                m.args.len()
            ),
            Frame::InvokeResult(r) => write!(f, "InvokeResult(response_data {:#04x})", r.response_data),
            Frame::App(_) => write!(f, "App"),
        }
    }
}

fn malformed(type_name: &'static str) -> impl Fn(bytes_varint::VarIntError) -> SerializationError {
    move |e| SerializationError::Malformed {
        type_name,
        cause: e.into(),
    }
}

impl Frame {
    pub(crate) fn ser(
        &self,
        registry: &ObjectRegistry,
        buf: &mut BytesMut,
    ) -> Result<(), SerializationError> {
        match self {
            Frame::RegisterTcp { connection_id } => {
                buf.put_u32_varint(CLASS_REGISTER_TCP);
                buf.put_u32(*connection_id);
            }
            Frame::RegisterUdp { connection_id } => {
                buf.put_u32_varint(CLASS_REGISTER_UDP);
                buf.put_u32(*connection_id);
            }
            Frame::InvokeMethod(m) => {
                buf.put_u32_varint(CLASS_INVOKE_METHOD);
                buf.put_u16_varint(m.object_space_id);
                buf.put_u32_varint(m.object_id);
                buf.put_u8(m.method_index);
                buf.put_u8(m.response_data);
                buf.put_u8(m.args.len() as u8);
                for arg in &m.args {
                    registry.write_class_and_object(buf, arg.as_ref())?;
                }
            }
            Frame::InvokeResult(r) => {
                buf.put_u32_varint(CLASS_INVOKE_RESULT);
                buf.put_u8(r.response_data);
                match &r.outcome {
                    InvokeOutcome::NoValue => buf.put_u8(OUTCOME_NO_VALUE),
                    InvokeOutcome::Value(v) => {
                        buf.put_u8(OUTCOME_VALUE);
                        registry.write_class_and_object(buf, v.as_ref())?;
                    }
                    InvokeOutcome::Exception(msg) => {
                        buf.put_u8(OUTCOME_EXCEPTION);
                        crate::buf::put_string(buf, msg);
                    }
                }
            }
            Frame::App(obj) => {
                registry.write_class_and_object(buf, obj.as_ref())?;
            }
        }
        Ok(())
    }

    pub(crate) fn deser(
        registry: &ObjectRegistry,
        payload: &[u8],
    ) -> Result<Frame, SerializationError> {
        let mut buf = payload;
        let class_id = buf.try_get_u32_varint().map_err(malformed("class id"))?;
        match class_id {
            CLASS_REGISTER_TCP => Ok(Frame::RegisterTcp {
                connection_id: buf.try_get_u32().map_err(malformed("RegisterTcp"))?,
            }),
            CLASS_REGISTER_UDP => Ok(Frame::RegisterUdp {
                connection_id: buf.try_get_u32().map_err(malformed("RegisterUdp"))?,
            }),
            CLASS_INVOKE_METHOD => Self::deser_invoke_method(registry, &mut buf),
            CLASS_INVOKE_RESULT => Self::deser_invoke_result(registry, &mut buf),
            _ => Ok(Frame::App(registry.read_object(class_id, &mut buf)?)),
        }
    }

    fn deser_invoke_method(
        registry: &ObjectRegistry,
        buf: &mut &[u8],
    ) -> Result<Frame, SerializationError> {
        let object_space_id = buf.try_get_u16_varint().map_err(malformed("InvokeMethod"))?;
        let object_id = buf.try_get_u32_varint().map_err(malformed("InvokeMethod"))?;
        let method_index = buf.try_get_u8().map_err(malformed("InvokeMethod"))?;
        let response_data = buf.try_get_u8().map_err(malformed("InvokeMethod"))?;
        let arg_count = buf.try_get_u8().map_err(malformed("InvokeMethod"))?;
        let mut args = Vec::with_capacity(arg_count as usize);
        for _ in 0..arg_count {
            args.push(registry.read_class_and_object(buf)?);
        }
        Ok(Frame::InvokeMethod(InvokeMethodMsg {
            object_space_id,
            object_id,
            method_index,
            response_data,
            args,
        }))
    }

    fn deser_invoke_result(
        registry: &ObjectRegistry,
        buf: &mut &[u8],
    ) -> Result<Frame, SerializationError> {
        let response_data = buf.try_get_u8().map_err(malformed("InvokeResult"))?;
        let outcome = match buf.try_get_u8().map_err(malformed("InvokeResult"))? {
            OUTCOME_NO_VALUE => InvokeOutcome::NoValue,
            OUTCOME_VALUE => InvokeOutcome::Value(registry.read_class_and_object(buf)?),
            OUTCOME_EXCEPTION => InvokeOutcome::Exception(
                crate::buf::try_get_string(buf).map_err(|e| SerializationError::Malformed {
                    type_name: "InvokeResult",
                    cause: e,
                })?,
            ),
            other => {
                return Err(SerializationError::Malformed {
                    type_name: "InvokeResult",
                    cause: anyhow::anyhow!("invalid outcome tag {}", other),
                })
            }
        };
        Ok(Frame::InvokeResult(InvokeResultMsg {
            response_data,
            outcome,
        }))
    }
}

/// Encodes a length prefix into `out`, returning the number of bytes used.
/// Little-endian base 128, continuation bit on all but the last byte - the
/// same encoding `bytes-varint` uses for `u32`.
pub(crate) fn encode_length_prefix(mut value: u32, out: &mut [u8; MAX_LENGTH_PREFIX]) -> usize {
    let mut i = 0;
    loop {
        let byte = (value & 0x7f) as u8;
        value >>= 7;
        if value == 0 {
            out[i] = byte;
            return i + 1;
        }
        out[i] = byte | 0x80;
        i += 1;
    }
}

/// Attempts to parse a length prefix from the start of `buf`. Returns
/// `Ok(None)` if more bytes are needed, `Ok(Some((prefix_len, payload_len)))`
/// once the prefix is complete, and an error for a prefix that does not
/// terminate within [`MAX_LENGTH_PREFIX`] bytes.
pub(crate) fn try_parse_length_prefix(buf: &[u8]) -> anyhow::Result<Option<(usize, usize)>> {
    let mut value: u64 = 0;
    for (i, &byte) in buf.iter().take(MAX_LENGTH_PREFIX).enumerate() {
        value |= ((byte & 0x7f) as u64) << (7 * i);
        if byte & 0x80 == 0 {
            return Ok(Some((i + 1, value as usize)));
        }
    }
    if buf.len() >= MAX_LENGTH_PREFIX {
        anyhow::bail!("length prefix does not terminate within {} bytes", MAX_LENGTH_PREFIX);
    }
    Ok(None)
}
