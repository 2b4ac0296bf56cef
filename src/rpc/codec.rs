//! Message codec
//!
//! Converts the four logical message kinds into broker records and back.
//! The record value is the raw application payload; everything else rides in
//! string-keyed headers.
//!
//! # Header layout
//!
//! ```text
//! type:       "call" | "tell" | "response" | "done"
//! request-id: opaque request identity
//! method:     handler method name            (requests only)
//! caller:     node id expecting the Response (calls only)
//! sequence:   decimal hop counter            (requests only)
//! deadline:   unix seconds; absent = no deadline
//! service:    service name                   (Service targets)
//! session-name / session-id / session-flow / lock-id (Session targets)
//! node:       node id                        (Node targets)
//! child-id / parent-id                       (nested blocking calls)
//! err-msg:    application error              (Response only)
//! resp-node:  responding node id             (Response only)
//! ```

use bytes::{Buf, BufMut, BytesMut};

use super::broker::{Record, RecordHeader};
use super::error::{Result, RpcError};
use super::message::{Message, Target};

const H_TYPE: &str = "type";
const H_REQUEST_ID: &str = "request-id";
const H_METHOD: &str = "method";
const H_CALLER: &str = "caller";
const H_SEQUENCE: &str = "sequence";
const H_DEADLINE: &str = "deadline";
const H_SERVICE: &str = "service";
const H_SESSION_NAME: &str = "session-name";
const H_SESSION_ID: &str = "session-id";
const H_SESSION_FLOW: &str = "session-flow";
const H_LOCK_ID: &str = "lock-id";
const H_NODE: &str = "node";
const H_CHILD_ID: &str = "child-id";
const H_PARENT_ID: &str = "parent-id";
const H_ERR_MSG: &str = "err-msg";
const H_RESP_NODE: &str = "resp-node";

fn header(key: &str, value: &str) -> RecordHeader {
    RecordHeader {
        key: key.to_string(),
        value: value.as_bytes().to_vec(),
    }
}

fn push_target(headers: &mut Vec<RecordHeader>, target: &Target) {
    match target {
        Target::Service { name } => headers.push(header(H_SERVICE, name)),
        Target::Session {
            name,
            id,
            flow,
            deferred_lock_id,
        } => {
            headers.push(header(H_SESSION_NAME, name));
            headers.push(header(H_SESSION_ID, id));
            headers.push(header(H_SESSION_FLOW, flow));
            if let Some(lock) = deferred_lock_id {
                headers.push(header(H_LOCK_ID, lock));
            }
        }
        Target::Node { id } => headers.push(header(H_NODE, id)),
    }
}

/// Encode a message into a broker record. The record key carries the request
/// id so log inspection tools can group chains without decoding headers.
pub fn encode(msg: &Message) -> Record {
    let mut headers = Vec::with_capacity(8);
    headers.push(header(H_REQUEST_ID, msg.request_id()));

    let value = match msg {
        Message::CallRequest {
            deadline,
            value,
            target,
            method,
            caller,
            sequence,
            child_id,
            parent_id,
            ..
        } => {
            headers.push(header(H_TYPE, "call"));
            headers.push(header(H_METHOD, method));
            headers.push(header(H_CALLER, caller));
            headers.push(header(H_SEQUENCE, &sequence.to_string()));
            if let Some(d) = deadline {
                headers.push(header(H_DEADLINE, &d.to_string()));
            }
            if let Some(c) = child_id {
                headers.push(header(H_CHILD_ID, c));
            }
            if let Some(p) = parent_id {
                headers.push(header(H_PARENT_ID, p));
            }
            push_target(&mut headers, target);
            value.clone()
        }
        Message::TellRequest {
            deadline,
            value,
            target,
            method,
            sequence,
            ..
        } => {
            headers.push(header(H_TYPE, "tell"));
            headers.push(header(H_METHOD, method));
            headers.push(header(H_SEQUENCE, &sequence.to_string()));
            if let Some(d) = deadline {
                headers.push(header(H_DEADLINE, &d.to_string()));
            }
            push_target(&mut headers, target);
            value.clone()
        }
        Message::Response {
            value,
            err_msg,
            node,
            ..
        } => {
            headers.push(header(H_TYPE, "response"));
            headers.push(header(H_RESP_NODE, node));
            if let Some(e) = err_msg {
                headers.push(header(H_ERR_MSG, e));
            }
            value.clone()
        }
        Message::Done { .. } => {
            headers.push(header(H_TYPE, "done"));
            Vec::new()
        }
    };

    Record {
        key: Some(msg.request_id().as_bytes().to_vec()),
        value,
        headers,
        timestamp: None,
    }
}

struct Headers<'a>(&'a [RecordHeader]);

impl<'a> Headers<'a> {
    fn get(&self, key: &str) -> Option<String> {
        self.0
            .iter()
            .find(|h| h.key == key)
            .map(|h| String::from_utf8_lossy(&h.value).into_owned())
    }

    fn require(&self, key: &str) -> Result<String> {
        self.get(key)
            .ok_or_else(|| RpcError::CorruptRecord(format!("missing header {:?}", key)))
    }

    fn sequence(&self) -> Result<u32> {
        let raw = self.require(H_SEQUENCE)?;
        raw.parse()
            .map_err(|_| RpcError::CorruptRecord(format!("bad sequence {:?}", raw)))
    }

    fn deadline(&self) -> Result<Option<u64>> {
        match self.get(H_DEADLINE) {
            None => Ok(None),
            Some(raw) => raw
                .parse()
                .map(Some)
                .map_err(|_| RpcError::CorruptRecord(format!("bad deadline {:?}", raw))),
        }
    }

    fn target(&self) -> Result<Target> {
        if let Some(name) = self.get(H_SERVICE) {
            return Ok(Target::Service { name });
        }
        if let Some(name) = self.get(H_SESSION_NAME) {
            return Ok(Target::Session {
                name,
                id: self.require(H_SESSION_ID)?,
                flow: self.require(H_SESSION_FLOW)?,
                deferred_lock_id: self.get(H_LOCK_ID),
            });
        }
        if let Some(id) = self.get(H_NODE) {
            return Ok(Target::Node { id });
        }
        Err(RpcError::CorruptRecord("request without target".into()))
    }
}

/// Decode a broker record back into a message.
pub fn decode(record: &Record) -> Result<Message> {
    let headers = Headers(&record.headers);
    let request_id = headers.require(H_REQUEST_ID)?;
    let kind = headers.require(H_TYPE)?;

    match kind.as_str() {
        "call" => Ok(Message::CallRequest {
            request_id,
            deadline: headers.deadline()?,
            value: record.value.clone(),
            target: headers.target()?,
            method: headers.require(H_METHOD)?,
            caller: headers.require(H_CALLER)?,
            sequence: headers.sequence()?,
            child_id: headers.get(H_CHILD_ID),
            parent_id: headers.get(H_PARENT_ID),
        }),
        "tell" => Ok(Message::TellRequest {
            request_id,
            deadline: headers.deadline()?,
            value: record.value.clone(),
            target: headers.target()?,
            method: headers.require(H_METHOD)?,
            sequence: headers.sequence()?,
        }),
        "response" => Ok(Message::Response {
            request_id,
            value: record.value.clone(),
            err_msg: headers.get(H_ERR_MSG),
            node: headers.require(H_RESP_NODE)?,
        }),
        "done" => Ok(Message::Done { request_id }),
        other => Err(RpcError::CorruptRecord(format!(
            "unknown message type {:?}",
            other
        ))),
    }
}

/// Encode a call result for parking under an `alt_<requestID>` hint.
///
/// Layout: flag byte (1 = error present), error length + bytes, value bytes.
pub fn encode_result(value: &[u8], err_msg: Option<&str>) -> Vec<u8> {
    let mut buf = BytesMut::with_capacity(value.len() + 8);
    match err_msg {
        Some(e) => {
            buf.put_u8(1);
            buf.put_u32(e.len() as u32);
            buf.put_slice(e.as_bytes());
        }
        None => buf.put_u8(0),
    }
    buf.put_slice(value);
    buf.to_vec()
}

/// Decode a parked call result.
pub fn decode_result(bytes: &[u8]) -> Result<(Vec<u8>, Option<String>)> {
    let mut buf = bytes;
    if buf.remaining() < 1 {
        return Err(RpcError::CorruptRecord("empty parked result".into()));
    }
    let flag = buf.get_u8();
    let err_msg = if flag == 1 {
        if buf.remaining() < 4 {
            return Err(RpcError::CorruptRecord("truncated parked error".into()));
        }
        let len = buf.get_u32() as usize;
        if buf.remaining() < len {
            return Err(RpcError::CorruptRecord("truncated parked error".into()));
        }
        let mut raw = vec![0u8; len];
        buf.copy_to_slice(&mut raw);
        Some(String::from_utf8_lossy(&raw).into_owned())
    } else {
        None
    };
    Ok((buf.to_vec(), err_msg))
}
