//! Binary bridge frames carried on the `zmq` device topics.
//!
//! A frame is the fully-qualified proto name, a single `:`, then the
//! protobuf-encoded body:
//!
//! ```text
//! embodied.perception.audio.zmqSTTRequest:<protobuf bytes>
//! ```

use prost::Message;

use crate::error::{ProtoError, Result};

/// A protobuf message that travels over the bridge under a fixed name.
pub trait BridgeMessage: Message + Default {
    const PROTO_NAME: &'static str;
}

/// Borrowed view of an inbound frame.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BridgeFrame<'a> {
    pub proto_name: &'a str,
    pub body: &'a [u8],
}

impl<'a> BridgeFrame<'a> {
    pub fn parse(payload: &'a [u8]) -> Result<Self> {
        let colon = payload
            .iter()
            .position(|b| *b == b':')
            .ok_or(ProtoError::MissingProtoName)?;
        let proto_name =
            std::str::from_utf8(&payload[..colon]).map_err(|_| ProtoError::InvalidProtoName)?;
        Ok(Self {
            proto_name,
            body: &payload[colon + 1..],
        })
    }

    pub fn is<M: BridgeMessage>(&self) -> bool {
        self.proto_name == M::PROTO_NAME
    }

    pub fn decode<M: BridgeMessage>(&self) -> Result<M> {
        M::decode(self.body).map_err(|source| ProtoError::Decode {
            proto: M::PROTO_NAME,
            source,
        })
    }
}

/// Encode `message` as a bridge payload.
pub fn encode_frame<M: BridgeMessage>(message: &M) -> Vec<u8> {
    let body = message.encode_to_vec();
    let mut payload = Vec::with_capacity(M::PROTO_NAME.len() + 1 + body.len());
    payload.extend_from_slice(M::PROTO_NAME.as_bytes());
    payload.push(b':');
    payload.extend_from_slice(&body);
    payload
}

/// Voice activity state reported with each audio frame.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, prost::Enumeration)]
#[repr(i32)]
pub enum VadState {
    Unknown = 0,
    StartOfSpeech = 1,
    InProgress = 2,
    EndOfSpeech = 3,
}

/// One frame of streamed utterance audio (16 kHz mono PCM16 LE).
#[derive(Clone, PartialEq, Message)]
pub struct SttRequest {
    #[prost(string, tag = "1")]
    pub uuid: String,
    #[prost(bytes = "vec", tag = "2")]
    pub audio_content: Vec<u8>,
    /// Device wall clock in milliseconds.
    #[prost(uint64, tag = "3")]
    pub timestamp: u64,
    #[prost(enumeration = "VadState", tag = "4")]
    pub vad: i32,
}

impl BridgeMessage for SttRequest {
    const PROTO_NAME: &'static str = "embodied.perception.audio.zmqSTTRequest";
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, prost::Enumeration)]
#[repr(i32)]
pub enum SttResponseType {
    Interim = 0,
    Final = 1,
}

/// Transcription result for one utterance.
#[derive(Clone, PartialEq, Message)]
pub struct SttResponse {
    #[prost(string, tag = "1")]
    pub uuid: String,
    #[prost(enumeration = "SttResponseType", tag = "2")]
    pub r#type: i32,
    #[prost(uint64, tag = "3")]
    pub timestamp: u64,
    #[prost(string, tag = "4")]
    pub speech: String,
    #[prost(uint64, tag = "5")]
    pub start_timestamp: u64,
    #[prost(uint64, tag = "6")]
    pub end_timestamp: u64,
    #[prost(int32, tag = "7")]
    pub error_code: i32,
    #[prost(string, tag = "8")]
    pub error_message: String,
}

impl BridgeMessage for SttResponse {
    const PROTO_NAME: &'static str = "embodied.perception.audio.zmqSTTResponse";
}

/// Ask the device to forward the named protos over the bridge.
#[derive(Clone, PartialEq, Message)]
pub struct ProtoSubscribe {
    #[prost(string, repeated, tag = "1")]
    pub protos: Vec<String>,
    #[prost(uint64, tag = "2")]
    pub timestamp: u64,
}

impl BridgeMessage for ProtoSubscribe {
    const PROTO_NAME: &'static str = "embodied.logging.ProtoSubscribe";
}

/// Milliseconds since the Unix epoch.
pub fn now_ms() -> u64 {
    u64::try_from(chrono::Utc::now().timestamp_millis()).unwrap_or_default()
}
