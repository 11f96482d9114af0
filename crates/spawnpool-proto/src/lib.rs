//! Wire protocol shared by the spawnpool supervisor (parent side) and the
//! worker runtime (child side).
//!
//! The protocol is a bidirectional stream of length-prefixed CBOR frames over
//! the child's stdio. Each frame is one self-describing message discriminated
//! by its `cmd` field; binary payloads ride as native CBOR byte strings, so
//! request bodies and response buffers never take a base64 hop.

pub mod frame;
pub mod json_body;
pub mod message;

pub use frame::{FrameReader, FrameWriter, MAX_FRAME_LEN, ProtoError};
pub use json_body::{CONTENT_TYPE_JS, CONTENT_TYPE_JSON, encode_json_body};
pub use message::{
    Command, CompressConfig, Perf, Reply, RequestEnvelope, ResponseBody, ResponseEnvelope,
    ResponseType, ServerInfo, UploadedFile, WorkerBootConfig, status,
};
