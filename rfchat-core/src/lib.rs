//! RFCOMM chat protocol reference implementation.
//! Host-driven: no radio I/O; host feeds watcher events and byte streams.

pub mod connection;
pub mod device;
pub mod discovery;
pub mod protocol;
pub mod service;
pub mod wire;

pub use connection::{
    classify_read_error, ConnectionState, ConnectionStateMachine, DisconnectReason, ReadOutcome,
    Role, StopCause,
};
pub use device::{DeviceId, DeviceUpdate, DiscoveredDevice};
pub use discovery::{DeviceListChange, Discovery, Toggle, WatcherEvent, WatcherStatus};
pub use service::{ServiceRecord, ServiceRecordError, SdpAttributes, CHAT_SERVICE};
pub use wire::{
    encode_frame, read_frame, read_frame_limited, write_frame, FrameReadError, FrameWriteError,
    MAX_FRAME_LEN,
};
