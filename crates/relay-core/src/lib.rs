pub mod envelope;
pub mod errors;
pub mod frames;
pub mod ids;
pub mod message;

pub use envelope::{BusEnvelope, BusPayload};
pub use errors::FrameError;
pub use frames::{ChatFrame, InboundFrame, OutboundFrame};
pub use ids::{ConnectionId, InstanceId};
pub use message::{now_timestamp, MessageDraft, MessageRecord, SYSTEM_SENDER};
