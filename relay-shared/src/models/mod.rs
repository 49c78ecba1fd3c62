pub mod events;
pub mod message;

pub use events::{
    ClientEvent, HistoryIncompleteEvent, MessageEvent, NicknameEvent, PresenceEvent, SessionEvent,
};
pub use message::{
    AckStatus, Message, NewMessage, NicknameRequest, PublishAck, PublishRequest, SequenceId,
};
