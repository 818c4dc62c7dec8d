//! Receiver events.

use std::sync::Arc;

use crate::error::RelayError;
use crate::events::{EventKind, KeyChangeEvent};
use crate::message::{AttachmentPointer, DataMessage, Envelope};

/// Where a delivered message came from.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MessageOrigin {
    /// Sent to us by a peer.
    Peer,
    /// Sent by us from another of our devices and mirrored here.
    SelfSent {
        destination: Option<String>,
        expiration_start_timestamp: Option<u64>,
    },
}

/// An attachment after fetch and decryption.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FetchedAttachment {
    Ready {
        pointer: AttachmentPointer,
        data: Vec<u8>,
    },
    /// Download or decryption failed; the rest of the message is still delivered.
    Failed {
        pointer: AttachmentPointer,
        error: String,
    },
}

impl FetchedAttachment {
    pub fn is_ready(&self) -> bool {
        matches!(self, FetchedAttachment::Ready { .. })
    }

    pub fn pointer(&self) -> &AttachmentPointer {
        match self {
            FetchedAttachment::Ready { pointer, .. } | FetchedAttachment::Failed { pointer, .. } => {
                pointer
            }
        }
    }
}

/// A decrypted data message.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MessageEvent {
    pub source: String,
    pub source_device: u32,
    pub timestamp: u64,
    pub message: DataMessage,
    pub attachments: Vec<FetchedAttachment>,
    /// Set when the sender's identity key changed and was accepted.
    pub key_change: bool,
    pub origin: MessageOrigin,
}

/// One message read on another of our devices.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReadEvent {
    /// Timestamp of the envelope carrying the read sync.
    pub envelope_timestamp: u64,
    /// Timestamp of the message that was read.
    pub timestamp: u64,
    pub sender: String,
    pub source: String,
    pub source_device: u32,
}

/// A failure handling one envelope or frame.
#[derive(Debug, Clone)]
pub struct ErrorEvent {
    pub error: Arc<RelayError>,
    pub envelope: Option<Envelope>,
}

/// Events emitted by [`MessageReceiver`](super::MessageReceiver).
#[derive(Debug, Clone)]
pub enum ReceiverEvent {
    Message(MessageEvent),
    Receipt(Envelope),
    Read(ReadEvent),
    KeyChange(KeyChangeEvent),
    Error(ErrorEvent),
}

/// Variant tags of [`ReceiverEvent`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ReceiverEventKind {
    Message,
    Receipt,
    Read,
    KeyChange,
    Error,
}

impl EventKind for ReceiverEvent {
    type Kind = ReceiverEventKind;

    fn kind(&self) -> ReceiverEventKind {
        match self {
            ReceiverEvent::Message(_) => ReceiverEventKind::Message,
            ReceiverEvent::Receipt(_) => ReceiverEventKind::Receipt,
            ReceiverEvent::Read(_) => ReceiverEventKind::Read,
            ReceiverEvent::KeyChange(_) => ReceiverEventKind::KeyChange,
            ReceiverEvent::Error(_) => ReceiverEventKind::Error,
        }
    }
}
