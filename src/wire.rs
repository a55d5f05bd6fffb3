// Copyright 2016 Benoît Labaere (benoit.labaere@gmail.com)
//
// Licensed under the Apache License, Version 2.0 <LICENSE-APACHE or http://www.apache.org/licenses/LICENSE-2.0>
// or the MIT license <LICENSE-MIT or http://opensource.org/licenses/MIT>, at your option.
// This file may not be copied, modified, or distributed except according to those terms.

//! The header shared by every frame: action, subscription-id, subject,
//! reply-subject. Tag values here are normative for interop per spec §6.

use crate::error::{GatewayError, Result};
use crate::frame::{FrameReader, FrameWriter};
use crate::message::Message;

/// The maximum frame size accepted from the wire before a connection is
/// disconnected for resource exhaustion (spec §7, kind 4).
pub const MAX_FRAME_LEN: u32 = 16 * 1024 * 1024;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Action {
    Connect,
    ConnectMeshPeer,
    Ack,
    Subscribe,
    Unsubscribe,
    Publish,
    Disconnect,
}

impl Action {
    fn tag(self) -> u8 {
        match self {
            Action::Connect => 1,
            Action::ConnectMeshPeer => 2,
            Action::Ack => 3,
            Action::Subscribe => 4,
            Action::Unsubscribe => 5,
            Action::Publish => 6,
            Action::Disconnect => 7,
        }
    }

    fn from_tag(tag: u8) -> Result<Action> {
        Ok(match tag {
            1 => Action::Connect,
            2 => Action::ConnectMeshPeer,
            3 => Action::Ack,
            4 => Action::Subscribe,
            5 => Action::Unsubscribe,
            6 => Action::Publish,
            7 => Action::Disconnect,
            other => {
                return Err(GatewayError::ProtocolViolation(format!(
                    "unknown action code {other}"
                )))
            }
        })
    }
}

/// `Action SubscriptionId Subject ReplySubject`, the fixed part of every
/// frame's payload.
#[derive(Debug, Clone)]
pub struct Header {
    pub action: Action,
    pub subscription_id: u32,
    pub subject: String,
    pub reply_subject: String,
}

impl Header {
    pub fn new(action: Action, subject: impl Into<String>) -> Header {
        Header {
            action,
            subscription_id: 0,
            subject: subject.into(),
            reply_subject: String::new(),
        }
    }

    pub fn with_subscription_id(mut self, id: u32) -> Header {
        self.subscription_id = id;
        self
    }

    pub fn with_reply_subject(mut self, reply_subject: impl Into<String>) -> Header {
        self.reply_subject = reply_subject.into();
        self
    }

    fn write(&self, w: &mut FrameWriter) {
        w.write_u8(self.action.tag());
        w.write_u32(self.subscription_id);
        w.write_string(&self.subject);
        w.write_string(&self.reply_subject);
    }

    fn read(r: &mut FrameReader) -> Result<Header> {
        let action = Action::from_tag(r.read_u8()?)?;
        let subscription_id = r.read_u32()?;
        let subject = r.read_string()?;
        let reply_subject = r.read_string()?;
        Ok(Header {
            action,
            subscription_id,
            subject,
            reply_subject,
        })
    }
}

/// A full frame payload: the header, plus a Message body for Publish
/// frames (empty for everything else).
#[derive(Debug, Clone)]
pub struct Frame {
    pub header: Header,
    pub body: Option<Message>,
}

impl Frame {
    pub fn control(header: Header) -> Frame {
        Frame { header, body: None }
    }

    pub fn publish(header: Header, body: Message) -> Frame {
        Frame {
            header,
            body: Some(body),
        }
    }

    /// Serializes into a complete, length-prefixed wire frame.
    pub fn to_bytes(&self) -> Vec<u8> {
        let mut w = FrameWriter::new();
        self.header.write(&mut w);
        if let Some(body) = &self.body {
            body.write(&mut w);
        }
        w.finish()
    }

    /// Parses a frame's payload (the bytes after the four-byte length
    /// prefix, as produced by [`crate::frame::FrameAssembler`]).
    pub fn from_payload(payload: &[u8]) -> Result<Frame> {
        let mut r = FrameReader::new(payload);
        let header = Header::read(&mut r)?;
        let body = match header.action {
            Action::Publish => Some(Message::read(&mut r)?),
            _ => None,
        };
        Ok(Frame { header, body })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::frame::FrameAssembler;
    use crate::message::FieldValue;

    #[test]
    fn publish_frame_round_trips() {
        let header = Header::new(Action::Publish, "orders.new")
            .with_subscription_id(10)
            .with_reply_subject("_INBOX.abc");
        let body = Message::new().with_field("qty", FieldValue::Int32(5));
        let frame = Frame::publish(header, body);
        let bytes = frame.to_bytes();

        let mut assembler = FrameAssembler::new(MAX_FRAME_LEN);
        let consumed = assembler.append_from_stream(&bytes).unwrap();
        assert_eq!(consumed, bytes.len());
        assert!(assembler.has_complete_frame());

        let decoded = Frame::from_payload(&assembler.take_payload()).unwrap();
        assert_eq!(decoded.header.subscription_id, 10);
        assert_eq!(decoded.header.subject, "orders.new");
        assert_eq!(decoded.header.reply_subject, "_INBOX.abc");
        assert_eq!(decoded.body.unwrap().get("qty"), Some(&FieldValue::Int32(5)));
    }

    #[test]
    fn control_frame_has_no_body() {
        let frame = Frame::control(Header::new(Action::Disconnect, "svc"));
        let bytes = frame.to_bytes();
        let decoded = Frame::from_payload(&bytes[4..]).unwrap();
        assert!(decoded.body.is_none());
    }
}
