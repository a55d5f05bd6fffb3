// Copyright 2016 Benoît Labaere (benoit.labaere@gmail.com)
//
// Licensed under the Apache License, Version 2.0 <LICENSE-APACHE or http://www.apache.org/licenses/LICENSE-2.0>
// or the MIT license <LICENSE-MIT or http://opensource.org/licenses/MIT>, at your option.
// This file may not be copied, modified, or distributed except according to those terms.

//! The Message/Field/BLOB value types. Their full API is out of scope
//! (see spec §1); this is the minimum wire-compatible shape C1 needs to
//! be testable: a count-prefixed sequence of named, typed fields.

use crate::error::GatewayError;
use crate::frame::{FrameReader, FrameWriter};

/// A single field value. The tag byte on the wire is `FieldValue::tag()`.
#[derive(Debug, Clone, PartialEq)]
pub enum FieldValue {
    Str(String),
    Int32(i32),
    Uint32(u32),
    Int64(i64),
    Uint64(u64),
    Double(f64),
    Message(Message),
    Bool(bool),
    Blob(Vec<u8>),
}

impl FieldValue {
    fn tag(&self) -> u8 {
        match self {
            FieldValue::Str(_) => 0x01,
            FieldValue::Int32(_) => 0x02,
            FieldValue::Uint32(_) => 0x03,
            FieldValue::Int64(_) => 0x04,
            FieldValue::Uint64(_) => 0x05,
            FieldValue::Double(_) => 0x06,
            FieldValue::Message(_) => 0x07,
            FieldValue::Bool(_) => 0x08,
            FieldValue::Blob(_) => 0x09,
        }
    }

    fn write(&self, w: &mut FrameWriter) {
        match self {
            FieldValue::Str(s) => w.write_string(s),
            FieldValue::Int32(v) => w.write_i32(*v),
            FieldValue::Uint32(v) => w.write_u32(*v),
            FieldValue::Int64(v) => w.write_i64(*v),
            FieldValue::Uint64(v) => w.write_u64(*v),
            FieldValue::Double(v) => w.write_f64(*v),
            FieldValue::Message(m) => m.write(w),
            FieldValue::Bool(v) => w.write_bool(*v),
            FieldValue::Blob(b) => w.write_blob(b),
        }
    }

    fn read(tag: u8, r: &mut FrameReader) -> crate::error::Result<FieldValue> {
        Ok(match tag {
            0x01 => FieldValue::Str(r.read_string()?),
            0x02 => FieldValue::Int32(r.read_i32()?),
            0x03 => FieldValue::Uint32(r.read_u32()?),
            0x04 => FieldValue::Int64(r.read_i64()?),
            0x05 => FieldValue::Uint64(r.read_u64()?),
            0x06 => FieldValue::Double(r.read_f64()?),
            0x07 => FieldValue::Message(Message::read(r)?),
            0x08 => FieldValue::Bool(r.read_bool()?),
            0x09 => FieldValue::Blob(r.read_blob()?),
            other => {
                return Err(GatewayError::ProtocolViolation(format!(
                    "unknown field type tag {other}"
                )))
            }
        })
    }
}

/// A named, typed field inside a [`Message`].
#[derive(Debug, Clone, PartialEq)]
pub struct Field {
    pub name: String,
    pub value: FieldValue,
}

/// A count-prefixed sequence of fields; the body of a Publish frame.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct Message {
    fields: Vec<Field>,
}

impl Message {
    pub fn new() -> Message {
        Message { fields: Vec::new() }
    }

    pub fn with_field(mut self, name: impl Into<String>, value: FieldValue) -> Message {
        self.fields.push(Field {
            name: name.into(),
            value,
        });
        self
    }

    pub fn get(&self, name: &str) -> Option<&FieldValue> {
        self.fields.iter().find(|f| f.name == name).map(|f| &f.value)
    }

    pub fn fields(&self) -> &[Field] {
        &self.fields
    }

    pub(crate) fn write(&self, w: &mut FrameWriter) {
        w.write_u32(self.fields.len() as u32);
        for field in &self.fields {
            w.write_string(&field.name);
            w.write_u8(field.value.tag());
            field.value.write(w);
        }
    }

    pub(crate) fn read(r: &mut FrameReader) -> crate::error::Result<Message> {
        let count = r.read_u32()?;
        let mut fields = Vec::with_capacity(count as usize);
        for _ in 0..count {
            let name = r.read_string()?;
            let tag = r.read_u8()?;
            let value = FieldValue::read(tag, r)?;
            fields.push(Field { name, value });
        }
        Ok(Message { fields })
    }
}
