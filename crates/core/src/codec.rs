//! Length-prefixed record framing.
//!
//! A body is a sequence of records, each a big-endian `u32` length followed
//! by that many bytes of MessagePack. Readers consume records in order and
//! never look past the last one they were asked for.

use bytes::{Buf, BufMut, BytesMut};
use serde::{Deserialize, Serialize};

use crate::error::CodecError;
use crate::registry::TaskRegistry;
use crate::wire::{EnvelopeRecord, TaskEnvelope};

const LEN_PREFIX: usize = 4;

#[derive(Debug, Default)]
pub struct RecordWriter {
    buf: BytesMut,
}

impl RecordWriter {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn write<T: Serialize>(&mut self, record: &T) -> Result<&mut Self, CodecError> {
        let bytes = rmp_serde::to_vec(record)?;
        self.buf.reserve(LEN_PREFIX + bytes.len());
        self.buf.put_u32(bytes.len() as u32);
        self.buf.put_slice(&bytes);
        Ok(self)
    }

    pub fn write_envelope(&mut self, envelope: &TaskEnvelope) -> Result<&mut Self, CodecError> {
        let record = envelope.to_record()?;
        self.write(&record)
    }

    pub fn len(&self) -> usize {
        self.buf.len()
    }

    pub fn is_empty(&self) -> bool {
        self.buf.is_empty()
    }

    pub fn finish(self) -> Vec<u8> {
        self.buf.to_vec()
    }
}

#[derive(Debug)]
pub struct RecordReader<'a> {
    buf: &'a [u8],
}

impl<'a> RecordReader<'a> {
    pub fn new(buf: &'a [u8]) -> Self {
        Self { buf }
    }

    pub fn has_more(&self) -> bool {
        !self.buf.is_empty()
    }

    pub fn read<T: Deserialize<'a>>(&mut self) -> Result<T, CodecError> {
        if self.buf.is_empty() {
            return Err(CodecError::MissingRecord);
        }
        if self.buf.len() < LEN_PREFIX {
            return Err(CodecError::Truncated {
                needed: LEN_PREFIX,
                available: self.buf.len(),
            });
        }
        let mut prefix = &self.buf[..LEN_PREFIX];
        let len = prefix.get_u32() as usize;
        let available = self.buf.len() - LEN_PREFIX;
        if available < len {
            return Err(CodecError::Truncated {
                needed: len,
                available,
            });
        }

        let body: &'a [u8] = &self.buf[LEN_PREFIX..LEN_PREFIX + len];
        self.buf = &self.buf[LEN_PREFIX + len..];
        Ok(rmp_serde::from_slice(body)?)
    }

    /// Read an envelope record and decode its task through `registry`.
    pub fn read_envelope(&mut self, registry: &TaskRegistry) -> Result<TaskEnvelope, CodecError> {
        let record: EnvelopeRecord = self.read()?;
        TaskEnvelope::from_record(record, registry)
    }
}
