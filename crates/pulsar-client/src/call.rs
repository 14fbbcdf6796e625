//! Two-phase procedure call construction.
//!
//! A call is begun with its full header (which procedure, how it relays,
//! whether it is retained), argument bytes are written in order, and the
//! call is then handed to the client to send. Sending consumes the
//! arguments; a second send of the same builder is an error rather than a
//! silent duplicate.

use pulsar_proto::{CacheMode, TargetFilter};
use pulsar_session::Transport;

/// Errors raised by call construction.
#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum CallError {
    /// The builder was already sent.
    #[error("call already finished")]
    AlreadyFinished,
}

/// Routing header fixed at `begin` time.
#[derive(Debug, Clone, Copy)]
pub(crate) enum CallHeader {
    Global {
        rpc_id: u8,
        cache: CacheMode,
    },
    Instance {
        view_id: u16,
        rpc_id: u8,
        instance_id: u8,
        target: TargetFilter,
        cache: CacheMode,
        transport: Transport,
    },
}

/// An in-progress procedure call: header plus accumulating argument bytes.
///
/// Obtained from [`crate::PulsarClient::begin_global_call`] or
/// [`crate::PulsarClient::begin_instance_call`]. All writers are
/// little-endian to match the argument reader on the receiving side.
#[derive(Debug)]
pub struct CallBuilder {
    pub(crate) header: CallHeader,
    args: Vec<u8>,
    finished: bool,
}

impl CallBuilder {
    pub(crate) fn new(header: CallHeader) -> Self {
        Self {
            header,
            args: Vec::new(),
            finished: false,
        }
    }

    pub fn write_u8(&mut self, value: u8) -> &mut Self {
        self.args.push(value);
        self
    }

    pub fn write_u16(&mut self, value: u16) -> &mut Self {
        self.args.extend_from_slice(&value.to_le_bytes());
        self
    }

    pub fn write_u32(&mut self, value: u32) -> &mut Self {
        self.args.extend_from_slice(&value.to_le_bytes());
        self
    }

    pub fn write_f32(&mut self, value: f32) -> &mut Self {
        self.args.extend_from_slice(&value.to_le_bytes());
        self
    }

    /// Write a length-prefixed UTF-8 string (u16 length). Text longer than
    /// the prefix can carry is truncated at the last character boundary
    /// that fits, so the receiver always reads valid UTF-8.
    pub fn write_str(&mut self, value: &str) -> &mut Self {
        let mut end = value.len().min(usize::from(u16::MAX));
        while !value.is_char_boundary(end) {
            end -= 1;
        }
        self.args.extend_from_slice(&(end as u16).to_le_bytes());
        self.args.extend_from_slice(&value.as_bytes()[..end]);
        self
    }

    pub fn write_bytes(&mut self, value: &[u8]) -> &mut Self {
        self.args.extend_from_slice(value);
        self
    }

    /// Take the argument bytes for sending. Fails on the second take.
    pub(crate) fn take_args(&mut self) -> Result<Vec<u8>, CallError> {
        if self.finished {
            return Err(CallError::AlreadyFinished);
        }
        self.finished = true;
        Ok(std::mem::take(&mut self.args))
    }
}
