// Copyright 2016 Benoît Labaere (benoit.labaere@gmail.com)
//
// Licensed under the Apache License, Version 2.0 <LICENSE-APACHE or http://www.apache.org/licenses/LICENSE-2.0>
// or the MIT license <LICENSE-MIT or http://opensource.org/licenses/MIT>, at your option.
// This file may not be copied, modified, or distributed except according to those terms.

//! The error taxonomy from the design: six kinds, distinct in meaning
//! though several of them wrap a plain `io::Error` at the boundary where
//! they are raised.

use std::io;
use thiserror::Error;

/// The six error kinds. Each has its own recovery policy, documented on
/// the variant; the policy is enforced by the caller (socket/service/
/// gateway code), not by this type.
#[derive(Debug, Error)]
pub enum GatewayError {
    /// Malformed frame, unknown action, unknown type tag, or a frame
    /// whose declared length was never matched by the stream.
    /// Recovery: disconnect the offending socket only.
    #[error("protocol violation: {0}")]
    ProtocolViolation(String),

    /// TCP read/write/connect failure.
    /// Recovery: status callback; mesh peers reconnect on a timer,
    /// client sockets are simply dropped.
    #[error("transport failure: {0}")]
    TransportFailure(#[from] io::Error),

    /// A bounded wait expired (construction Ack, request/reply deadline).
    /// Recovery: surface to the caller, do not crash.
    #[error("timed out waiting for {0}")]
    Timeout(String),

    /// A buffer grew past its configured maximum.
    /// Recovery: disconnect the offending connection.
    #[error("resource exhausted: {0}")]
    ResourceExhaustion(String),

    /// Subscribe-with-wildcard-in-publish, empty subject, and similar
    /// misuse that a well-behaved peer would never send.
    /// Recovery: log and drop the frame; the connection stays open.
    #[error("policy violation: {0}")]
    PolicyViolation(String),

    /// Trie inconsistency, socket found in an unexpected state, and
    /// other bugs-not-faults.
    /// Recovery: log with full context, process continues.
    #[error("internal invariant violated: {0}")]
    InternalInvariant(String),
}

pub type Result<T> = std::result::Result<T, GatewayError>;
