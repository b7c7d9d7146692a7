// Copyright 2026 The DSM Authors. All Rights Reserved.
// SPDX-License-Identifier: Apache-2.0

//! Coherence messages and their wire encoding.

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};

use crate::{NodeId, PageIndex};

/// Errors associated with encoding or decoding a message.
#[rustfmt::skip]
#[derive(Debug, thiserror::Error, displaydoc::Display)]
pub enum CodecError {
    /// Cannot encode message: {0}
    Encode(#[from] bincode::error::EncodeError),
    /// Cannot decode message: {0}
    Decode(#[from] bincode::error::DecodeError),
    /// {0} unexpected trailing bytes after message
    Trailing(usize),
}

/// A request travelling from one node to another.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum Request {
    /// Ask the home node for a shared copy.
    Fetch {
        /// Page wanted.
        page: PageIndex,
        /// Node that faulted.
        requester: NodeId,
    },
    /// Ask the home node for exclusive ownership.
    Upgrade {
        /// Page wanted.
        page: PageIndex,
        /// Node that faulted.
        requester: NodeId,
    },
    /// Revoke all access of the receiver; the owner hands back its content.
    Invalidate {
        /// Page revoked.
        page: PageIndex,
        /// Node about to become the owner.
        new_owner: NodeId,
        /// Directory transaction issuing the revocation.
        seq: u64,
    },
    /// Revoke write access of the receiver and collect its content.
    Downgrade {
        /// Page revoked.
        page: PageIndex,
        /// Node about to receive a shared copy.
        requester: NodeId,
        /// Directory transaction issuing the revocation.
        seq: u64,
    },
}

impl Request {
    /// Page the request is about.
    pub fn page(&self) -> PageIndex {
        match *self {
            Request::Fetch { page, .. }
            | Request::Upgrade { page, .. }
            | Request::Invalidate { page, .. }
            | Request::Downgrade { page, .. } => page,
        }
    }

    /// Short name for logs.
    pub fn name(&self) -> &'static str {
        match self {
            Request::Fetch { .. } => "fetch",
            Request::Upgrade { .. } => "upgrade",
            Request::Invalidate { .. } => "invalidate",
            Request::Downgrade { .. } => "downgrade",
        }
    }
}

/// Content and entitlement handed to a requester by the home node.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Grant {
    /// Latest committed content of the page, if the home has a copy.
    pub bytes: Option<Vec<u8>>,
    /// The requester already owns the page and keeps its own copy if it holds `version`.
    pub keep_local: bool,
    /// Directory version after the transaction.
    pub version: u64,
    /// Directory transaction that produced the grant.
    pub seq: u64,
}

/// Answer to a [`Request`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum Response {
    /// Answer to [`Request::Fetch`].
    Fetch(Grant),
    /// Answer to [`Request::Upgrade`].
    Upgrade(Grant),
    /// Answer to [`Request::Invalidate`].
    InvalidateAck {
        /// Content the receiver last wrote as owner, if it still has it.
        bytes: Option<Vec<u8>>,
        /// Directory version `bytes` belong to.
        version: u64,
    },
    /// Answer to [`Request::Downgrade`].
    DowngradeAck {
        /// Content the receiver last wrote as owner, if it still has it.
        bytes: Option<Vec<u8>>,
        /// Directory version `bytes` belong to.
        version: u64,
    },
    /// The home node gave up on the transaction because `peer` did not answer.
    Unreachable {
        /// The silent participant.
        peer: NodeId,
    },
}

/// Encodes a message for the wire.
pub fn encode<T: Serialize>(message: &T) -> Result<Vec<u8>, CodecError> {
    Ok(bincode::serde::encode_to_vec(
        message,
        bincode::config::standard(),
    )?)
}

/// Decodes a message produced by [`encode`].
pub fn decode<T: DeserializeOwned>(bytes: &[u8]) -> Result<T, CodecError> {
    let (message, read) =
        bincode::serde::decode_from_slice(bytes, bincode::config::standard())?;
    if read != bytes.len() {
        return Err(CodecError::Trailing(bytes.len() - read));
    }
    Ok(message)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_codec() {
        let request = Request::Downgrade {
            page: 3,
            requester: 1,
            seq: 42,
        };
        let wire = encode(&request).unwrap();
        assert_eq!(decode::<Request>(&wire).unwrap(), request);

        let response = Response::Fetch(Grant {
            bytes: Some(vec![9; 4096]),
            keep_local: false,
            version: 2,
            seq: 7,
        });
        let wire = encode(&response).unwrap();
        assert_eq!(decode::<Response>(&wire).unwrap(), response);

        let ack = Response::InvalidateAck {
            bytes: None,
            version: 3,
        };
        let wire = encode(&ack).unwrap();
        assert_eq!(decode::<Response>(&wire).unwrap(), ack);
    }

    #[test]
    fn test_malformed() {
        let mut wire = encode(&Request::Fetch {
            page: 1,
            requester: 0,
        })
        .unwrap();
        wire.push(0);
        assert!(matches!(
            decode::<Request>(&wire),
            Err(CodecError::Trailing(1))
        ));
        assert!(matches!(
            decode::<Request>(&[0xff, 0xff]),
            Err(CodecError::Decode(_))
        ));
    }

    #[test]
    fn test_request_accessors() {
        let request = Request::Invalidate {
            page: 5,
            new_owner: 2,
            seq: 1,
        };
        assert_eq!(request.page(), 5);
        assert_eq!(request.name(), "invalidate");
    }
}
