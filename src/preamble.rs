//! AMQP protocol header exchanged before any frame.
//!
//! Both peers open with eight bytes: the ASCII `AMQP`, a protocol id and the
//! major, minor and revision numbers. The engine only speaks plain AMQP
//! (protocol id 0) version 1.0.0 and checks the header byte for byte.

use thiserror::Error;

/// Number of bytes in the protocol header.
pub const HEADER_LEN: usize = 8;
/// Fixed prefix of every protocol header.
pub const PROTOCOL_PREFIX: &[u8; 4] = b"AMQP";
/// Protocol id of plain AMQP.
pub const PROTOCOL_ID_AMQP: u8 = 0;
/// Protocol id of a SASL security layer.
pub const PROTOCOL_ID_SASL: u8 = 3;
/// The header this engine sends and expects.
pub const AMQP_HEADER: [u8; HEADER_LEN] = [b'A', b'M', b'Q', b'P', PROTOCOL_ID_AMQP, 1, 0, 0];

/// Parsed protocol header.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct ProtocolHeader {
    /// Protocol id.
    pub protocol_id: u8,
    /// Major version.
    pub major: u8,
    /// Minor version.
    pub minor: u8,
    /// Revision.
    pub revision: u8,
}

/// Errors raised when the peer's protocol header is not `AMQP 0 1 0 0`.
#[derive(Clone, Debug, Error, PartialEq, Eq)]
pub enum HeaderError {
    /// The first four bytes were not `AMQP`.
    #[error("invalid protocol prefix {0:02x?}")]
    InvalidPrefix([u8; 4]),
    /// A protocol layer this engine does not implement, such as SASL.
    #[error("unsupported protocol id {0}")]
    UnsupportedProtocol(u8),
    /// A version other than 1.0.0.
    #[error("unsupported version {major}.{minor}.{revision}")]
    UnsupportedVersion {
        /// Major version received.
        major: u8,
        /// Minor version received.
        minor: u8,
        /// Revision received.
        revision: u8,
    },
}

/// Parse and validate the 8-byte protocol header.
///
/// # Errors
/// Returns a [`HeaderError`] if any byte differs from [`AMQP_HEADER`].
#[must_use = "handle the result"]
pub fn parse_header(buf: &[u8; HEADER_LEN]) -> Result<ProtocolHeader, HeaderError> {
    let [a, m, q, p, protocol_id, major, minor, revision] = *buf;
    if [a, m, q, p] != *PROTOCOL_PREFIX {
        return Err(HeaderError::InvalidPrefix([a, m, q, p]));
    }
    if protocol_id != PROTOCOL_ID_AMQP {
        return Err(HeaderError::UnsupportedProtocol(protocol_id));
    }
    if (major, minor, revision) != (1, 0, 0) {
        return Err(HeaderError::UnsupportedVersion {
            major,
            minor,
            revision,
        });
    }
    Ok(ProtocolHeader {
        protocol_id,
        major,
        minor,
        revision,
    })
}

#[cfg(test)]
mod tests {
    use rstest::rstest;

    use super::*;

    #[test]
    fn accepts_amqp_header() {
        assert_eq!(
            parse_header(&AMQP_HEADER),
            Ok(ProtocolHeader {
                protocol_id: 0,
                major: 1,
                minor: 0,
                revision: 0,
            })
        );
    }

    #[rstest]
    #[case(*b"AMQX\x00\x01\x00\x00", HeaderError::InvalidPrefix(*b"AMQX"))]
    #[case(*b"AMQP\x03\x01\x00\x00", HeaderError::UnsupportedProtocol(PROTOCOL_ID_SASL))]
    #[case(*b"AMQP\x00\x00\x09\x01", HeaderError::UnsupportedVersion { major: 0, minor: 9, revision: 1 })]
    #[case(*b"AMQP\x00\x01\x00\x01", HeaderError::UnsupportedVersion { major: 1, minor: 0, revision: 1 })]
    fn rejects_mismatched_bytes(#[case] bytes: [u8; HEADER_LEN], #[case] expected: HeaderError) {
        assert_eq!(parse_header(&bytes), Err(expected));
    }
}
