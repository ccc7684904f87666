//! Error type for PROXY preamble parsing and serialization.

/// Error type for PROXY preamble operations.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ProxyError {
    /// The buffer holds a plausible preamble prefix but not a complete one.
    /// Not fatal - the caller should read more bytes and retry.
    #[error("truncated preamble")]
    Truncated,

    /// The bytes claim to be a preamble but violate the wire format.
    #[error("invalid preamble: {0}")]
    Invalid(&'static str),

    /// A v2 preamble advertises an address family this implementation does
    /// not decode (only TCPv4 and TCPv6 are supported). Not fatal: `consumed`
    /// covers the whole preamble, so the caller can skip it and keep the
    /// transport-observed peer addresses.
    #[error("unsupported address family {family:#04x}")]
    UnsupportedFamily { family: u8, consumed: usize },
}

impl ProxyError {
    /// Returns true if this error indicates more data is needed.
    #[inline]
    pub fn is_truncated(&self) -> bool {
        matches!(self, ProxyError::Truncated)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn truncated_predicate() {
        assert!(ProxyError::Truncated.is_truncated());
        assert!(!ProxyError::Invalid("x").is_truncated());
        assert!(
            !ProxyError::UnsupportedFamily {
                family: 0x31,
                consumed: 16
            }
            .is_truncated()
        );
    }

    #[test]
    fn display() {
        assert_eq!(ProxyError::Truncated.to_string(), "truncated preamble");
        assert_eq!(
            ProxyError::Invalid("missing CRLF").to_string(),
            "invalid preamble: missing CRLF"
        );
        assert_eq!(
            ProxyError::UnsupportedFamily {
                family: 0x31,
                consumed: 232
            }
            .to_string(),
            "unsupported address family 0x31"
        );
    }
}
