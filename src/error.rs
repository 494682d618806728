/// Error types for the console protocol, storage glue and configuration
use std::time::Duration;

use crate::vantage::link::LinkState;

/// Malformed packet payloads. The offending packet is dropped.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum FormatError {
    #[error("expected {expected} bytes, got {actual}")]
    Length { expected: usize, actual: usize },

    #[error("packet does not begin with 'LOO': {0:02x?}")]
    Signature([u8; 3]),

    #[error("checksum mismatch: sent {sent:#06x}, computed {computed:#06x}")]
    Checksum { sent: u16, computed: u16 },
}

/// Everything that can go wrong while talking to the console.
#[derive(Debug, thiserror::Error)]
pub enum VantageError {
    #[error("transport error: {0}")]
    Transport(#[from] std::io::Error),

    #[error("{operation} timed out after {after:?}")]
    Timeout {
        operation: &'static str,
        after: Duration,
    },

    #[error("failed to wake console after {attempts} attempts")]
    Handshake { attempts: usize },

    #[error("protocol error during {context}: {}", describe_response(.received))]
    Protocol {
        context: String,
        received: Option<u8>,
    },

    #[error("malformed packet: {0}")]
    Format(#[from] FormatError),

    #[error("cannot {operation} while link is {state:?}")]
    InvalidState {
        operation: &'static str,
        state: LinkState,
    },

    #[error("archive output receiver was dropped")]
    OutputClosed,

    #[error("a LOOP burst must request at least one packet")]
    EmptyBurst,
}

impl VantageError {
    pub fn protocol<S: Into<String>>(context: S, received: Option<u8>) -> Self {
        VantageError::Protocol {
            context: context.into(),
            received,
        }
    }

    /// True for socket-level failures, which are fixed by redialing.
    pub fn is_transport(&self) -> bool {
        matches!(
            self,
            VantageError::Transport(_) | VantageError::Timeout { .. }
        )
    }
}

fn describe_response(received: &Option<u8>) -> String {
    match received {
        Some(byte) => format!("unexpected response byte {:#04x}", byte),
        None => "no response before deadline".to_string(),
    }
}

/// Failures of the PostgreSQL summary store.
#[derive(Debug, thiserror::Error)]
pub enum StorageError {
    #[error("invalid database url: {0}")]
    Config(String),

    #[error("TLS setup failed: {0}")]
    Tls(String),

    #[error("query failed: {0}")]
    Query(#[from] tokio_postgres::Error),

    #[error("giving up after {0} attempts")]
    RetriesExhausted(usize),
}

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("{0} environment variable not set")]
    Missing(&'static str),

    #[error("invalid value for {name}: '{value}'")]
    Invalid { name: &'static str, value: String },
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn only_socket_failures_are_transport_errors() {
        let refused = std::io::Error::new(std::io::ErrorKind::ConnectionRefused, "refused");
        assert!(VantageError::from(refused).is_transport());
        assert!(VantageError::Timeout {
            operation: "LOOP packet read",
            after: Duration::from_secs(5),
        }
        .is_transport());

        assert!(!VantageError::protocol("LOOP", Some(0x21)).is_transport());
        assert!(!VantageError::Handshake { attempts: 3 }.is_transport());
        assert!(!VantageError::from(FormatError::Signature(*b"XYZ")).is_transport());
        assert!(!VantageError::EmptyBurst.is_transport());
    }

    #[test]
    fn protocol_error_names_the_byte() {
        let err = VantageError::protocol("DMPAFT timestamp", Some(0x21));
        assert_eq!(
            err.to_string(),
            "protocol error during DMPAFT timestamp: unexpected response byte 0x21"
        );
    }
}
