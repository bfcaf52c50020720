// Copyright (c) Starcoin, Inc.
// SPDX-License-Identifier: Apache-2.0

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BridgeError {
    // Invalid or unusable configuration, only raised at startup
    Config(String),
    // Storage backend failure, data-integrity risk
    Backend(String),
    // Failure to serialize a record for storage or hashing
    Serialization(String),
    // Failure to deserialize a stored record or a network body
    Deserialization(String),
    // A recomputed digest does not match the digest carried by a record
    DigestMismatch {
        expected: String,
        calculated: String,
    },
    // The recovered signer is not a member of the validator set
    SignerNotInSet(String),
    // A signature does not recover to the validator that claims it
    SignatureInvalid(String),
    // The submission envelope expired before it was received
    Expired,
    // A numeric string does not fit the width the digest requires
    Overflow(String),
    // Transient RPC failure, retried on the next poll tick
    RpcTransient(String),
    // The requested transfer is not stored
    TransferNotFound,
    // Uncategorized error
    Generic(String),
}

impl BridgeError {
    /// Short stable string for metrics labels.
    pub fn error_type(&self) -> &'static str {
        match self {
            BridgeError::Config(_) => "config",
            BridgeError::Backend(_) => "backend",
            BridgeError::Serialization(_) => "serialization",
            BridgeError::Deserialization(_) => "deserialization",
            BridgeError::DigestMismatch { .. } => "digest_mismatch",
            BridgeError::SignerNotInSet(_) => "signer_not_in_set",
            BridgeError::SignatureInvalid(_) => "signature_invalid",
            BridgeError::Expired => "expired",
            BridgeError::Overflow(_) => "overflow",
            BridgeError::RpcTransient(_) => "rpc_transient",
            BridgeError::TransferNotFound => "transfer_not_found",
            BridgeError::Generic(_) => "generic",
        }
    }

    /// True for errors that indicate corrupt state or a programming bug when
    /// they surface while streaming locally observed events. The streamers
    /// abort the process on these; the HTTP ingestion path never does.
    pub fn is_fatal_in_streamer(&self) -> bool {
        !matches!(self, BridgeError::RpcTransient(_))
    }
}

impl std::fmt::Display for BridgeError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            BridgeError::DigestMismatch {
                expected,
                calculated,
            } => write!(
                f,
                "the calculated hash is different than the one received {} != calculated {}",
                expected, calculated
            ),
            BridgeError::Expired => write!(f, "Expired signature"),
            BridgeError::TransferNotFound => write!(f, "transfer does not exist"),
            other => write!(f, "{:?}", other),
        }
    }
}

impl std::error::Error for BridgeError {}

pub type BridgeResult<T> = Result<T, BridgeError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_type_labels_are_prometheus_safe() {
        let errors = vec![
            BridgeError::Config("x".to_string()),
            BridgeError::Backend("x".to_string()),
            BridgeError::Serialization("x".to_string()),
            BridgeError::Deserialization("x".to_string()),
            BridgeError::DigestMismatch {
                expected: "a".to_string(),
                calculated: "b".to_string(),
            },
            BridgeError::SignerNotInSet("x".to_string()),
            BridgeError::SignatureInvalid("x".to_string()),
            BridgeError::Expired,
            BridgeError::Overflow("x".to_string()),
            BridgeError::RpcTransient("x".to_string()),
            BridgeError::TransferNotFound,
            BridgeError::Generic("x".to_string()),
        ];
        for error in errors {
            let label = error.error_type();
            assert!(!label.is_empty());
            assert!(label.chars().all(|c| c.is_ascii_lowercase() || c == '_'));
            assert!(!label.starts_with('_') && !label.ends_with('_'));
        }
    }

    #[test]
    fn test_rpc_errors_are_not_fatal() {
        assert!(!BridgeError::RpcTransient("timeout".to_string()).is_fatal_in_streamer());
        assert!(BridgeError::Backend("io".to_string()).is_fatal_in_streamer());
        assert!(BridgeError::DigestMismatch {
            expected: "a".to_string(),
            calculated: "b".to_string(),
        }
        .is_fatal_in_streamer());
    }
}
