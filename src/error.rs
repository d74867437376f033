/// Errors that can occur while managing keys, sessions and realtime delivery.
#[derive(thiserror::Error, Debug, Clone, Eq, PartialEq)]
pub enum Error {
    /// No identity key pair has been generated for the user.
    #[error("No identity for user {0}")]
    IdentityNotFound(String),

    /// Key material could not be generated.
    #[error("Key generation failed: {0}")]
    KeyGeneration(String),

    /// The user has no unclaimed one-time pre-keys left.
    #[error("One-time pre-keys exhausted for user {0}")]
    PreKeyExhausted(String),

    /// No usable session exists for the ordered pair.
    #[error("No session from {from} to {to}")]
    SessionNotFound {
        /// Sending side of the directional record.
        from: String,
        /// Receiving side of the directional record.
        to: String,
    },

    /// Encrypting a message failed.
    #[error("Encryption failed: {0}")]
    Encryption(String),

    /// Decrypting a message failed.
    #[error("Decryption failed: {0}")]
    Decryption(String),

    /// The peer presented an identity key that differs from the pinned one.
    #[error("Untrusted identity for user {0}")]
    UntrustedIdentity(String),

    /// The connection credential was missing or invalid.
    #[error("Authentication failed: {0}")]
    Authentication(String),

    /// The user is not allowed to perform the operation.
    #[error("Not authorized: {0}")]
    Authorization(String),

    /// A payload was malformed.
    #[error("Invalid payload: {0}")]
    Validation(String),

    /// The message store rejected an operation.
    #[error("Storage error: {0}")]
    Storage(String),
}

impl Error {
    /// Stable machine-readable code sent to clients in failure events.
    pub fn code(&self) -> &'static str {
        match self {
            Error::IdentityNotFound(_) => "IDENTITY_NOT_FOUND",
            Error::KeyGeneration(_) => "KEY_GENERATION_ERROR",
            Error::PreKeyExhausted(_) => "PREKEY_EXHAUSTED",
            Error::SessionNotFound { .. } => "SESSION_NOT_FOUND",
            Error::Encryption(_) => "ENCRYPTION_ERROR",
            Error::Decryption(_) => "DECRYPTION_ERROR",
            Error::UntrustedIdentity(_) => "UNTRUSTED_IDENTITY",
            Error::Authentication(_) => "AUTHENTICATION_ERROR",
            Error::Authorization(_) => "AUTHORIZATION_ERROR",
            Error::Validation(_) => "VALIDATION_ERROR",
            Error::Storage(_) => "STORAGE_ERROR",
        }
    }

    pub(crate) fn session_not_found(from: impl Into<String>, to: impl Into<String>) -> Self {
        Self::SessionNotFound {
            from: from.into(),
            to: to.into(),
        }
    }
}

impl From<serde_json::Error> for Error {
    fn from(value: serde_json::Error) -> Self {
        Self::Validation(value.to_string())
    }
}

impl From<base64::DecodeError> for Error {
    fn from(value: base64::DecodeError) -> Self {
        Self::Validation(value.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_codes_are_distinct() {
        let errors = [
            Error::IdentityNotFound("a".into()),
            Error::KeyGeneration("x".into()),
            Error::PreKeyExhausted("a".into()),
            Error::session_not_found("a", "b"),
            Error::Encryption("x".into()),
            Error::Decryption("x".into()),
            Error::UntrustedIdentity("a".into()),
            Error::Authentication("x".into()),
            Error::Authorization("x".into()),
            Error::Validation("x".into()),
            Error::Storage("x".into()),
        ];

        let mut codes: Vec<_> = errors.iter().map(Error::code).collect();
        codes.sort_unstable();
        codes.dedup();
        assert_eq!(codes.len(), errors.len());
    }

    #[test]
    fn test_session_not_found_display() {
        let err = Error::session_not_found("alice", "bob");
        assert_eq!(err.to_string(), "No session from alice to bob");
    }
}
