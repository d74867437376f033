use crate::Error;
use std::env;
use std::str::FromStr;
use std::time::Duration;

/// Tuning for key issuance and pairwise sessions.
#[derive(Clone, Debug)]
pub struct SessionConfig {
    /// Upper bound on message keys a ratchet will skip for out-of-order delivery.
    pub max_skipped_messages: u32,
    /// HKDF info used by X3DH so keys from other deployments never collide.
    pub protocol_info: Vec<u8>,
    /// Number of one-time pre-keys issued per batch.
    pub pre_key_batch_size: u32,
    /// Published one-time pre-keys below this count trigger a replenish.
    pub min_one_time_pre_keys: usize,
    /// Signed pre-keys kept around for in-flight establishments.
    pub max_signed_pre_keys: usize,
    /// Bound on bundle claims and session lock waits.
    pub operation_timeout: Duration,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            max_skipped_messages: 100,
            protocol_info: b"Parley-E2E-v1".to_vec(),
            pre_key_batch_size: 50,
            min_one_time_pre_keys: 10,
            max_signed_pre_keys: 4,
            operation_timeout: Duration::from_secs(5),
        }
    }
}

/// Process-wide configuration.
#[derive(Clone, Debug)]
pub struct Config {
    pub session: SessionConfig,
    /// HMAC secret for bearer tokens.
    pub jwt_secret: String,
    /// Keep plaintext next to the ciphertext in persisted records.
    pub persist_plaintext: bool,
    pub max_content_length: usize,
    /// Inbound events buffered per connection before `send` waits.
    pub inbound_queue_capacity: usize,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            session: SessionConfig::default(),
            jwt_secret: String::new(),
            persist_plaintext: false,
            max_content_length: 16 * 1024,
            inbound_queue_capacity: 64,
        }
    }
}

/// Shortest HMAC secret accepted for bearer tokens.
pub(crate) const MIN_JWT_SECRET_LEN: usize = 32;

impl Config {
    /// Loads `.env` if present, then reads `PARLEY_*` variables over the defaults.
    pub fn from_env() -> Result<Self, Error> {
        let _ = dotenvy::dotenv();
        Self::from_lookup(|name| env::var(name).ok())
    }

    /// Builds a config from `lookup`, which maps a `PARLEY_*` name to its
    /// value. Unset names keep their defaults; only the JWT secret is required.
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self, Error> {
        let defaults = Config::default();
        let session_defaults = SessionConfig::default();

        let jwt_secret = lookup("PARLEY_JWT_SECRET")
            .ok_or_else(|| Error::Validation("PARLEY_JWT_SECRET must be set".to_string()))?;
        if jwt_secret.len() < MIN_JWT_SECRET_LEN {
            return Err(Error::Validation(format!(
                "PARLEY_JWT_SECRET must be at least {MIN_JWT_SECRET_LEN} bytes"
            )));
        }

        let protocol_info = lookup("PARLEY_PROTOCOL_INFO")
            .map(String::into_bytes)
            .unwrap_or(session_defaults.protocol_info);

        let session = SessionConfig {
            max_skipped_messages: parse_var(
                &lookup,
                "PARLEY_MAX_SKIPPED_MESSAGES",
                session_defaults.max_skipped_messages,
            )?,
            protocol_info,
            pre_key_batch_size: parse_var(
                &lookup,
                "PARLEY_PRE_KEY_BATCH_SIZE",
                session_defaults.pre_key_batch_size,
            )?,
            min_one_time_pre_keys: parse_var(
                &lookup,
                "PARLEY_MIN_ONE_TIME_PRE_KEYS",
                session_defaults.min_one_time_pre_keys,
            )?,
            max_signed_pre_keys: parse_var(
                &lookup,
                "PARLEY_MAX_SIGNED_PRE_KEYS",
                session_defaults.max_signed_pre_keys,
            )?,
            operation_timeout: Duration::from_millis(parse_var(
                &lookup,
                "PARLEY_OPERATION_TIMEOUT_MS",
                u64::try_from(session_defaults.operation_timeout.as_millis()).unwrap_or(u64::MAX),
            )?),
        };

        Ok(Self {
            session,
            jwt_secret,
            persist_plaintext: parse_var(
                &lookup,
                "PARLEY_PERSIST_PLAINTEXT",
                defaults.persist_plaintext,
            )?,
            max_content_length: parse_var(
                &lookup,
                "PARLEY_MAX_CONTENT_LENGTH",
                defaults.max_content_length,
            )?,
            inbound_queue_capacity: parse_var(
                &lookup,
                "PARLEY_INBOUND_QUEUE_CAPACITY",
                defaults.inbound_queue_capacity,
            )?,
        })
    }
}

fn parse_var<T: FromStr>(
    lookup: &impl Fn(&str) -> Option<String>,
    name: &str,
    default: T,
) -> Result<T, Error> {
    match lookup(name) {
        Some(value) => value
            .trim()
            .parse()
            .map_err(|_| Error::Validation(format!("{name} has an invalid value: {value}"))),
        None => Ok(default),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    const SECRET: &str = "config-test-secret-0123456789abcdef";

    fn vars(pairs: &[(&str, &str)]) -> HashMap<String, String> {
        pairs
            .iter()
            .map(|(name, value)| (name.to_string(), value.to_string()))
            .collect()
    }

    #[test]
    fn test_unset_variables_keep_defaults() {
        let vars = vars(&[("PARLEY_JWT_SECRET", SECRET)]);
        let config = Config::from_lookup(|name| vars.get(name).cloned()).unwrap();

        let defaults = Config::default();
        assert_eq!(config.jwt_secret, SECRET);
        assert_eq!(config.max_content_length, defaults.max_content_length);
        assert_eq!(config.inbound_queue_capacity, defaults.inbound_queue_capacity);
        assert!(!config.persist_plaintext);
        assert_eq!(
            config.session.protocol_info,
            SessionConfig::default().protocol_info
        );
        assert_eq!(
            config.session.operation_timeout,
            SessionConfig::default().operation_timeout
        );
    }

    #[test]
    fn test_set_variables_override_defaults() {
        let vars = vars(&[
            ("PARLEY_JWT_SECRET", SECRET),
            ("PARLEY_PROTOCOL_INFO", "staging"),
            ("PARLEY_MAX_SKIPPED_MESSAGES", "12"),
            ("PARLEY_PRE_KEY_BATCH_SIZE", " 20 "),
            ("PARLEY_MIN_ONE_TIME_PRE_KEYS", "3"),
            ("PARLEY_MAX_SIGNED_PRE_KEYS", "2"),
            ("PARLEY_OPERATION_TIMEOUT_MS", "250"),
            ("PARLEY_PERSIST_PLAINTEXT", "true"),
            ("PARLEY_MAX_CONTENT_LENGTH", "128"),
            ("PARLEY_INBOUND_QUEUE_CAPACITY", "4"),
        ]);
        let config = Config::from_lookup(|name| vars.get(name).cloned()).unwrap();

        assert_eq!(config.session.protocol_info, b"staging".to_vec());
        assert_eq!(config.session.max_skipped_messages, 12);
        assert_eq!(config.session.pre_key_batch_size, 20);
        assert_eq!(config.session.min_one_time_pre_keys, 3);
        assert_eq!(config.session.max_signed_pre_keys, 2);
        assert_eq!(config.session.operation_timeout, Duration::from_millis(250));
        assert!(config.persist_plaintext);
        assert_eq!(config.max_content_length, 128);
        assert_eq!(config.inbound_queue_capacity, 4);
    }

    #[test]
    fn test_secret_is_required_and_long_enough() {
        let missing = Config::from_lookup(|_| None);
        assert!(matches!(missing, Err(Error::Validation(_))));

        let short = vars(&[("PARLEY_JWT_SECRET", "too-short")]);
        let result = Config::from_lookup(|name| short.get(name).cloned());
        assert!(matches!(result, Err(Error::Validation(_))));
    }

    #[test]
    fn test_unparsable_value_names_the_variable() {
        let vars = vars(&[
            ("PARLEY_JWT_SECRET", SECRET),
            ("PARLEY_MAX_CONTENT_LENGTH", "lots"),
        ]);
        let result = Config::from_lookup(|name| vars.get(name).cloned());
        assert!(matches!(
            &result,
            Err(Error::Validation(message)) if message.contains("PARLEY_MAX_CONTENT_LENGTH")
        ));
    }

    #[test]
    fn test_from_env_requires_the_secret() {
        if env::var("PARLEY_JWT_SECRET").is_ok() {
            return;
        }
        assert!(matches!(Config::from_env(), Err(Error::Validation(_))));
    }

    #[test]
    fn test_defaults_are_consistent() {
        let config = SessionConfig::default();
        assert!(config.min_one_time_pre_keys < config.pre_key_batch_size as usize);
        assert!(config.max_signed_pre_keys >= 1);
    }
}
