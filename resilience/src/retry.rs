//! AWS-style retry classification, sitting above the breaker rather than
//! inside it: the breaker never retries, it only trips. Classification and
//! category-specific backoff belong here.

use std::time::Duration;

use rand::Rng;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AwsErrorType {
    Throttling,
    Temporary,
    Permanent,
    Credentials,
    Network,
    ServiceUnavailable,
}

impl AwsErrorType {
    /// Only these classes are worth retrying; permanent and credential
    /// errors are never transient, so retrying them just burns the retry
    /// budget on a call that will fail identically every time.
    pub fn is_retryable(self) -> bool {
        !matches!(self, AwsErrorType::Permanent | AwsErrorType::Credentials)
    }
}

#[derive(Debug, Clone)]
pub struct AwsRetryConfig {
    pub throttling_base_delay: Duration,
    pub throttling_max_delay: Duration,
    pub service_unavailable_delay: Duration,
    pub temporary_base_delay: Duration,
    pub temporary_exponential_base: f64,
    pub max_delay: Duration,
    pub jitter_fraction: f64,
    pub max_attempts: u32,
    pub credential_retry_attempts: u32,
}

impl Default for AwsRetryConfig {
    fn default() -> Self {
        Self {
            throttling_base_delay: Duration::from_secs(2),
            throttling_max_delay: Duration::from_secs(300),
            service_unavailable_delay: Duration::from_secs(5),
            temporary_base_delay: Duration::from_millis(500),
            temporary_exponential_base: 2.0,
            max_delay: Duration::from_secs(60),
            jitter_fraction: 0.25,
            max_attempts: 3,
            credential_retry_attempts: 1,
        }
    }
}

/// Classifies an error by its AWS-style string code (the same vocabulary
/// `botocore`-family SDKs use: `ThrottlingException`, `ServiceUnavailable`,
/// and so on) plus a couple of structural fallbacks for connection-layer
/// failures that never reach a coded response.
pub struct AwsErrorClassifier;

const THROTTLING_CODES: &[&str] = &[
    "ThrottlingException",
    "TooManyRequestsException",
    "RequestLimitExceeded",
    "ProvisionedThroughputExceededException",
    "SlowDown",
];

const TEMPORARY_CODES: &[&str] =
    &["InternalServerError", "ServiceUnavailable", "RequestTimeout", "RequestTimeoutException"];

const PERMANENT_CODES: &[&str] = &[
    "ValidationException",
    "AccessDeniedException",
    "ResourceNotFoundException",
    "InvalidParameterException",
];

const CREDENTIAL_CODES: &[&str] =
    &["UnrecognizedClientException", "InvalidSignatureException", "ExpiredTokenException", "NoCredentialsError"];

impl AwsErrorClassifier {
    pub fn classify(error_code: &str, is_connection_error: bool, is_timeout: bool) -> AwsErrorType {
        if is_connection_error {
            return AwsErrorType::Network;
        }
        if is_timeout {
            return AwsErrorType::Temporary;
        }
        if CREDENTIAL_CODES.contains(&error_code) {
            return AwsErrorType::Credentials;
        }
        if THROTTLING_CODES.contains(&error_code) {
            return AwsErrorType::Throttling;
        }
        if error_code == "ServiceUnavailable" {
            return AwsErrorType::ServiceUnavailable;
        }
        if TEMPORARY_CODES.contains(&error_code) {
            return AwsErrorType::Temporary;
        }
        if PERMANENT_CODES.contains(&error_code) {
            return AwsErrorType::Permanent;
        }
        // Unknown codes default to temporary: an unrecognized failure is
        // more often a new transient mode than a new permanent one.
        AwsErrorType::Temporary
    }

    pub fn should_retry(error_type: AwsErrorType, attempt: u32, config: &AwsRetryConfig) -> bool {
        if !error_type.is_retryable() {
            return false;
        }
        let cap = if error_type == AwsErrorType::Credentials {
            config.credential_retry_attempts
        } else {
            config.max_attempts
        };
        attempt < cap
    }
}

pub struct AwsRetryHandler {
    config: AwsRetryConfig,
}

impl AwsRetryHandler {
    pub fn new(config: AwsRetryConfig) -> Self {
        Self { config }
    }

    /// `attempt` is zero-based: the delay before the first retry (attempt=0)
    /// through subsequent retries.
    pub fn delay_for(&self, error_type: AwsErrorType, attempt: u32) -> Duration {
        let base_ms = match error_type {
            AwsErrorType::Throttling => {
                let delay = self.config.throttling_base_delay.as_millis() as f64 * 2f64.powi(attempt as i32);
                delay.min(self.config.throttling_max_delay.as_millis() as f64)
            }
            AwsErrorType::ServiceUnavailable => self.config.service_unavailable_delay.as_millis() as f64,
            _ => {
                let delay = self.config.temporary_base_delay.as_millis() as f64
                    * self.config.temporary_exponential_base.powi(attempt as i32);
                delay.min(self.config.max_delay.as_millis() as f64)
            }
        };
        let jitter_span = base_ms * self.config.jitter_fraction;
        let jitter = if jitter_span > 0.0 { rand::thread_rng().gen_range(-jitter_span..=jitter_span) } else { 0.0 };
        Duration::from_millis((base_ms + jitter).max(0.0) as u64)
    }

    pub fn should_retry(&self, error_type: AwsErrorType, attempt: u32) -> bool {
        AwsErrorClassifier::should_retry(error_type, attempt, &self.config)
    }
}
