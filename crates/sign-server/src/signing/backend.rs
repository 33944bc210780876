use std::time::Duration;

use async_trait::async_trait;

/// Separator between signature and certificate number in a signing code.
pub const CODE_SEPARATOR: &str = "||";

#[derive(Debug, thiserror::Error)]
pub enum SigningError {
    #[error("invalid signing request: {0}")]
    InvalidRequest(String),
    #[error("signing backend unavailable: {0}")]
    BackendUnavailable(String),
    #[error("invalid backend configuration: {0}")]
    Configuration(String),
    #[error("handshake failed: {0}")]
    Handshake(String),
    #[error("connection failed: {0}")]
    Connection(String),
    #[error("no response within {0:?}")]
    Timeout(Duration),
    #[error("protocol error: {0}")]
    Protocol(String),
    #[error("remote reported status {status}: {}", .errors.join("; "))]
    Status { status: String, errors: Vec<String> },
    #[error("signing failed: {}", .errors.join("; "))]
    Rejected { errors: Vec<String> },
    #[error("{call} returned error code {code}")]
    NativeCall { call: &'static str, code: u32 },
    #[error("signing result is missing the {0}")]
    Incomplete(&'static str),
}

impl SigningError {
    /// Transport-level failures; the exchange may be retried on a fresh connection.
    pub fn is_transport(&self) -> bool {
        matches!(self, Self::Connection(_) | Self::Handshake(_))
    }

    /// The remote answered and declined to sign.
    pub fn is_signing_failure(&self) -> bool {
        matches!(self, Self::Rejected { .. } | Self::NativeCall { .. })
    }

    /// The remote answered with something other than a usable result.
    pub fn is_protocol(&self) -> bool {
        matches!(self, Self::Protocol(_) | Self::Status { .. } | Self::Incomplete(_))
    }
}

pub type Result<T> = std::result::Result<T, SigningError>;

/// Payload plus the password unlocking the signing certificate.
#[derive(Clone)]
pub struct SigningRequest {
    payload: String,
    secret: String,
}

impl SigningRequest {
    pub fn new(payload: impl Into<String>, secret: impl Into<String>) -> Result<Self> {
        let payload = payload.into();
        let secret = secret.into();
        if payload.is_empty() {
            return Err(SigningError::InvalidRequest("payload must not be empty".into()));
        }
        if secret.is_empty() {
            return Err(SigningError::InvalidRequest("password must not be empty".into()));
        }
        Ok(Self { payload, secret })
    }

    pub fn payload(&self) -> &str {
        &self.payload
    }

    pub fn secret(&self) -> &str {
        &self.secret
    }
}

impl std::fmt::Debug for SigningRequest {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SigningRequest")
            .field("payload_len", &self.payload.len())
            .finish_non_exhaustive()
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SigningResult {
    pub signature: String,
    pub certificate_number: String,
}

impl SigningResult {
    /// Builds a result, rejecting an empty signature or certificate number.
    pub fn new(
        signature: impl Into<String>,
        certificate_number: impl Into<String>,
    ) -> Result<Self> {
        let signature = signature.into();
        let certificate_number = certificate_number.into();
        if signature.is_empty() {
            return Err(SigningError::Incomplete("signature"));
        }
        if certificate_number.is_empty() {
            return Err(SigningError::Incomplete("certificate number"));
        }
        Ok(Self {
            signature,
            certificate_number,
        })
    }

    /// Parses `"<signature>||<certificate number>"`.
    ///
    /// Splits once at the first separator and trims both halves, so a
    /// certificate number may itself contain `||`.
    pub fn from_code(code: &str) -> Result<Self> {
        let (signature, certificate_number) = code
            .split_once(CODE_SEPARATOR)
            .ok_or_else(|| {
                SigningError::Protocol(format!("code has no `{CODE_SEPARATOR}` separator"))
            })?;
        Self::new(signature.trim(), certificate_number.trim())
    }

    pub fn to_code(&self) -> String {
        format!("{}{CODE_SEPARATOR}{}", self.signature, self.certificate_number)
    }
}

/// A provider able to sign payloads with the operator's certificate.
#[async_trait]
pub trait SigningBackend: Send + Sync {
    /// Short identifier used in logs and status output.
    fn name(&self) -> &str;

    /// Cheap readiness probe; never touches the network or the device.
    fn is_available(&self) -> bool;

    async fn sign(&self, request: &SigningRequest) -> Result<SigningResult>;

    /// Signs `data` and returns `"<signature>||<certificate number>"`.
    async fn get_code(&self, data: &str, password: &str) -> Result<String> {
        let request = SigningRequest::new(data, password)?;
        if !self.is_available() {
            return Err(SigningError::BackendUnavailable(self.name().to_string()));
        }
        Ok(self.sign(&request).await?.to_code())
    }

    /// Releases held resources. Called once when the server stops.
    async fn shutdown(&self) {}
}
