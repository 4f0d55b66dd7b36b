//! reCAPTCHA verification

use crate::error::{FaucetError, FaucetResult};
use async_trait::async_trait;
use serde::Deserialize;
use std::time::Duration;
use tracing::{debug, warn};

pub const RECAPTCHA_VERIFY_URL: &str = "https://www.google.com/recaptcha/api/siteverify";

/// Response body of the siteverify endpoint
#[derive(Debug, Clone, Default, Deserialize)]
pub struct CaptchaVerdict {
    pub success: bool,
    #[serde(rename = "error-codes", default)]
    pub error_codes: Vec<String>,
}

#[async_trait]
pub trait CaptchaVerifier: Send + Sync {
    /// Ok when the token is accepted, `CaptchaFailed` otherwise
    async fn verify(&self, token: &str, origin: &str) -> FaucetResult<()>;
}

pub struct RecaptchaVerifier {
    client: reqwest::Client,
    secret_key: String,
    verify_url: String,
}

impl RecaptchaVerifier {
    pub fn new(secret_key: impl Into<String>) -> Self {
        Self::with_url(secret_key, RECAPTCHA_VERIFY_URL)
    }

    pub fn with_url(secret_key: impl Into<String>, verify_url: impl Into<String>) -> Self {
        Self {
            client: reqwest::Client::builder()
                .timeout(Duration::from_secs(10))
                .build()
                .unwrap_or_default(),
            secret_key: secret_key.into(),
            verify_url: verify_url.into(),
        }
    }
}

#[async_trait]
impl CaptchaVerifier for RecaptchaVerifier {
    async fn verify(&self, token: &str, origin: &str) -> FaucetResult<()> {
        if token.is_empty() {
            return Err(FaucetError::CaptchaFailed);
        }

        let verdict: CaptchaVerdict = self
            .client
            .post(&self.verify_url)
            .form(&[
                ("secret", self.secret_key.as_str()),
                ("response", token),
                ("remoteip", origin),
            ])
            .send()
            .await
            .map_err(|e| {
                warn!("reCAPTCHA request failed: {}", e);
                FaucetError::CaptchaFailed
            })?
            .json()
            .await
            .map_err(|e| {
                warn!("reCAPTCHA response unreadable: {}", e);
                FaucetError::CaptchaFailed
            })?;

        if !verdict.success {
            debug!("reCAPTCHA rejected token from {}: {:?}", origin, verdict.error_codes);
            return Err(FaucetError::CaptchaFailed);
        }
        Ok(())
    }
}

/// Used when no secret key is configured
#[derive(Debug, Clone, Copy, Default)]
pub struct DisabledCaptcha;

#[async_trait]
impl CaptchaVerifier for DisabledCaptcha {
    async fn verify(&self, _token: &str, _origin: &str) -> FaucetResult<()> {
        Ok(())
    }
}
