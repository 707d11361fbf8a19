use crate::error::CoreError;

/// Authentication configuration derived from the `[auth]` section.
#[derive(Clone)]
pub struct AuthConfig {
    /// HMAC key used to sign and verify bearer tokens.
    pub secret_key: String,
    pub token_expiry_hours: i64,
}

impl AuthConfig {
    /// A server without a signing key cannot authenticate anyone; callers treat
    /// this as fatal at startup.
    pub fn validate(&self) -> Result<(), CoreError> {
        if self.secret_key.trim().is_empty() {
            return Err(CoreError::Internal("SECRET_KEY is not set".into()));
        }
        if self.token_expiry_hours <= 0 {
            return Err(CoreError::Internal(
                "token expiry must be a positive number of hours".into(),
            ));
        }
        Ok(())
    }
}

impl std::fmt::Debug for AuthConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AuthConfig")
            .field("secret_key", &"<redacted>")
            .field("token_expiry_hours", &self.token_expiry_hours)
            .finish()
    }
}
