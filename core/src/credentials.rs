use async_trait::async_trait;
use tokio_util::sync::CancellationToken;

use crate::errors::CredentialError;

/// Supplies short-lived bearer tokens on demand.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait CredentialProvider: Send + Sync {
    async fn token(&self) -> Result<String, CredentialError>;
}

/// Always hands out the same token.
#[derive(Debug, Clone)]
pub struct StaticCredential {
    token: String,
}

impl StaticCredential {
    pub fn new(token: impl Into<String>) -> Self {
        Self {
            token: token.into(),
        }
    }
}

#[async_trait]
impl CredentialProvider for StaticCredential {
    async fn token(&self) -> Result<String, CredentialError> {
        Ok(self.token.clone())
    }
}

/// Requests a token, giving up as soon as `cancel` fires.
pub async fn request_token(
    provider: &dyn CredentialProvider,
    cancel: &CancellationToken,
) -> Result<String, CredentialError> {
    tokio::select! {
        biased;
        _ = cancel.cancelled() => Err(CredentialError::Cancelled),
        token = provider.token() => token,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    struct NeverReady;

    #[async_trait]
    impl CredentialProvider for NeverReady {
        async fn token(&self) -> Result<String, CredentialError> {
            std::future::pending().await
        }
    }

    #[tokio::test]
    async fn test_static_credential() {
        let provider = StaticCredential::new("bearer-123");
        let token = request_token(&provider, &CancellationToken::new()).await.unwrap();
        assert_eq!(token, "bearer-123");
    }

    #[tokio::test]
    async fn test_provider_failure_is_returned() {
        let mut provider = MockCredentialProvider::new();
        provider.expect_token().returning(|| {
            Err(CredentialError::Unavailable {
                reason: "expired refresh token".to_string(),
            })
        });

        let err = request_token(&provider, &CancellationToken::new())
            .await
            .unwrap_err();
        assert!(matches!(err, CredentialError::Unavailable { .. }));
    }

    #[tokio::test]
    async fn test_cancellation_interrupts_pending_request() {
        let cancel = CancellationToken::new();
        let trigger = cancel.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(10)).await;
            trigger.cancel();
        });

        let err = request_token(&NeverReady, &cancel).await.unwrap_err();
        assert!(matches!(err, CredentialError::Cancelled));
    }
}
