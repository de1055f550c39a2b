//! Credential provider seam.
//!
//! The core never looks at credentials itself; every outgoing request is
//! handed to a [`CredentialProvider`] which returns the signed request.
//! OAuth1 request signing can be plugged in by implementing the trait.

use vn_sync_api_models::SiteConfig;

use crate::request::ApiRequest;

/// Attaches authentication to outgoing requests.
pub trait CredentialProvider: Send + Sync {
    /// Returns `request` with whatever the provider needs attached.
    fn sign(&self, request: ApiRequest) -> ApiRequest;
}

/// Attaches the account e-mail and password as query parameters, which the
/// API requires on every call in addition to consumer authentication.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UserCredentials {
    user_email: String,
    user_pw: String,
}

impl UserCredentials {
    /// Creates credentials from explicit values.
    #[must_use]
    pub fn new(user_email: impl Into<String>, user_pw: impl Into<String>) -> Self {
        Self {
            user_email: user_email.into(),
            user_pw: user_pw.into(),
        }
    }

    /// Creates credentials from a site configuration.
    #[must_use]
    pub fn from_site(site: &SiteConfig) -> Self {
        Self::new(site.user_email.clone(), site.user_pw.clone())
    }
}

impl CredentialProvider for UserCredentials {
    fn sign(&self, request: ApiRequest) -> ApiRequest {
        request
            .with_param("user_email", self.user_email.clone())
            .with_param("user_pw", self.user_pw.clone())
    }
}

/// Leaves requests untouched.
#[derive(Debug, Clone, Copy, Default)]
pub struct NoCredentials;

impl CredentialProvider for NoCredentials {
    fn sign(&self, request: ApiRequest) -> ApiRequest {
        request
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::request::Method;

    #[test]
    fn user_credentials_append_query_params() {
        let creds = UserCredentials::new("me@example.org", "secret");
        let signed = creds.sign(ApiRequest::new(Method::Get, "taxo_groups"));
        assert_eq!(signed.param("user_email"), Some("me@example.org"));
        assert_eq!(signed.param("user_pw"), Some("secret"));
    }
}
