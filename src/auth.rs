/// Sign-in flows
///
/// Thin validation layer over the auth provider:
/// - magic link / one-time code by email
/// - OAuth redirect URL
/// - anonymous guest session
use crate::{
    context::WallContext,
    error::{WallError, WallResult},
    model::Session,
};
use tracing::info;

/// Length of the emailed one-time code
pub const OTP_CODE_LENGTH: usize = 6;

/// Check an email address and return it trimmed
pub fn validate_email(email: &str) -> WallResult<&str> {
    let email = email.trim();
    if email.is_empty() {
        return Err(WallError::Validation("Please enter your email.".to_string()));
    }
    if !email.contains('@') {
        return Err(WallError::Validation(format!(
            "'{}' is not an email address.",
            email
        )));
    }
    Ok(email)
}

/// Check a one-time code and return it trimmed
pub fn validate_otp_code(code: &str) -> WallResult<&str> {
    let code = code.trim();
    if code.len() != OTP_CODE_LENGTH || !code.bytes().all(|b| b.is_ascii_digit()) {
        return Err(WallError::Validation(format!(
            "Enter the {}-digit code from your email.",
            OTP_CODE_LENGTH
        )));
    }
    Ok(code)
}

/// Email a sign-in link (and code) to `email`
pub async fn send_magic_link(
    ctx: &WallContext,
    email: &str,
    redirect_to: Option<&str>,
) -> WallResult<()> {
    let email = validate_email(email)?;
    ctx.auth.send_magic_link(email, redirect_to).await
}

/// Exchange an emailed code for a session
pub async fn verify_code(ctx: &WallContext, email: &str, code: &str) -> WallResult<Session> {
    let email = validate_email(email)?;
    let code = validate_otp_code(code)?;
    ctx.auth.verify_otp(email, code).await
}

pub async fn sign_in_guest(ctx: &WallContext) -> WallResult<Session> {
    let session = ctx.auth.sign_in_anonymously().await?;
    info!("Guest session started for {}", session.user_id());
    Ok(session)
}

/// URL the user must visit to sign in with `provider`
pub fn oauth_url(ctx: &WallContext, provider: &str, redirect_to: &str) -> WallResult<String> {
    let provider = provider.trim();
    if provider.is_empty() {
        return Err(WallError::Validation("No sign-in provider given.".to_string()));
    }
    ctx.auth.oauth_authorize_url(provider, redirect_to)
}

pub async fn sign_out(ctx: &WallContext) -> WallResult<()> {
    ctx.auth.sign_out().await?;
    info!("Signed out");
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::InMemoryBackend;
    use std::sync::Arc;
    use tokio_test::{assert_err, assert_ok};

    #[test]
    fn test_email_validation() {
        assert_eq!(validate_email("  ada@example.com ").unwrap(), "ada@example.com");
        assert!(matches!(validate_email("   "), Err(WallError::Validation(_))));
        assert!(matches!(validate_email("ada"), Err(WallError::Validation(_))));
    }

    #[test]
    fn test_otp_code_validation() {
        assert_eq!(validate_otp_code(" 012345 ").unwrap(), "012345");
        for bad in ["12345", "1234567", "12a456", "١٢٣٤٥٦", ""] {
            assert!(
                matches!(validate_otp_code(bad), Err(WallError::Validation(_))),
                "{} should be rejected",
                bad
            );
        }
    }

    #[tokio::test]
    async fn test_code_sign_in_and_out() {
        let backend = Arc::new(InMemoryBackend::new());
        let ctx = WallContext::in_memory(backend.clone());

        assert_ok!(
            send_magic_link(&ctx, "ada@example.com", Some("https://wall.example/topics")).await
        );
        let code = backend.issued_code("ada@example.com").unwrap();

        assert!(matches!(
            verify_code(&ctx, "ada@example.com", "12").await,
            Err(WallError::Validation(_))
        ));
        let session = verify_code(&ctx, "ada@example.com", &code).await.unwrap();
        assert!(!session.is_anonymous());

        assert_ok!(sign_out(&ctx).await);
        assert!(ctx.auth.get_session().await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_guest_and_oauth() {
        let backend = Arc::new(InMemoryBackend::new());
        let ctx = WallContext::in_memory(backend);

        let guest = sign_in_guest(&ctx).await.unwrap();
        assert!(guest.is_anonymous());

        let url = oauth_url(&ctx, "github", "https://wall.example/").unwrap();
        assert!(url.contains("provider=github"));
        assert_err!(oauth_url(&ctx, " ", "https://wall.example/"));
    }
}
