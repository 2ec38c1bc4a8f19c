//! Authorization for registration-scoped operations (payment intents,
//! cancellation). Exactly one path must succeed: an authenticated owner or
//! admin, or an anonymous caller holding a valid guest credential.

use chrono::{DateTime, Utc};

use crate::auth::AuthUser;
use crate::models::purchase::Purchase;
use crate::models::registration::Registration;
use crate::services::guest_token;
use crate::utils::error::AppError;

/// Every failure returns the same generic error so callers cannot probe
/// whether a registration exists or who owns it.
pub fn ensure_can_transact(
    registration: &Registration,
    purchase: Option<&Purchase>,
    caller: Option<&AuthUser>,
    guest_token: Option<&str>,
    now: DateTime<Utc>,
) -> Result<(), AppError> {
    if let Some(user) = caller {
        if user.is_admin() || registration.owner_user_id == Some(user.user_id) {
            return Ok(());
        }
        return Err(AppError::not_authorized());
    }

    if let (Some(token), Some(purchase)) = (guest_token, purchase) {
        if let (Some(hash), Some(expires_at)) = (
            purchase.payment_token_hash.as_deref(),
            purchase.payment_token_expires_at,
        ) {
            if guest_token::verify(hash, expires_at, token, now) {
                return Ok(());
            }
        }
    }

    Err(AppError::not_authorized())
}

#[cfg(test)]
mod tests {
    use super::*;
    use uuid::Uuid;

    fn registration(owner: Option<Uuid>) -> Registration {
        use crate::models::registration::RegistrationStatus;
        let now = Utc::now();
        Registration {
            id: Uuid::new_v4(),
            event_id: Uuid::new_v4(),
            primary_participant_id: Uuid::new_v4(),
            owner_user_id: owner,
            status: RegistrationStatus::Pending,
            created_at: now,
            updated_at: now,
        }
    }

    fn purchase_with(hash: Option<String>, expires_at: Option<DateTime<Utc>>) -> Purchase {
        let now = Utc::now();
        Purchase {
            id: Uuid::new_v4(),
            registration_id: Uuid::new_v4(),
            total_price_minor: 5000,
            currency: "usd".into(),
            payment_token_hash: hash,
            payment_token_expires_at: expires_at,
            created_at: now,
            updated_at: now,
        }
    }

    fn user(id: Uuid, role: &str) -> AuthUser {
        AuthUser {
            user_id: id,
            role: role.into(),
        }
    }

    #[test]
    fn test_owner_is_authorized() {
        let owner_id = Uuid::new_v4();
        let reg = registration(Some(owner_id));
        let caller = user(owner_id, "participant");

        assert!(ensure_can_transact(&reg, None, Some(&caller), None, Utc::now()).is_ok());
    }

    #[test]
    fn test_admin_is_authorized_for_any_registration() {
        let reg = registration(Some(Uuid::new_v4()));
        let caller = user(Uuid::new_v4(), crate::auth::ROLE_ADMIN);

        assert!(ensure_can_transact(&reg, None, Some(&caller), None, Utc::now()).is_ok());
    }

    #[test]
    fn test_other_user_is_rejected_even_with_valid_guest_token() {
        let now = Utc::now();
        let credential = guest_token::issue(now);
        let reg = registration(Some(Uuid::new_v4()));
        let purchase = purchase_with(
            Some(credential.token_hash.clone()),
            Some(credential.expires_at),
        );
        let caller = user(Uuid::new_v4(), "participant");

        // An authenticated non-owner does not fall through to the token path.
        let result = ensure_can_transact(
            &reg,
            Some(&purchase),
            Some(&caller),
            Some(&credential.plaintext),
            now,
        );
        assert!(result.is_err());
    }

    #[test]
    fn test_guest_with_valid_token_is_authorized() {
        let now = Utc::now();
        let credential = guest_token::issue(now);
        let reg = registration(None);
        let purchase = purchase_with(
            Some(credential.token_hash.clone()),
            Some(credential.expires_at),
        );

        let result =
            ensure_can_transact(&reg, Some(&purchase), None, Some(&credential.plaintext), now);
        assert!(result.is_ok());
    }

    #[test]
    fn test_guest_with_expired_token_is_rejected() {
        let now = Utc::now();
        let credential = guest_token::issue(now);
        let reg = registration(None);
        let purchase = purchase_with(
            Some(credential.token_hash.clone()),
            Some(credential.expires_at),
        );

        let result = ensure_can_transact(
            &reg,
            Some(&purchase),
            None,
            Some(&credential.plaintext),
            credential.expires_at,
        );
        assert!(result.is_err());
    }

    #[test]
    fn test_anonymous_without_token_is_rejected() {
        let reg = registration(None);
        assert!(ensure_can_transact(&reg, None, None, None, Utc::now()).is_err());
    }

    #[test]
    fn test_purchase_without_stored_credential_rejects_any_token() {
        let reg = registration(None);
        let purchase = purchase_with(None, None);
        let result = ensure_can_transact(&reg, Some(&purchase), None, Some("deadbeef"), Utc::now());
        assert!(result.is_err());
    }
}
