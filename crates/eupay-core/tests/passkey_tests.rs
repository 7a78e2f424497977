mod common;

use std::sync::atomic::Ordering;
use std::time::Duration;

use common::{signed_in, signed_out, PromptMode};
use eupay_core::audit::AuditOutcome;
use eupay_core::key_vault::KeyVault;
use eupay_core::{SecurityError, TokenState};

#[tokio::test]
async fn ticket_used_twice_is_locked() {
    let h = signed_out();
    let public = h.core.vault.ensure_identity().unwrap();
    let ticket = h.core.unlock.request_unlock().await.unwrap();

    let signature = h.core.vault.sign(b"statement", &ticket).unwrap();
    KeyVault::verify(&public, b"statement", &signature).unwrap();
    assert!(matches!(
        h.core.vault.sign(b"statement", &ticket),
        Err(SecurityError::Locked)
    ));
    assert!(matches!(
        h.core.vault.agree_shared(&public.agreement, &ticket).err(),
        Some(SecurityError::Locked)
    ));

    let outcomes: Vec<_> = h
        .core
        .audit
        .read_recent(None)
        .unwrap()
        .into_iter()
        .map(|e| e.outcome)
        .collect();
    assert_eq!(
        outcomes,
        vec![AuditOutcome::Denied, AuditOutcome::Denied, AuditOutcome::Granted]
    );
    assert!(h.core.audit.verify_chain().unwrap());
}

#[tokio::test(start_paused = true)]
async fn expired_ticket_is_locked() {
    let h = signed_out();
    h.core.vault.ensure_identity().unwrap();
    let ticket = h.core.unlock.request_unlock().await.unwrap();
    tokio::time::advance(Duration::from_secs(61)).await;
    assert!(ticket.is_expired());
    assert!(matches!(
        h.core.vault.sign(b"late", &ticket),
        Err(SecurityError::Locked)
    ));
}

#[tokio::test]
async fn declined_prompt_never_yields_a_ticket() {
    let h = signed_out();
    *h.passkey.mode.lock() = PromptMode::Cancel;
    assert!(matches!(
        h.core.unlock.request_unlock().await,
        Err(SecurityError::UserCancelled)
    ));
    *h.passkey.mode.lock() = PromptMode::Reject;
    assert!(matches!(
        h.core.unlock.request_unlock().await,
        Err(SecurityError::AssertionInvalid(_))
    ));
    assert_eq!(h.core.tickets.outstanding(), 0);
}

#[tokio::test]
async fn lock_revokes_outstanding_tickets() {
    let h = signed_in();
    h.core.vault.ensure_identity().unwrap();
    let ticket = h.core.unlock.request_unlock().await.unwrap();
    h.core.logout().unwrap();
    assert!(matches!(
        h.core.vault.sign(b"after logout", &ticket),
        Err(SecurityError::Locked)
    ));
    assert_eq!(h.core.tokens.state(), TokenState::Unauthenticated);
}

#[tokio::test]
async fn passkey_login_stores_tokens() {
    let h = signed_out();
    assert_eq!(h.core.tokens.state(), TokenState::Unauthenticated);

    let user = h.core.login.login().await.unwrap();
    assert_eq!(user.as_deref(), Some("user-alice"));
    assert_eq!(h.core.tokens.state(), TokenState::Authenticated);
    assert_eq!(h.core.tokens.current().unwrap().access_token, "access-1");
    assert_eq!(h.transport.login_calls.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn cancelled_login_leaves_store_untouched() {
    let h = signed_out();
    *h.passkey.mode.lock() = PromptMode::Cancel;
    assert!(matches!(h.core.login.login().await, Err(SecurityError::UserCancelled)));
    assert_eq!(h.transport.login_calls.load(Ordering::SeqCst), 0);
    assert!(h.core.tokens.current().is_none());
}

#[tokio::test]
async fn registration_signs_in_and_sends_identity() {
    let h = signed_out();
    let user = h.core.registration.register(" Alice ", true).await.unwrap();
    assert_eq!(user.as_deref(), Some("user-alice"));
    assert_eq!(h.core.tokens.state(), TokenState::Authenticated);
    assert_eq!(h.passkey.prompts.load(Ordering::SeqCst), 1);

    let sent = h.transport.registrations.lock().clone();
    assert_eq!(sent.len(), 1);
    assert_eq!(sent[0].display_name, "Alice");
    assert_eq!(Some(sent[0].identity), h.core.vault.public_key().unwrap());
}

#[tokio::test]
async fn registration_requires_consent() {
    let h = signed_out();
    assert!(matches!(
        h.core.registration.register("Alice", false).await,
        Err(SecurityError::InvalidRequest(_))
    ));
    assert!(h.transport.registrations.lock().is_empty());
    assert_eq!(h.passkey.prompts.load(Ordering::SeqCst), 0);
    assert!(!h.core.vault.has_identity().unwrap());
}

#[tokio::test]
async fn cancelled_registration_stores_nothing() {
    let h = signed_out();
    *h.passkey.mode.lock() = PromptMode::Cancel;
    assert!(matches!(
        h.core.registration.register("Alice", true).await,
        Err(SecurityError::UserCancelled)
    ));
    assert!(h.core.tokens.current().is_none());
}
