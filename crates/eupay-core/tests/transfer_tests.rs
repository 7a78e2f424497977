mod common;

use std::sync::atomic::Ordering;

use common::{signed_in, Harness, PromptMode, ReceiptMode};
use eupay_core::transfer::{TransferInstruction, TransferRequest, TransferState};
use eupay_core::{SecurityError, TransferStage};

const BOB: &str = "bob@eupay.eu";

fn alice_and_bob() -> (Harness, Harness) {
    let alice = signed_in();
    let bob = signed_in();
    alice.core.vault.ensure_identity().unwrap();
    let bob_key = bob.core.vault.ensure_identity().unwrap().agreement;
    alice.transport.register_peer(BOB, bob_key);
    (alice, bob)
}

fn request(amount_cents: u64, memo: &str) -> TransferRequest {
    TransferRequest {
        recipient: BOB.into(),
        amount_cents,
        memo: Some(memo.into()),
    }
}

#[tokio::test]
async fn alice_to_bob_round_trip() {
    let (alice, bob) = alice_and_bob();

    let transfer = alice
        .core
        .transfers
        .execute(request(12_50, "Pizza night"), None)
        .await;
    assert_eq!(
        transfer.history(),
        &[
            TransferState::Pending,
            TransferState::Unlocking,
            TransferState::KeyResolved,
            TransferState::Encrypted,
            TransferState::Submitted,
            TransferState::Acknowledged,
        ]
    );
    assert_eq!(alice.passkey.prompts.load(Ordering::SeqCst), 1);
    let receipt = transfer.into_result().unwrap();

    let submission = alice.transport.submissions.lock()[0].clone();
    assert_eq!(submission.transfer_id, receipt.transfer_id);
    assert_eq!(submission.payload_digest, submission.payload.digest());

    // Bob receives the payload over the wire as base64 JSON.
    let wire = serde_json::to_string(&submission).unwrap();
    let received: eupay_core::transport::TransferSubmission = serde_json::from_str(&wire).unwrap();
    let ticket = bob.core.unlock.request_unlock().await.unwrap();
    let plaintext = bob
        .core
        .session
        .decrypt_from_peer(&received.payload, &ticket)
        .unwrap();
    let instruction: TransferInstruction = serde_json::from_slice(&plaintext).unwrap();
    assert_eq!(instruction.amount_cents, 1250);
    assert_eq!(instruction.memo.as_deref(), Some("Pizza night"));
    assert_eq!(instruction.currency, "EUR");
    assert_eq!(instruction.recipient, BOB);
    assert_eq!(instruction.transfer_id, receipt.transfer_id);
}

#[tokio::test]
async fn supplied_ticket_skips_prompt_and_is_consumed() {
    let (alice, _bob) = alice_and_bob();
    let ticket = alice.core.unlock.request_unlock().await.unwrap();
    assert_eq!(alice.core.tickets.outstanding(), 1);

    alice
        .core
        .transfers
        .send(request(100, "coffee"), Some(ticket))
        .await
        .unwrap();
    assert_eq!(alice.passkey.prompts.load(Ordering::SeqCst), 1);
    assert_eq!(alice.core.tickets.outstanding(), 0);
}

#[tokio::test]
async fn validation_failures_make_no_calls() {
    let (alice, _bob) = alice_and_bob();
    for bad in [
        request(0, "zero"),
        request(1_500_001, "too much"),
        request(100, &"m".repeat(141)),
        TransferRequest {
            recipient: "NL92ABNA0417164300".into(),
            amount_cents: 100,
            memo: None,
        },
    ] {
        let err = alice.core.transfers.send(bad, None).await.unwrap_err();
        assert!(matches!(
            err,
            SecurityError::TransferFailed {
                stage: TransferStage::Validation,
                ..
            }
        ));
    }
    assert_eq!(alice.passkey.prompts.load(Ordering::SeqCst), 0);
    assert_eq!(alice.transport.fetch_calls.load(Ordering::SeqCst), 0);
}

#[tokio::test]
async fn cancelled_prompt_fails_at_unlocking() {
    let (alice, _bob) = alice_and_bob();
    *alice.passkey.mode.lock() = PromptMode::Cancel;
    let transfer = alice.core.transfers.execute(request(100, "x"), None).await;
    assert!(matches!(
        transfer.state(),
        TransferState::Failed {
            stage: TransferStage::Unlocking,
            ..
        }
    ));
    assert!(matches!(transfer.error(), Some(SecurityError::UserCancelled)));
    assert_eq!(alice.transport.fetch_calls.load(Ordering::SeqCst), 0);
}

#[tokio::test]
async fn unknown_recipient_fails_at_key_resolution() {
    let (alice, _bob) = alice_and_bob();
    let transfer = alice
        .core
        .transfers
        .execute(
            TransferRequest {
                recipient: "carol@eupay.eu".into(),
                amount_cents: 100,
                memo: None,
            },
            None,
        )
        .await;
    assert!(matches!(
        transfer.state(),
        TransferState::Failed {
            stage: TransferStage::KeyResolution,
            ..
        }
    ));
    assert!(alice.transport.submissions.lock().is_empty());
    // The unused ticket was released with the failed transfer.
    assert_eq!(alice.core.tickets.outstanding(), 0);
}

#[tokio::test]
async fn rejected_or_mismatched_receipt_fails_at_acknowledgment() {
    for mode in [ReceiptMode::Reject, ReceiptMode::WrongDigest] {
        let (alice, _bob) = alice_and_bob();
        *alice.transport.receipt_mode.lock() = mode;
        let transfer = alice.core.transfers.execute(request(100, "x"), None).await;
        assert!(matches!(
            transfer.state(),
            TransferState::Failed {
                stage: TransferStage::Acknowledgment,
                ..
            }
        ));
        assert!(transfer.receipt().is_some());
        // Never resubmitted.
        assert_eq!(alice.transport.submissions.lock().len(), 1);
    }
}

#[tokio::test]
async fn expired_session_is_refreshed_mid_transfer() {
    let (alice, _bob) = alice_and_bob();
    alice.transport.expire_all_access();
    alice
        .core
        .transfers
        .send(request(2_000, "rent share"), None)
        .await
        .unwrap();
    assert_eq!(alice.transport.refresh_calls.load(Ordering::SeqCst), 1);
    assert_eq!(alice.core.tokens.current().unwrap().access_token, "access-1");
}

#[tokio::test]
async fn iban_recipient_is_normalised() {
    let (alice, bob) = alice_and_bob();
    let bob_key = bob.core.vault.ensure_identity().unwrap().agreement;
    alice.transport.register_peer("NL91ABNA0417164300", bob_key);
    let receipt = alice
        .core
        .transfers
        .send(
            TransferRequest {
                recipient: "nl91 abna 0417 1643 00".into(),
                amount_cents: 500,
                memo: None,
            },
            None,
        )
        .await
        .unwrap();
    let submission = alice.transport.submissions.lock()[0].clone();
    assert_eq!(submission.recipient, "NL91ABNA0417164300");
    assert_eq!(submission.transfer_id, receipt.transfer_id);
}

#[tokio::test]
async fn sender_without_identity_fails_at_encryption() {
    let alice = signed_in();
    let bob = signed_in();
    let bob_key = bob.core.vault.ensure_identity().unwrap().agreement;
    alice.transport.register_peer(BOB, bob_key);

    let transfer = alice.core.transfers.execute(request(100, "x"), None).await;
    assert!(matches!(
        transfer.state(),
        TransferState::Failed {
            stage: TransferStage::Encryption,
            ..
        }
    ));
    assert!(matches!(transfer.error(), Some(SecurityError::KeyUnavailable(_))));
    assert!(!alice.core.vault.has_identity().unwrap());
    assert!(alice.transport.submissions.lock().is_empty());
    assert_eq!(alice.core.tickets.outstanding(), 0);
}

#[tokio::test]
async fn recipient_with_url_delimiters_never_reaches_the_server() {
    let (alice, _bob) = alice_and_bob();
    let err = alice
        .core
        .transfers
        .send(
            TransferRequest {
                recipient: "../../auth/refresh?x@eupay.eu".into(),
                amount_cents: 100,
                memo: None,
            },
            None,
        )
        .await
        .unwrap_err();
    assert!(matches!(
        err,
        SecurityError::TransferFailed {
            stage: TransferStage::Validation,
            ..
        }
    ));
    assert_eq!(alice.transport.fetch_calls.load(Ordering::SeqCst), 0);
}
