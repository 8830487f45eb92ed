use std::sync::Arc;

use anyhow::{Context, Result};
use assert_matches2::assert_let;
use olm_device::{
    events::{EncryptedRoomEvent, ToDeviceEvent, ToDeviceMessage, MEGOLM_ALGORITHM},
    store::MemoryStore,
    CryptoEngine, MegolmDecryptionError, ToDeviceOutcome, VerificationState,
};
use serde_json::json;

const ROOM: &str = "!room:example.org";

fn engine(user_id: &str, device_id: &str) -> Result<CryptoEngine> {
    Ok(CryptoEngine::new(user_id, device_id, Arc::new(MemoryStore::new()))?)
}

/// Introduce two engines: exchange device-keys records and establish a
/// pairwise session from `alice` to `bob`, the way a client would after
/// downloading keys and claiming a one-time key.
fn introduce(alice: &CryptoEngine, bob: &CryptoEngine) -> Result<()> {
    alice.directory().receive_device_keys(bob.user_id(), vec![bob.own_device_keys()?])?;
    bob.directory().receive_device_keys(alice.user_id(), vec![alice.own_device_keys()?])?;

    bob.olm_device().generate_one_time_keys(1)?;
    let one_time_key = *bob
        .olm_device()
        .one_time_keys()
        .values()
        .next()
        .context("the freshly generated one-time key should exist")?;
    bob.olm_device().mark_keys_as_published()?;

    alice
        .olm_device()
        .create_outbound_session(bob.olm_device().curve25519_key(), one_time_key)?;

    Ok(())
}

/// Deliver the share messages addressed to `recipient` as to-device events
/// and install the room keys they carry.
fn deliver(
    sender: &CryptoEngine,
    recipient: &CryptoEngine,
    messages: &[ToDeviceMessage],
) -> Result<()> {
    for message in messages.iter().filter(|m| {
        m.recipient == recipient.user_id() && m.recipient_device == recipient.device_id()
    }) {
        let event = ToDeviceEvent {
            event_type: "m.room.encrypted".to_owned(),
            sender: sender.user_id().to_owned(),
            content: serde_json::to_value(&message.content)?,
            sender_key: None,
            keys: None,
        };

        assert_let!(
            ToDeviceOutcome::RoomKey { added, .. } = recipient.handle_to_device(&event)?
        );
        assert!(added, "the delivered room key should install");
    }

    Ok(())
}

fn send(alice: &CryptoEngine, body: &str) -> Result<EncryptedRoomEvent> {
    let content = alice.encrypt_room_event(
        ROOM,
        "m.room.message",
        &json!({ "msgtype": "m.text", "body": body }),
    )?;

    Ok(EncryptedRoomEvent { room_id: ROOM.to_owned(), content })
}

#[test]
fn first_contact_decrypts_with_proved_and_claimed_keys() -> Result<()> {
    let alice = engine("@alice:example.org", "ALICEDEVICE")?;
    let bob = engine("@bob:example.org", "BOBDEVICE")?;
    introduce(&alice, &bob)?;

    let share = alice.share_room_key(ROOM, &["@bob:example.org"])?;
    assert_eq!(share.messages.len(), 1);
    assert!(share.blocked.is_empty());
    assert!(share.withheld.is_empty());
    deliver(&alice, &bob, &share.messages)?;

    let event = send(&alice, "Hello I'm Alice!")?;
    assert_eq!(event.content.algorithm, MEGOLM_ALGORITHM);

    let decrypted = bob.decrypt_room_event(&event, Some("live"))?;

    assert_eq!(decrypted.payload["type"], "m.room.message");
    assert_eq!(decrypted.payload["room_id"], ROOM);
    assert_eq!(decrypted.payload["content"]["body"], "Hello I'm Alice!");

    let alice_curve = alice.olm_device().curve25519_key().to_base64();
    let alice_ed = alice.olm_device().ed25519_key().to_base64();
    assert_eq!(decrypted.keys_proved.get("curve25519"), Some(&alice_curve));
    assert_eq!(decrypted.keys_claimed.get("ed25519"), Some(&alice_ed));

    Ok(())
}

#[test]
fn the_same_ciphertext_decrypts_once_per_timeline() -> Result<()> {
    let alice = engine("@alice:example.org", "ALICEDEVICE")?;
    let bob = engine("@bob:example.org", "BOBDEVICE")?;
    introduce(&alice, &bob)?;

    let share = alice.share_room_key(ROOM, &["@bob:example.org"])?;
    deliver(&alice, &bob, &share.messages)?;

    let event = send(&alice, "Hello I'm Alice!")?;

    bob.decrypt_room_event(&event, Some("live"))?;
    assert_let!(
        Err(MegolmDecryptionError::DuplicateMessageIndex(0)) =
            bob.decrypt_room_event(&event, Some("live"))
    );

    // Without a timeline there is no replay bookkeeping.
    bob.decrypt_room_event(&event, None)?;

    // A rebuilt timeline starts over.
    bob.reset_replay_tracking("live");
    bob.decrypt_room_event(&event, Some("live"))?;

    Ok(())
}

#[test]
fn a_new_device_needs_a_rotation_and_a_fresh_share() -> Result<()> {
    let alice = engine("@alice:example.org", "ALICEDEVICE")?;
    let bob = engine("@bob:example.org", "BOBDEVICE")?;
    introduce(&alice, &bob)?;

    let share = alice.share_room_key(ROOM, &["@bob:example.org"])?;
    deliver(&alice, &bob, &share.messages)?;
    let old_event = send(&alice, "Hello I'm Alice!")?;
    bob.decrypt_room_event(&old_event, None)?;

    // Bob logs out and back in: a new device id and an empty store.
    let rejoined = engine("@bob:example.org", "BOBDEVICE2")?;

    assert_let!(
        Err(MegolmDecryptionError::UnknownInboundSessionId(_)) =
            rejoined.decrypt_room_event(&old_event, None)
    );

    // Alice learns about the new device, rotates, and shares again.
    introduce(&alice, &rejoined)?;
    assert!(alice.group_sessions().discard_outbound_session(ROOM));

    let share = alice.share_room_key(ROOM, &["@bob:example.org"])?;
    assert!(share
        .messages
        .iter()
        .any(|m| m.recipient_device == "BOBDEVICE2"));
    deliver(&alice, &rejoined, &share.messages)?;

    let event = send(&alice, "Hello I'm still Alice!")?;
    let decrypted = rejoined.decrypt_room_event(&event, Some("live"))?;
    assert_eq!(decrypted.payload["content"]["body"], "Hello I'm still Alice!");

    Ok(())
}

#[test]
fn a_replayed_room_key_cannot_rewind_the_session() -> Result<()> {
    let alice = engine("@alice:example.org", "ALICEDEVICE")?;
    let bob = engine("@bob:example.org", "BOBDEVICE")?;
    introduce(&alice, &bob)?;

    let share = alice.share_room_key(ROOM, &["@bob:example.org"])?;
    deliver(&alice, &bob, &share.messages)?;

    let first = send(&alice, "M1")?;
    bob.decrypt_room_event(&first, None)?;

    // A man in the middle re-announces the same session, but with the
    // ratchet exported at a later message index.
    let session_id = &first.content.session_id;
    let later_key = alice
        .olm_device()
        .outbound_session_key(session_id)
        .context("Alice's outbound session should still be cached")?;

    let replayed = ToDeviceEvent {
        event_type: "m.room_key".to_owned(),
        sender: "@alice:example.org".to_owned(),
        content: json!({
            "algorithm": MEGOLM_ALGORITHM,
            "room_id": ROOM,
            "session_id": session_id,
            "session_key": later_key,
        }),
        sender_key: Some(alice.olm_device().curve25519_key().to_base64()),
        keys: Some(
            [("ed25519".to_owned(), alice.olm_device().ed25519_key().to_base64())].into(),
        ),
    };

    assert_let!(ToDeviceOutcome::RoomKey { added, .. } = bob.handle_to_device(&replayed)?);
    assert!(!added, "the update for a known session must be ignored");

    // The retained session still decrypts the original message.
    let decrypted = bob.decrypt_room_event(&first, None)?;
    assert_eq!(decrypted.payload["content"]["body"], "M1");
    assert_eq!(decrypted.message_index, 0);

    Ok(())
}

#[test]
fn blocked_devices_do_not_receive_room_keys() -> Result<()> {
    let alice = engine("@alice:example.org", "ALICEDEVICE")?;
    let bob = engine("@bob:example.org", "BOBDEVICE")?;
    introduce(&alice, &bob)?;

    assert!(alice.directory().set_verification_state(
        "@bob:example.org",
        "BOBDEVICE",
        VerificationState::Blocked
    )?);

    let share = alice.share_room_key(ROOM, &["@bob:example.org"])?;
    assert!(share.messages.is_empty());
    assert_eq!(
        share.blocked,
        [("@bob:example.org".to_owned(), "BOBDEVICE".to_owned())]
    );

    let second = send(&alice, "M2")?;
    assert_let!(
        Err(MegolmDecryptionError::UnknownInboundSessionId(_)) =
            bob.decrypt_room_event(&second, None)
    );

    // Unblocking lets the next share through. The key is exported at the
    // current ratchet position, so M2 stays unreadable while M3 decrypts.
    alice.directory().set_verification_state(
        "@bob:example.org",
        "BOBDEVICE",
        VerificationState::Unverified,
    )?;

    let share = alice.share_room_key(ROOM, &["@bob:example.org"])?;
    assert_eq!(share.messages.len(), 1);
    deliver(&alice, &bob, &share.messages)?;

    let third = send(&alice, "M3")?;
    let decrypted = bob.decrypt_room_event(&third, None)?;
    assert_eq!(decrypted.payload["content"]["body"], "M3");

    assert!(bob.decrypt_room_event(&second, None).is_err());

    Ok(())
}

#[test]
fn back_pagination_decrypts_in_reverse_order() -> Result<()> {
    let alice = engine("@alice:example.org", "ALICEDEVICE")?;
    let bob = engine("@bob:example.org", "BOBDEVICE")?;
    introduce(&alice, &bob)?;

    let share = alice.share_room_key(ROOM, &["@bob:example.org"])?;
    deliver(&alice, &bob, &share.messages)?;

    let bodies = ["one", "two", "three", "four", "five"];
    let mut events = Vec::new();
    for body in bodies {
        events.push(send(&alice, body)?);
    }

    for (index, event) in events.iter().enumerate().rev() {
        let decrypted = bob.decrypt_room_event(event, Some("back-pagination"))?;

        assert_eq!(decrypted.payload["content"]["body"], bodies[index]);
        assert_eq!(decrypted.message_index, index as u32);
    }

    Ok(())
}
