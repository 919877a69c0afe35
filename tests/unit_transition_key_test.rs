use helmsman::core::keys::{TransitionKey, TransitionMagic};
use helmsman::core::types::OpStatus;
use proptest::prelude::*;
use uuid::Uuid;

#[test]
fn test_key_round_trip() {
    let key = TransitionKey::new(3, 17, 0, Uuid::new_v4());
    let encoded = key.to_string();
    let decoded = TransitionKey::parse(&encoded).unwrap();
    assert_eq!(key, decoded);
}

#[test]
fn test_key_encoding_shape() {
    let uuid = Uuid::parse_str("67e55044-10b1-426f-9247-bb680e5fe0c8").unwrap();
    let key = TransitionKey::new(3, 17, 0, uuid);
    assert_eq!(
        key.to_string(),
        "3:17:0:67e55044-10b1-426f-9247-bb680e5fe0c8"
    );
}

#[test]
fn test_key_rejects_malformed_input() {
    assert!(TransitionKey::parse("").is_err());
    assert!(TransitionKey::parse("3:17:0").is_err());
    assert!(TransitionKey::parse("3:17:0:not-a-uuid").is_err());
    assert!(TransitionKey::parse("x:17:0:67e55044-10b1-426f-9247-bb680e5fe0c8").is_err());
}

#[test]
fn test_key_negative_target_rc() {
    let key = TransitionKey::new(1, 2, -1, Uuid::new_v4());
    let decoded = TransitionKey::parse(&key.to_string()).unwrap();
    assert_eq!(decoded.target_rc, -1);
}

#[test]
fn test_magic_round_trip() {
    let key = TransitionKey::new(8, 4, 0, Uuid::new_v4());
    let magic = TransitionMagic::new(OpStatus::Done, 0, key);
    let decoded = TransitionMagic::parse(&magic.to_string()).unwrap();
    assert_eq!(magic, decoded);
    assert!(decoded.matches_target());
}

#[test]
fn test_magic_failure_does_not_match_target() {
    let key = TransitionKey::new(8, 4, 0, Uuid::new_v4());
    let magic = TransitionMagic::new(OpStatus::Done, 1, key);
    let decoded = TransitionMagic::parse(&magic.to_string()).unwrap();
    assert!(!decoded.matches_target());

    let timeout = TransitionMagic::new(OpStatus::Timeout, 1, key);
    assert!(!TransitionMagic::parse(&timeout.to_string()).unwrap().matches_target());
}

#[test]
fn test_magic_rejects_unknown_status_code() {
    let uuid = Uuid::new_v4();
    assert!(TransitionMagic::parse(&format!("99:0:1:2:0:{uuid}")).is_err());
}

proptest! {
    #[test]
    fn prop_key_encoding_is_a_bijection(
        graph_id in any::<u64>(),
        action_id in any::<u32>(),
        target_rc in any::<i32>(),
        uuid_bytes in any::<[u8; 16]>(),
    ) {
        let key = TransitionKey::new(graph_id, action_id, target_rc, Uuid::from_bytes(uuid_bytes));
        let decoded = TransitionKey::parse(&key.to_string()).unwrap();
        prop_assert_eq!(key, decoded);
    }

    #[test]
    fn prop_magic_encoding_round_trips(
        graph_id in any::<u64>(),
        action_id in any::<u32>(),
        target_rc in -1000i32..1000,
        rc in -1000i32..1000,
        status_code in prop::sample::select(vec![-1i32, 0, 1, 2, 4, 8, 9]),
        uuid_bytes in any::<[u8; 16]>(),
    ) {
        let status = helmsman::core::types::OpStatus::from_code(status_code).unwrap();
        let key = TransitionKey::new(graph_id, action_id, target_rc, Uuid::from_bytes(uuid_bytes));
        let magic = TransitionMagic::new(status, rc, key);
        let decoded = TransitionMagic::parse(&magic.to_string()).unwrap();
        prop_assert_eq!(magic, decoded);
    }
}
