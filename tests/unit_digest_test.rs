use helmsman::core::executor::metadata::{
    AgentMetadata, AgentParameter, MetadataCache, compute_digest, compute_restart_digest,
    compute_secure_digest,
};
use helmsman::core::types::ResourceSpec;
use proptest::prelude::*;
use std::collections::BTreeMap;

fn params(pairs: &[(&str, &str)]) -> BTreeMap<String, String> {
    pairs
        .iter()
        .map(|(k, v)| (k.to_string(), v.to_string()))
        .collect()
}

fn metadata() -> AgentMetadata {
    AgentMetadata {
        parameters: vec![
            AgentParameter {
                name: "ip".to_string(),
                unique: true,
                private: false,
                reloadable: false,
            },
            AgentParameter {
                name: "passwd".to_string(),
                unique: false,
                private: true,
                reloadable: false,
            },
            AgentParameter {
                name: "interval".to_string(),
                unique: false,
                private: false,
                reloadable: true,
            },
        ],
    }
}

#[test]
fn test_digest_is_deterministic() {
    let a = params(&[("ip", "10.0.0.1"), ("passwd", "secret")]);
    let b = params(&[("passwd", "secret"), ("ip", "10.0.0.1")]);
    assert_eq!(compute_digest(&a), compute_digest(&b));
}

#[test]
fn test_digest_distinguishes_key_value_boundaries() {
    // "ab"="c" and "a"="bc" must not collide.
    let a = params(&[("ab", "c")]);
    let b = params(&[("a", "bc")]);
    assert_ne!(compute_digest(&a), compute_digest(&b));
}

#[test]
fn test_restart_digest_ignores_reloadable_params() {
    let meta = metadata();
    let a = params(&[("ip", "10.0.0.1"), ("interval", "5")]);
    let b = params(&[("ip", "10.0.0.1"), ("interval", "30")]);
    assert_eq!(
        compute_restart_digest(&a, &meta),
        compute_restart_digest(&b, &meta)
    );
    // A non-reloadable change must still show up.
    let c = params(&[("ip", "10.0.0.2"), ("interval", "5")]);
    assert_ne!(
        compute_restart_digest(&a, &meta),
        compute_restart_digest(&c, &meta)
    );
}

#[test]
fn test_secure_digest_masks_private_params() {
    let meta = metadata();
    let a = params(&[("ip", "10.0.0.1"), ("passwd", "secret")]);
    let b = params(&[("ip", "10.0.0.1"), ("passwd", "other")]);
    assert_eq!(
        compute_secure_digest(&a, &meta),
        compute_secure_digest(&b, &meta)
    );
}

#[test]
fn test_metadata_parsing() {
    let raw = r#"{
        "parameters": [
            {"name": "ip", "unique": true},
            {"name": "passwd", "private": true},
            {"name": "interval", "reloadable": true}
        ]
    }"#;
    let parsed = AgentMetadata::parse(raw).unwrap();
    assert_eq!(parsed.parameters.len(), 3);
    assert_eq!(parsed.private_params(), vec!["passwd"]);
    assert_eq!(parsed.reloadable_params(), vec!["interval"]);
    assert!(AgentMetadata::parse("not json").is_err());
}

#[test]
fn test_metadata_cache_keys_by_agent_spec() {
    let cache = MetadataCache::new();
    let a = ResourceSpec::new("rscA", "ocf", Some("heartbeat"), "Dummy");
    let b = ResourceSpec::new("rscB", "ocf", Some("heartbeat"), "Dummy");
    let c = ResourceSpec::new("rscC", "ocf", Some("helmsman"), "Dummy");

    cache.insert(&a, metadata());
    // Same agent spec, different resource id: shared entry.
    assert!(cache.get(&b).is_some());
    assert!(cache.get(&c).is_none());
    assert_eq!(cache.len(), 1);

    cache.forget(&b);
    assert!(cache.get(&a).is_none());
}

proptest! {
    #[test]
    fn prop_digest_equal_for_equal_maps(
        pairs in prop::collection::btree_map("[a-z]{1,8}", "[a-zA-Z0-9]{0,16}", 0..10)
    ) {
        let rebuilt: BTreeMap<String, String> =
            pairs.iter().map(|(k, v)| (k.clone(), v.clone())).collect();
        prop_assert_eq!(compute_digest(&pairs), compute_digest(&rebuilt));
    }
}
