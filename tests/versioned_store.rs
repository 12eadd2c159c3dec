use agentcert::core::alias::{AliasTable, ManifestAliases};
use agentcert::core::error::AgentCertError;
use agentcert::core::time::Timestamp;
use agentcert::core::versioned::{Alias, EntityKind, VersionedStore};
use serde_json::json;
use std::path::Path;
use tempfile::TempDir;

const T1: &str = "20260101T000000000Z";
const T2: &str = "20260102T000000000Z";

fn ts(raw: &str) -> Timestamp {
    Timestamp::parse(raw).unwrap()
}

fn manifest() -> Box<dyn AliasTable> {
    Box::new(ManifestAliases)
}

#[cfg(unix)]
fn symlink() -> Box<dyn AliasTable> {
    Box::new(agentcert::core::alias::SymlinkAliases)
}

fn backends() -> Vec<fn() -> Box<dyn AliasTable>> {
    let mut out: Vec<fn() -> Box<dyn AliasTable>> = Vec::new();
    out.push(manifest);
    #[cfg(unix)]
    out.push(symlink);
    out
}

fn seeded(tmp: &TempDir, aliases: Box<dyn AliasTable>) -> VersionedStore {
    let store = VersionedStore::new(tmp.path().join("data"), aliases);
    store
        .write_version(EntityKind::Plan, "scout", &ts(T1), &json!({"steps": [1]}))
        .unwrap();
    store
        .write_version(EntityKind::Plan, "scout", &ts(T2), &json!({"steps": [1, 2]}))
        .unwrap();
    store
}

#[test]
fn write_version_is_append_only_and_leaves_aliases_alone() {
    for make in backends() {
        let tmp = TempDir::new().unwrap();
        let store = seeded(&tmp, make());
        let err = store
            .write_version(EntityKind::Plan, "scout", &ts(T1), &json!({}))
            .unwrap_err();
        assert!(matches!(err, AgentCertError::VersionExists(_)));
        assert!(tmp.path().join("data/plans/scout@20260101T000000000Z/plan.json").is_file());
        assert!(matches!(
            store.resolve_active(EntityKind::Plan, "scout"),
            Err(AgentCertError::NoActiveVersion { .. })
        ));
    }
}

#[test]
fn resolve_active_prefers_current_over_latest() {
    for make in backends() {
        let tmp = TempDir::new().unwrap();
        let store = seeded(&tmp, make());
        store
            .set_alias(EntityKind::Plan, "scout", Alias::Latest, &ts(T2))
            .unwrap();
        assert_eq!(
            store.resolve_active(EntityKind::Plan, "scout").unwrap().timestamp,
            ts(T2)
        );

        store
            .set_alias(EntityKind::Plan, "scout", Alias::Current, &ts(T1))
            .unwrap();
        let active = store.resolve_active(EntityKind::Plan, "scout").unwrap();
        assert_eq!(active.timestamp, ts(T1));
        assert_eq!(store.read_payload(&active).unwrap(), json!({"steps": [1]}));
    }
}

#[test]
fn set_alias_to_missing_version_keeps_prior_alias() {
    for make in backends() {
        let tmp = TempDir::new().unwrap();
        let store = seeded(&tmp, make());
        store
            .set_alias(EntityKind::Plan, "scout", Alias::Current, &ts(T1))
            .unwrap();
        let err = store
            .set_alias(EntityKind::Plan, "scout", Alias::Current, &ts("20270101T000000000Z"))
            .unwrap_err();
        assert!(matches!(err, AgentCertError::NotFound(_)));
        assert_eq!(
            store
                .resolve_alias(EntityKind::Plan, "scout", Alias::Current)
                .unwrap()
                .unwrap()
                .timestamp,
            ts(T1)
        );
    }
}

#[test]
fn alias_outside_the_entity_is_rejected() {
    let tmp = TempDir::new().unwrap();
    let store = seeded(&tmp, Box::new(ManifestAliases));
    store
        .write_version(EntityKind::Plan, "other", &ts(T1), &json!({}))
        .unwrap();
    // Hand-edited alias pointing at a different entity's version.
    ManifestAliases
        .point(
            &tmp.path().join("data/plans/scout"),
            "current",
            Path::new("../other@20260101T000000000Z"),
        )
        .unwrap();
    assert!(matches!(
        store.resolve_active(EntityKind::Plan, "scout"),
        Err(AgentCertError::InvalidAlias(_))
    ));
}

#[test]
fn list_versions_is_chronological() {
    let tmp = TempDir::new().unwrap();
    let store = seeded(&tmp, Box::new(ManifestAliases));
    assert_eq!(
        store.list_versions(EntityKind::Plan, "scout").unwrap(),
        vec![ts(T1), ts(T2)]
    );
    assert!(store.list_versions(EntityKind::Agent, "scout").unwrap().is_empty());
}

#[test]
fn ids_cannot_escape_the_data_root() {
    let tmp = TempDir::new().unwrap();
    let store = VersionedStore::new(tmp.path().join("data"), Box::new(ManifestAliases));
    assert!(matches!(
        store.write_version(EntityKind::Agent, "../evil", &ts(T1), &json!({})),
        Err(AgentCertError::ValidationError(_))
    ));
}

#[cfg(unix)]
#[test]
fn symlink_alias_points_at_sibling_directory() {
    let tmp = TempDir::new().unwrap();
    let store = seeded(&tmp, Box::new(agentcert::core::alias::SymlinkAliases));
    store
        .set_alias(EntityKind::Plan, "scout", Alias::Current, &ts(T2))
        .unwrap();
    let link = tmp.path().join("data/plans/scout/current");
    assert_eq!(
        std::fs::read_link(&link).unwrap(),
        Path::new("../scout@20260102T000000000Z")
    );
    assert!(link.join("plan.json").is_file());
}
