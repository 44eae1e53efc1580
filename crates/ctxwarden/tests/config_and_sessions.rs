//! Configuration files and session persistence through the filesystem.

use std::io::Write;

use ctxwarden::prelude::*;

#[test]
fn partial_config_file_keeps_defaults() {
    let mut file = tempfile::NamedTempFile::new().unwrap();
    write!(
        file,
        r#"{{"window": {{"total_tokens": 64000}}, "auto_compression": {{"compression_threshold": 0.8}}}}"#
    )
    .unwrap();

    let config = WardenConfig::load(file.path()).unwrap();
    assert_eq!(config.window.total_tokens, 64_000);
    assert_eq!(config.auto_compression.compression_threshold, 0.8);
    assert_eq!(config.window.allocation, SectionRatios::default());
    assert_eq!(config.fallback, WardenConfig::default().fallback);
}

#[test]
fn schema_violations_are_reported() {
    let err = WardenConfig::from_json_str(r#"{"window": {"total_tokens": "lots"}}"#).unwrap_err();
    assert!(matches!(err, WardenError::Schema(_)), "{err}");
    assert!(err.to_string().contains("total_tokens"));
}

#[test]
fn inconsistent_ratios_fail_validation() {
    let json = r#"{"window": {"allocation": {"system": 0.5, "conversation": 0.5, "code": 0.5, "project": 0.1, "memory": 0.1}}}"#;
    let err = WardenConfig::from_json_str(json).unwrap_err();
    assert!(matches!(err, WardenError::Config(_)), "{err}");
}

#[test]
fn missing_config_file_is_an_io_error() {
    let dir = tempfile::tempdir().unwrap();
    let err = WardenConfig::load(dir.path().join("absent.json")).unwrap_err();
    assert!(matches!(err, WardenError::Io(_)));
}

#[test]
fn session_survives_a_round_trip_through_disk() {
    let mut config = WardenConfig::default().with_total_tokens(20_000);
    config.window.buffer_percentage = 0.0;
    let mut source = ContextWindowManager::new("source", &config).unwrap();
    source.add(
        ContextItem::new("pref", "Prefer tabs over spaces.", ContentType::UserPreference)
            .with_priority(Priority::Critical),
    );
    source.add(ContextItem::new("q1", "How is the cache invalidated?", ContentType::Conversation));
    source.add(ContextItem::new(
        "lib",
        "pub fn evict(&mut self) { self.entries.clear(); }",
        ContentType::Code,
    ));

    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("session.json");
    source.export_session("s-1", "/work/proj").save(&path).unwrap();

    let loaded = SessionContext::load(&path).unwrap();
    assert_eq!(loaded.session_id, "s-1");
    assert_eq!(loaded.items.len(), 3);
    assert_eq!(loaded.total_tokens(), source.get_current_window().used_tokens);

    let mut target = ContextWindowManager::new("target", &config).unwrap();
    assert_eq!(target.restore_session(&loaded), 3);
    assert!(target.contains("pref"));
    assert_eq!(
        target.get_current_window().used_tokens,
        source.get_current_window().used_tokens
    );
    assert!(target.check_invariants());
}
