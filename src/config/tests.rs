use super::*;

#[test]
fn defaults_match_the_engine_defaults() {
    let settings = Settings::from_raw(RawSettings::default()).expect("valid settings");
    let engine = EngineConfig::from(&settings);
    let defaults = EngineConfig::default();

    assert_eq!(engine.pipeline.channel_capacity, defaults.pipeline.channel_capacity);
    assert_eq!(engine.pipeline.enqueue_wait_ms, 0);
    assert_eq!(engine.locks.lease_timeout_ms, defaults.locks.lease_timeout_ms);
    assert_eq!(engine.batch.size_threshold, 100);
    assert_eq!(engine.batch.flush_interval_ms, 5_000);
    assert_eq!(engine.batch.view_dedup_window_secs, 300);
    assert!(engine.repair.enabled);
    assert_eq!(engine.search.hot_ttl_secs, 3_600);
    assert_eq!(engine.search.empty_ttl_secs, 60);
    assert_eq!(engine.search.hot_retention, 1_000);
    assert_eq!(engine.cache_capacity, defaults.cache_capacity);
    assert!(matches!(settings.logging.format, LogFormat::Compact));
    assert_eq!(settings.logging.level, LevelFilter::INFO);
}

#[test]
fn cli_overrides_take_highest_precedence() {
    let mut raw = RawSettings::default();
    raw.batch.size_threshold = Some(500);
    raw.logging.level = Some("info".to_string());

    let overrides = RunOverrides {
        batch_size_threshold: Some(50),
        log_level: Some("debug".to_string()),
        repair_enabled: Some(false),
        ..Default::default()
    };

    raw.apply_overrides(&overrides);
    let settings = Settings::from_raw(raw).expect("valid settings");

    assert_eq!(settings.batch.size_threshold.get(), 50);
    assert_eq!(settings.logging.level, LevelFilter::DEBUG);
    assert!(!settings.repair.enabled);
}

#[test]
fn cli_json_logging_enforces_format() {
    let mut raw = RawSettings::default();
    let overrides = RunOverrides {
        log_json: Some(true),
        ..Default::default()
    };

    raw.apply_overrides(&overrides);
    let settings = Settings::from_raw(raw).expect("valid settings");

    assert!(matches!(settings.logging.format, LogFormat::Json));
}

#[test]
fn zero_enqueue_wait_and_dedup_window_are_allowed() {
    let mut raw = RawSettings::default();
    raw.pipeline.enqueue_wait_ms = Some(0);
    raw.batch.view_dedup_window_seconds = Some(0);

    let settings = Settings::from_raw(raw).expect("valid settings");
    assert!(settings.pipeline.enqueue_wait.is_zero());
    assert_eq!(EngineConfig::from(&settings).batch.view_dedup_window(), None);
}

#[test]
fn rejects_zero_sizes_and_intervals() {
    let cases: [(&str, fn(&mut RawSettings)); 4] = [
        ("pipeline.channel_capacity", |raw| {
            raw.pipeline.channel_capacity = Some(0)
        }),
        ("batch.flush_interval_ms", |raw| {
            raw.batch.flush_interval_ms = Some(0)
        }),
        ("locks.lease_timeout_ms", |raw| {
            raw.locks.lease_timeout_ms = Some(0)
        }),
        ("search.hot_threshold", |raw| raw.search.hot_threshold = Some(0)),
    ];

    for (expected, mutate) in cases {
        let mut raw = RawSettings::default();
        mutate(&mut raw);
        match Settings::from_raw(raw) {
            Err(LoadError::Invalid { key, .. }) => assert_eq!(key, expected),
            other => panic!("expected invalid `{expected}`, got {other:?}"),
        }
    }
}

#[test]
fn retry_interval_cannot_exceed_the_wait() {
    let mut raw = RawSettings::default();
    raw.locks.wait_timeout_ms = Some(100);
    raw.locks.retry_interval_ms = Some(500);

    assert!(matches!(
        Settings::from_raw(raw),
        Err(LoadError::Invalid {
            key: "locks.retry_interval_ms",
            ..
        })
    ));
}

#[test]
fn jitter_ratio_must_stay_below_one() {
    let mut raw = RawSettings::default();
    raw.search.ttl_jitter_ratio = Some(1.5);
    assert!(Settings::from_raw(raw).is_err());
}

#[test]
fn invalid_log_level_is_reported() {
    let mut raw = RawSettings::default();
    raw.logging.level = Some("loud".to_string());
    assert!(matches!(
        Settings::from_raw(raw),
        Err(LoadError::Invalid {
            key: "logging.level",
            ..
        })
    ));
}

#[test]
fn parse_run_overrides() {
    let args = CliArgs::parse_from([
        "tallyd",
        "--config-file",
        "/etc/tally.toml",
        "--log-json",
        "yes",
        "--pipeline-channel-capacity",
        "64",
        "--repair-enabled",
        "false",
    ]);

    assert_eq!(
        args.config_file.as_deref(),
        Some(std::path::Path::new("/etc/tally.toml"))
    );
    assert_eq!(args.overrides.log_json, Some(true));
    assert_eq!(args.overrides.pipeline_channel_capacity, Some(64));
    assert_eq!(args.overrides.repair_enabled, Some(false));
}

#[test]
fn no_arguments_means_no_overrides() {
    let args = CliArgs::parse_from(["tallyd"]);
    assert!(args.overrides.log_level.is_none());
    assert!(args.overrides.batch_size_threshold.is_none());
}
