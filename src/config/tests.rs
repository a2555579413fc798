use std::collections::HashMap;
use std::time::Duration;

use super::*;
use crate::cache::PolicyOverride;

#[test]
fn cli_overrides_take_highest_precedence() {
    let mut raw = RawSettings::default();
    raw.logging.level = Some("info".to_string());

    let overrides = LoggingOverrides {
        log_level: Some("debug".to_string()),
        ..Default::default()
    };

    raw.apply_logging_overrides(&overrides);
    let settings = Settings::from_raw(raw).expect("valid settings");

    assert_eq!(settings.logging.level, LevelFilter::DEBUG);
}

#[test]
fn cli_json_logging_enforces_format() {
    let mut raw = RawSettings::default();
    let overrides = LoggingOverrides {
        log_json: Some(true),
        ..Default::default()
    };

    raw.apply_logging_overrides(&overrides);
    let settings = Settings::from_raw(raw).expect("valid settings");

    assert!(matches!(settings.logging.format, LogFormat::Json));
}

#[test]
fn bad_log_level_names_the_key() {
    let mut raw = RawSettings::default();
    raw.logging.level = Some("loud".to_string());

    let err = Settings::from_raw(raw).expect_err("invalid level");
    assert!(matches!(err, LoadError::Invalid { key: "logging.level", .. }));
}

#[test]
fn defaults_keep_builtin_presets() {
    let settings = Settings::from_raw(RawSettings::default()).expect("valid settings");
    for preset in PolicyPreset::ALL {
        assert_eq!(settings.cache.policy(preset), preset.policy());
    }
}

#[test]
fn preset_override_is_applied() {
    let mut raw = RawSettings::default();
    raw.cache.policies.insert(
        PolicyPreset::Volatile,
        PolicyOverride {
            ttl_ms: Some(1_500),
            ..Default::default()
        },
    );

    let settings = Settings::from_raw(raw).expect("valid settings");
    let policy = settings.cache.policy(PolicyPreset::Volatile);
    assert_eq!(policy.ttl, Some(Duration::from_millis(1_500)));
    assert!(!policy.stale_while_revalidate);
}

#[test]
fn conflicting_expiry_is_rejected() {
    let mut raw = RawSettings::default();
    raw.cache.policies = HashMap::from([(
        PolicyPreset::Static,
        PolicyOverride {
            ttl_ms: Some(10),
            expires: Some(false),
            ..Default::default()
        },
    )]);

    let err = Settings::from_raw(raw).expect_err("conflict");
    assert!(matches!(err, LoadError::Invalid { key: "cache.policies", .. }));
}

#[test]
fn revalidating_on_demand_policy_is_rejected() {
    let mut raw = RawSettings::default();
    raw.cache.policies.insert(
        PolicyPreset::Static,
        PolicyOverride {
            stale_while_revalidate: Some(true),
            ..Default::default()
        },
    );

    assert!(Settings::from_raw(raw).is_err());
}

#[test]
fn policies_section_deserializes_from_toml() {
    let raw: RawSettings = Config::builder()
        .add_source(config::File::from_str(
            r#"
            [logging]
            json = true

            [cache.policies.personal]
            ttl_ms = 600000

            [cache.policies.external]
            stale_while_revalidate = true
            "#,
            config::FileFormat::Toml,
        ))
        .build()
        .expect("config builds")
        .try_deserialize()
        .expect("settings deserialize");

    let settings = Settings::from_raw(raw).expect("valid settings");
    assert_eq!(settings.logging.format, LogFormat::Json);
    assert_eq!(
        settings.cache.policy(PolicyPreset::Personal).ttl,
        Some(Duration::from_secs(600))
    );
    assert!(
        settings
            .cache
            .policy(PolicyPreset::External)
            .stale_while_revalidate
    );
}

#[test]
fn default_command_is_none() {
    let args = CliArgs::parse_from(["icebreak"]);
    assert!(args.command.is_none());
}

#[test]
fn parse_simulate_arguments() {
    let args = CliArgs::parse_from([
        "icebreak",
        "simulate",
        "--players",
        "5",
        "--fail-every",
        "4",
        "--log-level",
        "debug",
    ]);

    assert_eq!(args.logging.log_level.as_deref(), Some("debug"));
    match args.command.expect("simulate command") {
        Command::Simulate(simulate) => {
            assert_eq!(simulate.players, 5);
            assert_eq!(simulate.rounds, 2);
            assert_eq!(simulate.fail_every, 4);
        }
        _ => panic!("wrong command parsed"),
    }
}

#[test]
fn parse_policies_arguments() {
    let args = CliArgs::parse_from(["icebreak", "policies", "--json", "--preset", "volatile"]);

    match args.command.expect("policies command") {
        Command::Policies(policies) => {
            assert!(policies.json);
            assert_eq!(policies.preset, Some(PolicyPreset::Volatile));
        }
        _ => panic!("wrong command parsed"),
    }
}
