use std::collections::HashMap;
use std::path::PathBuf;
use std::time::Duration;

use review_lease::config::Config;
use review_lease::model::ResultLabel;

fn lookup(vars: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
    let vars: HashMap<String, String> = vars
        .iter()
        .map(|(k, v)| (k.to_string(), v.to_string()))
        .collect();
    move |name: &str| vars.get(name).cloned()
}

#[test]
fn defaults_apply_when_only_the_store_path_is_set() {
    let config = Config::from_lookup(lookup(&[("REVIEW_DB_PATH", "/srv/share/reviews.db")])).unwrap();

    assert_eq!(config.db_path, PathBuf::from("/srv/share/reviews.db"));
    assert_eq!(config.batch_size, 20);
    assert_eq!(config.qc_rate, 0.10);
    assert_eq!(config.standard_version, "v1.0");
    assert_eq!(
        config.results,
        vec![ResultLabel::new("yes"), ResultLabel::new("no"), ResultLabel::new("skip")]
    );
    assert_eq!(config.busy_timeout, Duration::from_secs(15));
    assert_eq!(config.otel_endpoint, None);
    assert_eq!(config.log_level, "info");
}

#[test]
fn overrides_are_parsed_and_reach_engine_options() {
    let config = Config::from_lookup(lookup(&[
        ("REVIEW_DB_PATH", "reviews.db"),
        ("REVIEW_BATCH_SIZE", "8"),
        ("REVIEW_QC_RATE", "0.5"),
        ("REVIEW_STANDARD_VERSION", "v2.1"),
        ("REVIEW_RESULTS", "yes,no,skip,blurry"),
        ("REVIEW_BUSY_TIMEOUT_SECS", "3"),
        ("OTEL_ENDPOINT", "http://localhost:4317"),
    ]))
    .unwrap();

    assert_eq!(config.batch_size, 8);
    assert_eq!(config.qc_rate, 0.5);
    assert_eq!(config.standard_version, "v2.1");
    assert_eq!(config.otel_endpoint.as_deref(), Some("http://localhost:4317"));

    let options = config.engine_options();
    assert_eq!(options.store.busy_timeout, Duration::from_secs(3));
    assert!(options.validate_label(&"blurry".into()).is_ok());
    assert!(options.validate_label(&"maybe".into()).is_err());
}

#[test]
fn invalid_values_fail_fast() {
    for (name, value) in [
        ("REVIEW_BATCH_SIZE", "0"),
        ("REVIEW_BATCH_SIZE", "-3"),
        ("REVIEW_QC_RATE", "1.5"),
        ("REVIEW_QC_RATE", "ten percent"),
        ("REVIEW_RESULTS", "yes,repeated_skip_pattern"),
        ("REVIEW_BUSY_TIMEOUT_SECS", "soon"),
    ] {
        let result = Config::from_lookup(lookup(&[("REVIEW_DB_PATH", "r.db"), (name, value)]));
        assert!(result.is_err(), "{name}={value} should be rejected");
    }
}

#[test]
fn config_from_env_fails_without_required() {
    unsafe {
        std::env::remove_var("REVIEW_DB_PATH");
    }

    let result = Config::from_env();
    assert!(result.is_err());
}
