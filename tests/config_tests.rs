//! Tests for operator configuration and retry timing

use clap::Parser;
use std::time::Duration;

use lightspeed_operator::config::{OperatorArgs, PlatformVersion};
use lightspeed_operator::controllers::backoff_delay;

#[test]
fn platform_version_forms() {
    for (input, expected) in [
        ("4.16", PlatformVersion::new(4, 16)),
        ("4.16.3", PlatformVersion::new(4, 16)),
        ("4.17.0-rc.1", PlatformVersion::new(4, 17)),
        (" 4.18 ", PlatformVersion::new(4, 18)),
    ] {
        assert_eq!(input.parse::<PlatformVersion>(), Ok(expected), "{}", input);
    }
}

#[test]
fn malformed_platform_version_is_rejected() {
    for input in ["", "4", "four.sixteen", "4.x"] {
        assert!(input.parse::<PlatformVersion>().is_err(), "{}", input);
    }
    assert_eq!(PlatformVersion::new(4, 16).to_string(), "4.16");
}

#[test]
fn backoff_doubles_up_to_the_cap() {
    assert_eq!(backoff_delay(1), Duration::from_secs(5));
    assert_eq!(backoff_delay(2), Duration::from_secs(10));
    assert_eq!(backoff_delay(4), Duration::from_secs(40));
    assert_eq!(backoff_delay(7), Duration::from_secs(300));
    assert_eq!(backoff_delay(64), Duration::from_secs(300));
    assert_eq!(backoff_delay(0), Duration::from_secs(5));
}

#[test]
fn args_have_usable_defaults() {
    let args = OperatorArgs::try_parse_from(["lightspeed-operator"]).unwrap();
    assert_eq!(args.namespace, "openshift-lightspeed");
    assert!(args.prometheus_available);
    assert_eq!(args.platform_version, None);

    let config = args.into_config(PlatformVersion::new(4, 16));
    assert_eq!(config.reconcile_interval, Duration::from_secs(60));
}

#[test]
fn args_accept_overrides() {
    let args = OperatorArgs::try_parse_from([
        "lightspeed-operator",
        "--namespace",
        "lightspeed-test",
        "--platform-version",
        "4.17.2",
        "--prometheus-available",
        "false",
        "--metrics-port",
        "9090",
    ])
    .unwrap();

    assert_eq!(args.namespace, "lightspeed-test");
    assert_eq!(args.platform_version, Some(PlatformVersion::new(4, 17)));
    assert!(!args.prometheus_available);
    assert_eq!(args.metrics_port, 9090);
}

#[test]
fn bad_platform_version_argument_fails() {
    assert!(OperatorArgs::try_parse_from(["lightspeed-operator", "--platform-version", "x"]).is_err());
}
