// Copyright Amazon.com, Inc. or its affiliates. All Rights Reserved.
// SPDX-License-Identifier: Apache-2.0

use std::sync::Arc;

use outflow::{
    BufferedOutput, TimeSlicedOutput, default_registry,
    test_util::{RecordingOutput, RecordingRouter, RecordingSink, SinkHandle},
};
use outflow_core::{
    ArrayEventStream, ConfigContext, ConfigError, EventRouter, Output, PluginConfig, RootAgent,
};
use rstest::rstest;
use serde_json::json;

fn buffered() -> BufferedOutput<RecordingSink> {
    BufferedOutput::new(RecordingSink::new("recording", SinkHandle::default()))
}

fn configure(params: serde_json::Value) -> Result<BufferedOutput<RecordingSink>, ConfigError> {
    let mut output = buffered();
    output.configure(
        &PluginConfig::new("match").with_params(params),
        &ConfigContext::new(default_registry()),
    )?;
    Ok(output)
}

#[rstest]
#[case::zero_threads(json!({"num_threads": 0}), "num_threads")]
#[case::negative_secondary_limit(json!({"secondary_limit": -1}), "secondary_limit")]
#[case::negative_retry_wait(json!({"retry_wait": -2}), "retry_wait")]
#[case::zero_chunk_limit(json!({"buffer_chunk_limit": 0}), "buffer_chunk_limit")]
#[case::zero_queue_limit(json!({"buffer_queue_limit": 0}), "buffer_queue_limit")]
fn out_of_range_parameters_are_rejected(#[case] params: serde_json::Value, #[case] param: &str) {
    match configure(params) {
        Err(ConfigError::InvalidParameter { name, .. }) => assert_eq!(name, param),
        Err(other) => panic!("unexpected error {other}"),
        Ok(_) => panic!("configure should fail"),
    }
}

#[rstest]
#[case::bad_time(json!({"flush_interval": "soon"}))]
#[case::bad_size(json!({"buffer_chunk_limit": "big"}))]
#[case::wrong_type(json!({"num_threads": "many"}))]
fn malformed_parameters_are_rejected(#[case] params: serde_json::Value) {
    assert!(matches!(configure(params), Err(ConfigError::Deserialize(_))));
}

#[test]
fn parameters_are_parsed_with_units() {
    let output = configure(json!({
        "@id": "out",
        "flush_interval": "2m",
        "retry_wait": "1.5",
        "max_retry_wait": "1h",
        "buffer_chunk_limit": "1m",
        "num_threads": 2,
    }))
    .unwrap();
    let settings = output.settings();
    assert_eq!(settings.flush_interval.0, 120.0);
    assert_eq!(settings.retry_wait.0, 1.5);
    assert_eq!(settings.max_retry_wait.map(|wait| wait.0), Some(3600.0));
    assert_eq!(settings.num_threads, 2);
    assert_eq!(output.plugin_id(), "out");
}

#[test]
fn unknown_buffer_type_is_rejected() {
    assert!(matches!(
        configure(json!({"buffer_type": "file"})),
        Err(ConfigError::UnknownPluginType(name)) if name == "file"
    ));
}

#[test]
fn unknown_secondary_type_is_rejected() {
    let mut output = buffered();
    let conf = PluginConfig::new("match")
        .with_element(PluginConfig::new("secondary").with_param("@type", "nowhere"));
    let err = output
        .configure(&conf, &ConfigContext::new(default_registry()))
        .unwrap_err();
    assert!(matches!(err, ConfigError::UnknownPluginType(name) if name == "nowhere"));
}

#[test]
fn secondary_defaults_to_the_primary_type() {
    let mut registry = default_registry();
    RecordingOutput::register(&mut registry, "recording", &SinkHandle::default());
    let mut output = buffered();
    let conf = PluginConfig::new("match").with_element(PluginConfig::new("secondary"));
    output
        .configure(&conf, &ConfigContext::new(registry))
        .unwrap();
    assert_eq!(output.secondary().unwrap().plugin_type(), "recording");
}

#[test]
fn label_selects_the_router() {
    let errors = Arc::new(RecordingRouter::default());
    let agent = RootAgent::default().with_label("@ERROR", errors.clone());
    let ctx = ConfigContext::new(default_registry()).with_agent(agent);

    let mut output = buffered();
    output
        .configure(&PluginConfig::new("match").with_param("@label", "@ERROR"), &ctx)
        .unwrap();
    let router = output.base().router().unwrap();
    router
        .emit_stream("t", ArrayEventStream::default().shared())
        .unwrap();
    assert_eq!(errors.routed(), [("t".to_owned(), 0)]);

    let mut output = buffered();
    let err = output
        .configure(&PluginConfig::new("match").with_param("@label", "@MISSING"), &ctx)
        .unwrap_err();
    assert!(matches!(err, ConfigError::UnknownLabel(label) if label == "@MISSING"));
}

#[test]
fn configure_is_one_shot() {
    let ctx = ConfigContext::new(default_registry());
    let mut output = buffered();
    let conf = PluginConfig::new("match");
    output.configure(&conf, &ctx).unwrap();
    assert!(matches!(
        output.configure(&conf, &ctx),
        Err(ConfigError::AlreadyConfigured)
    ));
}

#[rstest]
#[case::unknown_zone(json!({"timezone": "Mars/Olympus_Mons"}))]
#[case::bad_offset(json!({"timezone": "+25:99"}))]
fn invalid_timezone_is_rejected(#[case] params: serde_json::Value) {
    let mut output = TimeSlicedOutput::new(RecordingSink::new("file", SinkHandle::default()));
    let err = output
        .configure(
            &PluginConfig::new("match").with_params(params),
            &ConfigContext::new(default_registry()),
        )
        .unwrap_err();
    assert!(matches!(err, ConfigError::InvalidTimezone(_)), "{err}");
}

#[test]
fn invalid_time_slice_format_is_rejected() {
    let mut output = TimeSlicedOutput::new(RecordingSink::new("file", SinkHandle::default()));
    let err = output
        .configure(
            &PluginConfig::new("match").with_param("time_slice_format", "%Y%m%d%"),
            &ConfigContext::new(default_registry()),
        )
        .unwrap_err();
    assert!(matches!(err, ConfigError::InvalidTimeFormat { .. }), "{err}");
}

#[test]
fn secondary_label_overrides_the_primary_router() {
    let errors = Arc::new(RecordingRouter::default());
    let agent = RootAgent::default().with_label("@ERROR", errors.clone());
    let mut registry = default_registry();
    RecordingOutput::register(&mut registry, "recording", &SinkHandle::default());
    let ctx = ConfigContext::new(registry).with_agent(agent);

    let mut output = buffered();
    let conf = PluginConfig::new("match")
        .with_element(PluginConfig::new("secondary").with_param("@label", "@ERROR"));
    output.configure(&conf, &ctx).unwrap();

    let secondary = output.secondary().unwrap();
    secondary
        .base()
        .router()
        .unwrap()
        .emit_stream("t", ArrayEventStream::default().shared())
        .unwrap();
    assert_eq!(errors.routed(), [("t".to_owned(), 0)]);
    assert!(!Arc::ptr_eq(
        output.base().router().unwrap(),
        secondary.base().router().unwrap()
    ));
}
