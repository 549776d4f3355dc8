//! 配置快照的反序列化与默认值
//!
//! - **意图 (Why)**：部署方可能以 JSON 等格式下发配置，缺失字段必须回落到与构建器相同的默认值，
//!   时长字段以毫秒整数表示。

use std::time::Duration;

use ledgerlink_core::{ConnectionSettings, Limit, NodePreference, SettingsError};

#[test]
fn partial_json_falls_back_to_defaults() {
    let raw = r#"{
        "max_reconnections": "unlimited",
        "max_retries": { "finite": 3 },
        "operation_timeout": 250,
        "node_preference": "read_only_replica"
    }"#;
    let settings: ConnectionSettings = serde_json::from_str(raw).expect("合法 JSON 配置");
    settings.validate().expect("默认值满足校验");

    assert_eq!(settings.max_reconnections, Limit::Unlimited);
    assert_eq!(settings.max_retries, Limit::Finite(3));
    assert_eq!(settings.operation_timeout, Duration::from_millis(250));
    assert_eq!(settings.node_preference, NodePreference::ReadOnlyReplica);

    let defaults = ConnectionSettings::default();
    assert_eq!(settings.reconnection_delay, defaults.reconnection_delay);
    assert_eq!(settings.heartbeat_interval, Duration::from_millis(750));
    assert_eq!(settings.max_queue_size, 5000);
    assert!(settings.require_leader);
}

#[test]
fn deserialized_settings_are_validated_explicitly() {
    let settings: ConnectionSettings =
        serde_json::from_str(r#"{ "max_concurrent_items": 0 }"#).expect("结构合法");
    assert_eq!(
        settings.validate(),
        Err(SettingsError::MustBePositive {
            field: "max_concurrent_items"
        })
    );
}

#[test]
fn serialized_durations_are_milliseconds() {
    let settings = ConnectionSettings::builder()
        .set_reconnection_delay_to(Duration::from_millis(1500))
        .build()
        .expect("配置合法");
    let value = serde_json::to_value(&settings).expect("序列化");
    assert_eq!(value["reconnection_delay"], 1500);
    assert_eq!(value["max_reconnections"], serde_json::json!({ "finite": 10 }));
}
