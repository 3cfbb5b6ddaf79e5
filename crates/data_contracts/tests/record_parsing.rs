use data_contracts::{RecordError, TubRecord};
use proptest::prelude::*;
use serde_json::json;

#[test]
fn missing_angle_rejected() {
    let err = TubRecord::from_json(&json!({
        "cam/image_array": "0_cam.jpg",
        "user/throttle": 0.3,
    }))
    .unwrap_err();
    assert!(matches!(err, RecordError::MissingField("user/angle")));
}

#[test]
fn non_numeric_throttle_rejected() {
    let err = TubRecord::from_slice(
        br#"{"cam/image_array": "0_cam.jpg", "user/angle": 0.1, "user/throttle": "fast"}"#,
    )
    .unwrap_err();
    assert!(matches!(err, RecordError::NotNumeric { .. }));
}

#[test]
fn blank_image_rejected() {
    let err = TubRecord::from_json(&json!({
        "cam/image_array": "  ",
        "user/angle": 0.0,
        "user/throttle": 0.0,
    }))
    .unwrap_err();
    assert!(matches!(err, RecordError::MissingImage));
}

#[test]
fn truncated_json_reports_parse_error() {
    let err = TubRecord::from_slice(br#"{"cam/image_array": "0_cam.jpg", "user/an"#).unwrap_err();
    assert!(matches!(err, RecordError::Json(_)));
}

#[test]
fn behavior_and_imu_parsed() {
    let rec = TubRecord::from_json(&json!({
        "cam/image_array": "9_cam.jpg",
        "user/angle": 0.0,
        "user/throttle": 0.4,
        "user/mode": "user",
        "imu/acl_x": 0.1, "imu/acl_y": 0.2, "imu/acl_z": 9.8,
        "imu/gyr_x": "0.0", "imu/gyr_y": 0.0, "imu/gyr_z": 0.01,
        "behavior/one_hot_state_array": [0.0, 1.0],
    }))
    .unwrap();
    assert_eq!(rec.imu.unwrap()[2], 9.8);
    assert_eq!(rec.behavior.as_deref(), Some(&[0.0, 1.0][..]));
    assert_eq!(rec.mode.as_deref(), Some("user"));
}

proptest! {
    #[test]
    fn finite_controls_always_parse(angle in -1.0f32..1.0, throttle in -1.0f32..1.0) {
        let rec = TubRecord::from_json(&json!({
            "cam/image_array": "1_cam.jpg",
            "user/angle": angle,
            "user/throttle": throttle,
        }))
        .unwrap();
        prop_assert_eq!(rec.angle, angle);
        prop_assert_eq!(rec.throttle, throttle);
    }
}
