use serde_json::{Map, Value};
use thiserror::Error;

pub const IMAGE_FIELD: &str = "cam/image_array";
pub const ANGLE_FIELD: &str = "user/angle";
pub const THROTTLE_FIELD: &str = "user/throttle";
pub const MODE_FIELD: &str = "user/mode";
pub const BEHAVIOR_FIELD: &str = "behavior/one_hot_state_array";
/// Inertial fields in the order they are stacked into a model input.
pub const IMU_FIELDS: [&str; 6] = [
    "imu/acl_x",
    "imu/acl_y",
    "imu/acl_z",
    "imu/gyr_x",
    "imu/gyr_y",
    "imu/gyr_z",
];

#[derive(Debug, Error)]
pub enum RecordError {
    #[error("record is not valid json: {0}")]
    Json(#[from] serde_json::Error),
    #[error("record is not a json object")]
    NotAnObject,
    #[error("missing field {0}")]
    MissingField(&'static str),
    #[error("field {field} is not numeric: {value}")]
    NotNumeric { field: &'static str, value: String },
    #[error("field {field} is not finite: {value}")]
    NotFinite { field: &'static str, value: f32 },
    #[error("missing image path")]
    MissingImage,
    #[error("image payload malformed: {0}")]
    MalformedImage(String),
}

/// One frame's worth of driving telemetry as written by the vehicle.
///
/// Only the image reference and the two user controls are required. Inertial and
/// behavior readings are kept when present and well formed, otherwise dropped.
#[derive(Debug, Clone, PartialEq)]
pub struct TubRecord {
    /// Image file name, relative to the tub directory.
    pub image: String,
    pub angle: f32,
    pub throttle: f32,
    pub mode: Option<String>,
    /// `[acl_x, acl_y, acl_z, gyr_x, gyr_y, gyr_z]`, present only when all six parse.
    pub imu: Option<[f32; 6]>,
    pub behavior: Option<Vec<f32>>,
}

impl TubRecord {
    pub fn from_slice(bytes: &[u8]) -> Result<Self, RecordError> {
        let value: Value = serde_json::from_slice(bytes)?;
        Self::from_json(&value)
    }

    pub fn from_json(value: &Value) -> Result<Self, RecordError> {
        let map = value.as_object().ok_or(RecordError::NotAnObject)?;
        let image = match map.get(IMAGE_FIELD) {
            Some(Value::String(s)) => s.clone(),
            Some(_) => return Err(RecordError::MissingImage),
            None => return Err(RecordError::MissingField(IMAGE_FIELD)),
        };
        let record = TubRecord {
            image,
            angle: required_number(map, ANGLE_FIELD)?,
            throttle: required_number(map, THROTTLE_FIELD)?,
            mode: map
                .get(MODE_FIELD)
                .and_then(Value::as_str)
                .map(str::to_string),
            imu: parse_imu(map),
            behavior: parse_behavior(map),
        };
        record.validate()?;
        Ok(record)
    }

    pub fn validate(&self) -> Result<(), RecordError> {
        if self.image.trim().is_empty() {
            return Err(RecordError::MissingImage);
        }
        for (field, value) in [(ANGLE_FIELD, self.angle), (THROTTLE_FIELD, self.throttle)] {
            if !value.is_finite() {
                return Err(RecordError::NotFinite { field, value });
            }
        }
        Ok(())
    }

    pub fn to_json(&self) -> Value {
        let mut map = Map::new();
        map.insert(IMAGE_FIELD.into(), Value::String(self.image.clone()));
        map.insert(ANGLE_FIELD.into(), Value::from(self.angle));
        map.insert(THROTTLE_FIELD.into(), Value::from(self.throttle));
        if let Some(mode) = &self.mode {
            map.insert(MODE_FIELD.into(), Value::String(mode.clone()));
        }
        if let Some(imu) = &self.imu {
            for (field, v) in IMU_FIELDS.iter().zip(imu.iter()) {
                map.insert((*field).into(), Value::from(*v));
            }
        }
        if let Some(behavior) = &self.behavior {
            map.insert(
                BEHAVIOR_FIELD.into(),
                Value::Array(behavior.iter().map(|v| Value::from(*v)).collect()),
            );
        }
        Value::Object(map)
    }
}

/// Numbers may arrive as json numbers or as numeric strings.
pub fn lenient_number(value: &Value) -> Option<f32> {
    match value {
        Value::Number(n) => n.as_f64().map(|v| v as f32),
        Value::String(s) => s.trim().parse::<f32>().ok(),
        _ => None,
    }
}

fn required_number(map: &Map<String, Value>, field: &'static str) -> Result<f32, RecordError> {
    let raw = map.get(field).ok_or(RecordError::MissingField(field))?;
    lenient_number(raw).ok_or_else(|| RecordError::NotNumeric {
        field,
        value: raw.to_string(),
    })
}

fn parse_imu(map: &Map<String, Value>) -> Option<[f32; 6]> {
    let mut out = [0.0f32; 6];
    for (slot, field) in out.iter_mut().zip(IMU_FIELDS.iter()) {
        *slot = map.get(*field).and_then(lenient_number)?;
    }
    Some(out)
}

fn parse_behavior(map: &Map<String, Value>) -> Option<Vec<f32>> {
    let items = map.get(BEHAVIOR_FIELD)?.as_array()?;
    items.iter().map(lenient_number).collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn numeric_strings_are_accepted() {
        let rec = TubRecord::from_json(&json!({
            "cam/image_array": "3_cam.jpg",
            "user/angle": "-0.25",
            "user/throttle": 0.5,
        }))
        .unwrap();
        assert_eq!(rec.angle, -0.25);
        assert_eq!(rec.throttle, 0.5);
        assert!(rec.imu.is_none());
    }

    #[test]
    fn partial_imu_is_dropped() {
        let rec = TubRecord::from_json(&json!({
            "cam/image_array": "3_cam.jpg",
            "user/angle": 0.0,
            "user/throttle": 0.0,
            "imu/acl_x": 1.0,
            "imu/acl_y": 2.0,
        }))
        .unwrap();
        assert!(rec.imu.is_none());
    }

    #[test]
    fn to_json_keeps_optional_fields() {
        let rec = TubRecord {
            image: "1_cam.jpg".into(),
            angle: 0.1,
            throttle: 0.2,
            mode: Some("user".into()),
            imu: Some([1.0, 2.0, 3.0, 4.0, 5.0, 6.0]),
            behavior: Some(vec![0.0, 1.0]),
        };
        let back = TubRecord::from_json(&rec.to_json()).unwrap();
        assert_eq!(back, rec);
    }
}
