//! Schema of the compressed per-frame archives written by older vehicle firmware.
//!
//! Each archive is a zlib stream holding `{"val": {...}}`, where `val` carries the
//! usual record fields plus the raw frame under `cam/image_array` as nested
//! `[row][col][channel]` integer arrays.

use crate::record::{RecordError, IMAGE_FIELD};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LegacyArchive {
    pub val: Map<String, Value>,
}

/// Interleaved 8-bit pixels, row major.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RawImage {
    pub width: u32,
    pub height: u32,
    pub channels: u8,
    pub pixels: Vec<u8>,
}

impl LegacyArchive {
    pub fn from_slice(bytes: &[u8]) -> Result<Self, RecordError> {
        Ok(serde_json::from_slice(bytes)?)
    }

    /// Removes the embedded frame, leaving only telemetry fields in `val`.
    pub fn take_image(&mut self) -> Result<RawImage, RecordError> {
        let raw = self
            .val
            .remove(IMAGE_FIELD)
            .ok_or(RecordError::MissingField(IMAGE_FIELD))?;
        decode_rows(&raw)
    }

    /// Telemetry fields with the image replaced by a file reference.
    pub fn into_record_json(mut self, image_name: &str) -> Value {
        self.val
            .insert(IMAGE_FIELD.into(), Value::String(image_name.to_string()));
        Value::Object(self.val)
    }
}

fn decode_rows(raw: &Value) -> Result<RawImage, RecordError> {
    let malformed = |msg: &str| RecordError::MalformedImage(msg.to_string());
    let rows = raw.as_array().ok_or_else(|| malformed("expected rows"))?;
    let height = rows.len();
    let first = rows
        .first()
        .and_then(Value::as_array)
        .ok_or_else(|| malformed("empty frame"))?;
    let width = first.len();
    let channels = match first.first() {
        Some(Value::Array(px)) => px.len(),
        Some(_) => 1,
        None => return Err(malformed("empty row")),
    };
    if channels != 1 && channels != 3 {
        return Err(malformed("unsupported channel count"));
    }

    let mut pixels = Vec::with_capacity(height * width * channels);
    for row in rows {
        let row = row.as_array().ok_or_else(|| malformed("row is not an array"))?;
        if row.len() != width {
            return Err(malformed("ragged rows"));
        }
        for px in row {
            match px {
                Value::Array(chans) if chans.len() == channels => {
                    for c in chans {
                        pixels.push(channel_value(c).ok_or_else(|| malformed("bad channel"))?);
                    }
                }
                v if channels == 1 => {
                    pixels.push(channel_value(v).ok_or_else(|| malformed("bad channel"))?)
                }
                _ => return Err(malformed("inconsistent pixel layout")),
            }
        }
    }
    Ok(RawImage {
        width: width as u32,
        height: height as u32,
        channels: channels as u8,
        pixels,
    })
}

fn channel_value(v: &Value) -> Option<u8> {
    let n = v.as_f64()?;
    Some(n.clamp(0.0, 255.0).round() as u8)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn decodes_rgb_rows() {
        let mut archive: LegacyArchive = serde_json::from_value(json!({
            "val": {
                "cam/image_array": [[[1, 2, 3], [4, 5, 6]]],
                "user/angle": 0.5,
            }
        }))
        .unwrap();
        let img = archive.take_image().unwrap();
        assert_eq!((img.width, img.height, img.channels), (2, 1, 3));
        assert_eq!(img.pixels, vec![1, 2, 3, 4, 5, 6]);
        let rec = archive.into_record_json("7_cam.jpg");
        assert_eq!(rec["cam/image_array"], "7_cam.jpg");
        assert_eq!(rec["user/angle"], 0.5);
    }

    #[test]
    fn ragged_rows_rejected() {
        let raw = json!([[[1, 2, 3]], [[1, 2, 3], [4, 5, 6]]]);
        assert!(matches!(
            decode_rows(&raw),
            Err(RecordError::MalformedImage(_))
        ));
    }
}
