//! FrameRecord - one decoded sensor sample
//!
//! The unit of work handed to every sink. Field names on the wire follow the
//! compact keys existing consumers already parse (`ts`, `dn`, `sn`, `p`, ...).

use serde::{Deserialize, Deserializer, Serialize};

use crate::{ContractError, DeviceId};

/// One sampled reading from one device.
///
/// Immutable once produced: sinks only ever borrow it.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FrameRecord {
    /// Device epoch seconds; may be NaN, infinite or non-positive
    #[serde(rename = "ts", default, deserialize_with = "lenient_f64")]
    pub timestamp_seconds: f64,

    /// Hex device identifier as received (may be blank)
    #[serde(rename = "dn", default)]
    pub device_id: DeviceId,

    /// Number of pressure channels the device reports
    #[serde(rename = "sn", default)]
    pub sequence_count: i32,

    /// Pressure readings, nominally `sequence_count` long
    #[serde(rename = "p", default)]
    pub pressure: Vec<f32>,

    /// Magnetometer x, y, z
    #[serde(rename = "mag", default)]
    pub magnetometer: Vec<f32>,

    /// Gyroscope x, y, z
    #[serde(rename = "gyro", default)]
    pub gyroscope: Vec<f32>,

    /// Accelerometer x, y, z
    #[serde(rename = "acc", default)]
    pub accelerometer: Vec<f32>,
}

impl FrameRecord {
    /// Create an empty frame for a device with the given channel count.
    pub fn new(device_id: impl Into<DeviceId>, sequence_count: i32) -> Self {
        Self {
            timestamp_seconds: f64::NAN,
            device_id: device_id.into(),
            sequence_count,
            pressure: Vec::new(),
            magnetometer: Vec::new(),
            gyroscope: Vec::new(),
            accelerometer: Vec::new(),
        }
    }

    pub fn with_timestamp(mut self, timestamp_seconds: f64) -> Self {
        self.timestamp_seconds = timestamp_seconds;
        self
    }

    pub fn with_pressure(mut self, pressure: impl Into<Vec<f32>>) -> Self {
        self.pressure = pressure.into();
        self
    }

    pub fn with_imu(mut self, mag: [f32; 3], gyro: [f32; 3], acc: [f32; 3]) -> Self {
        self.magnetometer = mag.to_vec();
        self.gyroscope = gyro.to_vec();
        self.accelerometer = acc.to_vec();
        self
    }

    /// Device id with blank input replaced by the all-zero id.
    pub fn device_key(&self) -> DeviceId {
        self.device_id.normalized()
    }

    /// Channel count coerced to at least one.
    pub fn channel_count(&self) -> usize {
        self.sequence_count.max(1) as usize
    }

    /// The device timestamp if it can be used as an event time.
    pub fn event_timestamp(&self) -> Option<f64> {
        let ts = self.timestamp_seconds;
        (ts.is_finite() && ts > 0.0).then_some(ts)
    }

    /// Pressure channel `idx`, zero when the device sent fewer values.
    pub fn pressure_at(&self, idx: usize) -> f32 {
        self.pressure.get(idx).copied().unwrap_or(0.0)
    }

    pub fn magnetometer_xyz(&self) -> [f32; 3] {
        triple(&self.magnetometer)
    }

    pub fn gyroscope_xyz(&self) -> [f32; 3] {
        triple(&self.gyroscope)
    }

    pub fn accelerometer_xyz(&self) -> [f32; 3] {
        triple(&self.accelerometer)
    }

    /// Encode as the array-of-one JSON payload published to the broker.
    pub fn to_wire_bytes(&self) -> Result<Vec<u8>, ContractError> {
        encode_frames(std::slice::from_ref(self))
    }
}

fn triple(values: &[f32]) -> [f32; 3] {
    let at = |i: usize| values.get(i).copied().unwrap_or(0.0);
    [at(0), at(1), at(2)]
}

// serde_json writes non-finite floats as null, so accept it back as NaN
fn lenient_f64<'de, D>(deserializer: D) -> Result<f64, D::Error>
where
    D: Deserializer<'de>,
{
    Ok(Option::<f64>::deserialize(deserializer)?.unwrap_or(f64::NAN))
}

/// Encode frames as a JSON array, the batch form consumers expect.
pub fn encode_frames(frames: &[FrameRecord]) -> Result<Vec<u8>, ContractError> {
    serde_json::to_vec(frames).map_err(|e| ContractError::PayloadEncode {
        message: e.to_string(),
    })
}

#[derive(Deserialize)]
#[serde(untagged)]
enum WirePayload {
    Batch(Vec<FrameRecord>),
    Single(FrameRecord),
}

/// Decode a wire payload: either the array form or a bare object.
pub fn decode_frames(payload: &[u8]) -> Result<Vec<FrameRecord>, ContractError> {
    let parsed: WirePayload =
        serde_json::from_slice(payload).map_err(|e| ContractError::PayloadEncode {
            message: format!("invalid frame payload: {e}"),
        })?;
    Ok(match parsed {
        WirePayload::Batch(frames) => frames,
        WirePayload::Single(frame) => vec![frame],
    })
}
