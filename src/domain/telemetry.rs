//! Device telemetry as reported on the broker and as fanned out to clients.
//!
//! Devices publish snake_case reports ([`NodeTelemetryReport`],
//! [`CoordinatorTelemetryReport`], [`MmwaveFrame`]). The relay reshapes them
//! into [`TelemetryEvent`]s, which are what every connected client receives
//! through the broadcaster.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use utoipa::ToSchema;

/// One tracked target inside an mmWave radar frame.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize, ToSchema)]
#[serde(default)]
pub struct MmwaveTarget {
    /// Target slot reported by the sensor.
    pub id: u32,
    /// Radial distance in millimetres.
    pub distance_mm: i32,
    /// Radial speed in cm/s.
    pub speed_cm_s: i32,
    /// Distance resolution in millimetres.
    pub resolution_mm: i32,
    /// Lateral position in millimetres.
    pub position_x_mm: i32,
    /// Forward position in millimetres.
    pub position_y_mm: i32,
    /// Lateral velocity in m/s.
    pub velocity_x_m_s: f32,
    /// Forward velocity in m/s.
    pub velocity_y_m_s: f32,
}

/// A single mmWave radar frame from a coordinator.
///
/// `site_id` and `coordinator_id` are taken from the topic when the device
/// leaves them out of the payload.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, ToSchema)]
pub struct MmwaveFrame {
    /// Site the coordinator belongs to.
    #[serde(default)]
    pub site_id: String,
    /// Reporting coordinator.
    #[serde(default)]
    pub coordinator_id: String,
    /// Sensor identifier on the coordinator.
    #[serde(default)]
    pub sensor_id: String,
    /// Whether presence is detected.
    #[serde(default)]
    pub presence: bool,
    /// Detection confidence in `0.0..=1.0`.
    #[serde(default)]
    pub confidence: f32,
    /// Tracked targets.
    #[serde(default)]
    pub targets: Vec<MmwaveTarget>,
    /// Frame time; defaults to the receive time.
    #[serde(default = "Utc::now")]
    pub timestamp: DateTime<Utc>,
}

impl MmwaveFrame {
    /// Returns the frame served when a coordinator has not reported yet.
    #[must_use]
    pub fn empty(site_id: &str, coordinator_id: &str) -> Self {
        Self {
            site_id: site_id.to_string(),
            coordinator_id: coordinator_id.to_string(),
            sensor_id: String::new(),
            presence: false,
            confidence: 0.0,
            targets: Vec::new(),
            timestamp: Utc::now(),
        }
    }
}

/// Telemetry report published by a light node.
#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
#[serde(default)]
pub struct NodeTelemetryReport {
    /// Device timestamp (ms since epoch).
    pub ts: i64,
    /// Light fixture the node drives.
    pub light_id: String,
    /// Temperature in °C.
    pub temp_c: f32,
    /// Average red channel.
    pub avg_r: u32,
    /// Average green channel.
    pub avg_g: u32,
    /// Average blue channel.
    pub avg_b: u32,
    /// Average white channel.
    pub avg_w: u32,
    /// Battery voltage in millivolts.
    pub vbat_mv: u32,
    /// Node operating mode.
    pub status_mode: String,
}

/// mmWave sensor summary inside a coordinator report.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct MmwaveState {
    /// Whether presence is detected.
    pub presence: bool,
    /// Detection confidence.
    pub confidence: f32,
    /// Whether the sensor is responding.
    pub online: bool,
}

/// Telemetry report published by a coordinator.
#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
#[serde(default)]
pub struct CoordinatorTelemetryReport {
    /// Device timestamp (ms since epoch).
    pub ts: i64,
    /// Ambient light in lux.
    pub light_lux: f32,
    /// Temperature in °C.
    pub temp_c: f32,
    /// Wi-Fi signal strength in dBm.
    pub wifi_rssi: i32,
    /// mmWave sensor summary.
    pub mmwave: MmwaveState,
}

/// Light output state derived from the RGBW averages.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LightState {
    /// `true` when any channel is non-zero.
    pub on: bool,
    /// Brightest channel.
    pub brightness: u32,
    /// Average red channel.
    pub avg_r: u32,
    /// Average green channel.
    pub avg_g: u32,
    /// Average blue channel.
    pub avg_b: u32,
    /// Average white channel.
    pub avg_w: u32,
}

impl LightState {
    /// Derives the on flag and brightness from RGBW averages.
    #[must_use]
    pub fn from_rgbw(avg_r: u32, avg_g: u32, avg_b: u32, avg_w: u32) -> Self {
        let brightness = avg_r.max(avg_g).max(avg_b).max(avg_w);
        Self {
            on: brightness > 0,
            brightness,
            avg_r,
            avg_g,
            avg_b,
            avg_w,
        }
    }
}

/// Node telemetry as fanned out to clients.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NodeTelemetry {
    /// Reporting node.
    pub node_id: String,
    /// Light fixture the node drives.
    pub light_id: String,
    /// Device timestamp (ms since epoch).
    pub ts: i64,
    /// Temperature in °C.
    pub temp_c: f32,
    /// Derived light state.
    pub light: LightState,
    /// Battery voltage in millivolts.
    pub vbat_mv: u32,
    /// Node operating mode.
    pub status_mode: String,
}

impl NodeTelemetry {
    /// Builds the client-facing payload for `node_id` from a device report.
    #[must_use]
    pub fn from_report(node_id: &str, report: NodeTelemetryReport) -> Self {
        Self {
            node_id: node_id.to_string(),
            light_id: report.light_id,
            ts: report.ts,
            temp_c: report.temp_c,
            light: LightState::from_rgbw(report.avg_r, report.avg_g, report.avg_b, report.avg_w),
            vbat_mv: report.vbat_mv,
            status_mode: report.status_mode,
        }
    }
}

/// Coordinator telemetry as fanned out to clients.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CoordinatorTelemetry {
    /// Reporting coordinator.
    pub coord_id: String,
    /// Site the coordinator belongs to.
    pub site_id: String,
    /// Device timestamp (ms since epoch).
    pub ts: i64,
    /// Ambient light in lux.
    pub light_lux: f32,
    /// Temperature in °C.
    pub temp_c: f32,
    /// Wi-Fi signal strength in dBm.
    pub wifi_rssi: i32,
    /// mmWave sensor summary.
    pub mmwave: MmwaveState,
}

impl CoordinatorTelemetry {
    /// Builds the client-facing payload from a device report.
    #[must_use]
    pub fn from_report(site_id: &str, coord_id: &str, report: CoordinatorTelemetryReport) -> Self {
        Self {
            coord_id: coord_id.to_string(),
            site_id: site_id.to_string(),
            ts: report.ts,
            light_lux: report.light_lux,
            temp_c: report.temp_c,
            wifi_rssi: report.wifi_rssi,
            mmwave: report.mmwave,
        }
    }
}

/// Fleet-wide event pushed to every connected client.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", content = "payload", rename_all = "snake_case")]
pub enum TelemetryEvent {
    /// A light node reported telemetry.
    NodeTelemetry(NodeTelemetry),
    /// A coordinator reported telemetry.
    #[serde(rename = "coord_telemetry")]
    CoordinatorTelemetry(CoordinatorTelemetry),
    /// A coordinator reported a radar frame.
    MmwaveFrame(MmwaveFrame),
}
