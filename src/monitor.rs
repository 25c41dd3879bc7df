//! Capture session and device status tracking.
//!
//! Every session moves forward through the [`CapturePhase`]s and is archived
//! into its history when it completes, fails or is cancelled. Device status is
//! tracked separately, keyed by device id. All tables sit behind a single
//! mutex, so each call is applied atomically.

use crate::capture_models::{CaptureSession, ConnectionKind, DeviceInfo};
use crate::driver::{DriverEvent, DriverStatus};
use std::collections::{BTreeMap, HashMap};
use std::sync::{Mutex, MutexGuard, PoisonError};
use std::time::{Duration, Instant};

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum CapturePhase {
    Initializing,
    Configuring,
    WaitingForTrigger,
    Capturing,
    ProcessingData,
    Completed,
    Error,
    Cancelled,
}

impl CapturePhase {
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            CapturePhase::Completed | CapturePhase::Error | CapturePhase::Cancelled
        )
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct MonitorConfig {
    /// Archived records kept per session id
    pub history_limit: usize,
    /// Devices without a heartbeat for this long are reported as stale
    pub heartbeat_timeout: Duration,
    /// Log every progress update
    pub detailed_logging: bool,
}

impl Default for MonitorConfig {
    fn default() -> Self {
        Self {
            history_limit: 100,
            heartbeat_timeout: Duration::from_secs(30),
            detailed_logging: false,
        }
    }
}

impl MonitorConfig {
    pub fn high_performance() -> Self {
        Self {
            history_limit: 20,
            heartbeat_timeout: Duration::from_secs(60),
            detailed_logging: false,
        }
    }

    pub fn low_resource() -> Self {
        Self {
            history_limit: 5,
            heartbeat_timeout: Duration::from_secs(120),
            detailed_logging: false,
        }
    }

    pub fn debug() -> Self {
        Self {
            history_limit: 1000,
            heartbeat_timeout: Duration::from_secs(10),
            detailed_logging: true,
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct CaptureProgress {
    pub session_id: String,
    pub device_id: String,
    pub phase: CapturePhase,
    pub current_sample: u64,
    pub total_samples: u64,
    pub percentage: f64,
    /// Samples per second as observed by the host
    pub sample_rate: f64,
    /// Bytes per second
    pub data_rate: f64,
    pub lost_samples: u64,
    pub error_count: u64,
    pub started_at: Instant,
    pub capture_started_at: Option<Instant>,
    pub updated_at: Instant,
    pub finished_at: Option<Instant>,
    /// Failure description for sessions that ended in `Error`
    pub message: Option<String>,
}

impl CaptureProgress {
    fn new(session_id: &str, device_id: &str, total_samples: u64) -> Self {
        let now = Instant::now();
        Self {
            session_id: session_id.to_string(),
            device_id: device_id.to_string(),
            phase: CapturePhase::Initializing,
            current_sample: 0,
            total_samples,
            percentage: 0.0,
            sample_rate: 0.0,
            data_rate: 0.0,
            lost_samples: 0,
            error_count: 0,
            started_at: now,
            capture_started_at: None,
            updated_at: now,
            finished_at: None,
            message: None,
        }
    }

    /// Time from `start_monitoring` to the end of the session, or until now
    pub fn duration(&self) -> Duration {
        self.finished_at
            .unwrap_or_else(Instant::now)
            .duration_since(self.started_at)
    }
}

/// Partial progress update; unset fields keep their value
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ProgressUpdate {
    pub current_sample: Option<u64>,
    /// Derived from `current_sample` when unset
    pub percentage: Option<f64>,
    /// Derived from elapsed capture time when unset
    pub sample_rate: Option<f64>,
    pub data_rate: Option<f64>,
    pub lost_samples: Option<u64>,
    pub error_count: Option<u64>,
}

impl ProgressUpdate {
    pub fn samples(current_sample: u64) -> Self {
        Self {
            current_sample: Some(current_sample),
            ..Default::default()
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeviceStatus {
    Connected,
    Capturing,
    Disconnected,
    Error,
}

#[derive(Debug, Clone, PartialEq)]
pub struct DeviceStatusInfo {
    pub device_id: String,
    pub info: DeviceInfo,
    pub status: DeviceStatus,
    pub connection_type: ConnectionKind,
    /// 0.0 (unusable) to 1.0 (perfect)
    pub connection_quality: f64,
    pub last_heartbeat: Instant,
    pub temperature: Option<f32>,
    pub battery_level: Option<f32>,
}

/// Optional readings reported by a device
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct DeviceTelemetry {
    pub connection_quality: Option<f64>,
    pub temperature: Option<f32>,
    pub battery_level: Option<f32>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HealthStatus {
    Normal,
    Warning,
    Error,
}

#[derive(Debug, Clone, PartialEq)]
pub struct ResourceUsage {
    pub tracked_devices: usize,
    pub history_entries: usize,
    pub uptime: Duration,
}

#[derive(Debug, Clone, PartialEq)]
pub struct StatusReport {
    pub active_captures: usize,
    pub connected_devices: usize,
    pub health: HealthStatus,
    pub warnings: Vec<String>,
    pub resources: ResourceUsage,
}

#[derive(Debug, Clone, PartialEq)]
pub struct PerformanceStatistics {
    pub total_sessions: usize,
    pub successful_sessions: usize,
    pub average_duration: Duration,
    /// Mean samples per second over successful sessions
    pub average_throughput: f64,
    /// 0.0..=1.0
    pub success_rate: f64,
}

#[derive(Debug, Default)]
struct MonitorState {
    active: BTreeMap<String, CaptureProgress>,
    history: HashMap<String, Vec<CaptureProgress>>,
    devices: BTreeMap<String, DeviceStatusInfo>,
}

pub struct CaptureProgressMonitor {
    config: MonitorConfig,
    state: Mutex<MonitorState>,
    created_at: Instant,
}

impl Default for CaptureProgressMonitor {
    fn default() -> Self {
        Self::new(MonitorConfig::default())
    }
}

impl CaptureProgressMonitor {
    pub fn new(config: MonitorConfig) -> Self {
        Self {
            config,
            state: Mutex::new(MonitorState::default()),
            created_at: Instant::now(),
        }
    }

    pub fn config(&self) -> &MonitorConfig {
        &self.config
    }

    fn state(&self) -> MutexGuard<'_, MonitorState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Register a session as active in the `Initializing` phase
    pub fn start_monitoring(&self, session_id: &str, device_id: &str, session: &CaptureSession) {
        let progress = CaptureProgress::new(session_id, device_id, session.total_samples());
        log::debug!(
            "Monitoring session {} on {} ({} samples)",
            session_id,
            device_id,
            progress.total_samples
        );
        if let Some(previous) = self.state().active.insert(session_id.to_string(), progress) {
            log::warn!(
                "Session {} restarted while in phase {:?}",
                session_id,
                previous.phase
            );
        }
    }

    pub fn update_progress(&self, session_id: &str, update: &ProgressUpdate) {
        let mut state = self.state();
        let Some(progress) = state.active.get_mut(session_id) else {
            return;
        };
        let now = Instant::now();

        if let Some(current) = update.current_sample {
            progress.current_sample = current;
        }
        progress.percentage = match update.percentage {
            Some(percentage) => percentage.clamp(0.0, 100.0),
            None if progress.total_samples > 0 => {
                (progress.current_sample as f64 / progress.total_samples as f64 * 100.0).min(100.0)
            }
            None => progress.percentage,
        };
        progress.sample_rate = match update.sample_rate {
            Some(rate) => rate,
            None => {
                let elapsed = now
                    .duration_since(progress.capture_started_at.unwrap_or(progress.started_at))
                    .as_secs_f64();
                if elapsed > 0.0 {
                    progress.current_sample as f64 / elapsed
                } else {
                    progress.sample_rate
                }
            }
        };
        if let Some(rate) = update.data_rate {
            progress.data_rate = rate;
        }
        if let Some(lost) = update.lost_samples {
            progress.lost_samples = lost;
        }
        if let Some(errors) = update.error_count {
            progress.error_count = errors;
        }
        progress.updated_at = now;

        if self.config.detailed_logging {
            log::debug!(
                "Session {}: {}/{} samples ({:.1}%)",
                session_id,
                progress.current_sample,
                progress.total_samples,
                progress.percentage
            );
        }
    }

    /// Move a session forward. Backward moves and terminal phases are ignored;
    /// use [`complete_capture`](Self::complete_capture) or
    /// [`cancel_capture`](Self::cancel_capture) to end a session.
    pub fn update_phase(&self, session_id: &str, phase: CapturePhase) {
        let mut state = self.state();
        let Some(progress) = state.active.get_mut(session_id) else {
            return;
        };
        if phase.is_terminal() || phase <= progress.phase {
            log::warn!(
                "Ignoring phase change {:?} -> {:?} for session {}",
                progress.phase,
                phase,
                session_id
            );
            return;
        }

        log::debug!("Session {}: {:?} -> {:?}", session_id, progress.phase, phase);
        let now = Instant::now();
        if phase >= CapturePhase::Capturing && progress.capture_started_at.is_none() {
            progress.capture_started_at = Some(now);
        }
        progress.phase = phase;
        progress.updated_at = now;
    }

    /// End a session as `Completed` or `Error` and archive it
    pub fn complete_capture(&self, session_id: &str, success: bool, message: Option<&str>) {
        let phase = if success {
            CapturePhase::Completed
        } else {
            CapturePhase::Error
        };
        self.finish(session_id, phase, message);
    }

    pub fn cancel_capture(&self, session_id: &str) {
        self.finish(session_id, CapturePhase::Cancelled, None);
    }

    fn finish(&self, session_id: &str, phase: CapturePhase, message: Option<&str>) {
        let mut state = self.state();
        let Some(mut progress) = state.active.remove(session_id) else {
            return;
        };

        let now = Instant::now();
        progress.phase = phase;
        progress.finished_at = Some(now);
        progress.updated_at = now;
        progress.message = message.map(str::to_string);
        if phase == CapturePhase::Completed {
            progress.current_sample = progress.total_samples;
            progress.percentage = 100.0;
        }

        match phase {
            CapturePhase::Error => log::warn!(
                "Session {} failed: {}",
                session_id,
                message.unwrap_or("unknown error")
            ),
            _ => log::debug!(
                "Session {} finished as {:?} after {:?}",
                session_id,
                phase,
                progress.duration()
            ),
        }

        let records = state.history.entry(session_id.to_string()).or_default();
        records.push(progress);
        if records.len() > self.config.history_limit {
            let excess = records.len() - self.config.history_limit;
            records.drain(..excess);
        }
    }

    /// Insert or replace a device's status; refreshes its heartbeat
    pub fn update_device_status(&self, device_id: &str, info: &DeviceInfo, status: DeviceStatus) {
        let mut state = self.state();
        let now = Instant::now();
        let connection_type = if info.is_network {
            ConnectionKind::Wifi
        } else {
            ConnectionKind::Usb
        };

        let entry = state
            .devices
            .entry(device_id.to_string())
            .or_insert_with(|| DeviceStatusInfo {
                device_id: device_id.to_string(),
                info: info.clone(),
                status,
                connection_type,
                connection_quality: 1.0,
                last_heartbeat: now,
                temperature: None,
                battery_level: None,
            });
        if entry.status != status {
            log::debug!("Device {}: {:?} -> {:?}", device_id, entry.status, status);
        }
        entry.info = info.clone();
        entry.status = status;
        entry.connection_type = connection_type;
        entry.last_heartbeat = now;
    }

    /// Record telemetry for a known device; refreshes its heartbeat
    pub fn update_device_telemetry(&self, device_id: &str, telemetry: &DeviceTelemetry) {
        let mut state = self.state();
        let Some(device) = state.devices.get_mut(device_id) else {
            return;
        };
        if let Some(quality) = telemetry.connection_quality {
            device.connection_quality = quality.clamp(0.0, 1.0);
        }
        if telemetry.temperature.is_some() {
            device.temperature = telemetry.temperature;
        }
        if telemetry.battery_level.is_some() {
            device.battery_level = telemetry.battery_level;
        }
        device.last_heartbeat = Instant::now();
    }

    fn set_device_state(&self, device_id: &str, status: DeviceStatus) {
        if let Some(device) = self.state().devices.get_mut(device_id) {
            device.status = status;
            device.last_heartbeat = Instant::now();
        }
    }

    /// Apply a driver notification to `session_id` and its device
    pub fn handle_driver_event(&self, session_id: &str, event: &DriverEvent) {
        match event {
            DriverEvent::Status { device_id, status } => match status {
                DriverStatus::Connected => self.set_device_state(device_id, DeviceStatus::Connected),
                DriverStatus::Disconnected => {
                    self.set_device_state(device_id, DeviceStatus::Disconnected)
                }
                DriverStatus::Configuring => self.update_phase(session_id, CapturePhase::Configuring),
                DriverStatus::WaitingForTrigger => {
                    self.update_phase(session_id, CapturePhase::WaitingForTrigger);
                    self.set_device_state(device_id, DeviceStatus::Capturing);
                }
                DriverStatus::Capturing => {
                    self.update_phase(session_id, CapturePhase::Capturing);
                    self.set_device_state(device_id, DeviceStatus::Capturing);
                }
                DriverStatus::ProcessingData => {
                    self.update_phase(session_id, CapturePhase::ProcessingData)
                }
                DriverStatus::CaptureCompleted => {
                    self.complete_capture(session_id, true, None);
                    self.set_device_state(device_id, DeviceStatus::Connected);
                }
                DriverStatus::CaptureCancelled => {
                    self.cancel_capture(session_id);
                    self.set_device_state(device_id, DeviceStatus::Connected);
                }
            },
            DriverEvent::Data { device_id, chunk } => {
                self.update_progress(
                    session_id,
                    &ProgressUpdate::samples(chunk.first_sample + chunk.words.len() as u64),
                );
                self.set_device_state(device_id, DeviceStatus::Capturing);
            }
            DriverEvent::Error { device_id, message } => {
                self.complete_capture(session_id, false, Some(message.as_str()));
                self.set_device_state(device_id, DeviceStatus::Error);
            }
        }
    }

    pub fn get_progress(&self, session_id: &str) -> Option<CaptureProgress> {
        self.state().active.get(session_id).cloned()
    }

    /// Active sessions ordered by session id
    pub fn get_active_captures(&self) -> Vec<CaptureProgress> {
        self.state().active.values().cloned().collect()
    }

    /// Archived records of one session, or of all sessions ordered by finish time
    pub fn get_capture_history(&self, session_id: Option<&str>) -> Vec<CaptureProgress> {
        let state = self.state();
        match session_id {
            Some(id) => state.history.get(id).cloned().unwrap_or_default(),
            None => {
                let mut all: Vec<CaptureProgress> =
                    state.history.values().flatten().cloned().collect();
                all.sort_by_key(|p| p.finished_at);
                all
            }
        }
    }

    pub fn clear_history(&self, session_id: Option<&str>) {
        let mut state = self.state();
        match session_id {
            Some(id) => {
                state.history.remove(id);
            }
            None => state.history.clear(),
        }
    }

    pub fn get_device_status(&self, device_id: &str) -> Option<DeviceStatusInfo> {
        self.state().devices.get(device_id).cloned()
    }

    pub fn generate_status_report(&self) -> StatusReport {
        let state = self.state();
        let mut warnings = Vec::new();

        let errored = state
            .devices
            .values()
            .filter(|d| d.status == DeviceStatus::Error)
            .inspect(|d| warnings.push(format!("Device {} reports an error", d.device_id)))
            .count();
        let stale = state
            .devices
            .values()
            .filter(|d| {
                d.status != DeviceStatus::Disconnected
                    && d.last_heartbeat.elapsed() > self.config.heartbeat_timeout
            })
            .inspect(|d| {
                warnings.push(format!(
                    "Device {} has not reported for {:?}",
                    d.device_id,
                    d.last_heartbeat.elapsed()
                ))
            })
            .count();
        let connected_devices = state
            .devices
            .values()
            .filter(|d| matches!(d.status, DeviceStatus::Connected | DeviceStatus::Capturing))
            .count();

        let health = if errored > 0 && errored == state.devices.len() {
            HealthStatus::Error
        } else if errored > 0 || stale > 0 {
            HealthStatus::Warning
        } else {
            HealthStatus::Normal
        };

        StatusReport {
            active_captures: state.active.len(),
            connected_devices,
            health,
            warnings,
            resources: ResourceUsage {
                tracked_devices: state.devices.len(),
                history_entries: state.history.values().map(Vec::len).sum(),
                uptime: self.created_at.elapsed(),
            },
        }
    }

    pub fn get_performance_statistics(&self) -> PerformanceStatistics {
        let state = self.state();
        let records: Vec<&CaptureProgress> = state.history.values().flatten().collect();
        let successful: Vec<&&CaptureProgress> = records
            .iter()
            .filter(|p| p.phase == CapturePhase::Completed)
            .collect();

        let total_duration: Duration = records.iter().map(|p| p.duration()).sum();
        let average_duration = u32::try_from(records.len())
            .ok()
            .filter(|&n| n > 0)
            .map_or(Duration::ZERO, |n| total_duration / n);

        let throughputs: Vec<f64> = successful
            .iter()
            .filter_map(|p| {
                let seconds = p.duration().as_secs_f64();
                (seconds > 0.0).then(|| p.total_samples as f64 / seconds)
            })
            .collect();
        let average_throughput = if throughputs.is_empty() {
            0.0
        } else {
            throughputs.iter().sum::<f64>() / throughputs.len() as f64
        };

        PerformanceStatistics {
            total_sessions: records.len(),
            successful_sessions: successful.len(),
            average_duration,
            average_throughput,
            success_rate: if records.is_empty() {
                0.0
            } else {
                successful.len() as f64 / records.len() as f64
            },
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::capture_models::DriverType;
    use crate::driver::DataChunk;

    fn session(samples: u32) -> CaptureSession {
        CaptureSession::new(1_000_000, 2, samples - 2).with_channels(&[0])
    }

    fn device(name: &str) -> DeviceInfo {
        DeviceInfo {
            name: name.to_string(),
            firmware_version: "V6_5".to_string(),
            driver_type: DriverType::Serial,
            connection_path: "/dev/ttyACM0".to_string(),
            is_network: false,
        }
    }

    #[test]
    fn test_complete_path() {
        let monitor = CaptureProgressMonitor::default();
        monitor.start_monitoring("s1", "la0", &session(1000));
        assert_eq!(monitor.get_progress("s1").unwrap().total_samples, 1000);

        monitor.update_phase("s1", CapturePhase::Capturing);
        monitor.complete_capture("s1", true, None);

        assert!(monitor.get_active_captures().is_empty());
        let history = monitor.get_capture_history(Some("s1"));
        assert_eq!(history.len(), 1);
        assert_eq!(history[0].phase, CapturePhase::Completed);
        assert!(history[0].capture_started_at.is_some());
    }

    #[test]
    fn test_cancel_mid_capture() {
        let monitor = CaptureProgressMonitor::default();
        monitor.start_monitoring("s1", "la0", &session(1000));
        monitor.update_phase("s1", CapturePhase::Capturing);
        monitor.update_progress("s1", &ProgressUpdate::samples(250));
        monitor.cancel_capture("s1");

        let history = monitor.get_capture_history(None);
        assert_eq!(history.last().map(|p| p.phase), Some(CapturePhase::Cancelled));
        assert_eq!(history[0].current_sample, 250);
    }

    #[test]
    fn test_concurrent_sessions_across_devices() {
        let monitor = CaptureProgressMonitor::default();
        monitor.start_monitoring("a", "la0", &session(100));
        monitor.start_monitoring("b", "la1", &session(100));
        monitor.start_monitoring("c", "la0", &session(100));

        let pairs: Vec<(String, String)> = monitor
            .get_active_captures()
            .into_iter()
            .map(|p| (p.session_id, p.device_id))
            .collect();
        assert_eq!(
            pairs,
            vec![
                ("a".to_string(), "la0".to_string()),
                ("b".to_string(), "la1".to_string()),
                ("c".to_string(), "la0".to_string()),
            ]
        );

        monitor.complete_capture("b", true, None);
        let remaining: Vec<String> = monitor
            .get_active_captures()
            .into_iter()
            .map(|p| p.session_id)
            .collect();
        assert_eq!(remaining, vec!["a".to_string(), "c".to_string()]);
    }

    #[test]
    fn test_phase_only_moves_forward() {
        let monitor = CaptureProgressMonitor::default();
        monitor.start_monitoring("s1", "la0", &session(100));
        monitor.update_phase("s1", CapturePhase::ProcessingData);
        monitor.update_phase("s1", CapturePhase::Configuring);
        monitor.update_phase("s1", CapturePhase::Completed);

        let progress = monitor.get_progress("s1").unwrap();
        assert_eq!(progress.phase, CapturePhase::ProcessingData);
    }

    #[test]
    fn test_unknown_session_is_ignored() {
        let monitor = CaptureProgressMonitor::default();
        monitor.update_phase("missing", CapturePhase::Capturing);
        monitor.update_progress("missing", &ProgressUpdate::samples(5));
        monitor.complete_capture("missing", false, Some("boom"));
        monitor.cancel_capture("missing");
        assert!(monitor.get_active_captures().is_empty());
        assert!(monitor.get_capture_history(None).is_empty());
    }

    #[test]
    fn test_progress_percentage_derived() {
        let monitor = CaptureProgressMonitor::default();
        monitor.start_monitoring("s1", "la0", &session(200));
        monitor.update_progress("s1", &ProgressUpdate::samples(50));
        assert!((monitor.get_progress("s1").unwrap().percentage - 25.0).abs() < 1e-9);

        monitor.update_progress(
            "s1",
            &ProgressUpdate {
                percentage: Some(140.0),
                lost_samples: Some(3),
                ..Default::default()
            },
        );
        let progress = monitor.get_progress("s1").unwrap();
        assert!((progress.percentage - 100.0).abs() < 1e-9);
        assert_eq!(progress.lost_samples, 3);
        assert_eq!(progress.current_sample, 50);
    }

    #[test]
    fn test_error_message_kept_in_history() {
        let monitor = CaptureProgressMonitor::default();
        monitor.start_monitoring("s1", "la0", &session(100));
        monitor.complete_capture("s1", false, Some("trigger timeout"));

        let record = &monitor.get_capture_history(Some("s1"))[0];
        assert_eq!(record.phase, CapturePhase::Error);
        assert_eq!(record.message.as_deref(), Some("trigger timeout"));
    }

    #[test]
    fn test_history_limit_and_clear() {
        let monitor = CaptureProgressMonitor::new(MonitorConfig::low_resource());
        for _ in 0..8 {
            monitor.start_monitoring("s1", "la0", &session(100));
            monitor.complete_capture("s1", true, None);
        }
        monitor.start_monitoring("s2", "la0", &session(100));
        monitor.cancel_capture("s2");

        assert_eq!(monitor.get_capture_history(Some("s1")).len(), 5);
        monitor.clear_history(Some("s1"));
        assert!(monitor.get_capture_history(Some("s1")).is_empty());
        assert_eq!(monitor.get_capture_history(None).len(), 1);
        monitor.clear_history(None);
        assert!(monitor.get_capture_history(None).is_empty());
    }

    #[test]
    fn test_status_report_health() {
        let monitor = CaptureProgressMonitor::default();
        assert_eq!(monitor.generate_status_report().health, HealthStatus::Normal);

        monitor.update_device_status("la0", &device("la0"), DeviceStatus::Connected);
        monitor.update_device_status("la1", &device("la1"), DeviceStatus::Capturing);
        monitor.start_monitoring("s1", "la1", &session(100));

        let report = monitor.generate_status_report();
        assert_eq!(report.active_captures, 1);
        assert_eq!(report.connected_devices, 2);
        assert_eq!(report.health, HealthStatus::Normal);

        monitor.update_device_status("la1", &device("la1"), DeviceStatus::Error);
        let report = monitor.generate_status_report();
        assert_eq!(report.health, HealthStatus::Warning);
        assert_eq!(report.connected_devices, 1);
        assert_eq!(report.warnings.len(), 1);

        monitor.update_device_status("la0", &device("la0"), DeviceStatus::Error);
        assert_eq!(monitor.generate_status_report().health, HealthStatus::Error);
    }

    #[test]
    fn test_stale_heartbeat_is_a_warning() {
        let monitor = CaptureProgressMonitor::new(MonitorConfig {
            heartbeat_timeout: Duration::from_millis(200),
            ..Default::default()
        });
        monitor.update_device_status("la0", &device("la0"), DeviceStatus::Connected);
        std::thread::sleep(Duration::from_millis(300));
        assert_eq!(monitor.generate_status_report().health, HealthStatus::Warning);

        monitor.update_device_telemetry(
            "la0",
            &DeviceTelemetry {
                temperature: Some(41.5),
                ..Default::default()
            },
        );
        assert_eq!(monitor.generate_status_report().health, HealthStatus::Normal);
        assert_eq!(monitor.get_device_status("la0").unwrap().temperature, Some(41.5));
    }

    #[test]
    fn test_performance_statistics() {
        let monitor = CaptureProgressMonitor::default();
        for (id, success) in [("a", true), ("b", true), ("c", false), ("d", true)] {
            monitor.start_monitoring(id, "la0", &session(1000));
            std::thread::sleep(Duration::from_millis(1));
            monitor.complete_capture(id, success, None);
        }

        let stats = monitor.get_performance_statistics();
        assert_eq!(stats.total_sessions, 4);
        assert_eq!(stats.successful_sessions, 3);
        assert!((stats.success_rate - 0.75).abs() < 1e-9);
        assert!(stats.average_duration >= Duration::from_millis(1));
        assert!(stats.average_throughput > 0.0);
    }

    #[test]
    fn test_driver_events_drive_session() {
        let monitor = CaptureProgressMonitor::default();
        monitor.update_device_status("la0", &device("la0"), DeviceStatus::Connected);
        monitor.start_monitoring("s1", "la0", &session(8192));

        let status = |status| DriverEvent::Status {
            device_id: "la0".to_string(),
            status,
        };
        monitor.handle_driver_event("s1", &status(DriverStatus::Configuring));
        monitor.handle_driver_event("s1", &status(DriverStatus::WaitingForTrigger));
        monitor.handle_driver_event("s1", &status(DriverStatus::Capturing));
        monitor.handle_driver_event(
            "s1",
            &DriverEvent::Data {
                device_id: "la0".to_string(),
                chunk: DataChunk {
                    first_sample: 0,
                    total_samples: 8192,
                    words: vec![0; 4096],
                },
            },
        );

        let progress = monitor.get_progress("s1").unwrap();
        assert_eq!(progress.phase, CapturePhase::Capturing);
        assert_eq!(progress.current_sample, 4096);
        assert!((progress.percentage - 50.0).abs() < 1e-9);
        assert_eq!(
            monitor.get_device_status("la0").unwrap().status,
            DeviceStatus::Capturing
        );

        monitor.handle_driver_event(
            "s1",
            &DriverEvent::Error {
                device_id: "la0".to_string(),
                message: "Capture timed out".to_string(),
            },
        );
        let history = monitor.get_capture_history(Some("s1"));
        assert_eq!(history[0].phase, CapturePhase::Error);
        assert_eq!(history[0].message.as_deref(), Some("Capture timed out"));
        assert_eq!(
            monitor.get_device_status("la0").unwrap().status,
            DeviceStatus::Error
        );
    }
}
