//! LocalSink - per-device append-only CSV logs
//!
//! Each device owns at most one open session. Files are laid out as
//! `root/<device>/<YYYYMMDD>/<HHmmss>.csv` in a fixed reference zone, and a
//! device moves to a new file when the day changes, when it has been idle
//! for the inactivity timeout, or when its channel count changes.

mod csv;

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, PoisonError};

use chrono::{DateTime, FixedOffset, NaiveDate, TimeDelta, Utc};
use contracts::{ContractError, DeliverySink, DeviceId, FrameRecord, LocalStoreConfig};
use tracing::{debug, instrument, warn};

use crate::error::SinkError;

pub use self::csv::{comment_line, format_row, header_row, CsvWriter};

/// Resolved settings for the local sink
#[derive(Debug, Clone)]
pub struct LocalSinkSettings {
    pub root: PathBuf,
    pub flush_every_rows: usize,
    pub inactivity: TimeDelta,
    pub zone: FixedOffset,
}

impl LocalSinkSettings {
    pub fn from_config(config: &LocalStoreConfig) -> Result<Self, SinkError> {
        let zone = FixedOffset::east_opt(config.utc_offset_minutes * 60).ok_or_else(|| {
            SinkError::Config(format!(
                "utc offset of {} minutes is out of range",
                config.utc_offset_minutes
            ))
        })?;
        let inactivity = i64::try_from(config.inactivity_timeout_secs)
            .ok()
            .and_then(TimeDelta::try_seconds)
            .ok_or_else(|| {
                SinkError::Config(format!(
                    "inactivity timeout of {}s is out of range",
                    config.inactivity_timeout_secs
                ))
            })?;

        Ok(Self {
            root: config.root.clone(),
            flush_every_rows: config.flush_every_rows.max(1),
            inactivity,
            zone,
        })
    }
}

/// Why a device's session was replaced
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RotationReason {
    DayChanged,
    Inactive,
    ChannelsChanged,
}

impl RotationReason {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::DayChanged => "day",
            Self::Inactive => "inactivity",
            Self::ChannelsChanged => "channels",
        }
    }
}

#[derive(Debug)]
struct Session {
    day: NaiveDate,
    channels: usize,
    last_seen: DateTime<FixedOffset>,
    writer: CsvWriter,
}

type SessionSlot = Arc<tokio::sync::Mutex<Option<Session>>>;

struct LocalInner {
    name: String,
    settings: LocalSinkSettings,
    sessions: Mutex<HashMap<DeviceId, SessionSlot>>,
    /// Slots currently holding a session
    open_sessions: AtomicUsize,
}

/// Sink that persists frames into per-device CSV logs.
///
/// Cloning shares the session table, so clones may write concurrently;
/// writes for one device are serialized by that device's slot.
#[derive(Clone)]
pub struct LocalSink {
    inner: Arc<LocalInner>,
}

impl LocalSink {
    pub fn new(name: impl Into<String>, settings: LocalSinkSettings) -> Self {
        Self {
            inner: Arc::new(LocalInner {
                name: name.into(),
                settings,
                sessions: Mutex::new(HashMap::new()),
                open_sessions: AtomicUsize::new(0),
            }),
        }
    }

    pub fn from_config(name: impl Into<String>, config: &LocalStoreConfig) -> Result<Self, SinkError> {
        Ok(Self::new(name, LocalSinkSettings::from_config(config)?))
    }

    pub fn settings(&self) -> &LocalSinkSettings {
        &self.inner.settings
    }

    /// Append one frame to its device's session, rotating first if needed.
    ///
    /// Returns the file the row went to.
    #[instrument(
        name = "local_sink_write",
        skip(self, frame),
        fields(sink = %self.inner.name, device = %frame.device_id)
    )]
    pub async fn write(&self, frame: &FrameRecord) -> Result<PathBuf, SinkError> {
        let device = frame.device_key();
        let channels = frame.channel_count();
        let event_time = self.resolve_event_time(frame);

        let slot = self.slot(&device);
        let mut guard = slot.lock().await;

        let mut session = match guard.take() {
            Some(current) => match self.rotation_reason(&current, event_time, channels) {
                None => current,
                Some(reason) => {
                    debug!(
                        device = %device,
                        path = %current.writer.path().display(),
                        reason = reason.as_str(),
                        "Rotating session"
                    );
                    observability::record_session_rotated(reason.as_str());
                    self.session_closed();
                    current.writer.close().await?;
                    self.open_session(&device, channels, event_time).await?
                }
            },
            None => self.open_session(&device, channels, event_time).await?,
        };

        let row = format_row(frame, channels);
        match session.writer.append(&row).await {
            Ok(()) => {
                session.last_seen = event_time;
                let path = session.writer.path().to_path_buf();
                *guard = Some(session);
                Ok(path)
            }
            Err(e) => {
                // the failed row was already dropped from the writer's buffer
                self.session_closed();
                if let Err(close_err) = session.writer.close().await {
                    warn!(device = %device, error = %close_err, "Close after failed write also failed");
                }
                Err(e)
            }
        }
    }

    /// Flush every open session.
    pub async fn flush_all(&self) -> Result<(), SinkError> {
        for slot in self.slots() {
            if let Some(session) = slot.lock().await.as_mut() {
                session.writer.flush().await?;
            }
        }
        Ok(())
    }

    /// Close every open session; returns the first failure after trying all.
    #[instrument(name = "local_sink_close_all", skip(self), fields(sink = %self.inner.name))]
    pub async fn close_all(&self) -> Result<(), SinkError> {
        let mut first_err = None;
        for slot in self.slots() {
            let Some(session) = slot.lock().await.take() else {
                continue;
            };
            self.session_closed();
            let path = session.writer.path().to_path_buf();
            match session.writer.close().await {
                Ok(()) => debug!(path = %path.display(), "Session closed"),
                Err(e) => {
                    warn!(path = %path.display(), error = %e, "Session close failed");
                    first_err.get_or_insert(e);
                }
            }
        }
        first_err.map_or(Ok(()), Err)
    }

    /// Number of devices with an open session.
    pub fn active_sessions(&self) -> usize {
        self.inner.open_sessions.load(Ordering::SeqCst)
    }

    /// Current file of a device's open session.
    pub async fn session_path(&self, device: &str) -> Option<PathBuf> {
        let slot = self.lock_sessions().get(device).cloned()?;
        let guard = slot.lock().await;
        guard.as_ref().map(|s| s.writer.path().to_path_buf())
    }

    fn resolve_event_time(&self, frame: &FrameRecord) -> DateTime<FixedOffset> {
        frame
            .event_timestamp()
            .and_then(|ts| DateTime::from_timestamp_millis((ts * 1000.0) as i64))
            .unwrap_or_else(Utc::now)
            .with_timezone(&self.inner.settings.zone)
    }

    fn rotation_reason(
        &self,
        session: &Session,
        event_time: DateTime<FixedOffset>,
        channels: usize,
    ) -> Option<RotationReason> {
        let idle = (event_time - session.last_seen).max(TimeDelta::zero());
        if event_time.date_naive() != session.day {
            Some(RotationReason::DayChanged)
        } else if idle >= self.inner.settings.inactivity {
            Some(RotationReason::Inactive)
        } else if channels != session.channels {
            Some(RotationReason::ChannelsChanged)
        } else {
            None
        }
    }

    async fn open_session(
        &self,
        device: &DeviceId,
        channels: usize,
        event_time: DateTime<FixedOffset>,
    ) -> Result<Session, SinkError> {
        let path = self.session_file(device, event_time, channels).await;
        let writer = CsvWriter::open(
            path,
            device,
            channels,
            self.inner.settings.flush_every_rows,
        )
        .await?;
        debug!(device = %device, path = %writer.path().display(), channels, "Session opened");
        let open = self.inner.open_sessions.fetch_add(1, Ordering::SeqCst) + 1;
        observability::record_active_sessions(open);

        Ok(Session {
            day: event_time.date_naive(),
            channels,
            last_seen: event_time,
            writer,
        })
    }

    // `<HHmmss>.csv`, or `<HHmmss>_<n>.csv` when that second's file already
    // holds a different channel count
    async fn session_file(
        &self,
        device: &DeviceId,
        event_time: DateTime<FixedOffset>,
        channels: usize,
    ) -> PathBuf {
        let dir = self
            .inner
            .settings
            .root
            .join(path_component(device))
            .join(event_time.format("%Y%m%d").to_string());
        let stem = event_time.format("%H%M%S").to_string();

        let mut candidate = dir.join(format!("{stem}.csv"));
        let mut suffix = 1;
        while let Some(recorded) = csv::recorded_channels(&candidate).await {
            if recorded == channels {
                break;
            }
            candidate = dir.join(format!("{stem}_{suffix}.csv"));
            suffix += 1;
        }
        candidate
    }

    // callers hold the slot lock of the session being given up
    fn session_closed(&self) {
        let open = self.inner.open_sessions.fetch_sub(1, Ordering::SeqCst) - 1;
        observability::record_active_sessions(open);
    }

    fn slot(&self, device: &DeviceId) -> SessionSlot {
        self.lock_sessions().entry(device.clone()).or_default().clone()
    }

    fn slots(&self) -> Vec<SessionSlot> {
        self.lock_sessions().values().cloned().collect()
    }

    fn lock_sessions(&self) -> std::sync::MutexGuard<'_, HashMap<DeviceId, SessionSlot>> {
        self.inner
            .sessions
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
    }
}

fn path_component(device: &str) -> String {
    device
        .chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() || c == '-' || c == '_' {
                c
            } else {
                '_'
            }
        })
        .collect()
}

impl DeliverySink for LocalSink {
    fn name(&self) -> &str {
        &self.inner.name
    }

    async fn deliver(&mut self, frame: &FrameRecord) -> Result<(), ContractError> {
        self.write(frame)
            .await
            .map(|_| ())
            .map_err(|e| e.into_contract(&self.inner.name))
    }

    async fn flush(&mut self) -> Result<(), ContractError> {
        self.flush_all()
            .await
            .map_err(|e| e.into_contract(&self.inner.name))
    }

    async fn close(&mut self) -> Result<(), ContractError> {
        self.close_all()
            .await
            .map_err(|e| e.into_contract(&self.inner.name))
    }
}

/// Root-relative directory for a device's logs
pub fn device_dir(root: &Path, device: &DeviceId) -> PathBuf {
    root.join(path_component(&device.normalized()))
}
