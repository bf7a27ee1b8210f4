//! Columnar row layout and the buffered per-session file writer
//!
//! Rows are buffered in memory and written in batches. A batch that fails to
//! reach storage is rolled back on disk, and the row that triggered it is
//! forgotten, so a failed row never shows up in the file later.

use std::fmt::Write as _;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};

use contracts::FrameRecord;
use tokio::fs::{self, File, OpenOptions};
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tracing::debug;

use crate::error::SinkError;

const IMU_COLUMNS: &str = "Mag_x,Mag_y,Mag_z,Gyro_x,Gyro_y,Gyro_z,Acc_x,Acc_y,Acc_z";

/// First line of every log: `// DN: <device>, SN: <channels>`
pub fn comment_line(device: &str, channels: usize) -> String {
    format!("// DN: {device}, SN: {channels}")
}

/// Header row: `Timestamp,P1..Pk,Mag_x,...,Acc_z`
pub fn header_row(channels: usize) -> String {
    let mut header = String::from("Timestamp");
    for i in 1..=channels {
        let _ = write!(header, ",P{i}");
    }
    header.push(',');
    header.push_str(IMU_COLUMNS);
    header
}

/// One data row with exactly `channels` pressure columns.
///
/// The timestamp is written as received; every sensor value uses six
/// fixed decimals with a `.` separator.
pub fn format_row(frame: &FrameRecord, channels: usize) -> String {
    let mut row = format!("{:?}", frame.timestamp_seconds);
    let mut push = |value: f32| {
        let _ = write!(row, ",{:.6}", f64::from(value));
    };

    for i in 0..channels {
        push(frame.pressure_at(i));
    }
    for axis in [
        frame.magnetometer_xyz(),
        frame.gyroscope_xyz(),
        frame.accelerometer_xyz(),
    ] {
        axis.into_iter().for_each(&mut push);
    }
    row
}

/// Channel count recorded in the comment line of an existing log, if any
pub async fn recorded_channels(path: &Path) -> Option<usize> {
    let file = File::open(path).await.ok()?;
    let mut first = String::new();
    BufReader::new(file).read_line(&mut first).await.ok()?;
    first
        .trim_end()
        .rsplit_once("SN: ")
        .and_then(|(_, sn)| sn.parse().ok())
}

/// Append-only writer for one session file
#[derive(Debug)]
pub struct CsvWriter {
    path: PathBuf,
    file: File,
    /// Accepted rows not yet handed to storage
    pending: Vec<u8>,
    pending_rows: usize,
    flush_every: usize,
    /// File length covered by successful flushes
    durable_len: u64,
}

impl CsvWriter {
    /// Open `path` for appending, creating parent directories.
    ///
    /// The comment line and header are written only when the file is new
    /// (or empty).
    pub async fn open(
        path: PathBuf,
        device: &str,
        channels: usize,
        flush_every: usize,
    ) -> Result<Self, SinkError> {
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)
                .await
                .map_err(|e| SinkError::storage(parent, e))?;
        }

        let existing_len = match fs::metadata(&path).await {
            Ok(meta) => meta.len(),
            Err(e) if e.kind() == ErrorKind::NotFound => 0,
            Err(e) => return Err(SinkError::storage(&path, e)),
        };
        let file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&path)
            .await
            .map_err(|e| SinkError::storage(&path, e))?;

        let mut writer = Self {
            path,
            file,
            pending: Vec::new(),
            pending_rows: 0,
            flush_every: flush_every.max(1),
            durable_len: existing_len,
        };

        if existing_len == 0 {
            let preamble = format!(
                "{}\n{}\n",
                comment_line(device, channels),
                header_row(channels)
            );
            writer.pending.extend_from_slice(preamble.as_bytes());
            writer.flush().await?;
        }
        Ok(writer)
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Buffer one row; flushes to storage every `flush_every` rows.
    ///
    /// When that flush fails the row is dropped from the buffer; rows
    /// accepted earlier stay pending.
    pub async fn append(&mut self, row: &str) -> Result<(), SinkError> {
        let mark = self.pending.len();
        self.pending.extend_from_slice(row.as_bytes());
        self.pending.push(b'\n');
        self.pending_rows += 1;

        if self.pending_rows >= self.flush_every {
            if let Err(e) = self.flush().await {
                self.pending.truncate(mark);
                self.pending_rows -= 1;
                return Err(e);
            }
        }
        Ok(())
    }

    /// Write every pending row; on failure the file is cut back to its last
    /// flushed length and the rows stay pending.
    pub async fn flush(&mut self) -> Result<(), SinkError> {
        if self.pending.is_empty() {
            return Ok(());
        }
        if let Err(e) = self.write_pending().await {
            if let Err(undo) = self.file.set_len(self.durable_len).await {
                debug!(path = %self.path.display(), error = %undo, "Could not roll back partial write");
            }
            return Err(SinkError::storage(&self.path, e));
        }
        self.durable_len += self.pending.len() as u64;
        self.pending.clear();
        self.pending_rows = 0;
        Ok(())
    }

    /// Flush pending rows and release the handle.
    pub async fn close(mut self) -> Result<(), SinkError> {
        self.flush().await?;
        self.file
            .sync_all()
            .await
            .map_err(|e| SinkError::storage(&self.path, e))
    }

    async fn write_pending(&mut self) -> std::io::Result<()> {
        self.file.write_all(&self.pending).await?;
        self.file.flush().await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn test_header_columns() {
        assert_eq!(
            header_row(3),
            "Timestamp,P1,P2,P3,Mag_x,Mag_y,Mag_z,Gyro_x,Gyro_y,Gyro_z,Acc_x,Acc_y,Acc_z"
        );
        assert_eq!(comment_line("abc", 3), "// DN: abc, SN: 3");
    }

    #[test]
    fn test_row_pads_and_truncates_pressure() {
        let short = FrameRecord::new("d", 4)
            .with_timestamp(1_700_000_000.5)
            .with_pressure(vec![1.5, 2.25]);
        let row = format_row(&short, 4);
        let cells: Vec<&str> = row.split(',').collect();
        assert_eq!(cells.len(), 1 + 4 + 9);
        assert_eq!(cells[0], "1700000000.5");
        assert_eq!(&cells[1..5], ["1.500000", "2.250000", "0.000000", "0.000000"]);

        let long = FrameRecord::new("d", 2).with_pressure(vec![1.0, 2.0, 3.0, 4.0]);
        let cells = format_row(&long, 2).split(',').count();
        assert_eq!(cells, 1 + 2 + 9);
    }

    #[test]
    fn test_row_imu_values_fixed_point() {
        let frame = FrameRecord::new("d", 1)
            .with_timestamp(2.0)
            .with_pressure(vec![-0.5])
            .with_imu([0.1, 0.2, 0.3], [1.0, 2.0, 3.0], [0.0, 0.0, 9.75]);
        assert_eq!(
            format_row(&frame, 1),
            "2.0,-0.500000,0.100000,0.200000,0.300000,1.000000,2.000000,3.000000,0.000000,0.000000,9.750000"
        );
    }

    #[tokio::test]
    async fn test_reopen_appends_without_second_header() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("nested/day/120000.csv");

        let mut writer = CsvWriter::open(path.clone(), "dev", 1, 10).await.unwrap();
        writer.append("1.0,1.000000").await.unwrap();
        writer.close().await.unwrap();

        let mut writer = CsvWriter::open(path.clone(), "dev", 1, 10).await.unwrap();
        writer.append("2.0,2.000000").await.unwrap();
        writer.close().await.unwrap();

        let content = std::fs::read_to_string(&path).unwrap();
        let lines: Vec<&str> = content.lines().collect();
        assert_eq!(lines.len(), 4);
        assert_eq!(lines[0], "// DN: dev, SN: 1");
        assert_eq!(lines.iter().filter(|l| l.starts_with("Timestamp")).count(), 1);
        assert_eq!(recorded_channels(&path).await, Some(1));
    }

    #[tokio::test]
    async fn test_rows_buffer_until_threshold() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("buffered.csv");

        let mut writer = CsvWriter::open(path.clone(), "dev", 1, 3).await.unwrap();
        writer.append("1.0,1.000000").await.unwrap();
        writer.append("2.0,2.000000").await.unwrap();
        assert_eq!(std::fs::read_to_string(&path).unwrap().lines().count(), 2);

        writer.append("3.0,3.000000").await.unwrap();
        assert_eq!(std::fs::read_to_string(&path).unwrap().lines().count(), 5);
        writer.close().await.unwrap();
    }

    #[cfg(target_os = "linux")]
    #[tokio::test]
    async fn test_failed_row_leaves_buffer() {
        let full = std::fs::OpenOptions::new()
            .write(true)
            .open("/dev/full")
            .unwrap();
        let mut writer = CsvWriter {
            path: PathBuf::from("/dev/full"),
            file: File::from_std(full),
            pending: Vec::new(),
            pending_rows: 0,
            flush_every: 2,
            durable_len: 0,
        };

        writer.append("1.0,1.000000").await.unwrap();
        assert!(matches!(
            writer.append("2.0,2.000000").await,
            Err(SinkError::Storage { .. })
        ));
        assert_eq!(writer.pending, b"1.0,1.000000\n");
        assert_eq!(writer.pending_rows, 1);
    }
}
