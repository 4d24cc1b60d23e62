//! Sensor data ingestion: IMU text logs and raw point buffers.
//!
//! IMU log format, one record per line:
//!
//! ```text
//! timestamp_ns gx gy gz ax ay az
//! ```
//!
//! Timestamps are integer or floating nanoseconds and are converted to
//! seconds. Trailing fields after the seventh are ignored. Blank, malformed
//! and non-UTF-8 lines are skipped and counted.

use std::fs::File;
use std::io::{BufRead, BufReader};
use std::path::Path;

use nalgebra::{Point3, Vector3};
use rayon::prelude::*;
use tracing::{info, warn};

use crate::error::{LioError, Result};
use crate::imu::ImuSample;

/// Progress is reported every this many lines.
const PROGRESS_INTERVAL: usize = 10_000;

const NANOS_PER_SECOND: f64 = 1.0e9;

/// Parsed IMU log.
#[derive(Debug, Clone, Default)]
pub struct ImuLog {
    /// Accepted records in file order.
    pub samples: Vec<ImuSample>,
    /// Total lines read.
    pub lines: usize,
    /// Blank or malformed lines.
    pub skipped: usize,
}

impl ImuLog {
    /// Number of accepted records.
    pub fn accepted(&self) -> usize {
        self.samples.len()
    }
}

/// Parse one record. `None` for blank or malformed lines.
pub fn parse_imu_line(line: &str) -> Option<ImuSample> {
    let mut fields = line.split_whitespace().map(str::parse::<f64>);
    let mut values = [0.0; 7];
    for value in values.iter_mut() {
        *value = fields.next()?.ok()?;
    }
    let sample = ImuSample::new(
        values[0] / NANOS_PER_SECOND,
        Vector3::new(values[1], values[2], values[3]),
        Vector3::new(values[4], values[5], values[6]),
    );
    sample.is_finite().then_some(sample)
}

/// Parse an IMU log from a reader.
///
/// # Errors
/// [`LioError::Io`] if reading fails, [`LioError::Input`] if no line parses.
pub fn parse_imu_log<R: BufRead>(reader: R) -> Result<ImuLog> {
    let mut log = ImuLog::default();

    for line in reader.split(b'\n') {
        let line = line?;
        log.lines += 1;

        let parsed = std::str::from_utf8(&line).ok().and_then(parse_imu_line);
        match parsed {
            Some(sample) => log.samples.push(sample),
            None => log.skipped += 1,
        }

        if log.lines % PROGRESS_INTERVAL == 0 {
            info!(lines = log.lines, "processed IMU log entries");
        }
    }

    if log.samples.is_empty() {
        return Err(LioError::Input(format!(
            "IMU log has no valid records ({} lines read)",
            log.lines
        )));
    }
    if log.skipped > 0 {
        warn!(skipped = log.skipped, "skipped malformed IMU log lines");
    }
    info!(
        accepted = log.accepted(),
        skipped = log.skipped,
        "finished reading IMU log"
    );
    Ok(log)
}

/// Read an IMU log file.
pub fn read_imu_log(path: impl AsRef<Path>) -> Result<ImuLog> {
    let path = path.as_ref();
    let file = File::open(path)?;
    info!(path = %path.display(), "opened IMU log");
    parse_imu_log(BufReader::new(file))
}

/// Convert a raw sensor buffer into map-precision points.
///
/// Conversion runs in parallel; points with non-finite coordinates are
/// dropped.
///
/// # Errors
/// [`LioError::Input`] if the buffer is empty or holds no finite point.
pub fn points_from_raw(raw: &[[f32; 3]]) -> Result<Vec<Point3<f64>>> {
    if raw.is_empty() {
        return Err(LioError::Input("point buffer is empty".to_string()));
    }

    let points: Vec<Point3<f64>> = raw
        .par_iter()
        .filter(|p| p.iter().all(|v| v.is_finite()))
        .map(|p| Point3::new(p[0] as f64, p[1] as f64, p[2] as f64))
        .collect();

    if points.is_empty() {
        return Err(LioError::Input(
            "point buffer has no finite points".to_string(),
        ));
    }
    if points.len() < raw.len() {
        warn!(
            dropped = raw.len() - points.len(),
            "dropped non-finite points"
        );
    }
    Ok(points)
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;
    use std::io::{Cursor, Write};

    #[test]
    fn test_parse_line() {
        let sample = parse_imu_line("1500000000 0.1 0.2 0.3 1.0 2.0 9.81").unwrap();
        assert_relative_eq!(sample.timestamp, 1.5, epsilon = 1e-12);
        assert_eq!(sample.gyro, Vector3::new(0.1, 0.2, 0.3));
        assert_eq!(sample.accel, Vector3::new(1.0, 2.0, 9.81));

        // Trailing fields are ignored
        assert!(parse_imu_line("1 0 0 0 0 0 0 extra").is_some());

        assert!(parse_imu_line("").is_none());
        assert!(parse_imu_line("   ").is_none());
        assert!(parse_imu_line("1 2 3").is_none());
        assert!(parse_imu_line("1 2 3 4 5 6 x").is_none());
        assert!(parse_imu_line("1 2 3 4 5 6 nan").is_none());
    }

    #[test]
    fn test_malformed_lines_are_counted() {
        let text = "\
1000000000 0 0 0 0 0 9.81
garbage line

2000000000 0 0 0.1 0 0 9.81
3000000000 0 0
4000000000 0 0 0.2 0 0 9.81
";
        let log = parse_imu_log(Cursor::new(text)).unwrap();
        assert_eq!(log.lines, 6);
        assert_eq!(log.accepted(), 3);
        assert_eq!(log.skipped, 3);
        assert_relative_eq!(log.samples[2].timestamp, 4.0);
        assert_relative_eq!(log.samples[2].gyro.z, 0.2);
    }

    #[test]
    fn test_invalid_utf8_line_is_skipped() {
        let mut bytes = b"1000000000 0 0 0 0 0 9.81\r\n".to_vec();
        bytes.extend_from_slice(&[0xff, 0xfe, b'\n']);
        bytes.extend_from_slice(b"2000000000 0 0 0.1 0 0 9.81\n");

        let log = parse_imu_log(Cursor::new(bytes)).unwrap();
        assert_eq!(log.lines, 3);
        assert_eq!(log.accepted(), 2);
        assert_eq!(log.skipped, 1);
        assert_relative_eq!(log.samples[1].timestamp, 2.0);
    }

    #[test]
    fn test_empty_log_is_input_error() {
        assert!(matches!(
            parse_imu_log(Cursor::new("")).unwrap_err(),
            LioError::Input(_)
        ));
        assert!(matches!(
            parse_imu_log(Cursor::new("bad\nworse\n")).unwrap_err(),
            LioError::Input(_)
        ));
    }

    #[test]
    fn test_read_imu_log_file() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        for i in 0..25_000u64 {
            writeln!(file, "{} 0.0 0.0 0.01 0.0 0.0 9.81", i * 5_000_000).unwrap();
        }
        file.flush().unwrap();

        let log = read_imu_log(file.path()).unwrap();
        assert_eq!(log.accepted(), 25_000);
        assert_eq!(log.skipped, 0);
        assert_relative_eq!(log.samples[200].timestamp, 1.0, epsilon = 1e-12);
    }

    #[test]
    fn test_missing_file_is_io_error() {
        let dir = tempfile::tempdir().unwrap();
        let err = read_imu_log(dir.path().join("missing.txt")).unwrap_err();
        assert!(matches!(err, LioError::Io(_)));
    }

    #[test]
    fn test_points_from_raw() {
        let raw = vec![[1.0f32, 2.0, 3.0], [f32::NAN, 0.0, 0.0], [-1.5, 0.25, 4.0]];
        let points = points_from_raw(&raw).unwrap();
        assert_eq!(points.len(), 2);
        assert_eq!(points[0], Point3::new(1.0, 2.0, 3.0));
        assert_eq!(points[1], Point3::new(-1.5, 0.25, 4.0));

        assert!(matches!(points_from_raw(&[]).unwrap_err(), LioError::Input(_)));
        assert!(matches!(
            points_from_raw(&[[f32::INFINITY, 0.0, 0.0]]).unwrap_err(),
            LioError::Input(_)
        ));
    }
}
