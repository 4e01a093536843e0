//! Tab-separated output of collected records.

use crate::meter::{LogRecord, CHANNELS};
use chrono::NaiveDateTime;
use std::fs::{File, OpenOptions};
use std::io::{BufRead, BufReader, BufWriter, Write};
use std::path::{Path, PathBuf};
use thiserror::Error;

pub const TIMESTAMP_FORMAT: &str = "%Y-%m-%d %H:%M:%S";
const INDEX_COLUMN: &str = "record_index";

#[derive(Debug, Error)]
pub enum SinkError {
    #[error("io error on {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("{path} has header {found:?}, expected {expected:?}")]
    HeaderMismatch {
        path: PathBuf,
        expected: String,
        found: String,
    },

    #[error("malformed row: {0}")]
    Malformed(String),
}

/// Destination for collected records. Records arrive in index order.
pub trait RecordSink: Send {
    fn append(&mut self, record: &LogRecord) -> Result<(), SinkError>;

    /// Make everything appended so far durable.
    fn flush(&mut self) -> Result<(), SinkError>;
}

impl<S: RecordSink + ?Sized> RecordSink for Box<S> {
    fn append(&mut self, record: &LogRecord) -> Result<(), SinkError> {
        (**self).append(record)
    }

    fn flush(&mut self) -> Result<(), SinkError> {
        (**self).flush()
    }
}

impl<S: RecordSink + ?Sized> RecordSink for &mut S {
    fn append(&mut self, record: &LogRecord) -> Result<(), SinkError> {
        (**self).append(record)
    }

    fn flush(&mut self) -> Result<(), SinkError> {
        (**self).flush()
    }
}

pub fn header(include_index: bool) -> String {
    let mut columns = vec!["timestamp"];
    columns.extend(CHANNELS);
    if include_index {
        columns.push(INDEX_COLUMN);
    }
    columns.join("\t")
}

pub fn format_row(record: &LogRecord, include_index: bool) -> String {
    let mut fields = Vec::with_capacity(record.measurements.len() + 2);
    fields.push(record.timestamp.format(TIMESTAMP_FORMAT).to_string());
    fields.extend(record.measurements.iter().map(|v| format!("{:.1}", v)));
    if include_index {
        fields.push(record.index.to_string());
    }
    fields.join("\t")
}

/// One row read back from a TSV file.
#[derive(Debug, Clone, PartialEq)]
pub struct ParsedRow {
    pub timestamp: NaiveDateTime,
    pub measurements: Vec<f64>,
    pub index: Option<u64>,
}

/// Parse a data row written by [`format_row`].
pub fn parse_row(line: &str, include_index: bool) -> Result<ParsedRow, SinkError> {
    let fields: Vec<&str> = line.trim_end_matches(['\r', '\n']).split('\t').collect();
    let expected = 1 + CHANNELS.len() + usize::from(include_index);
    if fields.len() != expected {
        return Err(SinkError::Malformed(format!(
            "expected {} fields, found {}",
            expected,
            fields.len()
        )));
    }

    let timestamp = NaiveDateTime::parse_from_str(fields[0], TIMESTAMP_FORMAT)
        .map_err(|e| SinkError::Malformed(format!("timestamp {:?}: {}", fields[0], e)))?;

    let measurements = fields[1..=CHANNELS.len()]
        .iter()
        .map(|f| {
            f.parse::<f64>()
                .map_err(|e| SinkError::Malformed(format!("value {:?}: {}", f, e)))
        })
        .collect::<Result<Vec<_>, _>>()?;

    let index = if include_index {
        let raw = fields[expected - 1];
        Some(
            raw.parse::<u64>()
                .map_err(|e| SinkError::Malformed(format!("index {:?}: {}", raw, e)))?,
        )
    } else {
        None
    };

    Ok(ParsedRow {
        timestamp,
        measurements,
        index,
    })
}

/// Appends records to a TSV file, writing the header only when the file is new.
pub struct TsvSink {
    path: PathBuf,
    writer: BufWriter<File>,
    include_index: bool,
    written: u64,
}

impl TsvSink {
    pub fn open(path: impl AsRef<Path>, include_index: bool) -> Result<Self, SinkError> {
        let path = path.as_ref().to_path_buf();
        let io_err = |source| SinkError::Io {
            path: path.clone(),
            source,
        };

        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent).map_err(io_err)?;
            }
        }

        let expected = header(include_index);
        let existing = match std::fs::metadata(&path) {
            Ok(meta) => meta.len() > 0,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => false,
            Err(e) => return Err(io_err(e)),
        };

        if existing {
            let mut first = String::new();
            BufReader::new(File::open(&path).map_err(io_err)?)
                .read_line(&mut first)
                .map_err(io_err)?;
            let found = first.trim_end_matches(['\r', '\n']);
            if found != expected {
                return Err(SinkError::HeaderMismatch {
                    path: path.clone(),
                    expected,
                    found: found.to_string(),
                });
            }
        }

        let file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&path)
            .map_err(io_err)?;
        let mut writer = BufWriter::new(file);

        if !existing {
            writeln!(writer, "{}", expected).map_err(io_err)?;
            tracing::debug!(path = %path.display(), "Created output file");
        } else {
            tracing::debug!(path = %path.display(), "Appending to existing output file");
        }

        Ok(Self {
            path,
            writer,
            include_index,
            written: 0,
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn written(&self) -> u64 {
        self.written
    }

    fn io_error(&self, source: std::io::Error) -> SinkError {
        SinkError::Io {
            path: self.path.clone(),
            source,
        }
    }
}

impl RecordSink for TsvSink {
    fn append(&mut self, record: &LogRecord) -> Result<(), SinkError> {
        let row = format_row(record, self.include_index);
        writeln!(self.writer, "{}", row).map_err(|e| self.io_error(e))?;
        self.written += 1;
        Ok(())
    }

    fn flush(&mut self) -> Result<(), SinkError> {
        self.writer.flush().map_err(|e| self.io_error(e))?;
        self.writer.get_ref().sync_data().map_err(|e| self.io_error(e))
    }
}

impl Drop for TsvSink {
    fn drop(&mut self) {
        if let Err(e) = self.writer.flush() {
            tracing::error!(path = %self.path.display(), error = %e, "Failed to flush output file");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ts(s: &str) -> NaiveDateTime {
        NaiveDateTime::parse_from_str(s, "%Y-%m-%d %H:%M:%S").unwrap()
    }

    fn record(index: u64, time: &str) -> LogRecord {
        LogRecord {
            index,
            timestamp: ts(time),
            measurements: vec![36854.5, 9953.4, 3.3, 52652.9],
        }
    }

    #[test]
    fn test_header_columns() {
        assert_eq!(
            header(false),
            "timestamp\tkwh_import\tkwh_export\tkvarh_import\tkvarh_export"
        );
        assert!(header(true).ends_with("\trecord_index"));
    }

    #[test]
    fn test_written_rows_parse_back() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("AC-1.tsv");

        let records = vec![record(1, "2026-01-10 00:00:00"), record(2, "2026-01-10 00:15:00")];
        {
            let mut sink = TsvSink::open(&path, true).unwrap();
            for r in &records {
                sink.append(r).unwrap();
            }
            sink.flush().unwrap();
            assert_eq!(sink.written(), 2);
        }

        let text = std::fs::read_to_string(&path).unwrap();
        let mut lines = text.lines();
        assert_eq!(lines.next().unwrap(), header(true));
        for (line, original) in lines.zip(&records) {
            let row = parse_row(line, true).unwrap();
            assert_eq!(row.timestamp, original.timestamp);
            assert_eq!(row.measurements, original.measurements);
            assert_eq!(row.index, Some(original.index));
        }
    }

    #[test]
    fn test_header_written_once_across_opens() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nested").join("AC-1.tsv");

        for (i, time) in ["2026-01-10 00:00:00", "2026-01-10 00:15:00"].iter().enumerate() {
            let mut sink = TsvSink::open(&path, false).unwrap();
            sink.append(&record(i as u64 + 1, time)).unwrap();
            sink.flush().unwrap();
        }

        let text = std::fs::read_to_string(&path).unwrap();
        assert_eq!(text.lines().count(), 3);
        assert_eq!(text.lines().filter(|l| l.starts_with("timestamp")).count(), 1);
    }

    #[test]
    fn test_header_mismatch_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("AC-1.tsv");
        std::fs::write(&path, "serial,index,timestamp\n").unwrap();

        let err = TsvSink::open(&path, false).err().unwrap();
        assert!(matches!(err, SinkError::HeaderMismatch { .. }));
    }

    #[test]
    fn test_parse_row_rejects_garbage() {
        assert!(parse_row("2026-01-10 00:00:00\t1.0", false).is_err());
        assert!(parse_row("yesterday\t1.0\t2.0\t3.0\t4.0", false).is_err());
        assert!(parse_row("2026-01-10 00:00:00\t1.0\t2.0\tx\t4.0", false).is_err());
    }
}
