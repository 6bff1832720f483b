//! CSV tables and ZIP archives of recording sessions.
//!
//! A table has a `timestamp,ch1,…,chN` header followed by one row per
//! sample. Rows are joined with `\n` and numbers use Rust's shortest
//! round-trip formatting, so the same session always exports to the same
//! bytes and [`parse_table`] reads back exactly what was written.

use std::collections::HashSet;
use std::io::{Cursor, Write};

use zip::write::SimpleFileOptions;
use zip::{CompressionMethod, DateTime, ZipWriter};

use crate::error::{BioAmpError, Result};
use crate::parse::now_ms;
use crate::recording::{RecordedSample, RecordingSession};

/// Render `session` as a CSV table.
pub fn export_as_table(session: &RecordingSession) -> String {
    let mut lines = Vec::with_capacity(session.data.len() + 1);

    let mut header = String::from("timestamp");
    for ch in 1..=session.channels {
        header.push_str(&format!(",ch{ch}"));
    }
    lines.push(header);

    for sample in &session.data {
        let mut row = sample.timestamp.to_string();
        for v in &sample.channels {
            row.push(',');
            row.push_str(&v.to_string());
        }
        lines.push(row);
    }
    lines.join("\n")
}

/// Read a table produced by [`export_as_table`].
///
/// Returns the channel count from the header and the samples.
pub fn parse_table(text: &str) -> Result<(usize, Vec<RecordedSample>)> {
    let mut lines = text.lines().enumerate();
    let (_, header) = lines.next().ok_or(BioAmpError::InvalidTable {
        line: 1,
        reason: "empty table".into(),
    })?;

    let columns: Vec<&str> = header.trim_end_matches('\r').split(',').collect();
    if columns.first() != Some(&"timestamp") {
        return Err(BioAmpError::InvalidTable {
            line: 1,
            reason: "first column must be `timestamp`".into(),
        });
    }
    let channels = columns.len() - 1;

    let mut samples = Vec::new();
    for (i, line) in lines {
        let line_no = i + 1;
        let line = line.trim_end_matches('\r');
        if line.is_empty() {
            continue;
        }
        let values = line
            .split(',')
            .map(|field| {
                field.parse::<f64>().map_err(|e| BioAmpError::InvalidTable {
                    line: line_no,
                    reason: format!("{field:?}: {e}"),
                })
            })
            .collect::<Result<Vec<f64>>>()?;
        if values.len() != channels + 1 {
            return Err(BioAmpError::InvalidTable {
                line: line_no,
                reason: format!("expected {} columns, found {}", channels + 1, values.len()),
            });
        }
        samples.push(RecordedSample {
            timestamp: values[0],
            channels: values[1..].to_vec(),
        });
    }
    Ok((channels, samples))
}

/// Make a session name safe to use as a file name.
fn sanitize(name: &str) -> String {
    let cleaned: String = name
        .trim()
        .chars()
        .map(|c| match c {
            '/' | '\\' | ':' | '*' | '?' | '"' | '<' | '>' | '|' => '_',
            c if c.is_control() => '_',
            c => c,
        })
        .collect();
    let cleaned = cleaned.trim_matches('.').to_owned();
    if cleaned.is_empty() {
        "recording".to_owned()
    } else {
        cleaned
    }
}

/// Entry names for an archive of `sessions`, in the same order.
///
/// Each is `<sanitized name>.csv`; repeats become `name-2.csv`,
/// `name-3.csv`, and so on.
pub fn archive_entry_names(sessions: &[RecordingSession]) -> Vec<String> {
    let mut taken = HashSet::new();
    sessions
        .iter()
        .map(|s| {
            let base = sanitize(&s.name);
            let mut candidate = format!("{base}.csv");
            let mut n = 2;
            while !taken.insert(candidate.to_lowercase()) {
                candidate = format!("{base}-{n}.csv");
                n += 1;
            }
            candidate
        })
        .collect()
}

/// Pack every session's table into one ZIP archive.
///
/// Entries are stored uncompressed with a fixed modification time, so the
/// output depends only on the sessions.
pub fn export_all_as_archive(sessions: &[RecordingSession]) -> Result<Vec<u8>> {
    let mut zip = ZipWriter::new(Cursor::new(Vec::new()));
    let options = SimpleFileOptions::default()
        .compression_method(CompressionMethod::Stored)
        .last_modified_time(DateTime::default());

    for (session, entry) in sessions.iter().zip(archive_entry_names(sessions)) {
        zip.start_file(entry, options)?;
        zip.write_all(export_as_table(session).as_bytes())?;
    }
    Ok(zip.finish()?.into_inner())
}

/// File name for an archive downloaded now.
pub fn default_archive_name() -> String {
    format!("bioamp-recordings-{}.zip", now_ms() as u64)
}
