use crate::error::{AlignError, AlignResult};
use crate::model::alignment::{AlignmentEntry, OnsetInstant};
use crate::util::{frame_to_seconds, seconds_to_frame, with_default_extension};
use log::{debug, error, info};
use std::fs;
use std::path::{Path, PathBuf};

pub const CSV_HEADER: &str = "LABEL,TIME,FRAME";
const UNALIGNED: &str = "N";

pub fn format_alignment_csv(entries: &[AlignmentEntry], sample_rate: f64) -> String {
    let mut out = String::from(CSV_HEADER);
    out.push('\n');

    for entry in entries {
        match entry.frame {
            Some(frame) => out.push_str(&format!(
                "{},{},{}\n",
                entry.label,
                frame_to_seconds(frame, sample_rate),
                frame
            )),
            None => out.push_str(&format!("{},{},{}\n", entry.label, UNALIGNED, UNALIGNED)),
        }
    }

    out
}

/// Writes the entry table to `path` (with a `.csv` suffix added if it has
/// none) and returns the path written. The file is staged next to its
/// target and renamed over it, so an existing file is either fully
/// replaced or left as it was.
pub fn export_alignment_csv(entries: &[AlignmentEntry], sample_rate: f64, path: &Path) -> AlignResult<PathBuf> {
    let target = with_default_extension(path, "csv");

    let mut temp_name = target.file_name().unwrap_or_default().to_os_string();
    temp_name.push(".tmp");
    let temp = target.with_file_name(temp_name);

    let content = format_alignment_csv(entries, sample_rate);
    if let Err(e) = fs::write(&temp, content) {
        error!("Failed to write {}: {}", temp.display(), e);
        let _ = fs::remove_file(&temp);
        return Err(AlignError::io(temp, e));
    }

    if let Err(e) = fs::rename(&temp, &target) {
        error!("Failed to move {} into place: {}", target.display(), e);
        let _ = fs::remove_file(&temp);
        return Err(AlignError::io(target, e));
    }

    info!("Exported {} alignment entries to {}", entries.len(), target.display());
    Ok(target)
}

/// Reads `LABEL,TIME,FRAME` (frame authoritative) or `LABEL,TIME` (seconds
/// authoritative) rows. Rows without a usable time, such as unaligned
/// entries or a header, are skipped.
pub fn import_alignment_csv(path: &Path, sample_rate: f64) -> AlignResult<Vec<OnsetInstant>> {
    let text = fs::read_to_string(path).map_err(|e| AlignError::io(path, e))?;
    parse_alignment_csv(&text, sample_rate, path)
}

pub fn parse_alignment_csv(text: &str, sample_rate: f64, path: &Path) -> AlignResult<Vec<OnsetInstant>> {
    let mut onsets = Vec::new();

    for (n, line) in text.lines().enumerate() {
        let line = line.trim();
        if line.is_empty() {
            continue;
        }

        let columns: Vec<&str> = line.split(',').map(|c| c.trim().trim_matches('"')).collect();
        if columns.len() < 2 {
            return Err(AlignError::Format {
                path: path.to_path_buf(),
                line: n + 1,
                message: "expected LABEL,TIME or LABEL,TIME,FRAME".to_string(),
            });
        }

        let label = columns[0];
        let frame = if columns.len() > 2 {
            columns[2].parse::<i64>().ok()
        } else {
            columns[1]
                .parse::<f64>()
                .ok()
                .filter(|s| s.is_finite())
                .map(|s| seconds_to_frame(s, sample_rate))
        };

        match frame {
            Some(frame) => onsets.push(OnsetInstant::new(frame, label)),
            None => debug!("Skipping row {} ('{}'), no usable time", n + 1, line),
        }
    }

    Ok(onsets)
}
