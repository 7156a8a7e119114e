use crate::model::fraction::Fraction;
use std::path::{Path, PathBuf};

/// Wire value for an open score or audio bound.
pub const UNBOUNDED: i64 = -1;

pub fn frame_to_seconds(frame: i64, sample_rate: f64) -> f64 {
    frame as f64 / sample_rate
}

pub fn seconds_to_frame(seconds: f64, sample_rate: f64) -> i64 {
    (seconds * sample_rate).round() as i64
}

/// An open bound stays open; it never collapses to time zero.
pub fn frame_bound_to_seconds(frame: Option<i64>, sample_rate: f64) -> Option<f64> {
    frame.map(|f| frame_to_seconds(f, sample_rate))
}

/// `(numerator, denominator)` of a score bound, `(-1, -1)` when open.
pub fn score_bound_pair(bound: Option<Fraction>) -> (i64, i64) {
    match bound {
        Some(f) => (f.numerator(), f.denominator()),
        None => (UNBOUNDED, UNBOUNDED),
    }
}

/// Parses a frame bound given on the command line, where `-1` means open.
pub fn parse_frame_bound(value: i64) -> Option<i64> {
    if value < 0 { None } else { Some(value) }
}

pub fn with_default_extension<P: AsRef<Path>>(path: P, extension: &str) -> PathBuf {
    let path = path.as_ref();
    if path.extension().is_none() {
        path.with_extension(extension)
    } else {
        path.to_path_buf()
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn open_bounds_stay_open() {
        assert_eq!(frame_bound_to_seconds(None, 44100.0), None);
        assert_eq!(frame_bound_to_seconds(Some(0), 44100.0), Some(0.0));
        assert_eq!(frame_bound_to_seconds(Some(22050), 44100.0), Some(0.5));
        assert_eq!(score_bound_pair(None), (-1, -1));
        assert_eq!(score_bound_pair(Some(Fraction::new(6, 8).unwrap())), (3, 4));
        assert_eq!(parse_frame_bound(-1), None);
    }

    #[test]
    fn frames_and_seconds() {
        assert_eq!(seconds_to_frame(0.5, 48000.0), 24000);
        assert_eq!(seconds_to_frame(frame_to_seconds(12345, 44100.0), 44100.0), 12345);
    }

    #[test]
    fn csv_extension_is_added_once() {
        assert_eq!(with_default_extension("out", "csv"), PathBuf::from("out.csv"));
        assert_eq!(with_default_extension("out.txt", "csv"), PathBuf::from("out.txt"));
    }
}
