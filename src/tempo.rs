use crate::model::alignment::AlignmentEntry;
use crate::model::fraction::Fraction;
use crate::util::frame_to_seconds;
use log::{debug, warn};
use serde::Serialize;

const QUARTERS_PER_WHOLE: f64 = 4.0;
const SECONDS_PER_MINUTE: f64 = 60.0;

/// Tempo in quarter notes per minute, starting at `frame`.
#[derive(Serialize, Debug, Clone, Copy, PartialEq)]
pub struct TempoSample {
    pub frame: i64,
    pub bpm: f64,
}

/// Derives a tempo sample for every pair of adjacent entries that are both
/// aligned. `durations[i]` is the score length from entry `i` to entry `i + 1`.
/// Pairs whose audio times coincide are skipped.
pub fn build_tempo_curve(
    entries: &[AlignmentEntry],
    durations: &[Fraction],
    sample_rate: f64,
) -> Vec<TempoSample> {
    if entries.len() != durations.len() {
        warn!(
            "Tempo: {} alignment entries but {} score durations, using the shorter..!",
            entries.len(),
            durations.len()
        );
    }

    let count = entries.len().min(durations.len());
    let mut samples = Vec::new();

    for i in 0..count.saturating_sub(1) {
        let (Some(this_frame), Some(next_frame)) = (entries[i].frame, entries[i + 1].frame) else {
            continue;
        };

        let this_sec = frame_to_seconds(this_frame, sample_rate);
        let next_sec = frame_to_seconds(next_frame, sample_rate);
        let delta = next_sec - this_sec;

        if delta == 0.0 || !delta.is_finite() {
            debug!(
                "Tempo: no sample between {} and {}, zero time delta",
                entries[i].label,
                entries[i + 1].label
            );
            continue;
        }

        let quarters = QUARTERS_PER_WHOLE * durations[i].to_f64();
        samples.push(TempoSample {
            frame: this_frame,
            bpm: quarters * SECONDS_PER_MINUTE / delta,
        });
    }

    debug!("Tempo curve has {} sample(s)", samples.len());
    samples
}

#[cfg(test)]
mod test {
    use super::*;

    fn entry(label: &str, frame: Option<i64>) -> AlignmentEntry {
        AlignmentEntry {
            label: label.into(),
            frame,
        }
    }

    fn quarter() -> Fraction {
        Fraction::new(1, 4).unwrap()
    }

    #[test]
    fn steady_quarters_at_120() {
        env_logger::try_init().unwrap_or(());

        // Quarter notes half a second apart at 1kHz.
        let entries = vec![
            entry("1+0/1", Some(0)),
            entry("1+1/4", Some(500)),
            entry("1+1/2", Some(1000)),
        ];
        let durations = vec![quarter(); 3];

        let curve = build_tempo_curve(&entries, &durations, 1000.0);
        assert_eq!(curve.len(), 2);
        assert_eq!(curve[0].frame, 0);
        assert!((curve[0].bpm - 120.0).abs() < 1e-9);
        assert_eq!(curve[1].frame, 500);
        assert!((curve[1].bpm - 120.0).abs() < 1e-9);
    }

    #[test]
    fn gaps_break_runs() {
        env_logger::try_init().unwrap_or(());

        let entries = vec![
            entry("a", Some(0)),
            entry("b", None),
            entry("c", Some(1000)),
            entry("d", Some(2000)),
            entry("e", None),
            entry("f", Some(3000)),
        ];
        let durations = vec![quarter(); 6];

        let curve = build_tempo_curve(&entries, &durations, 1000.0);
        assert_eq!(curve.len(), 1);
        assert_eq!(curve[0].frame, 1000);
        assert!((curve[0].bpm - 60.0).abs() < 1e-9);
    }

    #[test]
    fn zero_delta_is_skipped() {
        env_logger::try_init().unwrap_or(());

        let entries = vec![entry("a", Some(100)), entry("b", Some(100)), entry("c", Some(600))];
        let half = Fraction::new(1, 2).unwrap();
        let durations = vec![quarter(), half, quarter()];

        let curve = build_tempo_curve(&entries, &durations, 1000.0);
        assert_eq!(curve.len(), 1);
        assert_eq!(curve[0].frame, 100);
        assert!((curve[0].bpm - 240.0).abs() < 1e-9);
    }

    #[test]
    fn unaligned_table_has_no_tempo() {
        env_logger::try_init().unwrap_or(());

        let entries = vec![entry("a", None), entry("b", None)];
        assert!(build_tempo_curve(&entries, &[quarter(), quarter()], 44100.0).is_empty());
        assert!(build_tempo_curve(&[], &[], 44100.0).is_empty());
    }
}
