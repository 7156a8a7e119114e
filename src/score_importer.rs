use crate::error::{AlignError, AlignResult};
use crate::model::fraction::Fraction;
use crate::model::score::*;
use crate::score_files::{ScoreFiles, write_score_files};
use log::{debug, info, warn};
use std::cmp::Ordering;
use std::collections::BTreeMap;
use std::fs;
use std::path::Path;

const QUARTERS_PER_WHOLE: f64 = 4.0;

/// Measure start positions, indexed from 0 (start of measure 1) up to and
/// including the end of the last measure.
struct MeasureMap {
    starts: Vec<Fraction>,
    signatures: Vec<Fraction>,
}

impl MeasureMap {
    fn measure_count(&self) -> usize {
        self.signatures.len()
    }

    fn start_of(&self, measure_index: u32) -> Option<Fraction> {
        if measure_index == 0 || measure_index as usize > self.measure_count() {
            return None;
        }
        self.starts.get(measure_index as usize - 1).copied()
    }

    /// Measure and beat of a release falling at `end`.
    fn locate_release(&self, end: Fraction) -> (u32, Fraction) {
        match self.starts.iter().position(|start| *start >= end) {
            Some(m) if self.starts[m] == end => (m as u32 + 1, Fraction::zero()),
            Some(m) => (m as u32, end - self.starts[m - 1]),
            None => {
                let last = self.measure_count();
                (last as u32, end - self.starts[last - 1])
            }
        }
    }
}

/// Reads the timemap and writes `<score_name>.meter` and `<score_name>.solo`
/// into `score_dir`. Either both files are written or neither is.
pub fn generate_score_files<P: AsRef<Path>, Q: AsRef<Path>>(
    timemap_path: P,
    score_dir: Q,
    score_name: &str,
    force_pickup: bool,
) -> AlignResult<ScoreFiles> {
    let score_dir = score_dir.as_ref();
    if !score_dir.is_dir() {
        return Err(AlignError::FatalInit(format!(
            "score directory '{}' does not exist",
            score_dir.display()
        )));
    }

    let document = load_timemap(timemap_path)?;
    let has_pickup = force_pickup || document.has_pickup();
    let timeline = build_timeline(&document.into_records(), has_pickup);

    write_score_files(&timeline, score_dir, score_name)
}

pub fn load_timemap<P: AsRef<Path>>(path: P) -> AlignResult<TimemapDocument> {
    let path = path.as_ref();
    let text = fs::read_to_string(path).map_err(|e| {
        AlignError::FatalInit(format!("failed to read timemap '{}': {}", path.display(), e))
    })?;

    serde_json::from_str(&text).map_err(|e| {
        AlignError::FatalInit(format!("failed to parse timemap '{}': {}", path.display(), e))
    })
}

/// Converts engraving timemap records into meter changes and a sorted list
/// of note onsets and releases. Malformed notes are logged and skipped.
pub fn build_timeline(records: &[TimemapRecord], has_pickup: bool) -> ScoreTimeline {
    let (meter_changes, map) = scan_meters(records, has_pickup);
    let map = match map {
        Some(map) => map,
        None => {
            warn!("Timemap contains no measures, nothing to build..!");
            return ScoreTimeline {
                meter_changes,
                events: Vec::new(),
            };
        }
    };

    let mut onsets: Vec<NoteEvent> = Vec::new();
    let mut skipped = 0;

    for record in records.iter() {
        let Some(note_id) = record.id.as_deref() else {
            continue;
        };

        if record.is_tie_continuation() {
            debug!("Skipping tied continuation '{}'", note_id);
            continue;
        }

        match onset_from_record(record, note_id, &map) {
            Ok(onset) => onsets.push(onset),
            Err(why) => {
                warn!("Skipping note: {}", why);
                skipped += 1;
            }
        }
    }

    let mut events: Vec<NoteEvent> = Vec::with_capacity(onsets.len() * 2);
    for onset in onsets.iter() {
        let end = onset.end();
        let (measure_index, beat) = map.locate_release(end);

        events.push(NoteEvent {
            measure_index,
            beat,
            cumulative: end,
            duration: onset.duration,
            pitch: onset.pitch,
            note_id: onset.note_id.clone(),
            is_onset: false,
        });
    }
    events.extend(onsets);

    // Releases sort before onsets at the same position, so a note ending
    // where another starts never overlaps it.
    events.sort_by(compare_events);

    if has_pickup && map.measure_count() > 1 {
        remap_pickup(&mut events, map.signatures[0]);
    }

    info!(
        "Built score timeline: {} meter change(s), {} event(s), {} note(s) skipped",
        meter_changes.len(),
        events.len(),
        skipped
    );

    ScoreTimeline {
        meter_changes,
        events,
    }
}

fn compare_events(a: &NoteEvent, b: &NoteEvent) -> Ordering {
    a.cumulative
        .cmp(&b.cumulative)
        .then_with(|| a.is_onset.cmp(&b.is_onset))
        .then_with(|| a.pitch.cmp(&b.pitch))
}

/// The engraved signature without any leading count, e.g. `"2 3/4"` -> `"3/4"`.
fn meter_notation(raw: &str) -> &str {
    raw.split_whitespace().last().unwrap_or(raw)
}

fn scan_meters(records: &[TimemapRecord], has_pickup: bool) -> (Vec<MeterChange>, Option<MeasureMap>) {
    let measure_count = records.iter().map(|r| r.measure).max().unwrap_or(0);
    // A lone measure is never treated as a pickup.
    let shift = if has_pickup && measure_count > 1 { 1 } else { 0 };
    let mut changes: Vec<MeterChange> = Vec::new();
    let mut declared: BTreeMap<u32, Fraction> = BTreeMap::new();
    let mut last_notation: Option<&str> = None;

    for record in records.iter() {
        let Some(raw) = record.meter_sig.as_deref() else {
            continue;
        };

        let notation = meter_notation(raw);
        let signature = match notation.parse::<Fraction>() {
            Ok(sig) if sig > Fraction::zero() => sig,
            _ => {
                warn!(
                    "Ignoring unreadable meter signature '{}' in measure {}..!",
                    raw, record.measure
                );
                continue;
            }
        };

        if record.measure == 0 {
            warn!("Ignoring meter signature '{}' outside any measure..!", raw);
            continue;
        }

        declared.entry(record.measure).or_insert(signature);

        if last_notation != Some(notation) {
            changes.push(MeterChange {
                measure_index: record.measure - shift,
                signature,
                notation: notation.to_string(),
            });
            last_notation = Some(notation);
        }
    }

    if measure_count == 0 {
        return (changes, None);
    }

    let mut current = match declared.get(&1) {
        Some(sig) => *sig,
        None => {
            warn!("No meter signature at measure 1, assuming 4/4..!");
            Fraction::from_integer(1)
        }
    };

    let mut signatures: Vec<Fraction> = Vec::with_capacity(measure_count as usize);
    let mut starts: Vec<Fraction> = Vec::with_capacity(measure_count as usize + 1);
    starts.push(Fraction::zero());

    for measure in 1..=measure_count {
        if let Some(sig) = declared.get(&measure) {
            current = *sig;
        }
        signatures.push(current);
        let next = starts[starts.len() - 1] + current;
        starts.push(next);
    }

    debug!(
        "Measure map: {} measures, total length {}",
        measure_count,
        starts[starts.len() - 1]
    );

    (changes, Some(MeasureMap { starts, signatures }))
}

fn onset_from_record(record: &TimemapRecord, note_id: &str, map: &MeasureMap) -> AlignResult<NoteEvent> {
    let malformed = |reason: String| AlignError::MalformedNote {
        note_id: note_id.to_string(),
        reason,
    };

    let pitch = record
        .pitch
        .ok_or_else(|| malformed("no pitch".into()))?;
    if !(MIN_PITCH..=MAX_PITCH).contains(&pitch) {
        return Err(malformed(format!(
            "pitch {} outside [{}..={}]",
            pitch, MIN_PITCH, MAX_PITCH
        )));
    }

    let measure_start = map
        .start_of(record.measure)
        .ok_or_else(|| malformed(format!("measure {} not in score", record.measure)))?;

    if record.tied_duration < 0.0 {
        return Err(malformed(format!("tied duration {}", record.tied_duration)));
    }

    let beat = Fraction::closest(record.onset / QUARTERS_PER_WHOLE)
        .map_err(|_| malformed(format!("onset {}", record.onset)))?;
    let duration = Fraction::closest((record.tied_duration + record.duration) / QUARTERS_PER_WHOLE)
        .map_err(|_| malformed(format!("duration {}", record.duration)))?;

    if beat < Fraction::zero() || duration < Fraction::zero() {
        return Err(malformed(format!("negative timing {} / {}", beat, duration)));
    }

    Ok(NoteEvent {
        measure_index: record.measure,
        beat,
        cumulative: measure_start + beat,
        duration,
        pitch,
        note_id: note_id.to_string(),
        is_onset: true,
    })
}

/// Renumbers a score whose first measure is a pickup: the pickup becomes
/// measure 0, and everything after it moves back by the part of measure 1
/// the pickup leaves empty.
fn remap_pickup(events: &mut [NoteEvent], nominal: Fraction) {

    // Where the pickup's content actually ends.
    let actual = events
        .iter()
        .filter(|e| e.is_onset && e.measure_index == 1)
        .map(|e| e.end().min(nominal))
        .max()
        .unwrap_or(nominal);

    let shift = nominal - actual;
    debug!("Pickup measure: nominal {}, actual {}, shift {}", nominal, actual, shift);

    for event in events.iter_mut() {
        match event.measure_index {
            m if m > 1 => {
                event.measure_index -= 1;
                event.cumulative -= shift;
            }
            1 if event.cumulative == actual => {
                event.beat = Fraction::zero();
            }
            1 => {
                event.measure_index = 0;
                event.beat = shift + event.cumulative;
            }
            _ => {}
        }
    }
}
