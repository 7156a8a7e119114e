use crate::model::fraction::Fraction;
use serde::{Deserialize, Serialize};

pub const MIN_PITCH: i32 = 21;
pub const MAX_PITCH: i32 = 108;

/// One record of the engraving toolkit's timemap. Onsets and durations are in
/// quarter notes relative to the start of `measure`; a record without `id`
/// carries only measure/meter information.
#[derive(Serialize, Deserialize, Debug, Clone, Default)]
#[serde(rename_all = "camelCase")]
pub struct TimemapRecord {
    #[serde(default)]
    pub onset: f64,
    #[serde(default)]
    pub duration: f64,
    /// `-1` marks the non-leading half of a tie.
    #[serde(default)]
    pub tied_duration: f64,
    pub measure: u32,
    #[serde(default)]
    pub meter_sig: Option<String>,
    #[serde(default)]
    pub pitch: Option<i32>,
    #[serde(default)]
    pub id: Option<String>,
}

impl TimemapRecord {
    pub fn is_tie_continuation(&self) -> bool {
        self.tied_duration == -1.0
    }
}

#[derive(Serialize, Deserialize, Debug, Clone)]
#[serde(untagged)]
pub enum TimemapDocument {
    Annotated {
        #[serde(default, rename = "hasPickup")]
        has_pickup: bool,
        events: Vec<TimemapRecord>,
    },
    Bare(Vec<TimemapRecord>),
}

impl TimemapDocument {
    pub fn has_pickup(&self) -> bool {
        match self {
            TimemapDocument::Annotated { has_pickup, .. } => *has_pickup,
            TimemapDocument::Bare(_) => false,
        }
    }

    pub fn into_records(self) -> Vec<TimemapRecord> {
        match self {
            TimemapDocument::Annotated { events, .. } => events,
            TimemapDocument::Bare(events) => events,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MeterChange {
    pub measure_index: u32,
    /// Measure length in whole notes.
    pub signature: Fraction,
    /// The signature as engraved, e.g. `6/8` (which `signature` reduces to 3/4).
    pub notation: String,
}

/// A note onset or its synthesized release on the score timeline.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NoteEvent {
    pub measure_index: u32,
    pub beat: Fraction,
    pub cumulative: Fraction,
    pub duration: Fraction,
    pub pitch: i32,
    pub note_id: String,
    pub is_onset: bool,
}

impl NoteEvent {
    pub fn label(&self) -> String {
        measure_label(self.measure_index, self.beat)
    }

    pub fn end(&self) -> Fraction {
        self.cumulative + self.duration
    }
}

/// `<measure>+<num>/<den>`, the key shared with the alignment plugin.
pub fn measure_label(measure_index: u32, beat: Fraction) -> String {
    format!(
        "{}+{}/{}",
        measure_index,
        beat.numerator(),
        beat.denominator()
    )
}

/// A distinct onset position of the score: every note starting at the same
/// measure and beat. This is what an alignment entry stands for.
#[derive(Debug, Clone, PartialEq)]
pub struct ScorePosition {
    pub label: String,
    pub measure_index: u32,
    pub beat: Fraction,
    pub cumulative: Fraction,
    /// Distance to the next position; for the last one, its longest note.
    pub duration: Fraction,
    pub note_ids: Vec<String>,
}

#[derive(Debug, Clone, Default)]
pub struct ScoreTimeline {
    pub meter_changes: Vec<MeterChange>,
    pub events: Vec<NoteEvent>,
}

impl ScoreTimeline {
    pub fn onsets(&self) -> impl Iterator<Item = &NoteEvent> {
        self.events.iter().filter(|e| e.is_onset)
    }

    /// Groups onsets by label in timeline order.
    pub fn positions(&self) -> Vec<ScorePosition> {
        let mut positions: Vec<ScorePosition> = Vec::new();
        let mut longest: Vec<Fraction> = Vec::new();

        for onset in self.onsets() {
            let label = onset.label();

            if let Some(last) = positions.last_mut()
                && last.label == label
            {
                last.note_ids.push(onset.note_id.clone());
                if let Some(max) = longest.last_mut()
                    && onset.duration > *max
                {
                    *max = onset.duration;
                }
                continue;
            }

            positions.push(ScorePosition {
                label,
                measure_index: onset.measure_index,
                beat: onset.beat,
                cumulative: onset.cumulative,
                duration: onset.duration,
                note_ids: vec![onset.note_id.clone()],
            });
            longest.push(onset.duration);
        }

        let count = positions.len();
        for i in 0..count {
            positions[i].duration = if i + 1 < count {
                positions[i + 1].cumulative - positions[i].cumulative
            } else {
                longest[i]
            };
        }

        positions
    }
}
