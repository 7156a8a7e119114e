use crate::error::{AlignError, AlignResult};
use crate::model::score::ScorePosition;
use log::{debug, error};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;

/// A labelled time instant on the recording, as produced by an alignment
/// plugin or an imported alignment file.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq, Hash)]
pub struct OnsetInstant {
    pub frame: i64,
    pub label: String,
}

impl OnsetInstant {
    pub fn new(frame: i64, label: impl Into<String>) -> Self {
        Self {
            frame,
            label: label.into(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AlignmentEntry {
    pub label: String,
    /// `None` until the position has been aligned.
    pub frame: Option<i64>,
}

/// The score's label sequence, in score order, with the frame each label is
/// currently aligned to.
#[derive(Debug, Clone, Default)]
pub struct AlignmentEntryTable {
    entries: Vec<AlignmentEntry>,
    index: HashMap<String, usize>,
}

impl AlignmentEntryTable {
    pub fn new(positions: &[ScorePosition]) -> Self {
        let mut table = Self::default();
        table.reset(positions);
        table
    }

    /// Rebuilds the table one entry per position, all unaligned.
    pub fn reset(&mut self, positions: &[ScorePosition]) {
        self.entries = positions
            .iter()
            .map(|p| AlignmentEntry {
                label: p.label.clone(),
                frame: None,
            })
            .collect();

        self.index = self
            .entries
            .iter()
            .enumerate()
            .map(|(i, e)| (e.label.clone(), i))
            .collect();

        debug!("Alignment entries reset to {} labels", self.entries.len());
    }

    pub fn entries(&self) -> &[AlignmentEntry] {
        &self.entries
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn frame_of(&self, label: &str) -> Option<i64> {
        self.index.get(label).and_then(|&i| self.entries[i].frame)
    }

    /// Sets the frame of every entry named by `displayed`. Entries the
    /// timeline does not mention keep their frame.
    ///
    /// All labels are checked before anything is written, so on an
    /// `Integrity` error the table is left exactly as it was.
    pub fn synchronize(&mut self, displayed: &[OnsetInstant]) -> AlignResult<()> {
        let targets = self.resolve(displayed)?;

        for (i, frame) in targets {
            self.entries[i].frame = Some(frame);
        }

        Ok(())
    }

    /// Like [`synchronize`](Self::synchronize), but entries absent from
    /// `displayed` become unaligned, so the table mirrors `displayed` exactly.
    pub fn replace_frames(&mut self, displayed: &[OnsetInstant]) -> AlignResult<()> {
        let targets = self.resolve(displayed)?;

        for entry in self.entries.iter_mut() {
            entry.frame = None;
        }
        for (i, frame) in targets {
            self.entries[i].frame = Some(frame);
        }

        Ok(())
    }

    fn resolve(&self, displayed: &[OnsetInstant]) -> AlignResult<Vec<(usize, i64)>> {
        displayed
            .iter()
            .map(|onset| match self.index.get(&onset.label) {
                Some(&i) => Ok((i, onset.frame)),
                None => {
                    error!(
                        "Label {} of the displayed alignment was not found in the score..!",
                        onset.label
                    );
                    Err(AlignError::Integrity(onset.label.clone()))
                }
            })
            .collect()
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::model::fraction::Fraction;

    fn positions(labels: &[&str]) -> Vec<ScorePosition> {
        labels
            .iter()
            .map(|l| ScorePosition {
                label: l.to_string(),
                measure_index: 1,
                beat: Fraction::zero(),
                cumulative: Fraction::zero(),
                duration: Fraction::zero(),
                note_ids: vec![],
            })
            .collect()
    }

    #[test]
    fn reset_mirrors_positions() {
        env_logger::try_init().unwrap_or(());

        let table = AlignmentEntryTable::new(&positions(&["1+0/1", "1+1/4", "1+1/2"]));
        assert_eq!(table.len(), 3);
        assert_eq!(table.entries()[1].label, "1+1/4");
        assert!(table.entries().iter().all(|e| e.frame.is_none()));
    }

    #[test]
    fn subset_synchronizes() {
        env_logger::try_init().unwrap_or(());

        let mut table = AlignmentEntryTable::new(&positions(&["1+0/1", "1+1/4", "1+1/2"]));
        let displayed = vec![OnsetInstant::new(4410, "1+1/2"), OnsetInstant::new(0, "1+0/1")];

        assert!(table.synchronize(&displayed).is_ok());
        assert_eq!(table.frame_of("1+0/1"), Some(0));
        assert_eq!(table.frame_of("1+1/4"), None);
        assert_eq!(table.frame_of("1+1/2"), Some(4410));
    }

    #[test]
    fn unknown_label_leaves_table_untouched() {
        env_logger::try_init().unwrap_or(());

        let mut table = AlignmentEntryTable::new(&positions(&["1+0/1", "1+1/4"]));
        table.synchronize(&[OnsetInstant::new(10, "1+0/1")]).unwrap();

        let displayed = vec![OnsetInstant::new(99, "1+1/4"), OnsetInstant::new(200, "7+1/3")];
        match table.synchronize(&displayed) {
            Err(AlignError::Integrity(label)) => assert_eq!(label, "7+1/3"),
            other => panic!("expected integrity error, got {:?}", other),
        }

        assert_eq!(table.frame_of("1+0/1"), Some(10));
        assert_eq!(table.frame_of("1+1/4"), None);
    }

    #[test]
    fn replace_clears_unmentioned_entries() {
        env_logger::try_init().unwrap_or(());

        let mut table = AlignmentEntryTable::new(&positions(&["1+0/1", "1+1/4"]));
        table.synchronize(&[OnsetInstant::new(10, "1+0/1"), OnsetInstant::new(20, "1+1/4")]).unwrap();
        table.replace_frames(&[OnsetInstant::new(30, "1+1/4")]).unwrap();

        assert_eq!(table.frame_of("1+0/1"), None);
        assert_eq!(table.frame_of("1+1/4"), Some(30));
    }
}
