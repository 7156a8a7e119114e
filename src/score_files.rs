use crate::error::{AlignError, AlignResult};
use crate::model::fraction::Fraction;
use crate::model::score::*;
use log::{debug, error, info, warn};
use std::collections::HashMap;
use std::fs;
use std::path::{Path, PathBuf};

pub const METER_EXTENSION: &str = "meter";
pub const SOLO_EXTENSION: &str = "solo";

const ONSET_VELOCITY: u8 = 80;
const RELEASE_VELOCITY: u8 = 0;
const CHANNEL_COLUMN: u8 = 90;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ScoreFiles {
    pub meter_path: PathBuf,
    pub solo_path: PathBuf,
}

impl ScoreFiles {
    pub fn new<P: AsRef<Path>>(score_dir: P, score_name: &str) -> Self {
        let dir = score_dir.as_ref();
        Self {
            meter_path: dir.join(format!("{}.{}", score_name, METER_EXTENSION)),
            solo_path: dir.join(format!("{}.{}", score_name, SOLO_EXTENSION)),
        }
    }
}

pub fn format_meter_file(changes: &[MeterChange]) -> String {
    changes
        .iter()
        .map(|c| format!("{}\t{}\n", c.measure_index, c.notation))
        .collect()
}

pub fn format_solo_file(events: &[NoteEvent]) -> String {
    events
        .iter()
        .map(|e| {
            format!(
                "{}\t{}\t{}\t{}\t{}\t{}\n",
                e.label(),
                e.cumulative,
                CHANNEL_COLUMN,
                e.pitch,
                if e.is_onset { ONSET_VELOCITY } else { RELEASE_VELOCITY },
                e.note_id
            )
        })
        .collect()
}

/// Writes the meter and solo artifacts as a pair. Each is written to a
/// temporary sibling first; if anything fails, every file written so far
/// is removed and any pair from an earlier build is put back as it was.
pub fn write_score_files<P: AsRef<Path>>(
    timeline: &ScoreTimeline,
    score_dir: P,
    score_name: &str,
) -> AlignResult<ScoreFiles> {
    let files = ScoreFiles::new(score_dir, score_name);
    let artifacts = [
        (files.meter_path.clone(), format_meter_file(&timeline.meter_changes)),
        (files.solo_path.clone(), format_solo_file(&timeline.events)),
    ];

    let mut staged: Vec<(PathBuf, &PathBuf)> = Vec::new();
    for (target, content) in artifacts.iter() {
        let temp = sibling(target, "tmp");
        if let Err(e) = fs::write(&temp, content) {
            error!("Failed to write {}: {}", temp.display(), e);
            remove_all(staged.iter().map(|(t, _)| t.as_path()).chain([temp.as_path()]));
            return Err(AlignError::io(temp, e));
        }
        staged.push((temp, target));
    }

    // Files from an earlier build are set aside, so a failure can put the
    // old pair back instead of leaving one of them orphaned.
    let mut backups: Vec<(PathBuf, &Path)> = Vec::new();
    for (_, target) in staged.iter() {
        if !target.is_file() {
            continue;
        }
        let backup = sibling(target, "bak");
        if let Err(e) = fs::rename(target, &backup) {
            error!("Failed to set aside {}: {}", target.display(), e);
            restore(&backups);
            remove_all(staged.iter().map(|(t, _)| t.as_path()));
            return Err(AlignError::io(target.as_path(), e));
        }
        backups.push((backup, target.as_path()));
    }

    let mut placed: Vec<&Path> = Vec::new();
    for (i, (temp, target)) in staged.iter().enumerate() {
        if let Err(e) = fs::rename(temp, target) {
            error!("Failed to move {} into place: {}", target.display(), e);
            remove_all(
                placed
                    .iter()
                    .copied()
                    .chain(staged[i..].iter().map(|(t, _)| t.as_path())),
            );
            restore(&backups);
            return Err(AlignError::io(target.as_path(), e));
        }
        placed.push(target.as_path());
    }

    remove_all(backups.iter().map(|(b, _)| b.as_path()));

    info!(
        "Wrote score data to {} and {}",
        files.meter_path.display(),
        files.solo_path.display()
    );

    Ok(files)
}

fn sibling(target: &Path, suffix: &str) -> PathBuf {
    let mut name = target.file_name().unwrap_or_default().to_os_string();
    name.push(".");
    name.push(suffix);
    target.with_file_name(name)
}

fn restore(backups: &[(PathBuf, &Path)]) {
    for (backup, target) in backups {
        match fs::rename(backup, target) {
            Ok(()) => debug!("Restored {}", target.display()),
            Err(e) => error!("Failed to restore {}: {}", target.display(), e),
        }
    }
}

fn remove_all<'a>(paths: impl Iterator<Item = &'a Path>) {
    for path in paths {
        match fs::remove_file(path) {
            Ok(()) => debug!("Rolled back {}", path.display()),
            Err(e) => debug!("Nothing to roll back at {}: {}", path.display(), e),
        }
    }
}

/// Reads a previously generated meter/solo pair back into a timeline.
/// Durations are recovered by pairing each onset with its release.
pub fn read_score_files<P: AsRef<Path>>(score_dir: P, score_name: &str) -> AlignResult<ScoreTimeline> {
    let files = ScoreFiles::new(score_dir, score_name);

    let meter_text =
        fs::read_to_string(&files.meter_path).map_err(|e| AlignError::io(&files.meter_path, e))?;
    let solo_text =
        fs::read_to_string(&files.solo_path).map_err(|e| AlignError::io(&files.solo_path, e))?;

    let meter_changes = parse_meter_file(&meter_text, &files.meter_path)?;
    let events = parse_solo_file(&solo_text, &files.solo_path)?;

    info!(
        "Read score '{}': {} meter change(s), {} event(s)",
        score_name,
        meter_changes.len(),
        events.len()
    );

    Ok(ScoreTimeline {
        meter_changes,
        events,
    })
}

pub fn parse_meter_file(text: &str, path: &Path) -> AlignResult<Vec<MeterChange>> {
    let mut changes = Vec::new();

    for (n, line) in text.lines().enumerate() {
        if line.trim().is_empty() {
            continue;
        }
        let malformed = |message: &str| AlignError::Format {
            path: path.to_path_buf(),
            line: n + 1,
            message: message.to_string(),
        };

        let (measure, notation) = line
            .split_once('\t')
            .ok_or_else(|| malformed("expected two tab-separated columns"))?;
        let measure_index = measure
            .trim()
            .parse::<u32>()
            .map_err(|_| malformed("measure index is not a number"))?;
        let notation = notation.trim();
        let signature = notation
            .parse::<Fraction>()
            .map_err(|_| malformed("unreadable meter signature"))?;

        changes.push(MeterChange {
            measure_index,
            signature,
            notation: notation.to_string(),
        });
    }

    Ok(changes)
}

pub fn parse_solo_file(text: &str, path: &Path) -> AlignResult<Vec<NoteEvent>> {
    let mut events: Vec<NoteEvent> = Vec::new();

    for (n, line) in text.lines().enumerate() {
        if line.trim().is_empty() {
            continue;
        }
        let malformed = |message: &str| AlignError::Format {
            path: path.to_path_buf(),
            line: n + 1,
            message: message.to_string(),
        };

        let columns: Vec<&str> = line.split('\t').collect();
        if columns.len() != 6 {
            return Err(malformed("expected six tab-separated columns"));
        }

        let (measure, beat) = columns[0]
            .split_once('+')
            .ok_or_else(|| malformed("label is not <measure>+<beat>"))?;
        let measure_index = measure
            .parse::<u32>()
            .map_err(|_| malformed("measure index is not a number"))?;
        let beat = beat.parse::<Fraction>().map_err(|_| malformed("unreadable beat"))?;
        let cumulative = columns[1]
            .parse::<Fraction>()
            .map_err(|_| malformed("unreadable position"))?;
        let pitch = columns[3]
            .parse::<i32>()
            .map_err(|_| malformed("pitch is not a number"))?;
        let is_onset = match columns[4].parse::<u8>() {
            Ok(ONSET_VELOCITY) => true,
            Ok(RELEASE_VELOCITY) => false,
            _ => return Err(malformed("velocity must be 80 or 0")),
        };

        events.push(NoteEvent {
            measure_index,
            beat,
            cumulative,
            duration: Fraction::zero(),
            pitch,
            note_id: columns[5].to_string(),
            is_onset,
        });
    }

    pair_durations(&mut events);
    Ok(events)
}

fn pair_durations(events: &mut [NoteEvent]) {
    let durations: Vec<(usize, usize, Fraction)> = {
        let mut onsets: HashMap<&str, Vec<usize>> = HashMap::new();
        let mut releases: HashMap<&str, Vec<usize>> = HashMap::new();

        for (i, event) in events.iter().enumerate() {
            let bucket = if event.is_onset { &mut onsets } else { &mut releases };
            bucket.entry(event.note_id.as_str()).or_default().push(i);
        }

        let mut pairs = Vec::new();
        for (id, starts) in onsets.iter() {
            let ends = releases.get(id).map(Vec::as_slice).unwrap_or(&[]);
            if ends.len() != starts.len() {
                warn!(
                    "Note '{}' has {} onset(s) but {} release(s)..!",
                    id,
                    starts.len(),
                    ends.len()
                );
            }
            for (&on, &off) in starts.iter().zip(ends.iter()) {
                pairs.push((on, off, events[off].cumulative - events[on].cumulative));
            }
        }
        pairs
    };

    for (on, off, duration) in durations {
        events[on].duration = duration;
        events[off].duration = duration;
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::score_importer::build_timeline;

    fn sample_timeline() -> ScoreTimeline {
        let record = |measure: u32, onset: f64, duration: f64, pitch: i32, id: &str| TimemapRecord {
            onset,
            duration,
            tied_duration: 0.0,
            measure,
            meter_sig: if onset == 0.0 { Some("3/4".into()) } else { None },
            pitch: Some(pitch),
            id: Some(id.into()),
        };

        build_timeline(
            &[
                record(1, 0.0, 1.0, 60, "a"),
                record(1, 1.0, 2.0, 64, "b"),
                record(2, 0.0, 3.0, 67, "c"),
            ],
            false,
        )
    }

    #[test]
    fn written_files_read_back() {
        env_logger::try_init().unwrap_or(());

        let dir = tempfile::tempdir().unwrap();
        let timeline = sample_timeline();

        write_score_files(&timeline, dir.path(), "waltz").unwrap();
        let read = read_score_files(dir.path(), "waltz").unwrap();

        assert_eq!(read.meter_changes, timeline.meter_changes);
        assert_eq!(read.events, timeline.events);
        assert!(!dir.path().join("waltz.meter.tmp").exists());
        assert!(!dir.path().join("waltz.solo.tmp").exists());
    }

    #[test]
    fn failed_write_leaves_no_artifacts() {
        env_logger::try_init().unwrap_or(());

        let dir = tempfile::tempdir().unwrap();
        // A directory squatting on the solo target makes the final rename fail.
        fs::create_dir(dir.path().join("waltz.solo")).unwrap();
        fs::write(dir.path().join("waltz.solo").join("keep"), "x").unwrap();

        let result = write_score_files(&sample_timeline(), dir.path(), "waltz");

        assert!(matches!(result, Err(AlignError::Io { .. })));
        assert!(!dir.path().join("waltz.meter").exists());
        assert!(!dir.path().join("waltz.meter.tmp").exists());
        assert!(!dir.path().join("waltz.solo.tmp").exists());
    }

    #[test]
    fn failed_placement_restores_earlier_meter() {
        env_logger::try_init().unwrap_or(());

        let dir = tempfile::tempdir().unwrap();
        fs::write(dir.path().join("waltz.meter"), "1\t6/8\n").unwrap();
        fs::create_dir(dir.path().join("waltz.solo")).unwrap();
        fs::write(dir.path().join("waltz.solo").join("keep"), "x").unwrap();

        let result = write_score_files(&sample_timeline(), dir.path(), "waltz");

        assert!(matches!(result, Err(AlignError::Io { .. })));
        assert_eq!(fs::read_to_string(dir.path().join("waltz.meter")).unwrap(), "1\t6/8\n");
        assert!(!dir.path().join("waltz.meter.bak").exists());
        assert!(!dir.path().join("waltz.meter.tmp").exists());
    }

    #[test]
    fn failed_rebuild_keeps_earlier_pair() {
        env_logger::try_init().unwrap_or(());

        let dir = tempfile::tempdir().unwrap();
        fs::write(dir.path().join("waltz.meter"), "old meter").unwrap();
        fs::write(dir.path().join("waltz.solo"), "old solo").unwrap();
        // Nothing can be moved onto this, so the solo file cannot be set aside.
        fs::create_dir(dir.path().join("waltz.solo.bak")).unwrap();
        fs::write(dir.path().join("waltz.solo.bak").join("keep"), "x").unwrap();

        let result = write_score_files(&sample_timeline(), dir.path(), "waltz");

        assert!(matches!(result, Err(AlignError::Io { .. })));
        assert_eq!(fs::read_to_string(dir.path().join("waltz.meter")).unwrap(), "old meter");
        assert_eq!(fs::read_to_string(dir.path().join("waltz.solo")).unwrap(), "old solo");
        assert!(!dir.path().join("waltz.meter.bak").exists());
        assert!(!dir.path().join("waltz.meter.tmp").exists());
        assert!(!dir.path().join("waltz.solo.tmp").exists());
    }

    #[test]
    fn rebuild_replaces_earlier_pair() {
        env_logger::try_init().unwrap_or(());

        let dir = tempfile::tempdir().unwrap();
        fs::write(dir.path().join("waltz.meter"), "old meter").unwrap();
        fs::write(dir.path().join("waltz.solo"), "old solo").unwrap();

        write_score_files(&sample_timeline(), dir.path(), "waltz").unwrap();

        assert_eq!(read_score_files(dir.path(), "waltz").unwrap().events, sample_timeline().events);
        assert!(!dir.path().join("waltz.meter.bak").exists());
        assert!(!dir.path().join("waltz.solo.bak").exists());
    }

    #[test]
    fn missing_directory_fails_cleanly() {
        env_logger::try_init().unwrap_or(());

        let dir = tempfile::tempdir().unwrap();
        let missing = dir.path().join("nowhere");

        let result = write_score_files(&sample_timeline(), &missing, "waltz");
        assert!(matches!(result, Err(AlignError::Io { .. })));
        assert!(!missing.exists());
    }

    #[test]
    fn malformed_solo_line_is_reported() {
        env_logger::try_init().unwrap_or(());

        let text = "1+0/1\t0/1\t90\t60\t80\ta\n1+1/4\t1/4\t90\t60\t55\ta\n";
        match parse_solo_file(text, Path::new("bad.solo")) {
            Err(AlignError::Format { line, .. }) => assert_eq!(line, 2),
            other => panic!("expected format error, got {:?}", other),
        }
    }
}
