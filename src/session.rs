use crate::alignment_io::{export_alignment_csv, import_alignment_csv};
use crate::engine::*;
use crate::error::{AlignError, AlignResult, DispatchFailure};
use crate::model::alignment::{AlignmentEntryTable, OnsetInstant};
use crate::model::fraction::Fraction;
use crate::model::score::{ScorePosition, ScoreTimeline};
use crate::tempo::{TempoSample, build_tempo_curve};
use crate::util::frame_bound_to_seconds;
use log::{debug, error, info, warn};
use std::path::{Path, PathBuf};
use std::sync::mpsc::{self, Receiver, RecvTimeoutError, Sender};
use std::time::{Duration, Instant};

/// Notifications published to session subscribers.
#[derive(Debug, Clone, PartialEq)]
pub enum SessionEvent {
    ReadyForReview,
    Accepted,
    Rejected,
    Modified,
    FailedToRun(String),
}

/// The audio frame range a run was asked to recompute. Both ends open for a
/// full alignment.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct FrameBounds {
    pub start: Option<i64>,
    pub end: Option<i64>,
}

impl FrameBounds {
    pub const UNBOUNDED: FrameBounds = FrameBounds {
        start: None,
        end: None,
    };
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    Idle,
    AwaitingResult { run: RunId, bounds: FrameBounds },
    ReadyForReview { run: RunId, bounds: FrameBounds },
}

impl SessionState {
    pub fn name(&self) -> &'static str {
        match self {
            SessionState::Idle => "idle",
            SessionState::AwaitingResult { .. } => "awaiting a result",
            SessionState::ReadyForReview { .. } => "a result is under review",
        }
    }
}

/// Replace-in-range merge: keeps every accepted onset strictly before
/// `bounds.start` or at/after `bounds.end`, plus all of `pending`. An open
/// start keeps nothing before; an open end keeps nothing after.
pub fn merge_replacing_range(
    accepted: &[OnsetInstant],
    pending: &[OnsetInstant],
    bounds: FrameBounds,
) -> Vec<OnsetInstant> {
    let mut merged: Vec<OnsetInstant> = pending.to_vec();

    for onset in accepted {
        let before = bounds.start.is_some_and(|start| onset.frame < start);
        let after = bounds.end.is_some_and(|end| onset.frame >= end);
        if before || after {
            merged.push(onset.clone());
        }
    }

    merged.sort_by(|a, b| a.frame.cmp(&b.frame).then_with(|| a.label.cmp(&b.label)));
    merged.dedup();
    merged
}

/// Owns the alignment state for one score and one recording.
///
/// All mutation happens on the owning thread. Plugin completions and
/// interrupts arrive as [`SessionMsg`]s on the inbox and only take effect
/// when the owner calls [`poll`](Self::poll), [`wait_for_result`](Self::wait_for_result)
/// or [`handle`](Self::handle).
pub struct AlignmentSession {
    plugins: AlignmentPlugins,
    plugin_id: Option<String>,

    score_id: String,
    positions: Vec<ScorePosition>,
    durations: Vec<Fraction>,
    audio: Option<AudioSource>,

    state: SessionState,
    accepted: Option<Vec<OnsetInstant>>,
    pending: Vec<OnsetInstant>,

    entries: AlignmentEntryTable,
    tempo: Vec<TempoSample>,

    next_run: u64,
    inbox_tx: Sender<SessionMsg>,
    inbox_rx: Receiver<SessionMsg>,
    subscribers: Vec<Sender<SessionEvent>>,
}

impl AlignmentSession {
    pub fn new(plugins: AlignmentPlugins) -> Self {
        let (inbox_tx, inbox_rx) = mpsc::channel();
        Self {
            plugins,
            plugin_id: None,
            score_id: String::new(),
            positions: Vec::new(),
            durations: Vec::new(),
            audio: None,
            state: SessionState::Idle,
            accepted: None,
            pending: Vec::new(),
            entries: AlignmentEntryTable::default(),
            tempo: Vec::new(),
            next_run: 1,
            inbox_tx,
            inbox_rx,
            subscribers: Vec::new(),
        }
    }

    pub fn subscribe(&mut self) -> Receiver<SessionEvent> {
        let (tx, rx) = mpsc::channel();
        self.subscribers.push(tx);
        rx
    }

    /// A sender for delivering messages to this session from other threads.
    pub fn inbox(&self) -> Sender<SessionMsg> {
        self.inbox_tx.clone()
    }

    pub fn state(&self) -> SessionState {
        self.state
    }

    pub fn score_id(&self) -> &str {
        &self.score_id
    }

    pub fn positions(&self) -> &[ScorePosition] {
        &self.positions
    }

    pub fn entries(&self) -> &AlignmentEntryTable {
        &self.entries
    }

    pub fn accepted(&self) -> Option<&[OnsetInstant]> {
        self.accepted.as_deref()
    }

    pub fn pending(&self) -> &[OnsetInstant] {
        &self.pending
    }

    pub fn tempo_curve(&self) -> &[TempoSample] {
        &self.tempo
    }

    /// The timeline currently shown: the merged preview while a result is
    /// under review, otherwise the accepted timeline.
    pub fn displayed(&self) -> Vec<OnsetInstant> {
        match self.state {
            SessionState::ReadyForReview { bounds, .. } => self.preview(bounds),
            _ => self.accepted.clone().unwrap_or_default(),
        }
    }

    fn preview(&self, bounds: FrameBounds) -> Vec<OnsetInstant> {
        match &self.accepted {
            Some(accepted) if bounds.end.is_some() => merge_replacing_range(accepted, &self.pending, bounds),
            _ => self.pending.clone(),
        }
    }

    /// Loads a new recording. Any alignment made against the previous one
    /// is dropped.
    pub fn set_audio(&mut self, audio: AudioSource) {
        info!(
            "Audio set to {} at {} Hz",
            audio.path.display(),
            audio.sample_rate
        );
        self.drop_alignment();
        self.audio = Some(audio);
    }

    /// Loads a new score, rebuilding the entry table from its onset positions.
    pub fn set_score(&mut self, score_id: impl Into<String>, timeline: &ScoreTimeline) {
        self.drop_alignment();
        self.score_id = score_id.into();
        self.positions = timeline.positions();
        self.durations = self.positions.iter().map(|p| p.duration).collect();
        self.entries.reset(&self.positions);

        info!(
            "Score '{}' set with {} aligned position(s)",
            self.score_id,
            self.positions.len()
        );
    }

    /// `None` falls back to the first alignment-capable plugin.
    pub fn set_alignment_plugin(&mut self, plugin_id: Option<String>) {
        debug!("Alignment plugin set to {:?}", plugin_id);
        self.plugin_id = plugin_id;
    }

    /// Drops the audio, the score and every timeline.
    pub fn clear(&mut self) {
        self.drop_alignment();
        self.audio = None;
        self.score_id.clear();
        self.positions.clear();
        self.durations.clear();
        self.entries.reset(&[]);
    }

    fn drop_alignment(&mut self) {
        if self.state != SessionState::Idle {
            info!("Discarding the outstanding alignment..!");
            self.emit(SessionEvent::Rejected);
        }
        self.state = SessionState::Idle;
        self.accepted = None;
        self.pending.clear();
        self.entries.reset(&self.positions);
        self.tempo.clear();
    }

    pub fn begin_alignment(&mut self) -> AlignResult<RunId> {
        self.begin_partial_alignment(None, None, None, None)
    }

    /// Dispatches an alignment run restricted to a score range and an audio
    /// frame range. Open bounds are `None`.
    ///
    /// Only valid while idle. On a dispatch failure the session stays idle
    /// and nothing changes.
    pub fn begin_partial_alignment(
        &mut self,
        score_start: Option<Fraction>,
        score_end: Option<Fraction>,
        frame_start: Option<i64>,
        frame_end: Option<i64>,
    ) -> AlignResult<RunId> {
        self.require_idle("begin alignment")?;

        let Some(audio) = self.audio.clone() else {
            error!("Cannot align without audio..!");
            return Err(AlignError::NoAudio);
        };

        let chosen = self
            .plugin_id
            .clone()
            .or_else(|| self.plugins.default_choice().map(str::to_string));
        let Some(plugin_id) = chosen else {
            return Err(self.dispatch_failed(
                "<default>",
                DispatchFailure::NotFound,
                "no alignment plugin is available",
            ));
        };

        let Some(plugin) = self.plugins.get(&plugin_id) else {
            return Err(self.dispatch_failed(&plugin_id, DispatchFailure::NotFound, "no such plugin"));
        };

        let run = RunId(self.next_run);
        self.next_run += 1;

        let request = AlignmentRequest {
            run,
            score_program: self.score_id.clone(),
            score_range_start: score_start,
            score_range_end: score_end,
            audio_time_start: frame_bound_to_seconds(frame_start, audio.sample_rate),
            audio_time_end: frame_bound_to_seconds(frame_end, audio.sample_rate),
            audio,
        };

        info!(
            "Dispatching run {:?} to '{}': score {:?}..{:?}, frames {:?}..{:?}",
            run, plugin_id, score_start, score_end, frame_start, frame_end
        );

        match plugin.start(request, CompletionHandle::new(run, self.inbox_tx.clone())) {
            PluginOutcome::OnsetStream => {}
            PluginOutcome::WrongShape(reason) => {
                return Err(self.dispatch_failed(&plugin_id, DispatchFailure::WrongShape, reason));
            }
            PluginOutcome::InitError(reason) => {
                return Err(self.dispatch_failed(&plugin_id, DispatchFailure::InitFailed, reason));
            }
        }

        self.pending.clear();
        self.state = SessionState::AwaitingResult {
            run,
            bounds: FrameBounds {
                start: frame_start,
                end: frame_end,
            },
        };

        Ok(run)
    }

    fn dispatch_failed(
        &mut self,
        plugin: &str,
        kind: DispatchFailure,
        message: impl Into<String>,
    ) -> AlignError {
        let err = AlignError::dispatch(plugin, kind, message);
        error!("{}", err);
        self.emit(SessionEvent::FailedToRun(err.to_string()));
        err
    }

    /// Handles every message already waiting in the inbox.
    pub fn poll(&mut self) -> AlignResult<usize> {
        let mut handled = 0;
        while let Ok(msg) = self.inbox_rx.try_recv() {
            self.handle(msg)?;
            handled += 1;
        }
        Ok(handled)
    }

    /// Blocks until the outstanding run is ready for review, fails or is
    /// interrupted. Returns whether a result is ready for review.
    pub fn wait_for_result(&mut self, timeout: Option<Duration>) -> AlignResult<bool> {
        let deadline = timeout.map(|t| Instant::now() + t);

        while let SessionState::AwaitingResult { .. } = self.state {
            let msg = match deadline {
                Some(deadline) => {
                    let remaining = deadline.saturating_duration_since(Instant::now());
                    match self.inbox_rx.recv_timeout(remaining) {
                        Ok(msg) => msg,
                        Err(RecvTimeoutError::Timeout) => {
                            warn!("Timed out waiting for the alignment result..!");
                            return Ok(false);
                        }
                        Err(RecvTimeoutError::Disconnected) => return Ok(false),
                    }
                }
                None => match self.inbox_rx.recv() {
                    Ok(msg) => msg,
                    Err(_) => return Ok(false),
                },
            };
            self.handle(msg)?;
        }

        Ok(matches!(self.state, SessionState::ReadyForReview { .. }))
    }

    /// Applies one inbox message. Completions for any run other than the
    /// outstanding one are ignored.
    pub fn handle(&mut self, msg: SessionMsg) -> AlignResult<()> {
        match msg {
            SessionMsg::Completed { run, result } => {
                let SessionState::AwaitingResult {
                    run: current,
                    bounds,
                } = self.state
                else {
                    debug!("Ignoring completion of run {:?} while {}", run, self.state.name());
                    return Ok(());
                };
                if run != current {
                    debug!("Ignoring stale completion of run {:?}", run);
                    return Ok(());
                }

                match result {
                    Ok(mut onsets) => {
                        onsets.sort_by(|a, b| a.frame.cmp(&b.frame));
                        info!("Run {:?} is ready with {} onset(s)..!", run, onsets.len());
                        self.pending = onsets;
                        self.state = SessionState::ReadyForReview { run, bounds };
                        self.emit(SessionEvent::ReadyForReview);
                        self.refresh()
                    }
                    Err(reason) => {
                        warn!("Run {:?} failed: {}", run, reason);
                        self.pending.clear();
                        self.state = SessionState::Idle;
                        self.emit(SessionEvent::FailedToRun(reason));
                        self.refresh()
                    }
                }
            }
            SessionMsg::Interrupt => {
                if self.state == SessionState::Idle {
                    return Ok(());
                }
                warn!("Interrupted while {}, discarding the result..!", self.state.name());
                self.pending.clear();
                self.state = SessionState::Idle;
                self.emit(SessionEvent::Rejected);
                self.refresh()
            }
        }
    }

    /// Commits the reviewed result. A bounded run is spliced into the
    /// accepted timeline; a run with an open end replaces it.
    pub fn accept_alignment(&mut self) -> AlignResult<()> {
        let SessionState::ReadyForReview { run, bounds } = self.state else {
            return Err(self.invalid("accept alignment"));
        };

        let merged = self.preview(bounds);

        // Nothing is committed unless every label is in the score; the
        // result stays under review so it can still be rejected.
        let mut check = self.entries.clone();
        check.replace_frames(&merged)?;

        info!("Accepted run {:?}: {} onset(s)", run, merged.len());

        self.accepted = Some(merged);
        self.pending.clear();
        self.state = SessionState::Idle;
        self.emit(SessionEvent::Accepted);
        self.refresh()
    }

    pub fn reject_alignment(&mut self) -> AlignResult<()> {
        let SessionState::ReadyForReview { run, .. } = self.state else {
            return Err(self.invalid("reject alignment"));
        };

        info!("Rejected run {:?}", run);
        self.pending.clear();
        self.state = SessionState::Idle;
        self.emit(SessionEvent::Rejected);
        self.refresh()
    }

    /// Moves the accepted onset for `label` to `frame`.
    pub fn move_onset(&mut self, label: &str, frame: i64) -> AlignResult<()> {
        self.require_idle("move onset")?;

        let Some(onset) = self
            .accepted
            .as_mut()
            .and_then(|a| a.iter_mut().find(|o| o.label == label))
        else {
            error!("No aligned onset labelled {}..!", label);
            return Err(AlignError::Integrity(label.to_string()));
        };

        debug!("Moving {} from frame {} to {}", label, onset.frame, frame);
        onset.frame = frame;

        if let Some(accepted) = self.accepted.as_mut() {
            accepted.sort_by(|a, b| a.frame.cmp(&b.frame));
        }

        self.emit(SessionEvent::Modified);
        self.refresh()
    }

    /// Replaces the accepted timeline with one read from a CSV file. Every
    /// label is checked against the score before anything changes.
    pub fn import_alignment<P: AsRef<Path>>(&mut self, path: P) -> AlignResult<()> {
        self.require_idle("import alignment")?;
        let Some(audio) = &self.audio else {
            return Err(AlignError::NoAudio);
        };

        let mut onsets = import_alignment_csv(path.as_ref(), audio.sample_rate)?;
        onsets.sort_by(|a, b| a.frame.cmp(&b.frame));

        let mut check = self.entries.clone();
        check.replace_frames(&onsets)?;

        info!(
            "Imported {} onset(s) from {}",
            onsets.len(),
            path.as_ref().display()
        );

        self.accepted = Some(onsets);
        self.emit(SessionEvent::Accepted);
        self.refresh()
    }

    /// Writes the entry table as CSV. Returns the path written, which gets
    /// a `.csv` suffix if it had none.
    pub fn export_alignment<P: AsRef<Path>>(&self, path: P) -> AlignResult<PathBuf> {
        let Some(audio) = &self.audio else {
            return Err(AlignError::NoAudio);
        };
        export_alignment_csv(self.entries.entries(), audio.sample_rate, path.as_ref())
    }

    /// Resynchronizes the entry table with the displayed timeline and
    /// recomputes the tempo curve from it.
    fn refresh(&mut self) -> AlignResult<()> {
        let displayed = self.displayed();
        self.entries.replace_frames(&displayed)?;

        self.tempo = match &self.audio {
            Some(audio) => build_tempo_curve(self.entries.entries(), &self.durations, audio.sample_rate),
            None => Vec::new(),
        };

        Ok(())
    }

    fn require_idle(&self, operation: &'static str) -> AlignResult<()> {
        if self.state == SessionState::Idle {
            Ok(())
        } else {
            Err(self.invalid(operation))
        }
    }

    fn invalid(&self, operation: &'static str) -> AlignError {
        warn!("Cannot {} while {}..!", operation, self.state.name());
        AlignError::InvalidState {
            operation,
            state: self.state.name(),
        }
    }

    fn emit(&mut self, event: SessionEvent) {
        debug!("Session event: {:?}", event);
        self.subscribers.retain(|tx| tx.send(event.clone()).is_ok());
    }
}
