use crate::model::alignment::OnsetInstant;
use crate::model::fraction::Fraction;
use crate::util::{UNBOUNDED, score_bound_pair};
use log::{debug, info};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::PathBuf;
use std::sync::mpsc::Sender;
use std::sync::{Arc, OnceLock};

pub mod process;

/// Output name of plugins that produce labelled chord onsets.
pub const ONSET_OUTPUT: &str = "chordonsets";

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
pub struct PluginDescriptor {
    pub id: String,
    #[serde(default)]
    pub name: String,
    pub output: String,
}

impl PluginDescriptor {
    pub fn produces_onsets(&self) -> bool {
        self.output == ONSET_OUTPUT
    }
}

/// Identifies one dispatched alignment run, so a late completion from a
/// discarded run can be told apart from the current one.
#[derive(Serialize, Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct RunId(pub u64);

#[derive(Serialize, Debug, Clone, PartialEq)]
pub struct AudioSource {
    pub path: PathBuf,
    pub sample_rate: f64,
}

#[derive(Serialize, Debug, Clone, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct AlignmentRequest {
    pub run: RunId,
    pub score_program: String,
    pub score_range_start: Option<Fraction>,
    pub score_range_end: Option<Fraction>,
    pub audio_time_start: Option<f64>,
    pub audio_time_end: Option<f64>,
    pub audio: AudioSource,
}

impl AlignmentRequest {
    /// Plugin parameters, with every open bound encoded as `-1`.
    pub fn parameters(&self) -> BTreeMap<&'static str, f64> {
        let (start_num, start_den) = score_bound_pair(self.score_range_start);
        let (end_num, end_den) = score_bound_pair(self.score_range_end);
        let unbounded = UNBOUNDED as f64;

        BTreeMap::from([
            ("score-position-start-numerator", start_num as f64),
            ("score-position-start-denominator", start_den as f64),
            ("score-position-end-numerator", end_num as f64),
            ("score-position-end-denominator", end_den as f64),
            ("audio-start", self.audio_time_start.unwrap_or(unbounded)),
            ("audio-end", self.audio_time_end.unwrap_or(unbounded)),
        ])
    }
}

/// Messages delivered to an `AlignmentSession` from other threads.
#[derive(Debug, Clone, PartialEq)]
pub enum SessionMsg {
    Completed {
        run: RunId,
        result: Result<Vec<OnsetInstant>, String>,
    },
    /// Drop whatever run is outstanding.
    Interrupt,
}

/// Handed to a plugin with each request; consumed when the run finishes.
#[derive(Debug)]
pub struct CompletionHandle {
    run: RunId,
    tx: Sender<SessionMsg>,
}

impl CompletionHandle {
    pub fn new(run: RunId, tx: Sender<SessionMsg>) -> Self {
        Self { run, tx }
    }

    pub fn run(&self) -> RunId {
        self.run
    }

    pub fn complete(self, onsets: Vec<OnsetInstant>) {
        self.send(Ok(onsets));
    }

    pub fn fail(self, reason: impl Into<String>) {
        self.send(Err(reason.into()));
    }

    fn send(self, result: Result<Vec<OnsetInstant>, String>) {
        let run = self.run;
        if self.tx.send(SessionMsg::Completed { run, result }).is_err() {
            debug!("Session went away before run {:?} completed", run);
        }
    }
}

/// What a plugin says when asked to start a run.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PluginOutcome {
    /// The run is under way; onsets arrive through the completion handle.
    OnsetStream,
    /// The plugin ran but does not produce labelled time instants.
    WrongShape(String),
    /// The plugin could not be started.
    InitError(String),
}

pub trait AlignmentPlugin: Send + Sync {
    fn descriptor(&self) -> &PluginDescriptor;

    /// Starts a run and returns without waiting for it. The plugin may call
    /// `completion` from any thread, including before `start` returns.
    fn start(&self, request: AlignmentRequest, completion: CompletionHandle) -> PluginOutcome;
}

#[derive(Clone, Default)]
pub struct PluginRegistry {
    plugins: Vec<Arc<dyn AlignmentPlugin>>,
}

impl PluginRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&mut self, plugin: Arc<dyn AlignmentPlugin>) {
        debug!("Registered plugin '{}'", plugin.descriptor().id);
        self.plugins.push(plugin);
    }

    pub fn get(&self, id: &str) -> Option<Arc<dyn AlignmentPlugin>> {
        self.plugins
            .iter()
            .find(|p| p.descriptor().id == id)
            .cloned()
    }

    pub fn descriptors(&self) -> impl Iterator<Item = &PluginDescriptor> {
        self.plugins.iter().map(|p| p.descriptor())
    }
}

/// Installed plugins that can align a score, in registry order.
pub fn list_available(registry: &PluginRegistry) -> Vec<PluginDescriptor> {
    registry
        .descriptors()
        .filter(|d| {
            debug!("Looking at plugin '{}' with output '{}'", d.id, d.output);
            d.produces_onsets()
        })
        .cloned()
        .collect()
}

pub fn default_choice(registry: &PluginRegistry) -> Option<String> {
    list_available(registry).into_iter().next().map(|d| d.id)
}

/// A registry plus the lazily computed list of its alignment-capable
/// plugins. The list is computed once, on first query, from any thread.
pub struct AlignmentPlugins {
    registry: PluginRegistry,
    available: OnceLock<Vec<PluginDescriptor>>,
}

impl AlignmentPlugins {
    pub fn new(registry: PluginRegistry) -> Self {
        Self {
            registry,
            available: OnceLock::new(),
        }
    }

    pub fn list_available(&self) -> &[PluginDescriptor] {
        self.available.get_or_init(|| {
            let found = list_available(&self.registry);
            info!("Found {} alignment plugin(s)", found.len());
            found
        })
    }

    pub fn default_choice(&self) -> Option<&str> {
        self.list_available().first().map(|d| d.id.as_str())
    }

    pub fn get(&self, id: &str) -> Option<Arc<dyn AlignmentPlugin>> {
        self.registry.get(id)
    }
}
