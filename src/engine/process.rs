use crate::engine::*;
use crate::error::{AlignError, AlignResult};
use crate::model::alignment::OnsetInstant;
use log::{debug, error, info, warn};
use serde::{Deserialize, Serialize};
use std::io::{BufRead, BufReader, Write};
use std::path::{Path, PathBuf};
use std::process::{Child, Command, Stdio};
use std::sync::Arc;
use std::thread;

/// One entry of the plugin manifest.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct ProcessPluginConfig {
    #[serde(flatten)]
    pub descriptor: PluginDescriptor,
    pub command: PathBuf,
    #[serde(default)]
    pub args: Vec<String>,
}

/// The JSON document sent to a plugin process on stdin.
#[derive(Serialize, Debug)]
#[serde(rename_all = "camelCase")]
struct WireRequest<'a> {
    #[serde(flatten)]
    request: &'a AlignmentRequest,
    parameters: std::collections::BTreeMap<&'static str, f64>,
}

/// Runs an external command per alignment request. The command reads one
/// JSON request from stdin and writes one `frame<TAB>label` line per onset.
#[derive(Debug, Clone)]
pub struct ProcessPlugin {
    config: ProcessPluginConfig,
}

impl ProcessPlugin {
    pub fn new(config: ProcessPluginConfig) -> Self {
        Self { config }
    }

    fn spawn(&self) -> std::io::Result<Child> {
        Command::new(&self.config.command)
            .args(&self.config.args)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::inherit())
            .spawn()
    }
}

impl AlignmentPlugin for ProcessPlugin {
    fn descriptor(&self) -> &PluginDescriptor {
        &self.config.descriptor
    }

    fn start(&self, request: AlignmentRequest, completion: CompletionHandle) -> PluginOutcome {
        let id = self.config.descriptor.id.clone();

        if !self.config.descriptor.produces_onsets() {
            return PluginOutcome::WrongShape(format!(
                "output '{}' is not '{}'",
                self.config.descriptor.output, ONSET_OUTPUT
            ));
        }

        let payload = match serde_json::to_vec(&WireRequest {
            parameters: request.parameters(),
            request: &request,
        }) {
            Ok(p) => p,
            Err(e) => return PluginOutcome::InitError(format!("cannot encode request: {}", e)),
        };

        let child = match self.spawn() {
            Ok(c) => c,
            Err(e) => {
                error!("Failed to start plugin '{}': {}", id, e);
                return PluginOutcome::InitError(e.to_string());
            }
        };

        info!("Plugin '{}' started for run {:?}..!", id, completion.run());

        let spawned = thread::Builder::new()
            .name(format!("plugin-{}", id))
            .spawn(move || match run_to_completion(child, &payload) {
                Ok(onsets) => {
                    debug!("Plugin '{}' produced {} onset(s)", id, onsets.len());
                    completion.complete(onsets);
                }
                Err(reason) => {
                    warn!("Plugin '{}' failed: {}", id, reason);
                    completion.fail(reason);
                }
            });

        match spawned {
            Ok(_) => PluginOutcome::OnsetStream,
            Err(e) => PluginOutcome::InitError(format!("cannot start worker thread: {}", e)),
        }
    }
}

fn run_to_completion(mut child: Child, payload: &[u8]) -> Result<Vec<OnsetInstant>, String> {
    let exchanged = exchange(&mut child, payload);

    if let Err(reason) = &exchanged {
        debug!("Stopping plugin process after: {}", reason);
        if let Err(e) = child.kill() {
            debug!("Plugin process already gone: {}", e);
        }
    }

    let status = child.wait().map_err(|e| format!("cannot wait for plugin: {}", e))?;
    let mut onsets = exchanged?;

    if !status.success() {
        return Err(format!("plugin exited with {}", status));
    }

    onsets.sort_by(|a, b| a.frame.cmp(&b.frame));
    Ok(onsets)
}

/// Sends the request and collects the reply. The child is always waited
/// on by the caller, whatever this returns.
fn exchange(child: &mut Child, payload: &[u8]) -> Result<Vec<OnsetInstant>, String> {
    if let Some(mut stdin) = child.stdin.take() {
        stdin
            .write_all(payload)
            .map_err(|e| format!("cannot send request: {}", e))?;
    }

    let Some(stdout) = child.stdout.take() else {
        return Err("plugin has no output stream".to_string());
    };

    let mut onsets = Vec::new();
    for (n, line) in BufReader::new(stdout).lines().enumerate() {
        let line = line.map_err(|e| format!("cannot read output: {}", e))?;
        if line.trim().is_empty() {
            continue;
        }
        match parse_onset_line(&line) {
            Some(onset) => onsets.push(onset),
            None => return Err(format!("output line {} is not 'frame<TAB>label': {}", n + 1, line)),
        }
    }

    Ok(onsets)
}

fn parse_onset_line(line: &str) -> Option<OnsetInstant> {
    let (frame, label) = line.split_once('\t')?;
    let frame = frame.trim().parse::<i64>().ok()?;
    let label = label.trim();
    if label.is_empty() {
        return None;
    }
    Some(OnsetInstant::new(frame, label))
}

/// Reads a JSON array of plugin entries into a registry.
pub fn load_manifest<P: AsRef<Path>>(path: P) -> AlignResult<PluginRegistry> {
    let path = path.as_ref();
    let text = std::fs::read_to_string(path).map_err(|e| AlignError::io(path, e))?;

    let configs: Vec<ProcessPluginConfig> =
        serde_json::from_str(&text).map_err(|e| AlignError::Format {
            path: path.to_path_buf(),
            line: e.line(),
            message: e.to_string(),
        })?;

    let mut registry = PluginRegistry::new();
    for config in configs {
        registry.register(Arc::new(ProcessPlugin::new(config)));
    }

    Ok(registry)
}

#[cfg(test)]
mod test {
    use super::*;
    use std::fs;
    use std::sync::mpsc;
    use std::time::Duration;

    fn config(command: &str, args: &[&str], output: &str) -> ProcessPluginConfig {
        ProcessPluginConfig {
            descriptor: PluginDescriptor {
                id: "test:plugin".into(),
                name: "Test plugin".into(),
                output: output.into(),
            },
            command: command.into(),
            args: args.iter().map(|a| a.to_string()).collect(),
        }
    }

    fn request() -> AlignmentRequest {
        AlignmentRequest {
            run: RunId(1),
            score_program: "piece".into(),
            score_range_start: None,
            score_range_end: None,
            audio_time_start: None,
            audio_time_end: None,
            audio: AudioSource {
                path: "take.wav".into(),
                sample_rate: 44100.0,
            },
        }
    }

    #[test]
    fn parses_onset_lines() {
        assert_eq!(parse_onset_line("4410\t1+1/4"), Some(OnsetInstant::new(4410, "1+1/4")));
        assert_eq!(parse_onset_line("x\t1+1/4"), None);
        assert_eq!(parse_onset_line("4410 1+1/4"), None);
        assert_eq!(parse_onset_line("4410\t"), None);
    }

    #[test]
    fn manifest_loads_into_registry() {
        env_logger::try_init().unwrap_or(());

        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("plugins.json");
        fs::write(
            &path,
            r#"[
                {"id": "vamp:aligner", "name": "Aligner", "output": "chordonsets", "command": "/usr/bin/aligner"},
                {"id": "vamp:tempo", "output": "tempo", "command": "tempo", "args": ["-q"]}
            ]"#,
        )
        .unwrap();

        let registry = load_manifest(&path).unwrap();
        assert_eq!(registry.descriptors().count(), 2);
        assert_eq!(default_choice(&registry).as_deref(), Some("vamp:aligner"));
    }

    #[test]
    fn broken_manifest_is_a_format_error() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("plugins.json");
        fs::write(&path, "[{\"id\": 3}]").unwrap();

        assert!(matches!(load_manifest(&path), Err(AlignError::Format { .. })));
    }

    #[test]
    fn wrong_output_is_refused_before_spawning() {
        let plugin = ProcessPlugin::new(config("/nonexistent/plugin", &[], "tempo"));
        let (tx, _rx) = mpsc::channel();

        let outcome = plugin.start(request(), CompletionHandle::new(RunId(1), tx));
        assert!(matches!(outcome, PluginOutcome::WrongShape(_)));
    }

    #[test]
    fn missing_command_is_an_init_error() {
        env_logger::try_init().unwrap_or(());

        let plugin = ProcessPlugin::new(config("/nonexistent/plugin", &[], ONSET_OUTPUT));
        let (tx, _rx) = mpsc::channel();

        let outcome = plugin.start(request(), CompletionHandle::new(RunId(1), tx));
        assert!(matches!(outcome, PluginOutcome::InitError(_)));
    }

    #[cfg(unix)]
    #[test]
    fn shell_plugin_completes_through_channel() {
        env_logger::try_init().unwrap_or(());

        let script = "cat > /dev/null; printf '2205\\t1+1/4\\n0\\t1+0/1\\n'";
        let plugin = ProcessPlugin::new(config("sh", &["-c", script], ONSET_OUTPUT));
        let (tx, rx) = mpsc::channel();

        let outcome = plugin.start(request(), CompletionHandle::new(RunId(9), tx));
        assert_eq!(outcome, PluginOutcome::OnsetStream);

        let msg = rx.recv_timeout(Duration::from_secs(10)).unwrap();
        assert_eq!(
            msg,
            SessionMsg::Completed {
                run: RunId(9),
                result: Ok(vec![OnsetInstant::new(0, "1+0/1"), OnsetInstant::new(2205, "1+1/4")]),
            }
        );
    }

    #[cfg(unix)]
    #[test]
    fn unreadable_output_stops_the_process() {
        env_logger::try_init().unwrap_or(());

        // Invalid UTF-8, then a long sleep that only a kill cuts short.
        let script = "cat > /dev/null; printf '\\377\\n'; sleep 30";
        let plugin = ProcessPlugin::new(config("sh", &["-c", script], ONSET_OUTPUT));
        let (tx, rx) = mpsc::channel();

        let started = std::time::Instant::now();
        plugin.start(request(), CompletionHandle::new(RunId(4), tx));

        match rx.recv_timeout(Duration::from_secs(20)).unwrap() {
            SessionMsg::Completed { run, result: Err(reason) } => {
                assert_eq!(run, RunId(4));
                assert!(reason.contains("cannot read output"), "{}", reason);
            }
            other => panic!("expected failure, got {:?}", other),
        }
        assert!(started.elapsed() < Duration::from_secs(20));
    }

    #[cfg(unix)]
    #[test]
    fn failing_process_reports_failure() {
        env_logger::try_init().unwrap_or(());

        let plugin = ProcessPlugin::new(config("sh", &["-c", "cat > /dev/null; exit 3"], ONSET_OUTPUT));
        let (tx, rx) = mpsc::channel();

        plugin.start(request(), CompletionHandle::new(RunId(2), tx));

        match rx.recv_timeout(Duration::from_secs(10)).unwrap() {
            SessionMsg::Completed { run, result: Err(_) } => assert_eq!(run, RunId(2)),
            other => panic!("expected failure, got {:?}", other),
        }
    }
}
