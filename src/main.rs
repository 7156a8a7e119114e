use anyhow::{Context, Result, bail};
use clap::Parser;
use log::{debug, info, warn};
use score_align::{
    AlignArgs, AlignmentPlugins, AlignmentSession, Args, AudioSource, BuildScoreArgs, Command,
    SessionMsg, TempoSample, frame_to_seconds, generate_score_files, list_available, load_manifest,
    parse_frame_bound, read_score_files,
};
use std::fs;
use std::path::Path;
use std::time::Duration;

fn main() -> Result<()> {
    env_logger::init();
    let args = Args::parse();

    match args.command {
        Command::BuildScore(build) => build_score(build),
        Command::ListPlugins { plugins } => list_plugins(&plugins),
        Command::Align(align) => run_alignment(align),
    }
}

fn build_score(args: BuildScoreArgs) -> Result<()> {
    info!("Building score '{}' from '{}'...", args.name, args.timemap.display());

    let files = generate_score_files(&args.timemap, &args.score_dir, &args.name, args.pickup)
        .with_context(|| format!("Failed to build score '{}'", args.name))?;

    println!("{}", files.meter_path.display());
    println!("{}", files.solo_path.display());
    Ok(())
}

fn list_plugins(manifest: &Path) -> Result<()> {
    let registry = load_manifest(manifest)
        .with_context(|| format!("Failed to load plugin manifest '{}'", manifest.display()))?;

    let available = list_available(&registry);
    if available.is_empty() {
        warn!("No alignment plugins in '{}'..!", manifest.display());
    }

    for (i, plugin) in available.iter().enumerate() {
        let marker = if i == 0 { " (default)" } else { "" };
        println!("{}\t{}{}", plugin.id, plugin.name, marker);
    }
    Ok(())
}

fn run_alignment(args: AlignArgs) -> Result<()> {
    let timeline = read_score_files(&args.score_dir, &args.name)
        .with_context(|| format!("Failed to read score '{}'", args.name))?;
    let registry = load_manifest(&args.plugins)
        .with_context(|| format!("Failed to load plugin manifest '{}'", args.plugins.display()))?;

    let mut session = AlignmentSession::new(AlignmentPlugins::new(registry));
    session.set_audio(AudioSource {
        path: args.audio.clone(),
        sample_rate: args.sample_rate,
    });
    session.set_score(args.name.as_str(), &timeline);
    session.set_alignment_plugin(args.plugin.clone());

    if let Some(previous) = &args.previous {
        session
            .import_alignment(previous)
            .with_context(|| format!("Failed to import '{}'", previous.display()))?;
    }

    let inbox = session.inbox();
    ctrlc::set_handler(move || {
        warn!("Ctrl-C received, discarding the alignment run..!");
        let _ = inbox.send(SessionMsg::Interrupt);
    })
    .context("Error setting Ctrl-C handler..!")?;

    let run = session.begin_partial_alignment(
        args.score_start,
        args.score_end,
        parse_frame_bound(args.frame_start),
        parse_frame_bound(args.frame_end),
    )?;

    info!("Waiting for run {:?}...", run);
    if !session.wait_for_result(args.timeout.map(Duration::from_secs))? {
        bail!("Alignment run {:?} produced no result..!", run);
    }

    if args.dry_run {
        let displayed = session.displayed();
        info!("Previewing at most {} of {} onsets..!", args.dry_run_max, displayed.len());
        for onset in displayed.iter().take(args.dry_run_max) {
            println!(
                "{}\t{:.3}\t{}",
                onset.label,
                frame_to_seconds(onset.frame, args.sample_rate),
                onset.frame
            );
        }
        session.reject_alignment()?;
        return Ok(());
    }

    session.accept_alignment()?;

    let written = session.export_alignment(&args.output)?;
    println!("{}", written.display());

    if let Some(tempo_path) = &args.tempo {
        write_tempo(tempo_path, session.tempo_curve(), args.sample_rate)?;
        println!("{}", tempo_path.display());
    }

    Ok(())
}

fn write_tempo(path: &Path, curve: &[TempoSample], sample_rate: f64) -> Result<()> {
    let text: String = curve
        .iter()
        .map(|s| {
            format!(
                "{}\t{}\t{:.3}\n",
                s.frame,
                frame_to_seconds(s.frame, sample_rate),
                s.bpm
            )
        })
        .collect();

    fs::write(path, text).with_context(|| format!("Failed to write tempo to '{}'", path.display()))?;
    debug!("Wrote {} tempo samples..!", curve.len());
    Ok(())
}
