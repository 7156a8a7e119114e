use crate::model::fraction::Fraction;
use clap::{Parser, Subcommand};
use std::path::PathBuf;

#[derive(Parser, Debug)]
#[command(
    name = "score_align",
    about = "Align a music score against a recorded performance."
)]
pub struct Args {
    #[command(subcommand)]
    pub command: Command,
}

#[derive(Subcommand, Debug)]
pub enum Command {
    /// Build the `.meter` and `.solo` score files from an engraving timemap.
    BuildScore(BuildScoreArgs),

    /// List the installed plugins that can align a score.
    ListPlugins {
        /// Path to the JSON plugin manifest.
        #[arg(short, long)]
        plugins: PathBuf,
    },

    /// Run an alignment and write the result as CSV.
    Align(AlignArgs),
}

#[derive(clap::Args, Debug)]
pub struct BuildScoreArgs {
    /// Path to the timemap JSON.
    pub timemap: PathBuf,

    /// Directory the score files are written into.
    #[arg(short = 'd', long)]
    pub score_dir: PathBuf,

    /// Base name of the score files.
    #[arg(short = 'n', long)]
    pub name: String,

    /// Treat the first measure as a pickup even if the timemap does not say so.
    #[arg(long, default_value_t = false)]
    pub pickup: bool,
}

#[derive(clap::Args, Debug)]
pub struct AlignArgs {
    /// Directory holding the score files.
    #[arg(short = 'd', long)]
    pub score_dir: PathBuf,

    /// Base name of the score files, also sent to the plugin as the score id.
    #[arg(short = 'n', long)]
    pub name: String,

    /// The recording to align against.
    #[arg(short, long)]
    pub audio: PathBuf,

    /// Sample rate of the recording, in Hz.
    #[arg(short = 'r', long, default_value_t = 44100.0)]
    pub sample_rate: f64,

    /// Path to the JSON plugin manifest.
    #[arg(short, long)]
    pub plugins: PathBuf,

    /// Plugin id to use. Defaults to the first alignment-capable plugin.
    #[arg(long)]
    pub plugin: Option<String>,

    /// First score position to align, as a fraction of whole notes (e.g. `9/4`).
    #[arg(long)]
    pub score_start: Option<Fraction>,

    /// Score position to stop aligning at.
    #[arg(long)]
    pub score_end: Option<Fraction>,

    /// First audio frame to align. -1 leaves it open.
    #[arg(long, default_value_t = -1, allow_hyphen_values = true)]
    pub frame_start: i64,

    /// Audio frame to stop aligning at. -1 leaves it open.
    #[arg(long, default_value_t = -1, allow_hyphen_values = true)]
    pub frame_end: i64,

    /// A previously exported alignment to splice the new result into.
    #[arg(short = 'i', long)]
    pub previous: Option<PathBuf>,

    /// Where to write the alignment CSV.
    #[arg(short, long)]
    pub output: PathBuf,

    /// Also write the tempo curve as `frame<TAB>seconds<TAB>bpm` lines.
    #[arg(long)]
    pub tempo: Option<PathBuf>,

    /// Give up waiting for the plugin after N seconds.
    #[arg(long)]
    pub timeout: Option<u64>,

    /// Print the first dry_run_max onsets of the result, then reject it.
    #[arg(long, default_value_t = false)]
    pub dry_run: bool,

    /// Maximum onsets to print in dry run.
    #[arg(long, default_value_t = 40)]
    pub dry_run_max: usize,
}

#[cfg(test)]
mod test {
    use super::*;
    use clap::CommandFactory;

    #[test]
    fn flags_do_not_collide() {
        Args::command().debug_assert();
    }

    #[test]
    fn align_parses_short_flags() {
        let args = Args::try_parse_from([
            "score_align", "align", "-d", "scores", "-n", "waltz", "-a", "take.wav", "-p",
            "plugins.json", "-i", "prev.csv", "-o", "out.csv", "--frame-start", "-1",
            "--score-start", "3/4",
        ])
        .unwrap();

        let Command::Align(align) = args.command else {
            panic!("expected the align command");
        };
        assert_eq!(align.plugins, PathBuf::from("plugins.json"));
        assert_eq!(align.previous, Some(PathBuf::from("prev.csv")));
        assert_eq!(align.frame_start, -1);
        assert_eq!(align.score_start, Some(Fraction::new(3, 4).unwrap()));
    }
}
