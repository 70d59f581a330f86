use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use indicatif::ProgressBar;
use std::path::PathBuf;
use vidloop::config::AppConfig;
use vidloop::engine::{Engine, FfmpegEngine};
use vidloop::sampler::SamplerSettings;
use vidloop::search::SearchParams;
use vidloop::{LoopError, LoopPoint, LoopRequest, PointSource};

#[derive(Parser)]
#[command(name = "vidloop", version, about = "Seamless video loop maker")]
struct Cli {
    /// Path to a config file (defaults to the XDG config dir)
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    /// Verbosity (-v, -vv, -vvv)
    #[arg(short, long, action = clap::ArgAction::Count, global = true)]
    verbose: u8,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Create a seamless loop, finding loop points automatically unless given
    Create {
        /// Input video
        file: PathBuf,

        /// Loop start in seconds (requires --end)
        #[arg(short, long, requires = "end")]
        start: Option<f64>,

        /// Loop end in seconds (requires --start)
        #[arg(short, long, requires = "start")]
        end: Option<f64>,

        /// Output path (defaults to <input>_loop.<ext>)
        #[arg(short, long)]
        output: Option<PathBuf>,

        /// Crossfade duration in seconds
        #[arg(long)]
        crossfade: Option<f64>,

        /// Seconds from the start of the video to search
        #[arg(long)]
        window: Option<f64>,

        /// Minimum similarity score for a match (0-1)
        #[arg(long)]
        threshold: Option<f64>,

        /// Print the ffmpeg command without rendering
        #[arg(long)]
        dry_run: bool,
    },

    /// Search for loop points without rendering
    Find {
        /// Input video
        file: PathBuf,

        /// Seconds from the start of the video to search
        #[arg(long)]
        window: Option<f64>,

        /// Minimum similarity score for a match (0-1)
        #[arg(long)]
        threshold: Option<f64>,
    },
}

fn main() -> Result<()> {
    let cli = Cli::parse();

    // Set up logging based on verbosity
    let log_level = match cli.verbose {
        0 => "warn",
        1 => "info",
        2 => "debug",
        _ => "trace",
    };
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or(log_level))
        .format_timestamp(None)
        .init();

    // Config file is optional: explicit path > XDG default > built-in defaults
    let config = match &cli.config {
        Some(path) => AppConfig::load_from(path),
        None => AppConfig::load(),
    };

    let engine = FfmpegEngine::new(&config.engine);
    engine
        .check()
        .context("ffmpeg is required. Install it and make sure it is on your PATH")?;

    match cli.command {
        Commands::Create {
            file,
            start,
            end,
            output,
            crossfade,
            window,
            threshold,
            dry_run,
        } => {
            let manual = match (start, end) {
                (Some(s), Some(e)) => Some(LoopPoint::new(s, e)),
                _ => None,
            };
            let request = LoopRequest {
                input: file,
                output,
                manual,
                crossfade,
                search_window: window,
                threshold,
                progress: cli.verbose == 0,
            };

            if dry_run {
                let plan = vidloop::pipeline::plan_loop(&engine, &request, &config)
                    .context("Loop planning failed")?;
                print_origin(plan.origin, plan.spec.start(), plan.spec.end());
                println!("{}", engine.render_command_line(&plan.job));
                return Ok(());
            }

            let (plan, path) = vidloop::pipeline::create_loop(&engine, &request, &config)
                .context("Loop creation failed")?;
            print_origin(plan.origin, plan.spec.start(), plan.spec.end());
            println!(
                "Created seamless loop: {} ({:.2}s)",
                path.display(),
                plan.spec.duration() - plan.spec.crossfade()
            );
        }

        Commands::Find {
            file,
            window,
            threshold,
        } => {
            let info = engine
                .probe(&file)
                .map_err(LoopError::Probe)
                .context("Loop search failed")?;

            let search = config
                .search
                .with_overrides(window, threshold)
                .context("Invalid search settings")?;
            let settings = SamplerSettings::from(&search);
            let params = SearchParams::from(&search);

            let found = vidloop::pipeline::find_loop_points(
                &engine,
                &file,
                info.duration,
                &settings,
                &params,
                &ProgressBar::hidden(),
            )
            .context("Loop search failed")?;

            match found {
                Some(m) => {
                    println!("{:.2} {:.2} {:.4}", m.point.start, m.point.end, m.score);
                }
                None => {
                    println!(
                        "{}",
                        LoopError::NotFound {
                            window: settings.window_for(info.duration),
                        }
                    );
                }
            }
        }
    }

    Ok(())
}

fn print_origin(origin: PointSource, start: f64, end: f64) {
    match origin {
        PointSource::Manual => println!("Loop points: {:.2}s -> {:.2}s (manual)", start, end),
        PointSource::Search { score } => println!(
            "Loop points: {:.2}s -> {:.2}s (similarity {:.4})",
            start, end, score
        ),
    }
}
