use std::fmt::Write;
use std::fs::File;
use std::path::{Path, PathBuf, absolute};
use std::sync::LazyLock;

use anyhow::{Context, Result, bail};
use clap::builder::styling::Styles;
use clap::{Args, ColorChoice, Parser, Subcommand, ValueEnum, crate_version};
use clap_cargo::style::{ERROR, HEADER, INVALID, LITERAL, PLACEHOLDER, USAGE, VALID};
use strum::Display;
use sys_locale::get_locale;
use tracing::level_filters::LevelFilter;
use tracing::{Level, debug, info, instrument, warn};
use tracing_subscriber::fmt::format::FmtSpan;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::{Layer, Registry, fmt};
use trackpipe::api::trackpoints_response;
use trackpipe::measure::{Kilometers, KilometersPerHour, Meters, Seconds};
use trackpipe::pipeline::{PipelineFailure, ProcessOutput, process_bytes};
use trackpipe::stats::StatsOptions;
use trackpipe::validate::{ValidationOptions, validate};
use trackpipe::worker::{ProcessEvent, Processor};
use trackpipe::{
    ProcessingContext, SimplificationLevel, TrackPipeError, TrackStatistics, ValidationError,
};

pub const CLAP_STYLING: Styles = Styles::styled()
    .header(HEADER)
    .usage(USAGE)
    .literal(LITERAL)
    .placeholder(PLACEHOLDER)
    .error(ERROR)
    .valid(VALID)
    .invalid(INVALID);

static LONG_VERSION: LazyLock<String> =
    LazyLock::new(|| format!("{} (rustc {})", crate_version!(), env!("RUSTC_VERSION")));

/// Validate, summarize and simplify GPS tracks
///
/// Reads GPX, KML, TCX and FIT track files, computes distance, elevation,
/// time and speed statistics, and produces simplified GeoJSON for map
/// display.
#[derive(Parser)]
#[command(
    name = "trackpipe",
    version,
    long_version = LONG_VERSION.as_str(),
    about,
    color = ColorChoice::Auto,
    styles = CLAP_STYLING,
)]
struct Cli {
    #[command(subcommand)]
    cmd: Commands,

    /// Configure diagnostic logging level
    ///
    /// Set to DEBUG to see a performance summary following execution, but be
    /// aware this has a non-negligible performance impact on debug builds.
    #[clap(long, short = 'L', default_value_t = Level::ERROR)]
    log_level: Level,

    /// Log to a file
    #[clap(long)]
    log_file: Option<PathBuf>,

    /// The unit of distance used in output on the command line.
    ///
    /// If unspecified, this will default to either km or mi based on your
    /// system locale.
    #[clap(long, short = 'u', default_value_t = DistUnit::Autodetect)]
    distance_unit: DistUnit,

    /// Maximum accepted input size, in bytes
    #[clap(long, global = true, default_value_t = trackpipe::validate::DEFAULT_MAX_SIZE_BYTES)]
    max_size: u64,
}

#[derive(Copy, Clone, Display, ValueEnum)]
#[strum(serialize_all = "kebab-case")]
#[clap(rename_all = "kebab-case")]
enum DistUnit {
    Autodetect,
    Km,
    Mi,
}

impl DistUnit {
    fn get(self) -> DistUnit {
        match self {
            Self::Autodetect => Self::auto_detect(),
            _ => self,
        }
    }

    fn auto_detect() -> DistUnit {
        let locale = get_locale().unwrap_or_else(|| String::from("en-US"));
        match locale.as_str() {
            "en-US" | "en-GB" => Self::Mi,
            _ => Self::Km,
        }
    }

    fn distance(self, d: Kilometers<f64>) -> String {
        match self {
            Self::Mi => format!("{:.2} mi", d.0 * MI_PER_KM),
            _ => format!("{:.2} km", d.0),
        }
    }

    fn elevation(self, e: Meters<f64>) -> String {
        match self {
            Self::Mi => format!("{:.0} ft", e.0 * FT_PER_M),
            _ => format!("{:.0} m", e.0),
        }
    }

    fn speed(self, s: KilometersPerHour<f64>) -> String {
        match self {
            Self::Mi => format!("{:.1} mph", s.0 * MI_PER_KM),
            _ => format!("{:.1} km/h", s.0),
        }
    }
}

const MI_PER_KM: f64 = 0.621_371_192;
const FT_PER_M: f64 = 3.280_839_895;

#[derive(Copy, Clone, Debug, Display, ValueEnum)]
#[strum(serialize_all = "lowercase")]
#[clap(rename_all = "lowercase")]
enum LevelArg {
    High,
    Medium,
    Low,
    None,
}

impl From<LevelArg> for SimplificationLevel {
    fn from(level: LevelArg) -> Self {
        match level {
            LevelArg::High => SimplificationLevel::High,
            LevelArg::Medium => SimplificationLevel::Medium,
            LevelArg::Low => SimplificationLevel::Low,
            LevelArg::None => SimplificationLevel::None,
        }
    }
}

#[derive(Args, Debug)]
struct InputArgs {
    /// Track file path (.gpx, .kml, .tcx or .fit)
    input: PathBuf,
}

#[derive(Args, Debug)]
struct StatsArgs {
    #[command(flatten)]
    input: InputArgs,

    /// Print the statistics as JSON
    #[clap(long, action)]
    json: bool,

    /// Segment speed in km/h at or below which time counts as stopped
    #[clap(long, default_value_t = 1.0)]
    stopped_threshold: f64,

    /// Fail if any point lacks a timestamp
    #[clap(long, action)]
    require_timestamps: bool,

    /// Ignore elevation changes smaller than this many meters
    #[clap(long)]
    elevation_hysteresis: Option<f64>,
}

#[derive(Args, Debug)]
struct GeojsonArgs {
    #[command(flatten)]
    input: InputArgs,

    /// Simplification level
    #[clap(long, short, default_value_t = LevelArg::Medium)]
    level: LevelArg,

    /// Output path.  If unspecified, GeoJSON is written to stdout.
    #[clap(long, short)]
    output: Option<PathBuf>,

    /// Force overwriting the output file, if it already exists.
    #[clap(long, short, action)]
    force: bool,
}

#[derive(Args, Debug)]
struct TrackpointsArgs {
    #[command(flatten)]
    input: InputArgs,

    /// Points per page
    #[clap(long)]
    limit: Option<String>,

    /// Page number, starting from 1
    #[clap(long)]
    page: Option<String>,

    /// Only points timestamped within START,END (RFC 3339)
    #[clap(long)]
    time_range: Option<String>,
}

#[derive(Args, Debug)]
struct ProcessArgs {
    /// Track file paths, processed concurrently
    #[clap(required = true)]
    inputs: Vec<PathBuf>,

    /// Simplification level
    #[clap(long, short, default_value_t = LevelArg::Medium)]
    level: LevelArg,

    /// Print one JSON result per input
    #[clap(long, action)]
    json: bool,
}

#[derive(Subcommand)]
enum Commands {
    /// Check that a file looks like a supported track file
    ///
    /// Checks the extension, the size and the leading content without parsing
    /// the whole file.
    Validate(InputArgs),

    /// Print distance, elevation, time and speed statistics for a track
    Stats(StatsArgs),

    /// Write a track as simplified GeoJSON
    Geojson(GeojsonArgs),

    /// List a page of a track's raw points as JSON
    Trackpoints(TrackpointsArgs),

    /// Process several track files in the background, reporting progress
    Process(ProcessArgs),
}

fn context_for(args: &Cli) -> ProcessingContext {
    ProcessingContext::default()
        .with_validation(ValidationOptions::default().with_max_size_bytes(args.max_size))
}

fn read_input(path: &Path) -> Result<Vec<u8>> {
    let bytes = std::fs::read(path)
        .context("Reading the <INPUT> file. Check that it exists and can be accessed.")?;
    info!("Read {} bytes from {:?}", bytes.len(), absolute(path)?);
    Ok(bytes)
}

fn file_name(path: &Path) -> String {
    path.file_name()
        .map(|name| name.to_string_lossy().into_owned())
        .unwrap_or_default()
}

/// Runs the pipeline in this thread, attaching advice to common failures.
fn process_input(
    path: &Path,
    level: SimplificationLevel,
    context: &ProcessingContext,
) -> Result<ProcessOutput> {
    let bytes = read_input(path)?;
    let res = process_bytes(&file_name(path), bytes, level, context);
    match &res {
        Err(PipelineFailure::Failed(TrackPipeError::Validation(
            ValidationError::UnsupportedFormat(_),
        ))) => res.context("The <INPUT> must have a .gpx, .kml, .tcx or .fit extension."),

        Err(PipelineFailure::Failed(TrackPipeError::Parse(_))) => {
            res.context("The <INPUT> could not be read as a track. Check that it is correct.")
        }

        _ => res.map_err(anyhow::Error::from),
    }
}

#[instrument(level = "trace", skip_all)]
fn validate_cmd(args: &Cli, sub_args: &InputArgs) -> Result<String> {
    let bytes = read_input(&sub_args.input)?;
    let extension = sub_args
        .input
        .extension()
        .map(|ext| ext.to_string_lossy().into_owned())
        .unwrap_or_default();
    let options = ValidationOptions::default().with_max_size_bytes(args.max_size);
    let file = validate(&bytes, &extension, &options)
        .into_result()
        .context("The <INPUT> is not a valid track file.")?;
    Ok(format!(
        "Valid {} file, {} bytes\n",
        file.file_type, file.file_size
    ))
}

fn duration(s: Seconds<f64>) -> String {
    let total = s.0.max(0.0).round() as u64;
    format!("{}:{:02}:{:02}", total / 3600, (total / 60) % 60, total % 60)
}

fn stats_report(stats: &TrackStatistics, unit: DistUnit) -> Result<String> {
    let mut r = String::new();
    writeln!(&mut r, "Points:          {}", stats.point_count)?;
    writeln!(&mut r, "Distance:        {}", unit.distance(stats.total_distance))?;
    if stats.has_elevation_data {
        writeln!(
            &mut r,
            "Elevation:       +{} / -{}",
            unit.elevation(stats.elevation_gain),
            unit.elevation(stats.elevation_loss)
        )?;
        writeln!(
            &mut r,
            "Elevation range: {} to {}",
            unit.elevation(stats.min_elevation),
            unit.elevation(stats.max_elevation)
        )?;
    } else {
        writeln!(&mut r, "Elevation:       no elevation data")?;
    }
    if let (Some(start), Some(end)) = (stats.start_time, stats.end_time) {
        writeln!(&mut r, "Start:           {}", start.to_rfc3339())?;
        writeln!(&mut r, "End:             {}", end.to_rfc3339())?;
    }
    writeln!(&mut r, "Total time:      {}", duration(stats.total_time))?;
    if stats.has_complete_timestamps {
        writeln!(&mut r, "Moving time:     {}", duration(stats.moving_time))?;
        writeln!(&mut r, "Average speed:   {}", unit.speed(stats.average_speed))?;
        writeln!(&mut r, "Max speed:       {}", unit.speed(stats.max_speed))?;
    } else {
        writeln!(&mut r, "Moving time:     incomplete timestamps")?;
    }
    Ok(r)
}

#[instrument(level = "trace", skip_all)]
fn stats_cmd(args: &Cli, sub_args: &StatsArgs) -> Result<String> {
    debug!("stats args: {:?}", sub_args);

    if sub_args.stopped_threshold < 0.0 {
        bail!("Stopped threshold cannot be negative");
    }

    let mut stats_options = StatsOptions::default()
        .with_stopped_threshold(KilometersPerHour(sub_args.stopped_threshold))
        .with_require_timestamps(sub_args.require_timestamps);
    if let Some(hysteresis) = sub_args.elevation_hysteresis {
        stats_options = stats_options.with_elevation_hysteresis(Meters(hysteresis));
    }
    let context = context_for(args).with_stats(stats_options);

    let output = process_input(&sub_args.input.input, SimplificationLevel::None, &context)?;
    if output.skipped_points > 0 {
        warn!("Skipped {} unreadable points", output.skipped_points);
    }

    if sub_args.json {
        Ok(format!("{}\n", serde_json::to_string_pretty(&output.stats)?))
    } else {
        stats_report(&output.stats, args.distance_unit.get())
    }
}

#[instrument(level = "trace", skip_all)]
fn geojson_cmd(args: &Cli, sub_args: &GeojsonArgs) -> Result<String> {
    let output = process_input(
        &sub_args.input.input,
        sub_args.level.into(),
        &context_for(args),
    )?;
    let json = serde_json::to_string(&output.geojson)?;

    match &sub_args.output {
        None => Ok(format!("{json}\n")),
        Some(path) => {
            let written = if sub_args.force {
                std::fs::write(path, &json)
            } else {
                File::create_new(path)
                    .and_then(|mut f| std::io::Write::write_all(&mut f, json.as_bytes()))
            };
            written.context("Writing the <OUTPUT> file")?;
            Ok(format!(
                "Output is in {}\n",
                absolute(path)
                    .unwrap_or(path.to_path_buf())
                    .to_string_lossy()
            ))
        }
    }
}

#[instrument(level = "trace", skip_all)]
fn trackpoints_cmd(args: &Cli, sub_args: &TrackpointsArgs) -> Result<String> {
    let output = process_input(
        &sub_args.input.input,
        SimplificationLevel::None,
        &context_for(args),
    )?;
    let response = trackpoints_response(
        &output.track,
        sub_args.limit.as_deref(),
        sub_args.page.as_deref(),
        sub_args.time_range.as_deref(),
    );
    Ok(format!("{}\n", serde_json::to_string_pretty(&response)?))
}

async fn process_all(
    args: &Cli,
    sub_args: &ProcessArgs,
) -> Result<Vec<(PathBuf, Result<ProcessOutput>)>> {
    let processor = Processor::new(context_for(args));
    let mut jobs = Vec::with_capacity(sub_args.inputs.len());
    for (i, path) in sub_args.inputs.iter().enumerate() {
        let mut handle = processor
            .submit_path(path, format!("file-{i}"), sub_args.level.into())
            .await
            .with_context(|| format!("Submitting {:?}", path))?;
        let path = path.clone();
        jobs.push(tokio::spawn(async move {
            let result = loop {
                match handle.next_event().await {
                    Some(ProcessEvent::Progress(percent)) => {
                        info!("{}: {}%", path.display(), percent)
                    }
                    Some(ProcessEvent::State(state)) => debug!("{}: {}", path.display(), state),
                    Some(ProcessEvent::Finished(result)) => {
                        break result.map(|output| *output).map_err(anyhow::Error::from);
                    }
                    None => break Err(anyhow::anyhow!("processing stopped without a result")),
                }
            };
            (path, result)
        }));
    }

    let mut results = Vec::with_capacity(jobs.len());
    for job in jobs {
        results.push(job.await?);
    }
    Ok(results)
}

#[instrument(level = "trace", skip_all)]
fn process_cmd(args: &Cli, sub_args: &ProcessArgs) -> Result<String> {
    let runtime = tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()
        .context("Starting the async runtime")?;
    let results = runtime.block_on(process_all(args, sub_args))?;

    let unit = args.distance_unit.get();
    let mut r = String::new();
    let mut failures = 0;
    for (path, result) in results {
        match result {
            Ok(output) if sub_args.json => {
                writeln!(&mut r, "{}", serde_json::to_string(&output)?)?;
            }
            Ok(output) => {
                let feature = output.geojson.track_feature();
                writeln!(
                    &mut r,
                    "{}: {} {}, {}, {} points simplified to {} ({})",
                    path.display(),
                    output.file_type,
                    feature.and_then(|f| f.properties.name.as_deref()).unwrap_or("track"),
                    unit.distance(output.stats.total_distance),
                    output.stats.point_count,
                    feature.map(|f| f.properties.point_count).unwrap_or_default(),
                    output.level,
                )?;
            }
            Err(err) => {
                failures += 1;
                writeln!(&mut r, "{}: error: {:#}", path.display(), err)?;
            }
        }
    }
    if failures > 0 {
        warn!("{} of {} files failed", failures, sub_args.inputs.len());
    }
    Ok(r)
}

fn main() -> Result<()> {
    // Intentionally avoid wrapping argument parsing errors in anyhow::Result so
    // we preserve Clap's pretty formatting of usage info.
    let args = Cli::parse();

    let log_w: Box<dyn std::io::Write + Send> = match &args.log_file {
        Some(path) => Box::new(File::create(path).context("Creating the log file")?),
        None => Box::new(std::io::stderr()),
    };
    let (appender, _guard) = tracing_appender::non_blocking(log_w);

    // Enable the TRACE-level span tree layer for fmt logging level DEBUG.
    let fmt_layer = fmt::Layer::new()
        .with_writer(appender)
        .with_ansi(args.log_file.is_none())
        .with_target(false)
        .with_span_events(FmtSpan::ENTER | FmtSpan::CLOSE)
        .with_filter(LevelFilter::from_level(args.log_level));
    if args.log_level >= Level::DEBUG {
        let span_tree_layer = tracing_span_tree::SpanTree::default().aggregate(true);
        tracing::subscriber::set_global_default(
            Registry::default().with(fmt_layer).with(span_tree_layer),
        )?;
    } else {
        tracing::subscriber::set_global_default(Registry::default().with(fmt_layer))?;
    }

    debug!("trackpipe {}", clap::crate_version!());

    let report = match &args.cmd {
        Commands::Validate(sub_args) => validate_cmd(&args, sub_args),
        Commands::Stats(sub_args) => stats_cmd(&args, sub_args),
        Commands::Geojson(sub_args) => geojson_cmd(&args, sub_args),
        Commands::Trackpoints(sub_args) => trackpoints_cmd(&args, sub_args),
        Commands::Process(sub_args) => process_cmd(&args, sub_args),
    }?;

    print!("{report}");
    Ok(())
}
