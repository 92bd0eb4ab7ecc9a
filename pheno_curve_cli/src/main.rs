use std::collections::BTreeMap;
use std::fs::{self, File};
use std::io::{self, Read, Write};
use std::path::{Path, PathBuf};
use std::time::Instant;

use anyhow::{anyhow, Context, Result};
use chrono::Utc;
use clap::{ArgAction, Parser, Subcommand, ValueEnum, ValueHint};
use ordered_float::OrderedFloat;
use pheno_curve::cloud_filter::{apply_filter, cloud_temporal_filter, CloudFilterParams, CloudFilterRecord};
use pheno_curve::phenology::{fit_series, PhenologyParams};
use pheno_curve::stats::WindowStats;
use pheno_curve::time::{date_from_days, parse_date, TimeDomain, DAYS_PER_YEAR};
use pheno_curve::{Observation, PredictionRecord, TimeSeries};
use rayon::prelude::*;
use serde::Deserialize;
use tracing::{debug, info, warn};
use tracing_subscriber::EnvFilter;

#[derive(Parser, Debug)]
#[command(author, version, about = "Phenology curve fitting and temporal cloud filtering", long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Fit evenly spaced phenology curves for every pixel of an observation table
    Fit(FitArgs),
    /// Mask observations that deviate from their temporal neighbours
    Filter(FilterArgs),
    /// Summarise the observation table per pixel
    Inspect(InspectArgs),
}

#[derive(Parser, Debug)]
struct FitArgs {
    /// Observation CSV (`pixel,date|time,value[,valid][,band]`, `-` for stdin)
    #[arg(value_hint = ValueHint::FilePath)]
    input: PathBuf,

    /// Output CSV path (`-` for stdout)
    #[arg(short, long, default_value = "phenology.csv", value_hint = ValueHint::FilePath)]
    output: PathBuf,

    /// JSON config with `phenology` / `cloud_filter` sections; flags override it
    #[arg(long, value_hint = ValueHint::FilePath)]
    config: Option<PathBuf>,

    /// Band to fit (rows of other bands are skipped when a `band` column exists)
    #[arg(long)]
    band: Option<String>,

    /// Time axis of the observations and targets
    #[arg(long, value_enum)]
    domain: Option<DomainOpt>,

    /// Symmetric window radius (days); overrides lookback/lookahead
    #[arg(long)]
    radius: Option<f64>,

    /// Window extent before each target (days)
    #[arg(long)]
    lookback: Option<f64>,

    /// Window extent after each target (days)
    #[arg(long)]
    lookahead: Option<f64>,

    /// Number of evenly spaced output samples
    #[arg(long)]
    steps: Option<usize>,

    /// First target (YYYY-MM-DD or a number on the domain axis)
    #[arg(long)]
    min_date: Option<String>,

    /// End of the target range (YYYY-MM-DD or a number on the domain axis)
    #[arg(long)]
    max_date: Option<String>,

    /// Lowest plausible band value
    #[arg(long, allow_hyphen_values = true)]
    min_value: Option<f64>,

    /// Highest plausible band value
    #[arg(long, allow_hyphen_values = true)]
    max_value: Option<f64>,

    /// Fold observations across the period boundary
    #[arg(long, action = ArgAction::SetTrue)]
    wrap: bool,

    /// Run the temporal cloud filter before fitting
    #[arg(long, action = ArgAction::SetTrue)]
    prefilter: bool,

    /// Lower residual bound for the prefilter
    #[arg(long, allow_hyphen_values = true)]
    threshold_low: Option<f64>,

    /// Upper residual bound for the prefilter
    #[arg(long, allow_hyphen_values = true)]
    threshold_high: Option<f64>,

    /// Scenes folded across the series ends for the prefilter
    #[arg(long)]
    padding: Option<usize>,

    /// Verbose logging
    #[arg(long, action = ArgAction::SetTrue)]
    verbose: bool,

    /// Profile major stages with timings
    #[arg(long, action = ArgAction::SetTrue)]
    profile: bool,
}

#[derive(Parser, Debug)]
struct FilterArgs {
    /// Observation CSV (`-` for stdin)
    #[arg(value_hint = ValueHint::FilePath)]
    input: PathBuf,

    /// Output CSV path (`-` for stdout)
    #[arg(short, long, default_value = "filtered.csv", value_hint = ValueHint::FilePath)]
    output: PathBuf,

    /// JSON config with a `cloud_filter` section; flags override it
    #[arg(long, value_hint = ValueHint::FilePath)]
    config: Option<PathBuf>,

    /// Band to filter
    #[arg(long)]
    band: Option<String>,

    /// Time axis of the observations
    #[arg(long, value_enum)]
    domain: Option<DomainOpt>,

    /// Lower residual bound
    #[arg(long, allow_hyphen_values = true)]
    threshold_low: Option<f64>,

    /// Upper residual bound
    #[arg(long, allow_hyphen_values = true)]
    threshold_high: Option<f64>,

    /// Scenes folded across the series ends
    #[arg(long)]
    padding: Option<usize>,

    /// Verbose logging
    #[arg(long, action = ArgAction::SetTrue)]
    verbose: bool,

    /// Profile major stages with timings
    #[arg(long, action = ArgAction::SetTrue)]
    profile: bool,
}

#[derive(Parser, Debug)]
struct InspectArgs {
    /// Observation CSV (`-` for stdin)
    #[arg(value_hint = ValueHint::FilePath)]
    input: PathBuf,

    /// Output report path (`-` for stdout)
    #[arg(short, long, default_value = "observation_report.txt", value_hint = ValueHint::FilePath)]
    output: PathBuf,

    /// Band to summarise
    #[arg(long)]
    band: Option<String>,

    /// Time axis of the observations
    #[arg(long, value_enum, default_value_t = DomainOpt::Doy)]
    domain: DomainOpt,

    /// Verbose logging
    #[arg(long, action = ArgAction::SetTrue)]
    verbose: bool,
}

#[derive(Copy, Clone, Debug, ValueEnum)]
enum DomainOpt {
    Doy,
    Absolute,
}

impl From<DomainOpt> for TimeDomain {
    fn from(value: DomainOpt) -> Self {
        match value {
            DomainOpt::Doy => TimeDomain::DayOfYear,
            DomainOpt::Absolute => TimeDomain::Absolute,
        }
    }
}

#[derive(Debug, Default, Deserialize)]
#[serde(default)]
struct ConfigFile {
    phenology: PhenologyParams,
    cloud_filter: CloudFilterParams,
    prefilter: bool,
}

#[derive(Debug, Deserialize)]
struct InputRow {
    pixel: String,
    #[serde(default)]
    band: Option<String>,
    #[serde(default)]
    date: Option<String>,
    #[serde(default)]
    time: Option<f64>,
    #[serde(default)]
    value: Option<f64>,
    #[serde(default)]
    valid: Option<String>,
}

type PixelSeries = Vec<(String, TimeSeries)>;

fn main() -> Result<()> {
    let cli = Cli::parse();
    let verbose = match &cli.command {
        Command::Fit(args) => args.verbose,
        Command::Filter(args) => args.verbose,
        Command::Inspect(args) => args.verbose,
    };
    let default_level = if verbose { "debug" } else { "info" };
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_level));
    let _ = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(io::stderr)
        .try_init();

    match cli.command {
        Command::Fit(args) => handle_fit(args),
        Command::Filter(args) => handle_filter(args),
        Command::Inspect(args) => handle_inspect(args),
    }
}

fn handle_fit(args: FitArgs) -> Result<()> {
    let config = load_config(args.config.as_deref())?;
    let mut params = config.phenology;
    let mut filter = config.cloud_filter;
    let prefilter = args.prefilter || config.prefilter;

    if let Some(domain) = args.domain {
        params.domain = domain.into();
    }
    if let Some(band) = args.band.as_ref() {
        params.band_name = band.clone();
    }
    if let Some(radius) = args.radius {
        params.window_radius = Some(radius);
    }
    if let Some(lookback) = args.lookback {
        params.lookback_width = lookback;
        params.window_radius = None;
    }
    if let Some(lookahead) = args.lookahead {
        params.lookahead_width = lookahead;
        params.window_radius = None;
    }
    if let Some(steps) = args.steps {
        params.num_time_steps = steps;
    }
    if let Some(min_value) = args.min_value {
        params.min_value = min_value;
    }
    if let Some(max_value) = args.max_value {
        params.max_value = max_value;
    }
    params.wrap_data |= args.wrap;
    let range_given = args.min_date.is_some() || args.max_date.is_some();
    if let Some(text) = args.min_date.as_deref() {
        params.min_date = parse_time_arg(text, params.domain)?;
    }
    if let Some(text) = args.max_date.as_deref() {
        params.max_date = parse_time_arg(text, params.domain)?;
    }

    filter.domain = params.domain;
    filter.band_name = params.band_name.clone();
    apply_filter_overrides(&mut filter, args.threshold_low, args.threshold_high, args.padding);

    let t_read = Instant::now();
    let pixels = read_observations(&args.input, params.domain, &params.band_name)?;
    if pixels.is_empty() {
        return Err(anyhow!(
            "no observations of band {} in {}",
            params.band_name,
            args.input.display()
        ));
    }
    if args.profile || args.verbose {
        info!(
            "Read stage: {:.1} ms ({} pixels)",
            t_read.elapsed().as_secs_f64() * 1000.0,
            pixels.len()
        );
    }

    if params.domain == TimeDomain::Absolute && !range_given && params.max_date <= DAYS_PER_YEAR {
        let (start, end) = data_span(&pixels)
            .ok_or_else(|| anyhow!("cannot derive a date range from the observations"))?;
        params.min_date = start.floor();
        params.max_date = end.ceil();
        info!(
            "Target range taken from data: {} .. {}",
            format_date(params.min_date),
            format_date(params.max_date)
        );
    }

    params.validate().context("invalid phenology parameters")?;
    if prefilter {
        filter.validate().context("invalid cloud filter parameters")?;
    }

    let t_compute = Instant::now();
    let fitted: Vec<(String, Vec<PredictionRecord>)> = pixels
        .par_iter()
        .map(|(pixel, series)| -> Result<(String, Vec<PredictionRecord>)> {
            let series = if prefilter {
                apply_filter(series, &filter)
                    .with_context(|| format!("cloud filter failed for pixel {}", pixel))?
            } else {
                series.clone()
            };
            let records = fit_series(&series, &params)
                .with_context(|| format!("phenology fit failed for pixel {}", pixel))?;
            Ok((pixel.clone(), records))
        })
        .collect::<Result<Vec<_>>>()?;
    if args.profile || args.verbose {
        info!(
            "Fit stage: {:.1} ms ({} pixels x {} targets)",
            t_compute.elapsed().as_secs_f64() * 1000.0,
            fitted.len(),
            params.num_time_steps
        );
    }

    let masked: usize = fitted
        .iter()
        .map(|(_, records)| records.iter().filter(|r| r.is_masked()).count())
        .sum();
    if masked > 0 {
        warn!("{} fitted samples had no unmasked observations", masked);
    }
    info!(
        "Fitted {} pixels, {} samples each, band {}",
        fitted.len(),
        params.num_time_steps,
        params.band_name
    );

    let t_csv = Instant::now();
    with_csv_writer(&args.output, |writer| write_fit_rows(&fitted, params.domain, writer))?;
    if args.profile || args.verbose {
        info!("CSV stage: {:.1} ms", t_csv.elapsed().as_secs_f64() * 1000.0);
    }
    if args.output.as_os_str() != "-" {
        info!("Wrote phenology CSV: {}", args.output.display());
    }
    Ok(())
}

fn handle_filter(args: FilterArgs) -> Result<()> {
    let config = load_config(args.config.as_deref())?;
    let mut filter = config.cloud_filter;
    if let Some(domain) = args.domain {
        filter.domain = domain.into();
    }
    if let Some(band) = args.band.as_ref() {
        filter.band_name = band.clone();
    }
    apply_filter_overrides(&mut filter, args.threshold_low, args.threshold_high, args.padding);
    filter.validate().context("invalid cloud filter parameters")?;

    let t_read = Instant::now();
    let pixels = read_observations(&args.input, filter.domain, &filter.band_name)?;
    if args.profile || args.verbose {
        info!(
            "Read stage: {:.1} ms ({} pixels)",
            t_read.elapsed().as_secs_f64() * 1000.0,
            pixels.len()
        );
    }

    let t_compute = Instant::now();
    let filtered: Vec<(String, Vec<CloudFilterRecord>)> = pixels
        .par_iter()
        .map(|(pixel, series)| -> Result<(String, Vec<CloudFilterRecord>)> {
            let records = cloud_temporal_filter(series, &filter)
                .with_context(|| format!("cloud filter failed for pixel {}", pixel))?;
            Ok((pixel.clone(), records))
        })
        .collect::<Result<Vec<_>>>()?;
    if args.profile || args.verbose {
        info!(
            "Filter stage: {:.1} ms",
            t_compute.elapsed().as_secs_f64() * 1000.0
        );
    }

    let total: usize = filtered.iter().map(|(_, r)| r.len()).sum();
    let rejected: usize = filtered
        .iter()
        .map(|(_, records)| records.iter().filter(|r| r.rejected).count())
        .sum();
    info!(
        "Filtered {} observations over {} pixels: {} masked as cloud",
        total,
        filtered.len(),
        rejected
    );

    with_csv_writer(&args.output, |writer| write_filter_rows(&filtered, writer))?;
    if args.output.as_os_str() != "-" {
        info!("Wrote filtered CSV: {}", args.output.display());
    }
    Ok(())
}

fn handle_inspect(args: InspectArgs) -> Result<()> {
    let domain: TimeDomain = args.domain.into();
    let band = args.band.clone().unwrap_or_else(|| PhenologyParams::default().band_name);
    let pixels = read_observations(&args.input, domain, &band)?;

    let mut report = String::new();
    report.push_str(&format!("GENERATED: {}\n", Utc::now().format("%Y-%m-%dT%H:%M:%SZ")));
    report.push_str(&format!("INPUT: {}\n", args.input.display()));
    report.push_str(&format!("  band: {}\n", band));
    report.push_str(&format!("  domain: {}\n", domain.name()));
    report.push_str(&format!("  pixels: {}\n", pixels.len()));
    let observations: usize = pixels.iter().map(|(_, s)| s.len()).sum();
    let valid: usize = pixels.iter().map(|(_, s)| s.valid_count()).sum();
    report.push_str(&format!("  observations: {} ({} unmasked)\n\n", observations, valid));

    for (pixel, series) in &pixels {
        report.push_str(&format!("PIXEL: {}\n", pixel));
        report.push_str(&format!(
            "  observations: {} ({} unmasked, {} masked)\n",
            series.len(),
            series.valid_count(),
            series.len() - series.valid_count()
        ));
        if let Some((start, end)) = series.span() {
            match domain {
                TimeDomain::Absolute => report.push_str(&format!(
                    "  span: {} .. {} ({:.1} days)\n",
                    format_date(start),
                    format_date(end),
                    end - start
                )),
                TimeDomain::DayOfYear => {
                    report.push_str(&format!("  span: day {:.1} .. {:.1}\n", start, end))
                }
            }
        }

        let values: Vec<f64> = series.iter().filter(|o| o.valid).map(|o| o.value).collect();
        let stats = WindowStats::from_values(&values);
        if !stats.is_empty() {
            report.push_str(&format!(
                "  values: median={:.4}, min={:.4}, max={:.4}, stdev={:.4}\n",
                stats.median, stats.min, stats.max, stats.stdev
            ));
        }

        let valid_times: Vec<f64> = series.iter().filter(|o| o.valid).map(|o| o.timestamp).collect();
        let largest_gap = valid_times
            .windows(2)
            .map(|w| OrderedFloat(w[1] - w[0]))
            .max();
        if let Some(gap) = largest_gap {
            report.push_str(&format!("  largest_gap_days: {:.1}\n", gap.into_inner()));
        }
        report.push('\n');
    }

    if args.output.as_os_str() == "-" {
        io::stdout()
            .lock()
            .write_all(report.as_bytes())
            .context("failed to write report to stdout")?;
    } else {
        fs::write(&args.output, report)
            .with_context(|| format!("failed to write {}", args.output.display()))?;
        info!("Observation report written: {}", args.output.display());
    }
    Ok(())
}

fn load_config(path: Option<&Path>) -> Result<ConfigFile> {
    let Some(path) = path else {
        return Ok(ConfigFile::default());
    };
    let text = fs::read_to_string(path)
        .with_context(|| format!("failed to read config {}", path.display()))?;
    let config: ConfigFile = serde_json::from_str(&text)
        .with_context(|| format!("{} is not a valid config file", path.display()))?;
    debug!("Loaded config {}", path.display());
    Ok(config)
}

fn apply_filter_overrides(
    filter: &mut CloudFilterParams,
    low: Option<f64>,
    high: Option<f64>,
    padding: Option<usize>,
) {
    if let Some(low) = low {
        filter.threshold_low = low;
    }
    if let Some(high) = high {
        filter.threshold_high = high;
    }
    if let Some(padding) = padding {
        filter.num_padding_scenes = padding;
    }
}

/// A number on the domain axis, or an ISO date converted onto it.
fn parse_time_arg(text: &str, domain: TimeDomain) -> Result<f64> {
    if let Ok(value) = text.trim().parse::<f64>() {
        return Ok(value);
    }
    let date = parse_date(text)?;
    Ok(domain.from_date(date))
}

fn parse_flag(text: &str) -> Result<bool> {
    match text.trim().to_ascii_lowercase().as_str() {
        "" | "1" | "true" | "t" | "yes" | "y" => Ok(true),
        "0" | "false" | "f" | "no" | "n" => Ok(false),
        other => Err(anyhow!("invalid validity flag '{}'", other)),
    }
}

fn open_input(path: &Path) -> Result<Box<dyn Read>> {
    if path.as_os_str() == "-" {
        Ok(Box::new(io::stdin()))
    } else {
        let file =
            File::open(path).with_context(|| format!("failed to open {}", path.display()))?;
        Ok(Box::new(file))
    }
}

fn read_observations(path: &Path, domain: TimeDomain, band: &str) -> Result<PixelSeries> {
    let reader = open_input(path)?;
    let grouped = group_observations(reader, domain, band)
        .with_context(|| format!("failed to read observations from {}", path.display()))?;
    grouped
        .into_iter()
        .map(|(pixel, observations)| {
            let series = TimeSeries::from_observations(observations)
                .with_context(|| format!("invalid series for pixel {}", pixel))?;
            Ok((pixel, series))
        })
        .collect()
}

fn group_observations<R: Read>(
    reader: R,
    domain: TimeDomain,
    band: &str,
) -> Result<BTreeMap<String, Vec<Observation>>> {
    let mut csv_reader = csv::ReaderBuilder::new().trim(csv::Trim::All).from_reader(reader);
    let mut grouped: BTreeMap<String, Vec<Observation>> = BTreeMap::new();
    let mut skipped = 0usize;

    for (line, row) in csv_reader.deserialize::<InputRow>().enumerate() {
        let row = row.with_context(|| format!("row {}", line + 1))?;
        if let Some(row_band) = row.band.as_deref() {
            if !row_band.is_empty() && row_band != band {
                skipped += 1;
                continue;
            }
        }
        let timestamp = match (row.time, row.date.as_deref()) {
            (Some(time), _) => time,
            (None, Some(date)) if !date.is_empty() => domain.from_date(parse_date(date)?),
            _ => return Err(anyhow!("row {}: needs a date or time column", line + 1)),
        };
        let flag = match row.valid.as_deref() {
            Some(text) => parse_flag(text).with_context(|| format!("row {}", line + 1))?,
            None => true,
        };
        let observation = match row.value {
            Some(value) => Observation::new(timestamp, value, flag),
            None => Observation::masked(timestamp, f64::NAN),
        };
        grouped.entry(row.pixel).or_default().push(observation);
    }

    if skipped > 0 {
        debug!("Skipped {} rows of other bands", skipped);
    }
    Ok(grouped)
}

fn data_span(pixels: &PixelSeries) -> Option<(f64, f64)> {
    pixels
        .iter()
        .filter_map(|(_, series)| series.span())
        .reduce(|(a0, a1), (b0, b1)| (a0.min(b0), a1.max(b1)))
}

fn with_csv_writer<F>(output: &Path, write_rows: F) -> Result<()>
where
    F: FnOnce(&mut csv::Writer<Box<dyn Write>>) -> Result<()>,
{
    let sink: Box<dyn Write> = if output.as_os_str() == "-" {
        Box::new(io::stdout().lock())
    } else {
        let file = File::create(output)
            .with_context(|| format!("failed to create {}", output.display()))?;
        Box::new(file)
    };
    let mut writer = csv::Writer::from_writer(sink);
    write_rows(&mut writer)?;
    writer.flush()?;
    Ok(())
}

fn write_fit_rows<W: Write>(
    fitted: &[(String, Vec<PredictionRecord>)],
    domain: TimeDomain,
    writer: &mut csv::Writer<W>,
) -> Result<()> {
    writer.write_record([
        "pixel",
        "time",
        "date",
        "median",
        "prediction_filtered",
        "clear_images",
        "window_size",
        "min",
        "max",
        "stdev",
        "linear_coef",
        "quadratic_coef",
        "model",
        "rejection",
    ])?;

    for (pixel, records) in fitted {
        for record in records {
            let date = match domain {
                TimeDomain::Absolute => format_date(record.target_time),
                TimeDomain::DayOfYear => String::new(),
            };
            writer.write_record([
                pixel.clone(),
                format!("{:.3}", record.target_time),
                date,
                format_value(record.median),
                format_value(record.prediction),
                record.unmasked_count.to_string(),
                record.observed_count.to_string(),
                format_value(record.min),
                format_value(record.max),
                format_value(record.stdev),
                format_value(record.linear_constant),
                format_value(record.quadratic_constant),
                record.model.as_str().to_string(),
                record.rejection.as_str().to_string(),
            ])?;
        }
    }
    Ok(())
}

fn write_filter_rows<W: Write>(
    filtered: &[(String, Vec<CloudFilterRecord>)],
    writer: &mut csv::Writer<W>,
) -> Result<()> {
    writer.write_record([
        "pixel",
        "time",
        "value",
        "valid",
        "rejected",
        "reg_diff",
        "reg_expected",
        "previous",
        "previous_DOY",
        "next",
        "next_DOY",
    ])?;

    for (pixel, records) in filtered {
        for record in records {
            let obs = &record.observation;
            writer.write_record([
                pixel.clone(),
                format!("{:.3}", obs.timestamp),
                format_value(obs.value),
                (obs.valid as u8).to_string(),
                (record.rejected as u8).to_string(),
                format_value(record.reg_diff),
                format_value(record.reg_expected),
                format_value(record.previous),
                format!("{:.3}", record.previous_doy),
                format_value(record.next),
                format!("{:.3}", record.next_doy),
            ])?;
        }
    }
    Ok(())
}

/// Masked (NaN) values are written as empty fields.
fn format_value(value: f64) -> String {
    if value.is_finite() {
        format!("{:.6}", value)
    } else {
        String::new()
    }
}

fn format_date(days: f64) -> String {
    date_from_days(days)
        .map(|d| d.format("%Y-%m-%d").to_string())
        .unwrap_or_default()
}
