use std::fs::{self, File};
use std::io::{self, Read, Write};
use std::path::{Path, PathBuf};
use std::time::Instant;

use anyhow::{anyhow, Context, Result};
use chrono::Utc;
use clap::{ArgAction, Parser, Subcommand, ValueEnum, ValueHint};
use rayon::prelude::*;
use serde::Serialize;
use tracing::{debug, info, warn};
use tracing_subscriber::EnvFilter;
use vx_curve::{
    decompose, Calibration, Decomposition, MatchStrategy, Params, SeriesPair, UnwrapDiagnostics,
    DEFAULT_MAX_ITERATIONS,
};

mod plot;

use plot::{render_chart_guard, ChartKind};

#[derive(Parser, Debug)]
#[command(author, version, about = "Unwrap quantized curves digitized from plots", long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Unwrap one or more digitized (T, V) tables
    Unwrap(UnwrapArgs),
    /// Report gaps, repeated steps and wrap candidates without unwrapping
    Diagnose(DiagnoseArgs),
}

#[derive(Parser, Debug)]
struct UnwrapArgs {
    /// CSV tables with a header row
    #[arg(required = true, value_hint = ValueHint::FilePath)]
    inputs: Vec<PathBuf>,

    /// Wrap quantum of the dependent variable
    #[arg(short, long)]
    quantum: f64,

    /// Independent column name (defaults to the first column)
    #[arg(long)]
    t_col: Option<String>,

    /// Dependent column name (defaults to the second column)
    #[arg(long)]
    v_col: Option<String>,

    /// Axis calibration JSON mapping graphic coordinates to physical units
    #[arg(long, value_hint = ValueHint::FilePath)]
    calibration: Option<PathBuf>,

    /// Sort rows by the independent variable before unwrapping
    #[arg(long, action = ArgAction::SetTrue)]
    sort: bool,

    /// Multiple-selection strategy
    #[arg(long, value_enum, default_value_t = StrategyOpt::HillClimb)]
    strategy: StrategyOpt,

    /// Iteration cap for a single step
    #[arg(long, default_value_t = DEFAULT_MAX_ITERATIONS)]
    max_iterations: usize,

    /// Output CSV path (`-` for stdout); ignored with several inputs
    #[arg(short, long, default_value = "unwrapped.csv", value_hint = ValueHint::FilePath)]
    output: PathBuf,

    /// Output PNG figure path (defaults next to the CSV); with several inputs
    /// each figure goes next to its own CSV and this path is ignored
    #[arg(long, value_hint = ValueHint::FilePath)]
    png: Option<PathBuf>,

    /// Output SVG figure path; with several inputs any value enables one SVG
    /// next to each CSV
    #[arg(long, value_hint = ValueHint::FilePath)]
    svg: Option<PathBuf>,

    /// Disable plot generation
    #[arg(long, action = ArgAction::SetTrue)]
    no_plot: bool,

    /// Optional JSON run summary
    #[arg(long, value_hint = ValueHint::FilePath)]
    summary: Option<PathBuf>,

    /// Verbose logging
    #[arg(long, action = ArgAction::SetTrue)]
    verbose: bool,
}

#[derive(Parser, Debug)]
struct DiagnoseArgs {
    /// CSV tables to inspect
    #[arg(required = true, value_hint = ValueHint::FilePath)]
    inputs: Vec<PathBuf>,

    /// Quantum used to flag steps that look like wraps
    #[arg(short, long)]
    quantum: Option<f64>,

    #[arg(long)]
    t_col: Option<String>,

    #[arg(long)]
    v_col: Option<String>,

    /// Output report path (`-` for stdout)
    #[arg(short, long, default_value = "vx_diagnostics.txt", value_hint = ValueHint::FilePath)]
    output: PathBuf,

    /// Verbose logging
    #[arg(long, action = ArgAction::SetTrue)]
    verbose: bool,
}

#[derive(Copy, Clone, Debug, ValueEnum)]
enum StrategyOpt {
    HillClimb,
    Rounding,
}

impl From<StrategyOpt> for MatchStrategy {
    fn from(value: StrategyOpt) -> Self {
        match value {
            StrategyOpt::HillClimb => MatchStrategy::HillClimb,
            StrategyOpt::Rounding => MatchStrategy::Rounding,
        }
    }
}

#[derive(Serialize, Debug)]
struct RunSummary {
    generated_at: String,
    params: Params,
    inputs: Vec<InputSummary>,
}

#[derive(Serialize, Debug)]
struct InputSummary {
    input: String,
    output: String,
    rows: usize,
    diagnostics: UnwrapDiagnostics,
}

struct Unwrapped {
    input: PathBuf,
    decomposition: Decomposition,
}

fn main() -> Result<()> {
    let cli = Cli::parse();
    let verbose = match &cli.command {
        Command::Unwrap(args) => args.verbose,
        Command::Diagnose(args) => args.verbose,
    };
    let default_level = if verbose { "debug" } else { "info" };
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_level));
    let _ = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(io::stderr)
        .try_init();

    match cli.command {
        Command::Unwrap(args) => handle_unwrap(args),
        Command::Diagnose(args) => handle_diagnose(args),
    }
}

fn handle_unwrap(args: UnwrapArgs) -> Result<()> {
    let mut params = Params::new(args.quantum);
    params.strategy = args.strategy.into();
    params.max_iterations = args.max_iterations;
    params.validate()?;

    let calibration = match args.calibration.as_ref() {
        Some(path) => {
            let cal = Calibration::load(path)
                .with_context(|| format!("failed to load calibration {}", path.display()))?;
            info!("Using axis calibration: {}", path.display());
            Some(cal)
        }
        None => None,
    };

    let t_compute = Instant::now();
    let results: Vec<Unwrapped> = args
        .inputs
        .par_iter()
        .map(|path| -> Result<Unwrapped> {
            let file =
                File::open(path).with_context(|| format!("failed to open {}", path.display()))?;
            let mut series = read_series(file, args.t_col.as_deref(), args.v_col.as_deref())
                .with_context(|| format!("failed to parse {}", path.display()))?;
            if let Some(cal) = calibration.as_ref() {
                series = cal.apply_series(&series);
            }
            if args.sort {
                series = series.sorted_by_independent();
            }
            let decomposition = decompose(series.t(), series.v(), &params)
                .with_context(|| format!("failed to unwrap {}", path.display()))?;
            Ok(Unwrapped {
                input: path.clone(),
                decomposition,
            })
        })
        .collect::<Result<Vec<_>>>()?;
    debug!(
        "Unwrap stage: {:.1} ms ({} inputs)",
        t_compute.elapsed().as_secs_f64() * 1000.0,
        results.len()
    );

    let single = results.len() == 1;
    let mut summaries = Vec::with_capacity(results.len());
    for result in &results {
        let d = &result.decomposition;
        info!(
            "{}: {} rows, seed row {}, {} corrected steps (max |shift| {})",
            result.input.display(),
            d.len(),
            d.diagnostics.seed_index,
            d.diagnostics.corrected_steps,
            d.diagnostics.max_abs_shift
        );

        let output = if single {
            args.output.clone()
        } else {
            derive_output_path(&result.input)
        };

        if output.as_os_str() == "-" {
            write_decomposition_stdout(d)?;
        } else {
            write_decomposition_csv(d, &output)?;
            info!("Wrote unwrapped CSV: {}", output.display());
        }

        if !args.no_plot {
            render_plots(&args, single, d, &output);
        }

        summaries.push(InputSummary {
            input: result.input.display().to_string(),
            output: output.display().to_string(),
            rows: d.len(),
            diagnostics: d.diagnostics.clone(),
        });
    }

    if let Some(path) = args.summary.as_ref() {
        let summary = RunSummary {
            generated_at: Utc::now().to_rfc3339(),
            params: params.clone(),
            inputs: summaries,
        };
        let text = serde_json::to_string_pretty(&summary)?;
        fs::write(path, text).with_context(|| format!("failed to write {}", path.display()))?;
        info!("Wrote summary: {}", path.display());
    }

    Ok(())
}

fn render_plots(args: &UnwrapArgs, single: bool, d: &Decomposition, output: &Path) {
    let (png_path, svg_path) = plot_paths(args, single, output);
    if let Some(path) = png_path {
        match render_chart_guard(d, &path, ChartKind::Png) {
            Ok(()) => info!("Wrote plot: {}", path.display()),
            Err(err) => warn!("Skipping PNG render ({}): {}", path.display(), err),
        }
    }
    if let Some(path) = svg_path {
        match render_chart_guard(d, &path, ChartKind::Svg) {
            Ok(()) => info!("Wrote plot: {}", path.display()),
            Err(err) => warn!("Skipping SVG render ({}): {}", path.display(), err),
        }
    }
}

/// PNG and SVG targets for one output CSV.
///
/// Explicit figure paths only apply to a single input; otherwise figures sit
/// next to the CSV. Nothing is derived from a stdout (`-`) output.
fn plot_paths(args: &UnwrapArgs, single: bool, output: &Path) -> (Option<PathBuf>, Option<PathBuf>) {
    let beside_csv = |ext: &str| {
        if output.as_os_str() == "-" {
            None
        } else {
            Some(output.with_extension(ext))
        }
    };
    let png = match (single, args.png.as_ref()) {
        (true, Some(path)) => Some(path.clone()),
        _ => beside_csv("png"),
    };
    let svg = match (single, args.svg.as_ref()) {
        (true, Some(path)) => Some(path.clone()),
        (false, Some(_)) => beside_csv("svg"),
        (_, None) => None,
    };
    (png, svg)
}

fn derive_output_path(input: &Path) -> PathBuf {
    let stem = input
        .file_stem()
        .and_then(|s| s.to_str())
        .unwrap_or("series");
    input.with_file_name(format!("{}_unwrapped.csv", stem))
}

/// Read two columns of a CSV table into a series.
///
/// Empty cells and `nan`/`na` tokens become missing values.
fn read_series<R: Read>(reader: R, t_col: Option<&str>, v_col: Option<&str>) -> Result<SeriesPair> {
    let mut rdr = csv::ReaderBuilder::new()
        .has_headers(true)
        .trim(csv::Trim::All)
        .flexible(true)
        .from_reader(reader);
    let headers = rdr.headers()?.clone();
    let t_idx = resolve_column(&headers, t_col, 0)?;
    let v_idx = resolve_column(&headers, v_col, 1)?;

    let mut t = Vec::new();
    let mut v = Vec::new();
    for (row, record) in rdr.records().enumerate() {
        let record = record.with_context(|| format!("invalid CSV row {}", row + 1))?;
        t.push(parse_cell(record.get(t_idx), row)?);
        v.push(parse_cell(record.get(v_idx), row)?);
    }
    Ok(SeriesPair::new(t, v)?)
}

fn resolve_column(headers: &csv::StringRecord, name: Option<&str>, fallback: usize) -> Result<usize> {
    match name {
        Some(name) => headers
            .iter()
            .position(|h| h == name)
            .ok_or_else(|| anyhow!("column '{}' not found in header", name)),
        None if fallback < headers.len() => Ok(fallback),
        None => Err(anyhow!(
            "table has {} columns; expected at least {}",
            headers.len(),
            fallback + 1
        )),
    }
}

fn parse_cell(cell: Option<&str>, row: usize) -> Result<f64> {
    let text = cell.unwrap_or("").trim();
    if text.is_empty() || matches!(text.to_ascii_lowercase().as_str(), "nan" | "na" | "null") {
        return Ok(f64::NAN);
    }
    text.parse::<f64>()
        .with_context(|| format!("invalid number '{}' in row {}", text, row + 1))
}

fn write_decomposition_stdout(d: &Decomposition) -> Result<()> {
    let stdout = io::stdout();
    let handle = stdout.lock();
    let mut writer = csv::Writer::from_writer(handle);
    write_decomposition_rows(d, &mut writer)
}

fn write_decomposition_csv(d: &Decomposition, path: &Path) -> Result<()> {
    let file =
        File::create(path).with_context(|| format!("failed to create {}", path.display()))?;
    let mut writer = csv::Writer::from_writer(file);
    write_decomposition_rows(d, &mut writer)
}

fn write_decomposition_rows<W: Write>(d: &Decomposition, writer: &mut csv::Writer<W>) -> Result<()> {
    writer.write_record(["t", "v", "smooth", "residual", "corrected_dv", "shift"])?;
    for i in 0..d.len() {
        writer.write_record([
            format_value(d.independent[i]),
            format_value(d.raw[i]),
            format_value(d.smooth[i]),
            format_value(d.residual[i]),
            format_value(d.corrected_increments[i]),
            d.shifts[i].to_string(),
        ])?;
    }
    writer.flush()?;
    Ok(())
}

fn format_value(value: f64) -> String {
    if value.is_finite() {
        value.to_string()
    } else {
        String::new()
    }
}

fn handle_diagnose(args: DiagnoseArgs) -> Result<()> {
    if let Some(q) = args.quantum {
        if !q.is_finite() || q <= 0.0 {
            return Err(anyhow!("--quantum must be finite and > 0"));
        }
    }

    let mut report = String::new();
    for path in &args.inputs {
        let file = File::open(path).with_context(|| format!("failed to open {}", path.display()))?;
        let series = read_series(file, args.t_col.as_deref(), args.v_col.as_deref())
            .with_context(|| format!("failed to parse {}", path.display()))?;
        report.push_str(&diagnose_series(&path.display().to_string(), &series, args.quantum));
        report.push('\n');
    }

    if args.output.as_os_str() == "-" {
        io::stdout().write_all(report.as_bytes())?;
    } else {
        fs::write(&args.output, report)
            .with_context(|| format!("failed to write {}", args.output.display()))?;
        info!("Diagnostic report written: {}", args.output.display());
    }
    Ok(())
}

const REPORT_INDEX_LIMIT: usize = 20;

fn diagnose_series(name: &str, series: &SeriesPair, quantum: Option<f64>) -> String {
    let mut out = String::new();
    out.push_str(&format!("== {}\n", name));
    out.push_str(&format!("rows: {}\n", series.len()));
    out.push_str(&format!("valid rows: {}\n", series.valid_rows()));
    out.push_str(&format!("leading gap: {}\n", series.leading_gap()));
    out.push_str(&format!(
        "seed row: {}\n",
        series
            .nth_valid_row(2)
            .map(|i| i.to_string())
            .unwrap_or_else(|| "none (insufficient data)".into())
    ));
    out.push_str(&format!(
        "interior gaps: {}\n",
        format_indices(&series.interior_gaps())
    ));
    out.push_str(&format!(
        "repeated independent values: {}\n",
        format_indices(&series.repeated_steps())
    ));

    if let Some(q) = quantum {
        let candidates = wrap_candidates(series, q);
        out.push_str(&format!(
            "steps with |dV| >= quantum/2: {}\n",
            format_indices(&candidates)
        ));
        let status = match decompose(series.t(), series.v(), &Params::new(q)) {
            Ok(d) => format!(
                "ok ({} corrected steps, max |shift| {})",
                d.diagnostics.corrected_steps, d.diagnostics.max_abs_shift
            ),
            Err(err) => format!("error: {}", err),
        };
        out.push_str(&format!("unwrap: {}\n", status));
    }
    out
}

fn wrap_candidates(series: &SeriesPair, quantum: f64) -> Vec<usize> {
    let (_, dv) = series.increments();
    dv.iter()
        .enumerate()
        .filter(|(_, d)| d.is_finite() && d.abs() >= quantum / 2.0)
        .map(|(i, _)| i)
        .collect()
}

fn format_indices(indices: &[usize]) -> String {
    if indices.is_empty() {
        return "none".into();
    }
    let shown: Vec<String> = indices
        .iter()
        .take(REPORT_INDEX_LIMIT)
        .map(|i| i.to_string())
        .collect();
    if indices.len() > REPORT_INDEX_LIMIT {
        format!(
            "{} (first {}: {}, ...)",
            indices.len(),
            REPORT_INDEX_LIMIT,
            shown.join(", ")
        )
    } else {
        format!("{} ({})", indices.len(), shown.join(", "))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const TABLE: &str = "temp,voltage,extra\n0,0,a\n1,1,b\n2,2,c\n3,5,d\n4,6,e\n";

    #[test]
    fn test_read_series_defaults_to_first_columns() {
        let series = read_series(TABLE.as_bytes(), None, None).unwrap();
        assert_eq!(series.t(), &[0.0, 1.0, 2.0, 3.0, 4.0]);
        assert_eq!(series.v(), &[0.0, 1.0, 2.0, 5.0, 6.0]);
    }

    #[test]
    fn test_read_series_by_name() {
        let series = read_series(TABLE.as_bytes(), Some("voltage"), Some("temp")).unwrap();
        assert_eq!(series.t()[3], 5.0);
        assert_eq!(series.v()[3], 3.0);
        assert!(read_series(TABLE.as_bytes(), Some("missing"), None).is_err());
    }

    #[test]
    fn test_missing_cells_become_nan() {
        let text = "t,v\n,\nNaN,1\n2, 3 \n";
        let series = read_series(text.as_bytes(), None, None).unwrap();
        assert!(series.t()[0].is_nan() && series.v()[0].is_nan());
        assert!(series.t()[1].is_nan());
        assert_eq!(series.v()[2], 3.0);
        assert!(read_series("t,v\n1,abc\n".as_bytes(), None, None).is_err());
    }

    #[test]
    fn test_single_column_table_is_rejected() {
        assert!(read_series("t\n1\n2\n".as_bytes(), None, None).is_err());
    }

    #[test]
    fn test_derive_output_path() {
        let path = derive_output_path(Path::new("data/run_a.csv"));
        assert_eq!(path, PathBuf::from("data/run_a_unwrapped.csv"));
    }

    #[test]
    fn test_csv_rows_leave_missing_values_blank() {
        let t = [f64::NAN, 1.0, 2.0, 3.0];
        let v = [f64::NAN, 1.0, 2.0, 3.0];
        let d = decompose(&t, &v, &Params::new(1.0)).unwrap();
        let mut writer = csv::Writer::from_writer(Vec::new());
        write_decomposition_rows(&d, &mut writer).unwrap();
        let text = String::from_utf8(writer.into_inner().unwrap()).unwrap();
        let lines: Vec<&str> = text.lines().collect();
        assert_eq!(lines[0], "t,v,smooth,residual,corrected_dv,shift");
        assert_eq!(lines[1], ",,,0,,0");
        assert_eq!(lines[4], "3,3,3,0,1,0");
    }

    #[test]
    fn test_diagnose_report_flags_wraps() {
        let series = read_series(TABLE.as_bytes(), None, None).unwrap();
        let report = diagnose_series("table", &series, Some(3.0));
        assert!(report.contains("valid rows: 4"));
        assert!(report.contains("seed row: 2"));
        assert!(report.contains("steps with |dV| >= quantum/2: 1 (3)"));
        assert!(report.contains("unwrap: ok (1 corrected steps, max |shift| 1)"));
    }

    fn unwrap_args(argv: &[&str]) -> UnwrapArgs {
        let cli = Cli::try_parse_from(argv).unwrap();
        match cli.command {
            Command::Unwrap(args) => args,
            Command::Diagnose(_) => panic!("expected unwrap arguments"),
        }
    }

    #[test]
    fn test_plot_paths_single_and_multi_input() {
        let args = unwrap_args(&[
            "vx-curve", "unwrap", "a.csv", "-q", "2", "--png", "fig.png", "--svg", "fig.svg",
        ]);
        let out = Path::new("out/a_unwrapped.csv");
        assert_eq!(
            plot_paths(&args, true, out),
            (Some(PathBuf::from("fig.png")), Some(PathBuf::from("fig.svg")))
        );
        assert_eq!(
            plot_paths(&args, false, out),
            (
                Some(PathBuf::from("out/a_unwrapped.png")),
                Some(PathBuf::from("out/a_unwrapped.svg"))
            )
        );

        let args = unwrap_args(&["vx-curve", "unwrap", "a.csv", "-q", "2"]);
        assert_eq!(plot_paths(&args, true, Path::new("-")), (None, None));
        assert_eq!(
            plot_paths(&args, true, Path::new("unwrapped.csv")),
            (Some(PathBuf::from("unwrapped.png")), None)
        );
    }

    #[test]
    fn test_unwrap_several_inputs_writes_per_input_outputs() {
        let dir = tempfile::tempdir().unwrap();
        let first = dir.path().join("run_a.csv");
        let second = dir.path().join("run_b.csv");
        fs::write(&first, "t,v\n0,0\n1,1\n2,2\n3,5\n4,6\n").unwrap();
        fs::write(&second, "t,v\n0,2\n1,1\n2,0\n3,2\n4,1\n").unwrap();
        let summary = dir.path().join("summary.json");

        let args = unwrap_args(&[
            "vx-curve",
            "unwrap",
            first.to_str().unwrap(),
            second.to_str().unwrap(),
            "-q",
            "3",
            "--no-plot",
            "--summary",
            summary.to_str().unwrap(),
        ]);
        let params_hash = Params::new(3.0).params_hash_sha256().unwrap();
        handle_unwrap(args).unwrap();

        let a = fs::read_to_string(dir.path().join("run_a_unwrapped.csv")).unwrap();
        let a_lines: Vec<&str> = a.lines().collect();
        assert_eq!(a_lines[0], "t,v,smooth,residual,corrected_dv,shift");
        assert_eq!(a_lines[4], "3,5,2,3,0,-1");
        assert_eq!(a_lines[5], "4,6,3,3,1,0");

        let b = fs::read_to_string(dir.path().join("run_b_unwrapped.csv")).unwrap();
        assert_eq!(b.lines().nth(4), Some("3,2,-1,3,-1,-1"));
        assert!(!dir.path().join("unwrapped.csv").exists());
        assert!(!dir.path().join("run_a_unwrapped.png").exists());

        let json: serde_json::Value =
            serde_json::from_str(&fs::read_to_string(&summary).unwrap()).unwrap();
        assert!(json["generated_at"].is_string());
        assert_eq!(json["params"]["quantum"], 3.0);
        let inputs = json["inputs"].as_array().unwrap();
        assert_eq!(inputs.len(), 2);
        assert!(inputs[0]["output"].as_str().unwrap().ends_with("run_a_unwrapped.csv"));
        assert!(inputs[1]["output"].as_str().unwrap().ends_with("run_b_unwrapped.csv"));
        assert_eq!(inputs[0]["diagnostics"]["corrected_steps"], 1);
        assert_eq!(inputs[0]["diagnostics"]["params_hash"], params_hash.as_str());
    }

    #[test]
    fn test_format_indices_truncates() {
        let many: Vec<usize> = (0..25).collect();
        let text = format_indices(&many);
        assert!(text.starts_with("25 (first 20: 0, 1,"));
        assert_eq!(format_indices(&[]), "none");
    }
}
