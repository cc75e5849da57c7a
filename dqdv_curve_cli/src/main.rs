use std::collections::BTreeMap;
use std::fs;
use std::fs::File;
use std::io::{self, Read, Write};
use std::path::{Path, PathBuf};
use std::time::Instant;

use anyhow::{anyhow, bail, Context, Result};
use chrono::Utc;
use clap::{ArgAction, Parser, Subcommand, ValueHint};
use dqdv_curve::{
    analyze_cycles, coulombic_efficiency, group_cycles, state_of_health, summarize_cycles,
    Analysis, Describe, OutputKind, Params, StepKind, StepRecord,
};
use rayon::prelude::*;
use serde::Deserialize;
use serde_json::json;
use tracing::{debug, info, warn};
use tracing_subscriber::EnvFilter;

#[derive(Parser, Debug)]
#[command(author, version, about = "Battery cycler dQ/dV analysis CLI", long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Compute dQ/dV curves, peaks, Gaussian fits and cycle metrics
    Analyze(AnalyzeArgs),
    /// Summarise cycles and steps of cycler exports
    Inspect(InspectArgs),
}

#[derive(Parser, Debug)]
struct AnalyzeArgs {
    /// Cycler record tables (tab separated by default)
    #[arg(required = true, value_hint = ValueHint::FilePath)]
    inputs: Vec<PathBuf>,

    /// Output directory for result tables
    #[arg(short, long, default_value = "dqdv_out", value_hint = ValueHint::DirPath)]
    output: PathBuf,

    /// Params JSON document; flags below override its fields
    #[arg(long, value_hint = ValueHint::FilePath)]
    config: Option<PathBuf>,

    /// Column delimiter (`tab`, `,`, `;`, ...)
    #[arg(long, default_value = "tab")]
    delimiter: String,

    /// Number of points on the resampled voltage grid
    #[arg(long)]
    interpolation_points: Option<usize>,

    /// Savitzky-Golay window length (odd)
    #[arg(long)]
    window_length: Option<usize>,

    /// Savitzky-Golay polynomial order
    #[arg(long)]
    polyorder: Option<usize>,

    /// Samples on each side of a peak used for the Gaussian fit
    #[arg(long)]
    fit_half_width: Option<usize>,

    /// Lower bound of the peak height threshold (mAh/V)
    #[arg(long)]
    min_height: Option<f64>,

    /// Upper bound of the peak height threshold (mAh/V)
    #[arg(long)]
    max_height: Option<f64>,

    /// Height threshold step per search iteration
    #[arg(long)]
    height_step: Option<f64>,

    /// Lower bound of the prominence threshold (mAh/V)
    #[arg(long)]
    min_prominence: Option<f64>,

    /// Upper bound of the prominence threshold (mAh/V)
    #[arg(long)]
    max_prominence: Option<f64>,

    /// Prominence threshold step per search iteration
    #[arg(long)]
    prominence_step: Option<f64>,

    /// Threshold adjustments before the peak search gives up
    #[arg(long)]
    max_iterations: Option<usize>,

    /// Largest acceptable peak count per branch
    #[arg(long)]
    max_peaks: Option<usize>,

    /// Initial Gaussian sigma for charge peaks (V)
    #[arg(long)]
    charge_sigma: Option<f64>,

    /// Initial Gaussian sigma for discharge peaks (V)
    #[arg(long)]
    discharge_sigma: Option<f64>,

    /// Model evaluation budget per Gaussian fit
    #[arg(long)]
    max_fit_evaluations: Option<usize>,

    /// Rated capacity (mAh); enables the state-of-health table
    #[arg(long)]
    rated_capacity: Option<f64>,

    /// Enabled outputs (comma separated: raw,resampled,smoothed,peaks-fitting,device)
    #[arg(long)]
    outputs: Option<String>,

    /// Verbose logging
    #[arg(long, action = ArgAction::SetTrue)]
    verbose: bool,

    /// Profile major stages with timings
    #[arg(long, action = ArgAction::SetTrue)]
    profile: bool,
}

#[derive(Parser, Debug)]
struct InspectArgs {
    /// Cycler record tables to inspect
    #[arg(required = true, value_hint = ValueHint::FilePath)]
    inputs: Vec<PathBuf>,

    /// Output report path
    #[arg(short, long, default_value = "dqdv_inspect.txt", value_hint = ValueHint::FilePath)]
    output: PathBuf,

    /// Column delimiter (`tab`, `,`, `;`, ...)
    #[arg(long, default_value = "tab")]
    delimiter: String,

    /// Verbose logging
    #[arg(long, action = ArgAction::SetTrue)]
    verbose: bool,
}

/// One row of a cycler export. Unknown columns are ignored.
#[derive(Debug, Deserialize)]
struct RecordRow {
    #[serde(rename = "Cycle ID")]
    cycle_id: u32,
    #[serde(rename = "Step Name")]
    step: String,
    #[serde(rename = "Voltage(V)", alias = "Voltage (V)", alias = "Voltage")]
    voltage: f64,
    #[serde(rename = "Current(mA)", alias = "Current (mA)", alias = "Current")]
    current: f64,
    #[serde(rename = "Capacity(mAh)", alias = "Capacity (mAh)", alias = "Capacity")]
    capacity: f64,
    #[serde(rename = "dQ/dV(mAh/V)", alias = "dQ/dV (mAh/V)", default)]
    dqdv: Option<f64>,
}

impl From<RecordRow> for StepRecord {
    fn from(row: RecordRow) -> Self {
        StepRecord {
            cycle_id: row.cycle_id,
            step: StepKind::from_name(&row.step),
            voltage: row.voltage,
            current: row.current,
            capacity: row.capacity,
            dqdv: row.dqdv,
        }
    }
}

fn main() -> Result<()> {
    let cli = Cli::parse();
    let verbose = match &cli.command {
        Command::Analyze(args) => args.verbose,
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
        Command::Analyze(args) => handle_analyze(args),
        Command::Inspect(args) => handle_inspect(args),
    }
}

fn handle_analyze(args: AnalyzeArgs) -> Result<()> {
    let params = build_params(&args)?;
    params.validate().context("invalid analysis parameters")?;
    let params_hash = params.params_hash()?;
    let delimiter = parse_delimiter(&args.delimiter)?;
    debug!(hash = %params_hash, "analysis parameters ready");

    fs::create_dir_all(&args.output)
        .with_context(|| format!("failed to create {}", args.output.display()))?;

    let t_parse = Instant::now();
    let inputs = load_inputs(&args.inputs, delimiter)?;
    if args.profile || args.verbose {
        info!(
            "Parse stage: {:.1} ms ({} files)",
            t_parse.elapsed().as_secs_f64() * 1000.0,
            inputs.len()
        );
    }

    for (path, records) in &inputs {
        let stem = file_stem(path);
        let cycles = group_cycles(records);
        if cycles.is_empty() {
            warn!("No cycles found in {}; skipping", path.display());
            continue;
        }

        let t_compute = Instant::now();
        let analysis = analyze_cycles(&cycles, &params)
            .with_context(|| format!("failed to analyse {}", path.display()))?;
        if args.profile || args.verbose {
            info!(
                "Compute stage for {}: {:.1} ms ({} cycles)",
                stem,
                t_compute.elapsed().as_secs_f64() * 1000.0,
                cycles.len()
            );
        }
        info!(
            "Analysed {}: {} cycles, {} peaks, {} fits, {} skipped, {} failed branches",
            stem,
            cycles.len(),
            analysis.peaks.len(),
            analysis.fits.len(),
            analysis.skipped_cycles.len(),
            analysis.failures.len()
        );

        let t_write = Instant::now();
        let base = args.output.join(&stem);
        let output_set = params.output_set();
        write_dqdv_csv(&analysis, &table_path(&base, "dqdv"))?;
        if !analysis.failures.is_empty() {
            write_failures_csv(&analysis, &table_path(&base, "failures"))?;
        }
        if output_set.peaks_fitting {
            write_peaks_csv(&analysis, &table_path(&base, "peaks"))?;
            write_fitting_csv(&analysis, &table_path(&base, "fitting"))?;
            write_overvoltage_csv(&analysis, &table_path(&base, "overvoltage"))?;
            write_search_csv(&analysis, &table_path(&base, "search"))?;
        }

        let ce = coulombic_efficiency(&cycles);
        write_ce_csv(&ce, &table_path(&base, "ce"))?;
        let soh_rows = match params.rated_capacity {
            Some(rated) => {
                let rows = state_of_health(&cycles, rated)?;
                write_soh_csv(&rows, &table_path(&base, "soh"))?;
                Some(rows.len())
            }
            None => None,
        };

        let summary = json!({
            "input": path.display().to_string(),
            "generated_at": Utc::now().to_rfc3339(),
            "params": &params,
            "params_hash": &params_hash,
            "records": records.len(),
            "cycles": cycles.len(),
            "skipped_cycles": &analysis.skipped_cycles,
            "failures": &analysis.failures,
            "curves": analysis.curves.len(),
            "peaks": analysis.peaks.len(),
            "fits": analysis.fits.len(),
            "overvoltage": analysis.overvoltage.len(),
            "coulombic_efficiency": ce.len(),
            "state_of_health": soh_rows,
        });
        let summary_path = args.output.join(format!("{}_summary.json", stem));
        let text = serde_json::to_string_pretty(&summary)?;
        fs::write(&summary_path, text)
            .with_context(|| format!("failed to write {}", summary_path.display()))?;

        if args.profile || args.verbose {
            info!(
                "CSV stage for {}: {:.1} ms",
                stem,
                t_write.elapsed().as_secs_f64() * 1000.0
            );
        }
        info!("Wrote results: {}_*", base.display());
    }

    Ok(())
}

fn build_params(args: &AnalyzeArgs) -> Result<Params> {
    let mut params = match args.config.as_ref() {
        Some(path) => {
            let text = fs::read_to_string(path)
                .with_context(|| format!("failed to read {}", path.display()))?;
            serde_json::from_str::<Params>(&text)
                .with_context(|| format!("failed to parse {}", path.display()))?
        }
        None => Params::default(),
    };

    if let Some(v) = args.interpolation_points {
        params.interpolation_points = v;
    }
    if let Some(v) = args.window_length {
        params.window_length = v;
    }
    if let Some(v) = args.polyorder {
        params.polyorder = v;
    }
    if let Some(v) = args.fit_half_width {
        params.fit_half_width = v;
    }
    let search = &mut params.peak_search;
    if let Some(v) = args.min_height {
        search.min_height = v;
    }
    if let Some(v) = args.max_height {
        search.max_height = v;
    }
    if let Some(v) = args.height_step {
        search.height_step = v;
    }
    if let Some(v) = args.min_prominence {
        search.min_prominence = v;
    }
    if let Some(v) = args.max_prominence {
        search.max_prominence = v;
    }
    if let Some(v) = args.prominence_step {
        search.prominence_step = v;
    }
    if let Some(v) = args.max_iterations {
        search.max_iterations = v;
    }
    if let Some(v) = args.max_peaks {
        search.max_peaks = v;
    }
    if let Some(v) = args.charge_sigma {
        params.charge_sigma_seed = v;
    }
    if let Some(v) = args.discharge_sigma {
        params.discharge_sigma_seed = v;
    }
    if let Some(v) = args.max_fit_evaluations {
        params.max_fit_evaluations = v;
    }
    if let Some(v) = args.rated_capacity {
        params.rated_capacity = Some(v);
    }
    if let Some(list) = args.outputs.as_ref() {
        params.outputs = parse_outputs(list)?;
    }
    Ok(params)
}

fn parse_outputs(input: &str) -> Result<Vec<OutputKind>> {
    let mut kinds = Vec::new();
    for token in input.split(',') {
        let token = token.trim();
        if token.is_empty() {
            continue;
        }
        let kind = OutputKind::parse(token).ok_or_else(|| anyhow!("unknown output '{}'", token))?;
        if !kinds.contains(&kind) {
            kinds.push(kind);
        }
    }
    Ok(kinds)
}

fn parse_delimiter(input: &str) -> Result<u8> {
    match input {
        "tab" | "\\t" | "\t" => Ok(b'\t'),
        other => {
            let bytes = other.as_bytes();
            if bytes.len() == 1 && bytes[0].is_ascii() {
                Ok(bytes[0])
            } else {
                bail!("delimiter must be a single ASCII character or 'tab', got '{}'", other)
            }
        }
    }
}

/// Parse every input file in parallel, keeping the command-line order.
fn load_inputs(paths: &[PathBuf], delimiter: u8) -> Result<Vec<(PathBuf, Vec<StepRecord>)>> {
    paths
        .par_iter()
        .map(|path| -> Result<(PathBuf, Vec<StepRecord>)> {
            let file =
                File::open(path).with_context(|| format!("failed to open {}", path.display()))?;
            let records = read_records(file, delimiter)
                .with_context(|| format!("failed to parse {}", path.display()))?;
            debug!("Parsed {} records from {}", records.len(), path.display());
            Ok((path.clone(), records))
        })
        .collect()
}

fn read_records<R: Read>(reader: R, delimiter: u8) -> Result<Vec<StepRecord>> {
    let mut reader = csv::ReaderBuilder::new()
        .delimiter(delimiter)
        .trim(csv::Trim::All)
        .flexible(true)
        .from_reader(reader);
    let mut records = Vec::new();
    for (line, row) in reader.deserialize::<RecordRow>().enumerate() {
        let row = row.with_context(|| format!("bad record at data row {}", line + 1))?;
        records.push(row.into());
    }
    Ok(records)
}

fn file_stem(path: &Path) -> String {
    path.file_stem()
        .map(|s| s.to_string_lossy().into_owned())
        .unwrap_or_else(|| "input".into())
}

fn table_path(base: &Path, table: &str) -> PathBuf {
    let mut name = base.as_os_str().to_owned();
    name.push(format!("_{}.csv", table));
    PathBuf::from(name)
}

fn create_writer(path: &Path) -> Result<csv::Writer<File>> {
    let file =
        File::create(path).with_context(|| format!("failed to create {}", path.display()))?;
    Ok(csv::Writer::from_writer(file))
}

fn fmt_value(value: f64) -> String {
    format!("{:.6}", value)
}

fn write_dqdv_csv(analysis: &Analysis, path: &Path) -> Result<()> {
    let mut writer = create_writer(path)?;
    write_dqdv_rows(analysis, &mut writer)
}

fn write_dqdv_rows<W: Write>(analysis: &Analysis, writer: &mut csv::Writer<W>) -> Result<()> {
    writer.write_record(["cycle_id", "branch", "variant", "voltage_v", "dqdv_mah_per_v"])?;
    for curve in &analysis.curves {
        let cycle = curve.cycle_id.to_string();
        let branch = curve.branch.as_str();
        let mut variants: Vec<(&str, &[f64], &[f64])> =
            vec![("smoothed", curve.voltage.as_slice(), curve.smoothed.as_slice())];
        if let Some(resampled) = curve.resampled.as_ref() {
            variants.push(("resampled", curve.voltage.as_slice(), resampled.as_slice()));
        }
        if let Some((voltage, raw)) = curve.raw.as_ref() {
            variants.push(("raw", voltage.as_slice(), raw.as_slice()));
        }
        if let Some((voltage, device)) = curve.device.as_ref() {
            variants.push(("device", voltage.as_slice(), device.as_slice()));
        }
        for (variant, voltage, values) in variants {
            for (v, d) in voltage.iter().zip(values.iter()) {
                writer.write_record([
                    cycle.as_str(),
                    branch,
                    variant,
                    fmt_value(*v).as_str(),
                    fmt_value(*d).as_str(),
                ])?;
            }
        }
    }
    writer.flush()?;
    Ok(())
}

fn write_peaks_csv(analysis: &Analysis, path: &Path) -> Result<()> {
    let mut writer = create_writer(path)?;
    writer.write_record([
        "cycle_id",
        "branch",
        "peak",
        "index",
        "voltage_v",
        "dqdv_mah_per_v",
        "prominence",
    ])?;
    for peak in &analysis.peaks {
        writer.write_record([
            peak.cycle_id.to_string(),
            peak.branch.as_str().to_string(),
            peak.ordinal.to_string(),
            peak.index.to_string(),
            fmt_value(peak.voltage),
            fmt_value(peak.dqdv),
            fmt_value(peak.prominence),
        ])?;
    }
    writer.flush()?;
    Ok(())
}

fn write_fitting_csv(analysis: &Analysis, path: &Path) -> Result<()> {
    let mut writer = create_writer(path)?;
    writer.write_record(["cycle_id", "branch", "peak", "amplitude", "mean", "sigma", "area"])?;
    for fit in &analysis.fits {
        writer.write_record([
            fit.cycle_id.to_string(),
            fit.branch.as_str().to_string(),
            fit.ordinal.to_string(),
            fmt_value(fit.amplitude),
            fmt_value(fit.mean),
            fmt_value(fit.sigma),
            fmt_value(fit.area),
        ])?;
    }
    writer.flush()?;
    Ok(())
}

fn write_overvoltage_csv(analysis: &Analysis, path: &Path) -> Result<()> {
    let mut writer = create_writer(path)?;
    writer.write_record([
        "cycle_id",
        "peak",
        "charge_voltage_v",
        "discharge_voltage_v",
        "overvoltage_v",
    ])?;
    for row in &analysis.overvoltage {
        writer.write_record([
            row.cycle_id.to_string(),
            row.ordinal.to_string(),
            fmt_value(row.charge_voltage),
            fmt_value(row.discharge_voltage),
            fmt_value(row.overvoltage),
        ])?;
    }
    writer.flush()?;
    Ok(())
}

fn write_search_csv(analysis: &Analysis, path: &Path) -> Result<()> {
    let mut writer = create_writer(path)?;
    writer.write_record([
        "cycle_id",
        "branch",
        "outcome",
        "iterations",
        "height",
        "prominence",
        "peaks",
    ])?;
    for search in &analysis.searches {
        writer.write_record([
            search.cycle_id.to_string(),
            search.branch.as_str().to_string(),
            search.outcome.as_str().to_string(),
            search.iterations.to_string(),
            fmt_value(search.height),
            fmt_value(search.prominence),
            search.peaks.to_string(),
        ])?;
    }
    writer.flush()?;
    Ok(())
}

fn write_failures_csv(analysis: &Analysis, path: &Path) -> Result<()> {
    let mut writer = create_writer(path)?;
    writer.write_record(["cycle_id", "branch", "reason"])?;
    for failure in &analysis.failures {
        writer.write_record([
            failure.cycle_id.to_string(),
            failure.branch.as_str().to_string(),
            failure.reason.clone(),
        ])?;
    }
    writer.flush()?;
    Ok(())
}

fn write_ce_csv(rows: &[dqdv_curve::CoulombicEfficiencyRow], path: &Path) -> Result<()> {
    let mut writer = create_writer(path)?;
    writer.write_record([
        "cycle_id",
        "charge_capacity_mah",
        "discharge_capacity_mah",
        "coulombic_efficiency_pct",
    ])?;
    for row in rows {
        writer.write_record([
            row.cycle_id.to_string(),
            fmt_value(row.charge_capacity),
            fmt_value(row.discharge_capacity),
            fmt_value(row.efficiency),
        ])?;
    }
    writer.flush()?;
    Ok(())
}

fn write_soh_csv(rows: &[dqdv_curve::StateOfHealthRow], path: &Path) -> Result<()> {
    let mut writer = create_writer(path)?;
    writer.write_record(["cycle_id", "max_capacity_mah", "soh_pct"])?;
    for row in rows {
        writer.write_record([
            row.cycle_id.to_string(),
            fmt_value(row.max_capacity),
            fmt_value(row.soh),
        ])?;
    }
    writer.flush()?;
    Ok(())
}

fn handle_inspect(args: InspectArgs) -> Result<()> {
    let delimiter = parse_delimiter(&args.delimiter)?;
    let inputs = load_inputs(&args.inputs, delimiter)?;

    let mut report = String::new();
    for (path, records) in &inputs {
        report.push_str(&inspect_report(path, records));
        report.push('\n');
    }

    fs::write(&args.output, report)
        .with_context(|| format!("failed to write {}", args.output.display()))?;
    info!("Inspection report written: {}", args.output.display());
    Ok(())
}

fn inspect_report(path: &Path, records: &[StepRecord]) -> String {
    let mut steps: BTreeMap<u32, BTreeMap<String, usize>> = BTreeMap::new();
    for record in records {
        *steps
            .entry(record.cycle_id)
            .or_default()
            .entry(record.step.name().to_string())
            .or_insert(0) += 1;
    }
    let cycles = group_cycles(records);

    let mut report = String::new();
    report.push_str(&format!("FILE: {}\n", path.display()));
    report.push_str(&format!("  records: {}\n", records.len()));
    report.push_str(&format!("  cycles: {}\n", steps.len()));

    let incomplete: Vec<String> = cycles
        .iter()
        .filter(|c| c.charge.is_none() || c.discharge.is_none())
        .map(|c| c.id.to_string())
        .collect();
    if !incomplete.is_empty() {
        report.push_str(&format!(
            "  cycles missing a branch: {}\n",
            incomplete.join(", ")
        ));
    }

    report.push_str("  steps:\n");
    for (cycle_id, counts) in &steps {
        let parts: Vec<String> = counts
            .iter()
            .map(|(name, count)| format!("{}={}", name, count))
            .collect();
        report.push_str(&format!("    - cycle {}: {}\n", cycle_id, parts.join(", ")));
    }

    report.push_str("  statistics:\n");
    for summary in summarize_cycles(records) {
        report.push_str(&format!("    - cycle {}:\n", summary.cycle_id));
        let columns = [
            ("voltage_v", &summary.voltage),
            ("current_ma", &summary.current),
            ("capacity_mah", &summary.capacity),
            ("dqdv_mah_per_v", &summary.dqdv),
        ];
        for (name, stats) in columns {
            report.push_str(&format!("        {}: {}\n", name, describe_line(stats.as_ref())));
        }
    }
    report
}

fn describe_line(stats: Option<&Describe>) -> String {
    match stats {
        Some(d) => format!(
            "count={} mean={:.3} std={:.3} min={:.3} 25%={:.3} 50%={:.3} 75%={:.3} max={:.3}",
            d.count, d.mean, d.std, d.min, d.q25, d.median, d.q75, d.max
        ),
        None => "n/a".into(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const SAMPLE: &str = "Record ID\tCycle ID\tStep Name\tVoltage(V)\tCurrent(mA)\tCapacity(mAh)\tdQ/dV(mAh/V)\n\
        1\t1\tCC_Chg\t3.0\t1000\t0\t\n\
        2\t1\tCC_Chg\t4.2\t1000\t1800\t1500\n\
        3\t1\tCV_Chg\t4.2\t200\t50\t0\n\
        4\t1\tCC_DChg\t3.0\t-1000\t1700\t-1400\n";

    #[test]
    fn reads_tab_separated_export() {
        let records = read_records(SAMPLE.as_bytes(), b'\t').unwrap();
        assert_eq!(records.len(), 4);
        assert_eq!(records[0].step, StepKind::CcCharge);
        assert_eq!(records[0].dqdv, None);
        assert_eq!(records[1].dqdv, Some(1500.0));
        assert_eq!(records[3].step, StepKind::CcDischarge);

        let cycles = group_cycles(&records);
        assert_eq!(
            cycles[0].charge.as_ref().unwrap().capacity,
            vec![0.0, 1800.0, 1850.0]
        );
    }

    #[test]
    fn reads_spaced_headers_without_dqdv() {
        let text = "Cycle ID,Step Name,Voltage (V),Current (mA),Capacity (mAh)\n2,Rest,3.5,0,0\n";
        let records = read_records(text.as_bytes(), b',').unwrap();
        assert_eq!(records.len(), 1);
        assert_eq!(records[0].cycle_id, 2);
        assert_eq!(records[0].step, StepKind::Rest);
        assert!(records[0].dqdv.is_none());
    }

    #[test]
    fn bad_rows_report_their_position() {
        let text = "Cycle ID,Step Name,Voltage(V),Current(mA),Capacity(mAh)\n1,CC_Chg,abc,0,0\n";
        let err = read_records(text.as_bytes(), b',').unwrap_err();
        assert!(format!("{:#}", err).contains("data row 1"));
    }

    #[test]
    fn dqdv_table_includes_device_rows() {
        let analysis = Analysis {
            curves: vec![dqdv_curve::DqdvCurve {
                cycle_id: 3,
                branch: dqdv_curve::Branch::Charge,
                voltage: vec![3.0, 3.1],
                smoothed: vec![10.0, 20.0],
                resampled: None,
                raw: None,
                device: Some((vec![3.0, 3.05, 3.1], vec![9.0, 15.0, 21.0])),
            }],
            ..Analysis::default()
        };
        let mut writer = csv::Writer::from_writer(Vec::new());
        write_dqdv_rows(&analysis, &mut writer).unwrap();
        let text = String::from_utf8(writer.into_inner().unwrap()).unwrap();
        assert_eq!(text.lines().filter(|l| l.contains(",smoothed,")).count(), 2);
        assert_eq!(text.lines().filter(|l| l.contains(",device,")).count(), 3);
        assert!(text.contains("3,Charge,device,3.050000,15.000000"));
    }

    #[test]
    fn delimiter_tokens() {
        assert_eq!(parse_delimiter("tab").unwrap(), b'\t');
        assert_eq!(parse_delimiter(",").unwrap(), b',');
        assert!(parse_delimiter(";;").is_err());
    }

    #[test]
    fn output_list_is_parsed_and_deduplicated() {
        let kinds = parse_outputs("raw, peaks,raw,,smoothed").unwrap();
        assert_eq!(
            kinds,
            vec![OutputKind::Raw, OutputKind::PeaksFitting, OutputKind::Smoothed]
        );
        assert!(parse_outputs("plots").is_err());
    }

    #[test]
    fn table_paths_share_the_input_stem() {
        let base = Path::new("out").join(file_stem(Path::new("data/cell_07.txt")));
        assert_eq!(table_path(&base, "peaks"), Path::new("out").join("cell_07_peaks.csv"));
    }

    #[test]
    fn inspect_report_lists_steps_and_statistics() {
        let records = read_records(SAMPLE.as_bytes(), b'\t').unwrap();
        let report = inspect_report(Path::new("cell.txt"), &records);
        assert!(report.contains("records: 4"));
        assert!(report.contains("cycle 1: CC_Chg=2, CC_DChg=1, CV_Chg=1"));
        assert!(report.contains("dqdv_mah_per_v: count=3"));
    }
}
