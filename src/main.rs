use std::time::Duration;

use anyhow::{bail, Context};
use clap::{Args, Parser, Subcommand};
use serde_json::Value;

use mapsweep_lib::config::Browser;
use mapsweep_lib::{
    generate, init_tracing, run_batch, storage, telemetry_for, AppConfig, BatchReport, Depth,
    QueryStatus, RunOptions,
};

#[derive(Parser)]
#[command(
    name = "mapsweep",
    version,
    about = "Resumable batch map search with administrative reverse geocoding"
)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Write a fresh batch file for "<term> <location>" without querying
    Generate {
        term: String,
        output: String,
        #[command(flatten)]
        source: SourceArgs,
        /// Pretty-print indent (0 for compact output)
        #[arg(long, default_value_t = 2)]
        indent: usize,
    },
    /// Generate a batch and run every query in it
    Query {
        term: String,
        output: String,
        #[command(flatten)]
        source: SourceArgs,
        #[command(flatten)]
        run: RunArgs,
    },
    /// Continue a batch from a save or autosave file
    Resume {
        save: String,
        output: String,
        #[command(flatten)]
        run: RunArgs,
    },
}

#[derive(Args)]
#[group(required = true, multiple = false)]
struct SourceArgs {
    /// Comma-separated locations
    #[arg(long, value_delimiter = ',')]
    cities: Option<Vec<String>>,
    /// JSON array or text file with one location per line
    #[arg(long = "source", alias = "file")]
    source: Option<String>,
}

#[derive(Args)]
struct RunArgs {
    /// Pages to load per query; 0 scrolls until the list ends
    #[arg(short, long)]
    depth: Option<u32>,
    /// Query language
    #[arg(short, long)]
    lang: Option<String>,
    /// firefox or chrome
    #[arg(long)]
    browser: Option<String>,
    /// Show the browser window
    #[arg(long)]
    show: bool,
    /// Seconds to wait after opening each search
    #[arg(long)]
    init_pause: Option<f64>,
    /// Replace {timestamp} in the output name with the current time
    #[arg(long)]
    timestamp: bool,
    #[arg(long)]
    keep_autosave: bool,
    /// Keep places outside the queried city
    #[arg(long)]
    no_filter: bool,
    #[arg(long)]
    flat: bool,
    #[arg(long)]
    ascii: bool,
    #[arg(long)]
    replace_newline: bool,
    #[arg(long)]
    indent: Option<usize>,
    /// Also write the batch before postprocessing
    #[arg(long)]
    raw: Option<String>,
    /// Write the status report as JSON
    #[arg(long)]
    report: Option<String>,
    /// Write flattened results as CSV
    #[arg(long)]
    csv: Option<String>,
}

impl RunArgs {
    fn apply(&self, config: &mut AppConfig) -> anyhow::Result<()> {
        if let Some(depth) = self.depth {
            config.query.depth = Depth::from_count(depth);
        }
        if let Some(lang) = &self.lang {
            config.query.lang = lang.clone();
        }
        if let Some(browser) = &self.browser {
            config.webclient.browser = Browser::parse(browser)?;
        }
        if let Some(pause) = self.init_pause {
            if !pause.is_finite() || pause < 0.0 {
                bail!("initial pause must be a non-negative number of seconds");
            }
            config.query.initial_pause = Duration::from_secs_f64(pause);
        }
        if let Some(indent) = self.indent {
            config.fileio.output_indent = indent;
        }
        config.webclient.show |= self.show;
        config.fileio.keep_autosave |= self.keep_autosave;
        config.postproc.filter_by_city &= !self.no_filter;
        config.postproc.flatten |= self.flat;
        config.postproc.convert_ascii |= self.ascii;
        config.postproc.replace_newline |= self.replace_newline;
        Ok(())
    }

    fn options(&self, output: &str) -> anyhow::Result<RunOptions> {
        Ok(RunOptions {
            raw_output: self.raw.clone(),
            report_output: self.report.clone(),
            csv_output: self.csv.clone(),
            ..RunOptions::new(output, self.timestamp)?
        })
    }
}

fn source_items(source: &SourceArgs) -> anyhow::Result<Vec<Value>> {
    match (&source.cities, &source.source) {
        (Some(cities), _) => Ok(cities.iter().cloned().map(Value::String).collect()),
        (None, Some(path)) => storage::read_source_items(path)
            .with_context(|| format!("failed to read locations from {path}")),
        (None, None) => bail!("either --cities or --source is required"),
    }
}

fn print_report(report: &BatchReport) {
    for entry in &report.entries {
        println!(
            "{:>5}  {:<38}  {}",
            entry.no,
            entry.status.as_tag(),
            entry.query.as_deref().unwrap_or("-")
        );
    }
    println!();
    for status in QueryStatus::ALL {
        println!("{:<38}  {}", status.as_tag(), report.count(status));
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    init_tracing();
    let cli = Cli::parse();
    let mut config = AppConfig::from_env();

    match cli.command {
        Commands::Generate {
            term,
            output,
            source,
            indent,
        } => {
            let telemetry = telemetry_for(&config)?;
            let records = generate(&term, source_items(&source)?, &telemetry);
            storage::write_json(&output, &records, indent)?;
            telemetry.flush();
            println!("Generated {} queries into {output}", records.len());
        }
        Commands::Query {
            term,
            output,
            source,
            run,
        } => {
            run.apply(&mut config)?;
            let options = run.options(&output)?;
            let telemetry = telemetry_for(&config)?;
            let records = generate(&term, source_items(&source)?, &telemetry);
            let report = run_batch(records, &config, &options, telemetry).await?;
            print_report(&report);
        }
        Commands::Resume { save, output, run } => {
            run.apply(&mut config)?;
            let options = run.options(&output)?;
            let records = storage::read_batch(&save)
                .with_context(|| format!("failed to read batch from {save}"))?;
            let telemetry = telemetry_for(&config)?;
            let report = run_batch(records, &config, &options, telemetry).await?;
            print_report(&report);
        }
    }
    Ok(())
}
