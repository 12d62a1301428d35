//! Distributed spelling and grammar correction pipeline CLI
//!
//! Provides commands for running the correction pipeline over a document
//! and for managing the remote module servers it dispatches to.
use clap::{Args, Parser};
use inline_colorization::{color_red, color_reset, color_yellow};
use prettytable::{row, Table};
use std::collections::BTreeMap;
use std::path::PathBuf;
use std::process;
use tracing_subscriber::filter::{EnvFilter, LevelFilter};

use corrigo::{Error, Parameters, Runtime};

#[derive(Parser)]
#[command(name = "corrigo")]
#[command(bin_name = "corrigo")]
enum CorrigoCli {
    /// Run the correction pipeline over a document
    Run(RunArgs),
    /// Start servers for every non-local module targeted at this host
    Startservers(ServersArgs),
    /// Stop this host's registered module servers
    Stopservers(ServersArgs),
    /// Probe and list registered module servers
    Listservers(ConfigArgs),
    /// Serve one module on host:port (used internally by startservers)
    Startserver(StartServerArgs),
    /// Remove every PID file, live servers included (destructive)
    Wipe(ConfigArgs),
}

#[derive(clap::ValueEnum, Clone, Default, Debug)]
enum LogLevel {
    Info,
    Debug,
    Trace,
    Error,
    #[default]
    None,
}

#[derive(Args)]
#[command(author, version, about, long_about = None)]
struct ConfigArgs {
    #[arg(short, long)]
    config: PathBuf,
    #[arg(short, long, value_enum, default_value = "none")]
    log_level: LogLevel,
}

#[derive(Args)]
#[command(author, version, about, long_about = None)]
struct ServersArgs {
    #[arg(short, long)]
    config: PathBuf,
    /// Restrict to these module ids
    modules: Vec<String>,
    #[arg(short, long, value_enum, default_value = "none")]
    log_level: LogLevel,
}

#[derive(Args)]
#[command(author, version, about, long_about = None)]
struct StartServerArgs {
    #[arg(short, long)]
    config: PathBuf,
    module: String,
    host: String,
    port: u16,
    #[arg(short, long, value_enum, default_value = "info")]
    log_level: LogLevel,
}

#[derive(Args)]
#[command(author, version, about, long_about = None)]
struct RunArgs {
    #[arg(short, long)]
    config: PathBuf,
    /// Input document: structured JSON or plain text to tokenize
    input: PathBuf,
    /// Restrict the run to these module ids
    modules: Vec<String>,
    /// Output file; defaults to the structured form of the input path
    #[arg(short, long)]
    output: Option<PathBuf>,
    /// Free-form key=value parameters handed to every module
    #[arg(short = 'p', long = "param", value_parser = parse_key_val)]
    params: Vec<(String, String)>,
    /// Force every module local, regardless of running servers
    #[arg(long)]
    local: bool,
    /// Write the corrected document to stdout as JSON instead of a file
    #[arg(long, conflicts_with = "dump_xml")]
    dump_json: bool,
    /// Write the corrected document to stdout as XML instead of a file
    #[arg(long)]
    dump_xml: bool,
    #[arg(short, long, value_enum, default_value = "none")]
    log_level: LogLevel,
}

fn parse_key_val(s: &str) -> Result<(String, String), String> {
    s.split_once('=')
        .map(|(k, v)| (k.to_string(), v.to_string()))
        .ok_or_else(|| format!("invalid key=value parameter: {s}"))
}

fn subset(modules: Vec<String>) -> Option<Vec<String>> {
    if modules.is_empty() {
        None
    } else {
        Some(modules)
    }
}

#[tokio::main]
async fn main() {
    let result = match CorrigoCli::parse() {
        CorrigoCli::Run(args) => {
            setup_subscriber(args.log_level.clone());
            run(args).await
        }
        CorrigoCli::Startservers(args) => {
            setup_subscriber(args.log_level.clone());
            start_servers(args).await
        }
        CorrigoCli::Stopservers(args) => {
            setup_subscriber(args.log_level.clone());
            stop_servers(args).await
        }
        CorrigoCli::Listservers(args) => {
            setup_subscriber(args.log_level.clone());
            list_servers(args).await
        }
        CorrigoCli::Startserver(args) => {
            setup_subscriber(args.log_level.clone());
            start_server(args).await
        }
        CorrigoCli::Wipe(args) => {
            setup_subscriber(args.log_level.clone());
            wipe(args).await
        }
    };

    match result {
        Ok(()) => process::exit(0),
        Err(e) => {
            eprintln!("{color_red}{e}{color_reset}");
            process::exit(1);
        }
    }
}

async fn run(args: RunArgs) -> Result<(), Error> {
    let mut runtime = Runtime::from_config_file(&args.config).await?;
    runtime.set_force_local(args.local);
    runtime.set_module_subset(subset(args.modules));
    let params: Parameters = args.params.into_iter().collect();
    runtime.set_metadata(metadata_from_params(&params));
    runtime.set_parameters(params);

    let (doc, _report) = runtime.run_file(&args.input).await?;

    if args.dump_json {
        println!("{}", doc.to_json_string()?);
    } else if args.dump_xml {
        print!("{}", doc.to_xml());
    } else {
        let output = args
            .output
            .unwrap_or_else(|| Runtime::default_output_path(&args.input));
        doc.save(&output)?;
        println!("corrected document written to {}", output.display());
    }
    Ok(())
}

async fn start_servers(args: ServersArgs) -> Result<(), Error> {
    let runtime = Runtime::from_config_file(&args.config).await?;
    let only = subset(args.modules);
    let started = runtime
        .registry()
        .start_servers(&runtime.config().modules, only.as_deref(), &args.config)
        .await?;
    for d in &started {
        println!("started {} on {}:{}", d.module_id, d.host, d.port);
    }
    println!("{} server(s) started", started.len());
    Ok(())
}

async fn stop_servers(args: ServersArgs) -> Result<(), Error> {
    let runtime = Runtime::from_config_file(&args.config).await?;
    let only = subset(args.modules);
    let stopped = runtime.registry().stop_servers(only.as_deref())?;
    for d in &stopped {
        println!("stopped {} on {}:{}", d.module_id, d.host, d.port);
    }
    println!("{} server(s) stopped", stopped.len());
    Ok(())
}

async fn list_servers(args: ConfigArgs) -> Result<(), Error> {
    let runtime = Runtime::from_config_file(&args.config).await?;
    let found = runtime.registry().find_servers().await?;

    let mut table = Table::new();
    let _ = table.add_row(row!["MODULE", "HOST", "PORT", "LOAD"]);
    let mut total = 0;
    for (module, servers) in &found {
        for s in servers {
            let _ = table.add_row(row![module, s.host, s.port, format!("{:.2}", s.load)]);
            total += 1;
        }
    }
    table.printstd();
    println!("{} live server(s)", total);
    Ok(())
}

async fn start_server(args: StartServerArgs) -> Result<(), Error> {
    let runtime = Runtime::from_config_file(&args.config).await?;
    runtime
        .serve_module(&args.module, &args.host, args.port)
        .await
}

async fn wipe(args: ConfigArgs) -> Result<(), Error> {
    println!(
        "{color_yellow}wipe removes every PID file unconditionally; \
         servers still running become orphans and must be killed by hand{color_reset}"
    );
    let runtime = Runtime::from_config_file(&args.config).await?;
    let removed = runtime.registry().wipe()?;
    println!("{} PID file(s) removed", removed);
    Ok(())
}

fn setup_subscriber(arg_log_level: LogLevel) {
    let log_level = match arg_log_level {
        LogLevel::Debug => Some(LevelFilter::DEBUG),
        LogLevel::Error => Some(LevelFilter::ERROR),
        LogLevel::Info => Some(LevelFilter::INFO),
        LogLevel::Trace => Some(LevelFilter::TRACE),
        LogLevel::None => None,
    };

    if let Some(l) = log_level {
        let filter = EnvFilter::builder()
            .with_default_directive(l.into())
            .from_env_lossy();
        tracing_subscriber::fmt().with_env_filter(filter).init();
    }
}

/// Parameters prefixed `meta.` become document metadata overrides.
fn metadata_from_params(params: &Parameters) -> BTreeMap<String, String> {
    params
        .iter()
        .filter_map(|(k, v)| {
            k.strip_prefix("meta.")
                .map(|key| (key.to_string(), v.clone()))
        })
        .collect()
}
