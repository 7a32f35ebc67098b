use std::path::PathBuf;
use std::time::Duration;

use anyhow::Result;
use clap::{ArgGroup, Parser};
use tracing::info;

use scstadm::{
    parse_file, read_state, to_conf_string, ApplyOptions, Engine, Modprobe, ScstError, Sysfs,
};

#[derive(Parser, Debug)]
#[command(name = "scstadmcli", version)]
#[command(about = "Converge the SCST target subsystem to a declared configuration")]
#[command(group(ArgGroup::new("action").required(true)))]
struct Args {
    /// Apply a configuration file to the subsystem
    #[arg(long, value_name = "FILE", group = "action")]
    apply: Option<PathBuf>,

    /// Parse a configuration file and list the pending changes
    #[arg(long, value_name = "FILE", group = "action")]
    check: Option<PathBuf>,

    /// Remove everything except the built-in copy-manager driver
    #[arg(long, group = "action")]
    clear: bool,

    /// Dump the live configuration to a file (YAML for .yml/.yaml paths)
    #[arg(long, value_name = "FILE", group = "action")]
    write_config: Option<PathBuf>,

    /// Raise the subsystem-wide suspend toggle to N around the run
    #[arg(long, value_name = "N")]
    suspend: Option<u32>,

    /// Timeout for each control-filesystem operation
    #[arg(long, value_name = "SECONDS", default_value_t = 60)]
    timeout: u64,

    /// Log level (error, warn, info, debug, trace)
    #[arg(long, value_name = "LEVEL", default_value = "info")]
    log_level: String,

    /// Control filesystem root (autodetected when omitted)
    #[arg(long, value_name = "PATH")]
    root: Option<PathBuf>,
}

fn run(args: &Args) -> Result<()> {
    let timeout = Duration::from_secs(args.timeout);
    let sysfs = match &args.root {
        Some(root) => Sysfs::new(root, timeout),
        None => Sysfs::detect(timeout)?,
    };
    let engine = Engine::new(&sysfs, &Modprobe);
    let opts = ApplyOptions {
        suspend: args.suspend,
        cancel: None,
    };

    if let Some(file) = &args.apply {
        let desired = parse_file(file)?;
        let report = engine.apply(&desired, &opts)?;
        info!("converged with {} change(s)", report.mutations);
        return Ok(());
    }

    if let Some(file) = &args.check {
        let desired = parse_file(file)?;
        let plan = engine.check(&desired)?;
        if plan.is_empty() {
            println!("configuration is already live; nothing to do");
        } else {
            for line in plan {
                println!("{}", line);
            }
        }
        return Ok(());
    }

    if args.clear {
        let report = engine.clear(&opts)?;
        info!("cleared with {} change(s)", report.mutations);
        return Ok(());
    }

    if let Some(file) = &args.write_config {
        let live = read_state(&sysfs)?;
        let yaml = matches!(
            file.extension().and_then(|e| e.to_str()),
            Some("yml") | Some("yaml")
        );
        if yaml {
            live.write_yml(file)?;
        } else {
            std::fs::write(file, to_conf_string(&live))?;
        }
        info!("wrote live configuration to {}", file.display());
        return Ok(());
    }

    unreachable!("clap enforces exactly one action");
}

fn main() {
    let args = Args::parse();

    let level = args
        .log_level
        .parse::<tracing::Level>()
        .unwrap_or(tracing::Level::INFO);
    tracing_subscriber::fmt().with_max_level(level).init();

    if let Err(err) = run(&args) {
        eprintln!("error: {:#}", err);
        if let Some(ScstError::Partial { errors }) = err.downcast_ref::<ScstError>() {
            for e in errors {
                eprintln!("  - {}", e);
            }
        }
        std::process::exit(1);
    }
}
