use anyhow::{Context, Result};
use clap::Parser;
use carrera::cli::{Cli, OutputFormat};
use carrera::coverage::Coverage;
use carrera::detect::{detect_races, DetectConfig};
use carrera::ir::Module;
use carrera::trace::ProgramTrace;
use tracing_subscriber::EnvFilter;

/// Initialize tracing subscriber for debug output
fn init_tracing(debug: bool) {
    if debug {
        tracing_subscriber::fmt()
            .with_env_filter(
                EnvFilter::from_default_env().add_directive(tracing::Level::DEBUG.into()),
            )
            .with_writer(std::io::stderr)
            .init();
    }
}

fn main() -> Result<()> {
    let args = Cli::parse();

    init_tracing(args.debug);

    let data = std::fs::read_to_string(&args.program)
        .with_context(|| format!("failed to read {}", args.program.display()))?;
    let module = Module::from_json(&data)
        .with_context(|| format!("failed to parse module from {}", args.program.display()))?;

    let config = DetectConfig {
        entry: args.entry.clone(),
        print_trace: args.print_trace,
    };
    let mut report = detect_races(&module, &config)?;

    if let Some(pattern) = &args.filter {
        let regex = regex::Regex::new(pattern)
            .with_context(|| format!("invalid filter expression `{pattern}`"))?;
        report = report.filtered(&regex);
    }

    match args.format {
        OutputFormat::Text => print!("{report}"),
        OutputFormat::Json => println!("{}", serde_json::to_string_pretty(&report)?),
    }

    if args.coverage {
        let program = ProgramTrace::build(&module, &args.entry)?;
        let coverage = Coverage::new(&program);
        eprint!("{coverage}");
    }

    // nonzero exit when races were found, for CI use
    if !report.is_empty() {
        std::process::exit(1);
    }
    Ok(())
}
