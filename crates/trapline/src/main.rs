use std::path::PathBuf;
use std::process;

use clap::{Parser, Subcommand};
use trapline_core::module::Module;
use trapline_utils::{LogFormat, LogLevel, debug, init_logging, init_logging_with_level};

/// Inspect compiled binary modules for the Trapline debug layer.
#[derive(Parser, Debug)]
#[command(name = "trapline")]
#[command(version)]
#[command(about = "Inspect compiled binary modules for the Trapline debug layer", long_about = None)]
struct Cli
{
    /// Log level (error, warn, info, debug, trace). Overrides RUST_LOG.
    #[arg(long, global = true)]
    log_level: Option<LogLevel>,

    /// Log format (pretty or json). Overrides TRAPLINE_LOG_FORMAT.
    #[arg(long, global = true)]
    log_format: Option<LogFormat>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands
{
    /// List the sections of a module
    Sections
    {
        /// Path to the module file
        file: PathBuf,
    },
    /// Print the URL stored in the module's sourceMappingURL section
    SourceMapUrl
    {
        /// Path to the module file
        file: PathBuf,
    },
}

fn main()
{
    let cli = Cli::parse();

    // Flags win over the environment. A format flag alone keeps the default level.
    let logging = match (cli.log_level, cli.log_format) {
        (None, None) => init_logging(),
        (level, format) => init_logging_with_level(level.unwrap_or(LogLevel::Info), format.unwrap_or_default()),
    };
    if let Err(e) = logging {
        eprintln!("Failed to initialize logging: {e}");
        process::exit(1);
    }

    if let Err(e) = run_command(cli.command) {
        eprintln!("Error: {e}");
        process::exit(1);
    }
}

fn run_command(command: Commands) -> trapline_core::Result<()>
{
    match command {
        Commands::Sections { file } => {
            debug!("Listing sections of {}", file.display());
            let module = Module::from_path(&file)?;
            println!("{:>4}  {:<24} {:>10}  {:>10}", "ID", "KIND", "OFFSET", "SIZE");
            for section in module.sections() {
                println!(
                    "{:>4}  {:<24} {:>#10x}  {:>10}",
                    section.id,
                    section.kind(),
                    section.payload.start,
                    section.payload.len()
                );
            }
            println!("{} section(s), {} bytes", module.sections().len(), module.debug_bytecode().len());
        }
        Commands::SourceMapUrl { file } => {
            let module = Module::from_path(&file)?;
            match module.source_mapping_url() {
                Some(url) => println!("{url}"),
                None => println!("(none)"),
            }
        }
    }
    Ok(())
}
