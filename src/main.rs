use std::fs;
use std::io::Write;
use std::path::PathBuf;

use clap::{Parser, Subcommand, ValueEnum};
use log::LevelFilter;

use ijit::driver::{self, Format};

#[derive(Parser)]
#[command(name = "ij", version, about = "Compiler and JIT for the IJ language")]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Compile SRC into JAS assembly, an IJVM image or x86-64 code.
    Compile {
        /// Output file; stdout when omitted.
        #[arg(short)]
        output: Option<PathBuf>,

        /// Output format.
        #[arg(short, value_enum, default_value = "ijvm")]
        format: FormatArg,

        /// Log compilation milestones.
        #[arg(short)]
        verbose: bool,

        /// Log per-pass detail.
        #[arg(short)]
        debug: bool,

        src: PathBuf,
    },
    /// Compile SRC to native code and execute it immediately.
    Run {
        /// Redirect the program's standard input from a file.
        #[arg(short)]
        input: Option<PathBuf>,

        /// Redirect the program's standard output to a file.
        #[arg(short)]
        output: Option<PathBuf>,

        /// Log compilation milestones.
        #[arg(short)]
        verbose: bool,

        /// Log per-pass detail.
        #[arg(short)]
        debug: bool,

        src: PathBuf,
    },
}

#[derive(Debug, Copy, Clone, ValueEnum)]
enum FormatArg {
    Jas,
    Ijvm,
    X64,
}

impl From<FormatArg> for Format {
    fn from(f: FormatArg) -> Format {
        match f {
            FormatArg::Jas => Format::Jas,
            FormatArg::Ijvm => Format::Ijvm,
            FormatArg::X64 => Format::X64,
        }
    }
}

fn init_logger(verbose: bool, debug: bool) {
    let level = if debug {
        LevelFilter::Debug
    } else if verbose {
        LevelFilter::Info
    } else {
        LevelFilter::Warn
    };
    env_logger::Builder::new()
        .filter_level(level)
        .format_timestamp(None)
        .init();
}

fn run(cli: Cli) -> anyhow::Result<()> {
    match cli.command {
        Command::Compile {output, format, verbose, debug, src} => {
            init_logger(verbose, debug);
            let artifact = driver::compile_file(&src, format.into())?;
            match output {
                Some(path) => fs::write(path, artifact)?,
                None => std::io::stdout().write_all(&artifact)?,
            }
            Ok(())
        },
        Command::Run {input, output, verbose, debug, src} => {
            init_logger(verbose, debug);
            driver::run_file(&src, input.as_deref(), output.as_deref())?;
            Ok(())
        },
    }
}

fn main() {
    let cli = Cli::parse();
    if let Err(e) = run(cli) {
        eprintln!("error: {}", e);
        std::process::exit(1);
    }
}
