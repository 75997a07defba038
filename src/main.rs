use std::{
    fs,
    path::{Path, PathBuf},
    process::ExitCode,
};

use cfgsc::{
    cfg::structurize_function,
    config::{MarkerNames, StructurizerOptions},
    lir::{
        parser::Parser,
        pretty_print::{pretty_print_module, print_module_plain},
    },
};
use clap::{ArgAction, CommandFactory, Parser as ClapParser, error::ErrorKind};
use colored::Colorize;
use log::{LevelFilter, info};
use simplelog::{ColorChoice, ConfigBuilder, TermLogger, TerminalMode};

#[derive(Debug, ClapParser)]
#[command(version, about, long_about = None)]
pub struct Args {
    /// Textual IR modules to structurize
    source_files: Vec<PathBuf>,

    /// Write the structurized module here instead of printing it
    #[arg(short, long)]
    output: Option<PathBuf>,

    /// Don't emit merge and continue markers
    #[arg(long)]
    no_annotations: bool,

    #[arg(long, default_value_t = StructurizerOptions::DEFAULT_MAX_PASSES)]
    max_passes: usize,

    /// Callee name of the discard intrinsic
    #[arg(long)]
    discard_intrinsic: Option<String>,

    /// Dump the final CFG of every function as graphviz into this directory
    #[arg(long, value_name = "DIR")]
    dot: Option<PathBuf>,

    #[arg(short, long, action = ArgAction::Count)]
    verbose: u8,
}

macro_rules! function {
    () => {{
        fn f() {}
        fn type_name_of<T>(_: T) -> &'static str {
            std::any::type_name::<T>()
        }
        type_name_of(f)
            .rsplit("::")
            .find(|&part| part != "f" && part != "{{closure}}")
            .expect("Short function name")
    }};
}

macro_rules! report_error {
    ($message:expr $(,)?) => {{
        let message = format!("{}: {}", "error".red(), $message);

        #[cfg(feature = "error-backtrace")]
        let message = format!(
            "{}: {}\n{}",
            "backtrace".blue(),
            format!(
                "{}::{} {}",
                module_path!(),
                function!(),
                format!("(at {}:{}:{})", file!(), line!(), column!()).white()
            ),
            message
        );

        eprintln!("{message}");
    }};
}

fn main() -> ExitCode {
    let args = Args::parse();

    let level = match args.verbose {
        0 => LevelFilter::Warn,
        1 => LevelFilter::Info,
        2 => LevelFilter::Debug,
        _ => LevelFilter::Trace,
    };

    let _ = TermLogger::init(
        level,
        ConfigBuilder::new().set_time_level(LevelFilter::Off).build(),
        TerminalMode::Stderr,
        ColorChoice::Auto,
    );

    if args.source_files.is_empty() {
        Args::command()
            .error(ErrorKind::MissingRequiredArgument, "Missing source files!")
            .exit();
    }

    if args.output.is_some() && args.source_files.len() > 1 {
        Args::command()
            .error(
                ErrorKind::ArgumentConflict,
                "--output takes a single source file!",
            )
            .exit();
    }

    for source_file in &args.source_files {
        if !source_file.exists() {
            Args::command()
                .error(
                    ErrorKind::InvalidValue,
                    format!("Source file '{}' does not exist!", source_file.display()),
                )
                .exit()
        }

        if !source_file.is_file() {
            Args::command()
                .error(
                    ErrorKind::InvalidValue,
                    format!("Input path '{}' is not a file!", source_file.display()),
                )
                .exit()
        }
    }

    let mut options = StructurizerOptions {
        max_passes: args.max_passes,
        add_merge_annotations: !args.no_annotations,
        markers: MarkerNames::default(),
    };

    if let Some(discard) = &args.discard_intrinsic {
        options.markers.discard = discard.clone();
    }

    let mut failed = false;

    for source_file in &args.source_files {
        failed |= !process_file(source_file, &args, &options);
    }

    if failed {
        ExitCode::FAILURE
    } else {
        ExitCode::SUCCESS
    }
}

/// Structurizes every function of one file, returns false if anything failed
fn process_file(path: &Path, args: &Args, options: &StructurizerOptions) -> bool {
    let contents = match fs::read_to_string(path) {
        Ok(contents) => contents,
        Err(error) => {
            report_error!(format!("failed to read '{}': {error}", path.display()));
            return false;
        }
    };

    let mut module = match Parser::parse_module(&contents) {
        Ok(module) => module,
        Err(error) => {
            report_error!(format!("{}: {error}", path.display()));
            return false;
        }
    };

    let mut succeeded = true;

    for function in &mut module.functions {
        let cfg = match structurize_function(function, options) {
            Ok(cfg) => cfg,
            Err(error) => {
                report_error!(format!("in function `{}`: {error}", function.name));
                succeeded = false;
                continue;
            }
        };

        info!("structurized `{}`", function.name);

        if let Some(directory) = &args.dot {
            let dot_path = directory.join(format!("{}.dot", function.name));

            if let Err(error) = fs::write(&dot_path, cfg.to_dot(&function.name)) {
                report_error!(format!("failed to write '{}': {error}", dot_path.display()));
                succeeded = false;
            }
        }
    }

    if !succeeded {
        return false;
    }

    match &args.output {
        Some(output) => {
            if let Err(error) = fs::write(output, print_module_plain(&module)) {
                report_error!(format!("failed to write '{}': {error}", output.display()));
                return false;
            }
        }
        None => print!("{}", pretty_print_module(&module)),
    }

    true
}
