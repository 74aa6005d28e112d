use clap::{Parser, Subcommand, ValueEnum};
use kettle::image::{self, EntryPoint};
use kettle::vm::descriptor::MethodDescriptor;
use kettle::{ImageLoader, Outcome, RuntimeConfig, Vm};
use std::path::{Path, PathBuf};
use std::process::ExitCode;
use std::time::{Duration, Instant};
use tracing_subscriber::EnvFilter;

const CONFIG_FILE: &str = "kettle.toml";

#[derive(Parser)]
#[command(name = "kettle")]
#[command(about = "An interpreter for class-file bytecode", long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Clone, Copy, Debug, Default, ValueEnum)]
enum TimingsFormatArg {
    #[default]
    Human,
    Json,
}

#[derive(Subcommand)]
enum Commands {
    /// Run a program image
    Run {
        /// Path to a program image (.toml or .json)
        image: PathBuf,

        /// Entry point as Class.method or Class.method:descriptor
        #[arg(long)]
        entry: Option<String>,

        /// Argument passed to the entry point (repeatable)
        #[arg(long = "arg")]
        args: Vec<String>,

        /// Runtime configuration file (default: kettle.toml next to the image)
        #[arg(long)]
        config: Option<PathBuf>,

        /// Skip structural verification
        #[arg(long)]
        no_verify: bool,

        /// Maximum call depth per thread
        #[arg(long)]
        max_depth: Option<usize>,

        /// Log filter, e.g. "debug" or "kettle::calls=info"
        #[arg(long)]
        log: Option<String>,

        /// Print phase timings to stderr (--timings or --timings=json)
        #[arg(
            long,
            value_enum,
            require_equals = true,
            num_args = 0..=1,
            default_missing_value = "human"
        )]
        timings: Option<TimingsFormatArg>,
    },
    /// Load and verify every class of a program image
    Check {
        /// Path to a program image (.toml or .json)
        image: PathBuf,

        /// Log filter
        #[arg(long)]
        log: Option<String>,
    },
    /// Print a listing of the classes in a program image
    Disasm {
        /// Path to a program image (.toml or .json)
        image: PathBuf,

        /// Only list this class
        #[arg(long)]
        class: Option<String>,
    },
}

#[derive(Debug, Default)]
struct Timings {
    load: Duration,
    link: Duration,
    execute: Duration,
}

impl Timings {
    fn print(&self, format: TimingsFormatArg) {
        match format {
            TimingsFormatArg::Human => {
                eprintln!("load:    {:>10.3}ms", self.load.as_secs_f64() * 1000.0);
                eprintln!("link:    {:>10.3}ms", self.link.as_secs_f64() * 1000.0);
                eprintln!("execute: {:>10.3}ms", self.execute.as_secs_f64() * 1000.0);
            }
            TimingsFormatArg::Json => {
                let json = serde_json::json!({
                    "load_ms": self.load.as_secs_f64() * 1000.0,
                    "link_ms": self.link.as_secs_f64() * 1000.0,
                    "execute_ms": self.execute.as_secs_f64() * 1000.0,
                });
                eprintln!("{}", json);
            }
        }
    }
}

fn init_logging(filter: Option<&str>) {
    let filter = match filter {
        Some(f) => EnvFilter::new(f),
        None => EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn")),
    };
    let _ = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .try_init();
}

/// `--config`, else `kettle.toml` beside the image, else defaults.
fn load_config(image: &Path, explicit: Option<&Path>) -> Result<RuntimeConfig, String> {
    if let Some(path) = explicit {
        return RuntimeConfig::load(path).map_err(|e| e.to_string());
    }
    let beside = image
        .parent()
        .unwrap_or(Path::new("."))
        .join(CONFIG_FILE);
    if beside.exists() {
        tracing::debug!(path = %beside.display(), "using configuration file");
        RuntimeConfig::load(&beside).map_err(|e| e.to_string())
    } else {
        Ok(RuntimeConfig::default())
    }
}

fn entry_point(loader: &ImageLoader, explicit: Option<&str>) -> Result<EntryPoint, String> {
    let spec = explicit
        .or(loader.entry())
        .ok_or("no entry point: the image has none and --entry was not given")?;
    loader.resolve_entry(spec).map_err(|e| e.to_string())
}

struct RunOptions {
    entry: Option<String>,
    args: Vec<String>,
    config: Option<PathBuf>,
    no_verify: bool,
    max_depth: Option<usize>,
    timings: Option<TimingsFormatArg>,
}

fn run(image_path: &Path, options: RunOptions) -> ExitCode {
    let mut timings = Timings::default();

    let start = Instant::now();
    let mut config = match load_config(image_path, options.config.as_deref()) {
        Ok(config) => config,
        Err(e) => {
            eprintln!("error: {}", e);
            return ExitCode::from(2);
        }
    };
    if options.no_verify {
        config.verify = false;
    }
    if let Some(depth) = options.max_depth {
        config.max_call_depth = depth;
    }
    let loader = match ImageLoader::load(image_path) {
        Ok(loader) => loader,
        Err(e) => {
            eprintln!("error: {}", e);
            return ExitCode::from(2);
        }
    };
    let entry = match entry_point(&loader, options.entry.as_deref()) {
        Ok(entry) => entry,
        Err(e) => {
            eprintln!("error: {}", e);
            return ExitCode::from(2);
        }
    };
    timings.load = start.elapsed();

    let start = Instant::now();
    let vm = match Vm::builder().config(config).loader(loader).build() {
        Ok(vm) => vm,
        Err(e) => {
            eprintln!("error: {}", e);
            return ExitCode::from(2);
        }
    };
    let mut thread = vm.new_thread();
    let args = MethodDescriptor::parse(&entry.descriptor)
        .map_err(kettle::VmError::from)
        .and_then(|descriptor| image::host_args(&mut thread, &descriptor, &options.args));
    let args = match args {
        Ok(args) => args,
        Err(e) => {
            eprintln!("error: {}", e);
            return ExitCode::from(2);
        }
    };
    timings.link = start.elapsed();

    let start = Instant::now();
    let outcome = thread.invoke_static(&entry.class, &entry.method, &entry.descriptor, &args);
    let joined = vm.join_threads();
    timings.execute = start.elapsed();

    if let Some(format) = options.timings {
        timings.print(format);
    }

    let code = match outcome {
        Ok(Outcome::Returned(value)) => {
            tracing::debug!(?value, "entry point returned");
            ExitCode::SUCCESS
        }
        Ok(Outcome::Threw {
            exception,
            backtrace,
        }) => {
            let description = vm
                .describe_throwable(exception)
                .unwrap_or_else(|e| format!("<unprintable exception: {}>", e));
            eprint!("Exception in thread \"main\" {}\n{}", description, backtrace);
            ExitCode::FAILURE
        }
        Err(e) => {
            eprintln!("fatal: {}", e);
            return ExitCode::from(2);
        }
    };
    if let Err(e) = joined {
        eprintln!("fatal: {}", e);
        return ExitCode::from(2);
    }
    code
}

fn check(image_path: &Path) -> ExitCode {
    let loader = match ImageLoader::load(image_path) {
        Ok(loader) => loader,
        Err(e) => {
            eprintln!("error: {}", e);
            return ExitCode::from(2);
        }
    };
    let names: Vec<String> = loader.class_names().into_iter().map(String::from).collect();
    let config = RuntimeConfig {
        verify: true,
        ..RuntimeConfig::default()
    };
    let vm = match Vm::builder().config(config).loader(loader).build() {
        Ok(vm) => vm,
        Err(e) => {
            eprintln!("error: {}", e);
            return ExitCode::from(2);
        }
    };

    let mut failures = 0;
    for name in &names {
        if let Err(e) = vm.registry().load(name) {
            eprintln!("{}: {}", name.replace('/', "."), e);
            failures += 1;
        }
    }
    if failures > 0 {
        eprintln!("{} of {} classes failed", failures, names.len());
        return ExitCode::FAILURE;
    }
    println!("ok: {} classes", names.len());
    ExitCode::SUCCESS
}

fn disasm(image_path: &Path, class: Option<&str>) -> ExitCode {
    let loader = match ImageLoader::load(image_path) {
        Ok(loader) => loader,
        Err(e) => {
            eprintln!("error: {}", e);
            return ExitCode::from(2);
        }
    };
    match class {
        Some(name) => {
            let name = name.replace('.', "/");
            let Some(def) = loader.class(&name) else {
                eprintln!("error: class {} not found in image", name.replace('/', "."));
                return ExitCode::FAILURE;
            };
            print!("{}", image::disassemble(def));
        }
        None => {
            for (i, name) in loader.class_names().into_iter().enumerate() {
                if i > 0 {
                    println!();
                }
                if let Some(def) = loader.class(name) {
                    print!("{}", image::disassemble(def));
                }
            }
        }
    }
    ExitCode::SUCCESS
}

fn main() -> ExitCode {
    let cli = Cli::parse();

    match cli.command {
        Commands::Run {
            image,
            entry,
            args,
            config,
            no_verify,
            max_depth,
            log,
            timings,
        } => {
            init_logging(log.as_deref());
            run(
                &image,
                RunOptions {
                    entry,
                    args,
                    config,
                    no_verify,
                    max_depth,
                    timings,
                },
            )
        }
        Commands::Check { image, log } => {
            init_logging(log.as_deref());
            check(&image)
        }
        Commands::Disasm { image, class } => {
            init_logging(None);
            disasm(&image, class.as_deref())
        }
    }
}
