use std::{
    fs,
    path::{Path, PathBuf},
    process::ExitCode,
    time::Instant,
};

use anyhow::{Context, Result, bail};
use clap::Parser;
use pyhost::{Error, Globals, InitConfig, Outputs, Python, Value};

/// Run a Python snippet in an embedded interpreter.
///
/// Without `--config`, `--lib` or `--python`, the interpreter is located through the
/// `PYHOST_PYTHON_*` environment variables, falling back to probing `python3` on `PATH`.
#[derive(Parser)]
#[command(name = "pyhost", version)]
struct Cli {
    /// JSON file with the interpreter configuration
    #[arg(long, conflicts_with_all = ["lib", "python"])]
    config: Option<PathBuf>,
    /// Interpreter executable to probe for its configuration
    #[arg(long, conflicts_with = "lib")]
    python: Option<PathBuf>,
    /// libpython shared library
    #[arg(long, requires_all = ["home", "executable"])]
    lib: Option<PathBuf>,
    /// Python home, used with --lib
    #[arg(long)]
    home: Option<PathBuf>,
    /// Interpreter executable reported to Python, used with --lib
    #[arg(long)]
    executable: Option<PathBuf>,
    /// Extra sys.path entry; repeatable
    #[arg(long = "sys-path")]
    sys_paths: Vec<PathBuf>,
    /// Print the result and bound globals as JSON
    #[arg(long)]
    json: bool,
    /// Report the names the snippet reads and binds instead of running it
    #[arg(long)]
    analyze: bool,
    /// Program passed in as a string
    #[arg(short = 'c', conflicts_with = "file")]
    code: Option<String>,
    /// Python file to run
    #[arg(required_unless_present = "code")]
    file: Option<PathBuf>,
}

fn main() -> ExitCode {
    env_logger::Builder::new()
        .filter_level(log::LevelFilter::Warn)
        .parse_default_env()
        .init();

    let cli = Cli::parse();
    match run(&cli) {
        Ok(code) => code,
        Err(err) => {
            eprintln!("error: {err:#}");
            ExitCode::FAILURE
        }
    }
}

fn run(cli: &Cli) -> Result<ExitCode> {
    let source = match (&cli.code, &cli.file) {
        (Some(code), _) => code.clone(),
        (None, Some(file)) => fs::read_to_string(file).with_context(|| format!("reading {}", file.display()))?,
        (None, None) => bail!("nothing to run"),
    };

    let mut config = config(cli)?;
    config.sys_paths.extend(cli.sys_paths.iter().cloned());
    log::info!("starting Python from {}", config.library_path.display());
    let python = Python::init(config).context("starting the interpreter")?;

    if cli.analyze {
        let analysis = python.analyze(&source)?;
        if cli.json {
            let json = serde_json::json!({
                "referenced": analysis.referenced,
                "defined": analysis.defined,
            });
            println!("{json:#}");
        } else {
            println!("referenced: {}", join(&analysis.referenced));
            println!("defined: {}", join(&analysis.defined));
        }
        return Ok(ExitCode::SUCCESS);
    }

    let start = Instant::now();
    let output = match python.eval(&source, &Globals::new(), &Outputs::std()) {
        Ok(output) => output,
        Err(Error::Python(exc)) => {
            eprintln!("{exc}");
            return Ok(ExitCode::FAILURE);
        }
        Err(err) => return Err(err.into()),
    };
    log::debug!("evaluated in {:?}", start.elapsed());

    let result = match &output.result {
        Some(result) => python.decode(result)?,
        None => Value::None,
    };
    if cli.json {
        let mut globals = serde_json::Map::new();
        for (name, object) in &output.globals {
            globals.insert(name.clone(), python.decode(object)?.to_json_value());
        }
        let json = serde_json::json!({
            "result": result.to_json_value(),
            "globals": globals,
        });
        println!("{json:#}");
    } else if let Some(object) = &output.result
        && result != Value::None
    {
        println!("{}", python.repr(object)?);
    }
    python.shutdown();
    Ok(ExitCode::SUCCESS)
}

fn config(cli: &Cli) -> Result<InitConfig> {
    if let Some(path) = &cli.config {
        return InitConfig::from_json_file(path).map_err(Into::into);
    }
    if let (Some(lib), Some(home), Some(executable)) = (&cli.lib, &cli.home, &cli.executable) {
        return Ok(InitConfig::new(lib, home, executable));
    }
    if let Some(python) = &cli.python {
        return InitConfig::probe(python).with_context(|| format!("probing {}", python.display()));
    }
    InitConfig::from_env()
        .or_else(|err| {
            log::debug!("{err}, probing python3 instead");
            InitConfig::probe(Path::new("python3"))
        })
        .context("no Python configured; pass --config, --lib or --python")
}

fn join(names: &std::collections::BTreeSet<String>) -> String {
    names.iter().map(String::as_str).collect::<Vec<_>>().join(", ")
}
