//! envcache - toolchain environment cache maintenance
//!
//! Runs single environment-cache operations on a compile-farm worker node:
//! listing, resetting, installing from a local tarball, verifying and
//! evicting environments, and building the native toolchain tarball.

use std::io;
use std::path::PathBuf;
use std::time::Duration;

use anyhow::{bail, Context, Result};
use envcache_core::env::{janitor, tree};
use envcache_core::{
    catalog, init_logging, remove_native, Channel, CompilerKind, EnvConfig, EnvironmentId,
    EnvironmentInstaller, EnvironmentRemover, EnvironmentVerifier, FileChannel, Message,
    NativeEnvironmentBuilder,
};
use tracing::{info, warn};

fn print_help() {
    println!("envcache - Toolchain Environment Cache v{}", env!("CARGO_PKG_VERSION"));
    println!();
    println!("USAGE:");
    println!("  envcache [OPTIONS] <COMMAND> [ARGS...]");
    println!();
    println!("OPTIONS:");
    println!("  -c, --config <FILE>  Read configuration from a JSON file");
    println!("  -h, --help           Print this help message");
    println!("  -v, --version        Print version information");
    println!();
    println!("COMMANDS:");
    println!("  list                               List installed environments");
    println!("  reset                              Wipe and recreate the cache directory");
    println!("  size <PATH>                        Sum file sizes below PATH");
    println!("  install <TARGET> <NAME> <TARBALL>  Install an environment from a tarball");
    println!("  verify <TARGET> <NAME>             Run bin/true inside the environment");
    println!("  remove <TARGET> <NAME>             Remove an environment");
    println!("  native [gcc|clang] [FILE...]       Package the local compiler");
    println!("  remove-native <PATH>               Remove a native environment tarball");
}

#[derive(Debug)]
enum Command {
    List,
    Reset,
    Size(PathBuf),
    Install(EnvironmentId, PathBuf),
    Verify(EnvironmentId),
    Remove(EnvironmentId),
    Native(CompilerKind, Vec<PathBuf>),
    RemoveNative(PathBuf),
}

impl Command {
    fn parse(name: &str, operands: &[String]) -> Result<Self> {
        let command = match (name, operands) {
            ("list", []) => Self::List,
            ("reset", []) => Self::Reset,
            ("size", [path]) => Self::Size(PathBuf::from(path)),
            ("install", [target, env, tarball]) => {
                Self::Install(EnvironmentId::new(target, env), PathBuf::from(tarball))
            }
            ("verify", [target, env]) => Self::Verify(EnvironmentId::new(target, env)),
            ("remove", [target, env]) => Self::Remove(EnvironmentId::new(target, env)),
            ("native", []) => Self::Native(CompilerKind::default(), Vec::new()),
            ("native", [kind, extra @ ..]) => Self::Native(
                CompilerKind::parse(kind),
                extra.iter().map(PathBuf::from).collect(),
            ),
            ("remove-native", [path]) => Self::RemoveNative(PathBuf::from(path)),
            _ => bail!("unrecognized command '{name}' with {} argument(s)", operands.len()),
        };
        Ok(command)
    }
}

/// Status lines from the verifier go to the terminal.
struct ConsoleChannel;

impl Channel for ConsoleChannel {
    fn get_msg(&mut self, _timeout: Duration) -> Option<Message> {
        None
    }

    fn supports_status(&self) -> bool {
        true
    }

    fn send_status(&mut self, text: &str) -> io::Result<()> {
        eprintln!("{text}");
        Ok(())
    }
}

fn run(config: EnvConfig, command: Command) -> Result<()> {
    match command {
        Command::List => {
            for id in catalog::list(&config.basedir) {
                println!("{}\t{}", id.target, id.name);
            }
        }
        Command::Reset => {
            janitor::reset(&config.basedir, config.build_uid, config.build_gid)?;
        }
        Command::Size(path) => println!("{}", tree::sum_dir(&path)),
        Command::Install(id, tarball) => {
            let mut channel = FileChannel::open(&tarball)
                .with_context(|| format!("Failed to open {}", tarball.display()))?;
            let timeout = config.first_chunk_timeout();
            let installer = EnvironmentInstaller::new(config);
            let mut pending = installer.begin(&id, &mut channel)?;
            if let Err(e) = pending.feed(&mut channel, timeout) {
                warn!(env = %id, error = %e, "Streaming tarball failed");
            }
            let size = installer.finish(pending)?;
            info!(env = %id, size, "Installed");
            println!("{size}");
        }
        Command::Verify(id) => {
            if !EnvironmentVerifier::new(config).verify(&mut ConsoleChannel, &id) {
                bail!("environment {id} failed verification");
            }
        }
        Command::Remove(id) => {
            println!("{}", EnvironmentRemover::new(config).remove(&id));
        }
        Command::Native(kind, extra) => {
            let builder = NativeEnvironmentBuilder::new(config);
            let Some(build) = builder.begin(kind, &extra)? else {
                bail!("no usable {} installation for a native environment", kind.as_str());
            };
            match builder.finish(build) {
                Some(tarball) => println!("{}\t{}", tarball.path.display(), tarball.size),
                None => bail!("packaging helper produced no tarball"),
            }
        }
        Command::RemoveNative(path) => println!("{}", remove_native(&path)),
    }
    Ok(())
}

#[tokio::main]
async fn main() -> Result<()> {
    let mut args = std::env::args().skip(1);
    let mut config_path: Option<PathBuf> = None;
    let mut rest = Vec::new();

    while let Some(arg) = args.next() {
        match arg.as_str() {
            "-h" | "--help" => {
                print_help();
                return Ok(());
            }
            "-v" | "--version" => {
                println!("envcache {}", env!("CARGO_PKG_VERSION"));
                return Ok(());
            }
            "-c" | "--config" => {
                let path = args.next().context("--config requires a file")?;
                config_path = Some(PathBuf::from(path));
            }
            _ => rest.push(arg),
        }
    }

    let Some((name, operands)) = rest.split_first() else {
        eprintln!("error: no command given");
        eprintln!("Run 'envcache --help' for usage information.");
        std::process::exit(1);
    };
    let command = Command::parse(name, operands)?;

    init_logging("info");

    let config = match config_path.as_deref() {
        Some(path) => EnvConfig::from_file(path)?,
        None => EnvConfig::default(),
    };
    info!(basedir = %config.basedir.display(), ?command, "Running");

    // Every operation blocks on child processes; keep them off the runtime.
    tokio::task::spawn_blocking(move || run(config, command))
        .await
        .context("worker task panicked")?
}
