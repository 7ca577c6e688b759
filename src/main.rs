//! FlashStore - A Namespaced Key-Value Cache over String Storage
//!
//! This is the command-line front end. It opens a file-backed medium, runs one
//! command against the store namespace and prints the result as JSON.

use anyhow::{anyhow, bail, Context};
use flashstore::backend::FileBackend;
use flashstore::store::options::{DEFAULT_MAX_SIZE_BYTES, DEFAULT_PREFIX};
use flashstore::{
    ImportOptions, Maintenance, MaintenanceConfig, QuotaEvent, ReadOptions, Store, StoreConfig,
    WriteOptions,
};
use regex::Regex;
use serde_json::Value;
use std::sync::Arc;
use std::time::Duration;
use tokio::signal;
use tracing::info;
use tracing_subscriber::{EnvFilter, FmtSubscriber};

/// CLI configuration
struct Config {
    /// Medium file
    file: String,
    /// Namespace prefix
    prefix: String,
    /// Quota in bytes, also the capacity of the medium file
    max_size: usize,
    /// Log at debug level
    verbose: bool,
    /// Command and its arguments
    command: Vec<String>,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            file: "flashstore.json".to_string(),
            prefix: DEFAULT_PREFIX.to_string(),
            max_size: DEFAULT_MAX_SIZE_BYTES,
            verbose: false,
            command: Vec::new(),
        }
    }
}

impl Config {
    /// Parse configuration from command-line arguments
    fn from_args() -> Self {
        let mut config = Config::default();
        let args: Vec<String> = std::env::args().collect();

        let mut i = 1;
        while i < args.len() {
            match args[i].as_str() {
                "--file" | "-f" => {
                    if i + 1 < args.len() {
                        config.file = args[i + 1].clone();
                        i += 2;
                    } else {
                        eprintln!("Error: --file requires a value");
                        std::process::exit(1);
                    }
                }
                "--prefix" | "-p" => {
                    if i + 1 < args.len() {
                        config.prefix = args[i + 1].clone();
                        i += 2;
                    } else {
                        eprintln!("Error: --prefix requires a value");
                        std::process::exit(1);
                    }
                }
                "--max-size" | "-m" => {
                    if i + 1 < args.len() {
                        config.max_size = args[i + 1].parse().unwrap_or_else(|_| {
                            eprintln!("Error: invalid size");
                            std::process::exit(1);
                        });
                        i += 2;
                    } else {
                        eprintln!("Error: --max-size requires a value");
                        std::process::exit(1);
                    }
                }
                "--verbose" => {
                    config.verbose = true;
                    i += 1;
                }
                "--help" | "-h" => {
                    print_help();
                    std::process::exit(0);
                }
                "--version" | "-v" => {
                    println!("FlashStore version {}", flashstore::VERSION);
                    std::process::exit(0);
                }
                _ => {
                    // Everything from the first positional argument on is the command
                    config.command = args[i..].to_vec();
                    break;
                }
            }
        }

        if config.command.is_empty() {
            print_help();
            std::process::exit(1);
        }

        config
    }

    fn store_config(&self) -> StoreConfig {
        StoreConfig::with_prefix(self.prefix.clone()).max_size_bytes(self.max_size)
    }
}

fn print_help() {
    println!(
        r#"
FlashStore - A Namespaced Key-Value Cache over String Storage

USAGE:
    flashstore [OPTIONS] <COMMAND>

OPTIONS:
    -f, --file <FILE>        Medium file (default: flashstore.json)
    -p, --prefix <PREFIX>    Namespace prefix (default: app_)
    -m, --max-size <BYTES>   Quota and medium capacity (default: 5242880)
        --verbose            Debug logging
    -v, --version            Print version information
    -h, --help               Print this help message

COMMANDS:
    get <key> [--decrypt]                   Print a value
    set <key> <json> [--ttl ms] [--encrypt] Store a value
    rm <key>                                Remove an entry
    keys [regex]                            List keys
    clear [regex]                           Remove matching entries
    stats                                   Print quota usage
    sweep                                   Remove expired entries
    export [regex]                          Print a snapshot
    import <file> [--overwrite]             Apply a snapshot file
    watch [--interval ms]                   Run background maintenance until Ctrl+C

EXAMPLES:
    flashstore set session '"abc123"' --ttl 60000
    flashstore get session
    flashstore --prefix other_ keys '^user:'
    flashstore export > backup.json
"#
    );
}

/// Pulls `--flag <value>` out of a command's arguments.
fn take_option(args: &mut Vec<String>, flag: &str) -> anyhow::Result<Option<String>> {
    let Some(pos) = args.iter().position(|a| a == flag) else {
        return Ok(None);
    };
    if pos + 1 >= args.len() {
        bail!("{flag} requires a value");
    }
    let value = args.remove(pos + 1);
    args.remove(pos);
    Ok(Some(value))
}

/// Pulls a boolean `--flag` out of a command's arguments.
fn take_flag(args: &mut Vec<String>, flag: &str) -> bool {
    match args.iter().position(|a| a == flag) {
        Some(pos) => {
            args.remove(pos);
            true
        }
        None => false,
    }
}

fn pattern(args: &[String]) -> anyhow::Result<Option<Regex>> {
    args.first()
        .map(|p| Regex::new(p).with_context(|| format!("invalid pattern {p:?}")))
        .transpose()
}

fn key_arg(args: &[String], command: &str) -> anyhow::Result<String> {
    args.first()
        .cloned()
        .ok_or_else(|| anyhow!("{command} requires a key"))
}

fn print_json(value: &impl serde::Serialize) -> anyhow::Result<()> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}

async fn run(store: Arc<Store>, command: &str, mut args: Vec<String>) -> anyhow::Result<()> {
    match command {
        "get" => {
            let decrypt = take_flag(&mut args, "--decrypt");
            let key = key_arg(&args, "get")?;
            let opts = ReadOptions {
                decrypt,
                ..store.config().read
            };
            print_json(&store.get_value(&key, &opts).unwrap_or(Value::Null))
        }
        "set" => {
            let ttl = take_option(&mut args, "--ttl")?
                .map(|ms| ms.parse::<u64>().context("invalid --ttl"))
                .transpose()?;
            let encrypt = take_flag(&mut args, "--encrypt");
            let [key, raw] = args.as_slice() else {
                bail!("set requires <key> <json>");
            };
            let value: Value =
                serde_json::from_str(raw).unwrap_or_else(|_| Value::String(raw.clone()));
            let opts = WriteOptions {
                encrypt,
                ttl: ttl.map(Duration::from_millis),
                ..WriteOptions::default()
            };
            if !store.set_value(key, &value, &opts) {
                bail!("value for {key:?} was not stored");
            }
            println!("OK");
            Ok(())
        }
        "rm" => {
            let key = key_arg(&args, "rm")?;
            if !store.remove(&key) {
                bail!("failed to remove {key:?}");
            }
            println!("OK");
            Ok(())
        }
        "keys" => {
            let mut keys = store.keys(pattern(&args)?.as_ref());
            keys.sort();
            print_json(&keys)
        }
        "clear" => {
            if !store.clear(pattern(&args)?.as_ref()) {
                bail!("clear failed");
            }
            println!("OK");
            Ok(())
        }
        "stats" => print_json(&store.get_stats()),
        "sweep" => {
            println!("{}", store.cleanup_expired());
            Ok(())
        }
        "export" => print_json(&store.export_data(pattern(&args)?.as_ref())),
        "import" => {
            let overwrite = take_flag(&mut args, "--overwrite");
            let path = key_arg(&args, "import")?;
            let text = std::fs::read_to_string(&path)
                .with_context(|| format!("failed to read {path}"))?;
            let document: Value = serde_json::from_str(&text)?;
            let report = store.import_snapshot(&document, ImportOptions { overwrite })?;
            print_json(&report)
        }
        "watch" => {
            let interval = take_option(&mut args, "--interval")?
                .map(|ms| ms.parse::<u64>().context("invalid --interval"))
                .transpose()?
                .map(Duration::from_millis)
                .unwrap_or(Duration::from_secs(1));
            watch(store, interval).await
        }
        other => bail!("unknown command {other:?}, see --help"),
    }
}

async fn watch(store: Arc<Store>, interval: Duration) -> anyhow::Result<()> {
    let _changes = store.subscribe(|event| {
        if let Ok(line) = serde_json::to_string(event) {
            println!("{line}");
        }
    });
    let _quota = store.on_quota(|event| match event {
        QuotaEvent::Warning(state) => {
            info!(usage = %format!("{:.2}%", state.usage_percentage), "Near quota")
        }
        QuotaEvent::Exceeded { key, .. } => info!(key = %key, "Quota exceeded"),
    });

    let config = MaintenanceConfig {
        base_interval: interval,
        ..MaintenanceConfig::default()
    };
    let _maintenance = Maintenance::start(Arc::clone(&store), config);
    info!("Watching {}, press Ctrl+C to stop", store.prefix());

    signal::ctrl_c().await?;
    info!("Shutdown signal received");
    Ok(())
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Parse command-line arguments
    let config = Config::from_args();

    // Set up logging; stdout carries command output. RUST_LOG wins over --verbose
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(if config.verbose { "debug" } else { "warn" }));
    FmtSubscriber::builder()
        .with_env_filter(filter)
        .with_target(false)
        .with_thread_ids(false)
        .with_file(false)
        .with_line_number(false)
        .with_writer(std::io::stderr)
        .init();

    let medium = FileBackend::open(&config.file)
        .with_context(|| format!("failed to open {}", config.file))?
        .with_capacity(config.max_size);
    let store = Arc::new(Store::new(medium, config.store_config())?);
    if !store.is_enabled() {
        bail!("storage medium {} is unavailable", config.file);
    }

    let (command, args) = config
        .command
        .split_first()
        .map(|(c, rest)| (c.clone(), rest.to_vec()))
        .ok_or_else(|| anyhow!("missing command"))?;

    run(store, &command, args).await
}
