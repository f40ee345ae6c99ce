pub mod config;
pub mod db {
    pub mod models;
    pub mod pool;
}
pub mod devices {
    pub mod actuator;
    pub mod plug;
    pub mod registry;
    pub mod sensor;
}
pub mod schema;
pub mod services {
    pub mod control;
    pub mod device_log;
    pub mod poller;
    pub mod readings;
    pub mod rules;
}
pub mod shutdown;
pub mod utils;
pub mod web;

use crate::config::{Config, DevicesFile};
use crate::devices::registry::DeviceRegistry;
use crate::devices::sensor::SensorSource;
use crate::services::control::{Control, LoopTimings};
use crate::services::device_log::DeviceLog;
use crate::services::poller::SensorPoller;
use crate::services::readings::ReadingStore;
use crate::services::rules::RuleStore;
use crate::shutdown::ShutdownHandle;
use log::{error, info};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;

#[derive(Debug)]
struct LoadedEnvFile {
    path: PathBuf,
    explicit: bool,
}

pub fn run() -> Result<(), String> {
    // 1) Load config
    let cfg = Config::from_env()?;
    info!(
        "Config loaded (database={}, devices_file={}, bind={}, control_interval={}s, control_backoff={}s, sensor_interval={}s, sensors_enabled={})",
        cfg.database_path,
        cfg.devices_file.display(),
        cfg.http_bind,
        cfg.control_interval.as_secs(),
        cfg.control_backoff.as_secs(),
        cfg.sensor_interval.as_secs(),
        cfg.sensors_enabled
    );
    let devices = DevicesFile::load(&cfg.devices_file)?;
    info!("Loaded {} widget(s) from {}", devices.devices.len(), cfg.devices_file.display());

    // 2) Open DB and apply pending migrations
    let pool = db::pool::open(&cfg.database_path).map_err(|e| format!("Opening database failed: {}", e))?;

    // 3) Build the device registry
    let registry = Arc::new(DeviceRegistry::from_config(
        &devices,
        cfg.actuation_timeout,
        DeviceLog::new(pool.clone()),
    ));
    let readings = ReadingStore::new(pool.clone());
    let rules = RuleStore::new(pool.clone());
    let mut workers = ShutdownHandle::new();

    // 4) Sensor pollers
    if cfg.sensors_enabled {
        for sensor in registry.list_sensors() {
            let Some(source) = sensor.source.as_ref() else {
                continue;
            };
            let poller = SensorPoller {
                sensor_id: sensor.id.clone(),
                metrics: sensor.metrics.clone(),
                source: SensorSource::from_config(source),
                readings: readings.clone(),
            };
            let interval = cfg.sensor_interval;
            workers
                .spawn(format!("sensor-{}", sensor.id), move |token| poller.run_loop(interval, &token))
                .map_err(|e| format!("Starting poller for {} failed: {}", sensor.id, e))?;
        }
    } else {
        info!("Sensor polling disabled via SENSORS_ENABLED={}", cfg.sensors_enabled);
    }

    // 5) One control loop per control widget
    let timings = LoopTimings {
        interval: cfg.control_interval,
        backoff: cfg.control_backoff,
    };
    let mut controls = HashMap::new();
    for control_cfg in devices.controls() {
        info!(
            "Control {} ({}) defaults: {}/{} {} {} -> {}",
            control_cfg.id,
            control_cfg.name.as_deref().unwrap_or("unnamed"),
            control_cfg.defaults.sensor_id,
            control_cfg.defaults.metric,
            control_cfg.defaults.operator,
            control_cfg.defaults.target_value,
            control_cfg.defaults.device_id
        );
        let control = Control {
            control_id: control_cfg.id.clone(),
            defaults: control_cfg.defaults.clone(),
            rules: rules.clone(),
            readings: readings.clone(),
            registry: registry.clone(),
        };
        let worker = control.clone();
        workers
            .spawn(format!("control-{}", control_cfg.id), move |token| worker.run_loop(timings, &token))
            .map_err(|e| format!("Starting control loop for {} failed: {}", control_cfg.id, e))?;
        controls.insert(control_cfg.id.clone(), control);
    }
    info!("Started {} background thread(s)", workers.worker_count());

    // 6) Serve the dashboard API until SIGINT/SIGTERM
    let (signal_tx, signal_rx) = crossbeam_channel::bounded(1);
    ctrlc::set_handler(move || {
        let _ = signal_tx.try_send(());
    })
    .map_err(|e| format!("Installing signal handler failed: {}", e))?;

    let state = web::AppState {
        controls,
        registry,
        readings,
        history_hours: cfg.history_hours,
        clock: devices.has_clock(),
    };
    let server = match web::serve(state, &cfg.http_bind) {
        Ok(server) => server,
        Err(e) => {
            workers.shutdown();
            return Err(e);
        }
    };

    // The sender lives in the signal handler, so this only returns on a signal.
    let _ = signal_rx.recv();
    info!("Shutdown requested");
    let stopped = server.stop();
    workers.shutdown();
    info!("Shutdown complete");
    stopped
}

/// Find `--env-file <path>` (or `--env-file=<path>`) among the arguments.
fn env_file_arg(mut args: impl Iterator<Item = std::ffi::OsString>) -> Result<Option<PathBuf>, String> {
    let mut env_file: Option<PathBuf> = None;
    while let Some(arg) = args.next() {
        let value = match arg.to_str() {
            Some("--env-file") => args
                .next()
                .ok_or_else(|| "`--env-file` requires a path argument".to_string())?,
            Some(s) if s.starts_with("--env-file=") => s["--env-file=".len()..].into(),
            Some("--") => break,
            Some(other) => return Err(format!("unrecognised argument: {}", other)),
            None => return Err("argument contains invalid UTF-8".to_string()),
        };
        if value.is_empty() {
            return Err("`--env-file` requires a path argument".to_string());
        }
        if env_file.replace(PathBuf::from(value)).is_some() {
            return Err("`--env-file` provided more than once".to_string());
        }
    }
    Ok(env_file)
}

fn configure_env_from_cli() -> Result<Option<LoadedEnvFile>, String> {
    // skip program name
    if let Some(path) = env_file_arg(std::env::args_os().skip(1))? {
        if !path.is_file() {
            return Err(format!("env file not found: {}", path.display()));
        }
        load_env_file(&path)?;
        return Ok(Some(LoadedEnvFile { path, explicit: true }));
    }

    let cwd = std::env::current_dir().map_err(|e| format!("unable to read current directory: {}", e))?;
    let path = cwd.join(".env");
    if !path.is_file() {
        return Ok(None);
    }
    load_env_file(&path)?;
    Ok(Some(LoadedEnvFile { path, explicit: false }))
}

fn load_env_file(path: &Path) -> Result<(), String> {
    let text = std::fs::read_to_string(path).map_err(|e| format!("failed to read {}: {}", path.display(), e))?;
    for (index, line) in text.lines().enumerate() {
        let Some((key, value)) =
            parse_env_assignment(line).map_err(|e| format!("{}:{}: {}", path.display(), index + 1, e))?
        else {
            continue;
        };
        // The process environment wins over the file.
        if std::env::var_os(&key).is_none() {
            // Updating process-level environment variables is unsafe on some targets.
            unsafe {
                std::env::set_var(key, value);
            }
        }
    }
    Ok(())
}

fn parse_env_assignment(line: &str) -> Result<Option<(String, String)>, String> {
    let trimmed = line.trim();
    if trimmed.is_empty() || trimmed.starts_with('#') {
        return Ok(None);
    }
    let assignment = trimmed.strip_prefix("export ").map(str::trim_start).unwrap_or(trimmed);
    let (key, raw) = assignment
        .split_once('=')
        .ok_or_else(|| "missing '=' in assignment".to_string())?;
    let key = key.trim();
    if key.is_empty() {
        return Err("environment variable name cannot be empty".to_string());
    }
    if key.chars().any(char::is_whitespace) {
        return Err(format!("environment variable name contains whitespace: {}", key));
    }

    let raw = raw.trim();
    let value = match raw.chars().next() {
        Some(quote @ ('"' | '\'')) => parse_quoted(&raw[1..], quote)?,
        _ => raw.split('#').next().unwrap_or_default().trim_end().to_string(),
    };
    Ok(Some((key.to_string(), value)))
}

/// Read up to the closing `quote`. Escapes are only honoured inside double quotes.
fn parse_quoted(input: &str, quote: char) -> Result<String, String> {
    let mut result = String::new();
    let mut chars = input.chars();
    while let Some(ch) = chars.next() {
        if ch == quote {
            let rest = chars.as_str().trim();
            if rest.is_empty() || rest.starts_with('#') {
                return Ok(result);
            }
            return Err(format!("unexpected characters after closing {} quote", quote));
        }
        if ch == '\\' && quote == '"' {
            let escaped = chars
                .next()
                .ok_or_else(|| "unterminated escape sequence in double-quoted value".to_string())?;
            result.push(match escaped {
                'n' => '\n',
                'r' => '\r',
                't' => '\t',
                other => other,
            });
            continue;
        }
        result.push(ch);
    }
    Err(format!("unterminated {}-quoted value", quote))
}

fn main() {
    let loaded_env = match configure_env_from_cli() {
        Ok(info) => info,
        Err(err) => {
            eprintln!("fatal: {}", err);
            std::process::exit(1);
        }
    };

    // Init logging after environment so RUST_LOG from .env is respected.
    let default_filter = env_logger::Env::default().default_filter_or("info");
    env_logger::Builder::from_env(default_filter)
        .format_timestamp_secs()
        .init();

    if let Some(info) = loaded_env.as_ref() {
        let origin = if info.explicit { "CLI-specified" } else { "default" };
        info!("Environment loaded from {} .env file: {}", origin, info.path.display());
    }

    info!(
        "homeboard {} (git {}) starting",
        env!("CARGO_PKG_VERSION"),
        env!("BUILD_TIME_GIT_HASH")
    );
    if let Err(e) = run() {
        error!("fatal: {}", e);
        std::process::exit(1);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::ffi::OsString;

    fn args(list: &[&str]) -> impl Iterator<Item = OsString> {
        list.iter().map(OsString::from).collect::<Vec<_>>().into_iter()
    }

    #[test]
    fn env_file_flag_forms() {
        assert_eq!(env_file_arg(args(&[])).unwrap(), None);
        assert_eq!(
            env_file_arg(args(&["--env-file", "prod.env"])).unwrap(),
            Some(PathBuf::from("prod.env"))
        );
        assert_eq!(
            env_file_arg(args(&["--env-file=dev.env"])).unwrap(),
            Some(PathBuf::from("dev.env"))
        );
        assert!(env_file_arg(args(&["--env-file"])).is_err());
        assert!(env_file_arg(args(&["--env-file="])).is_err());
        assert!(env_file_arg(args(&["--env-file", "a", "--env-file", "b"])).is_err());
        assert!(env_file_arg(args(&["--verbose"])).is_err());
    }

    #[test]
    fn env_assignments() {
        let parse = |line: &str| parse_env_assignment(line).unwrap();
        assert_eq!(parse("# comment"), None);
        assert_eq!(parse("   "), None);
        assert_eq!(parse("HTTP_BIND=127.0.0.1:9000"), Some(("HTTP_BIND".into(), "127.0.0.1:9000".into())));
        assert_eq!(parse("export RUST_LOG = debug # noisy"), Some(("RUST_LOG".into(), "debug".into())));
        assert_eq!(parse(r#"NAME="a \"b\"\tc" # x"#), Some(("NAME".into(), "a \"b\"\tc".into())));
        assert_eq!(parse(r"RAW='a\nb#c'"), Some(("RAW".into(), r"a\nb#c".into())));
        assert_eq!(parse("EMPTY="), Some(("EMPTY".into(), String::new())));

        assert!(parse_env_assignment("NOVALUE").is_err());
        assert!(parse_env_assignment("=x").is_err());
        assert!(parse_env_assignment("A B=1").is_err());
        assert!(parse_env_assignment("A=\"open").is_err());
        assert!(parse_env_assignment("A='x' y").is_err());
    }
}
