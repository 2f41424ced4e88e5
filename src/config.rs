//! Ingress configuration (env-driven).

use std::net::SocketAddr;
use std::time::Duration;

use anyhow::{bail, Result};

const DEFAULT_LISTEN_ADDR: &str = "0.0.0.0:19000";
const DEFAULT_IDLE_TIMEOUT: Duration = Duration::from_secs(300);
const DEFAULT_STARTUP_TIMEOUT: Duration = Duration::from_secs(15);
const DEFAULT_READ_HELLO_TIMEOUT: Duration = Duration::from_secs(10);
const DEFAULT_PORT_RANGE_START: u16 = 20000;
const DEFAULT_PORT_RANGE_END: u16 = 20100;
const DEFAULT_RESTART_BACKOFF: Duration = Duration::from_secs(2);
const DEFAULT_MAX_RESTARTS: u32 = 3;

/// Log output format selected at startup.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LogFormat {
    Plain,
    Json,
}

/// Runtime configuration, populated from environment variables with defaults.
#[derive(Debug, Clone)]
pub struct Config {
    /// Public listener bind address.
    pub listen_addr: SocketAddr,

    /// How long a tunnel with no attached connections is kept alive.
    pub idle_timeout: Duration,

    /// Deadline for a freshly spawned helper to accept loopback connections.
    pub startup_timeout: Duration,

    /// Deadline for each stage of reading the client's initial bytes.
    pub read_hello_timeout: Duration,

    /// Inclusive loopback port pool bounds.
    pub port_range_start: u16,
    pub port_range_end: u16,

    /// Log output format (`plain` or `json`).
    pub log_format: LogFormat,

    /// Base delay between helper restarts; attempt N waits N times this.
    pub restart_backoff: Duration,

    /// Consecutive restart cap while connections are attached.
    pub max_restarts: u32,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            listen_addr: DEFAULT_LISTEN_ADDR.parse().expect("default listen addr"),
            idle_timeout: DEFAULT_IDLE_TIMEOUT,
            startup_timeout: DEFAULT_STARTUP_TIMEOUT,
            read_hello_timeout: DEFAULT_READ_HELLO_TIMEOUT,
            port_range_start: DEFAULT_PORT_RANGE_START,
            port_range_end: DEFAULT_PORT_RANGE_END,
            log_format: LogFormat::Plain,
            restart_backoff: DEFAULT_RESTART_BACKOFF,
            max_restarts: DEFAULT_MAX_RESTARTS,
        }
    }
}

impl Config {
    /// Load configuration from environment variables, falling back to defaults.
    ///
    /// All invalid variables are reported in one error so the operator sees
    /// the full list instead of fixing them one restart at a time.
    pub fn from_env() -> Result<Self> {
        let mut cfg = Config::default();
        let mut errs: Vec<String> = Vec::new();

        if let Some(v) = env_var("LISTEN_ADDR") {
            match parse_listen_addr(&v) {
                Ok(addr) => cfg.listen_addr = addr,
                Err(e) => errs.push(format!("invalid LISTEN_ADDR: {e}")),
            }
        }

        for (name, slot) in [
            ("IDLE_TIMEOUT", &mut cfg.idle_timeout),
            ("STARTUP_TIMEOUT", &mut cfg.startup_timeout),
            ("READ_HELLO_TIMEOUT", &mut cfg.read_hello_timeout),
            ("RESTART_BACKOFF", &mut cfg.restart_backoff),
        ] {
            if let Some(v) = env_var(name) {
                match parse_duration(&v) {
                    Ok(d) => *slot = d,
                    Err(e) => errs.push(format!("invalid {name}: {e}")),
                }
            }
        }

        if let Some(v) = env_var("PORT_RANGE_START") {
            match parse_port(&v) {
                Ok(p) => cfg.port_range_start = p,
                Err(e) => errs.push(format!("invalid PORT_RANGE_START: {e}")),
            }
        }
        if let Some(v) = env_var("PORT_RANGE_END") {
            match parse_port(&v) {
                Ok(p) => cfg.port_range_end = p,
                Err(e) => errs.push(format!("invalid PORT_RANGE_END: {e}")),
            }
        }
        if cfg.port_range_end < cfg.port_range_start {
            errs.push(format!(
                "port range end must be >= start, got {}-{}",
                cfg.port_range_start, cfg.port_range_end
            ));
        }

        if let Some(v) = env_var("LOG_FORMAT") {
            match v.to_ascii_lowercase().as_str() {
                "plain" => cfg.log_format = LogFormat::Plain,
                "json" => cfg.log_format = LogFormat::Json,
                other => errs.push(format!("invalid LOG_FORMAT: {other:?} (must be plain|json)")),
            }
        }

        if let Some(v) = env_var("MAX_RESTARTS") {
            match v.parse::<u32>() {
                Ok(n) if n > 0 => cfg.max_restarts = n,
                _ => errs.push(format!("invalid MAX_RESTARTS: {v:?} (must be a positive integer)")),
            }
        }

        if !errs.is_empty() {
            bail!("invalid configuration: {}", errs.join("; "));
        }
        Ok(cfg)
    }
}

fn env_var(name: &str) -> Option<String> {
    std::env::var(name)
        .ok()
        .map(|v| v.trim().to_string())
        .filter(|v| !v.is_empty())
}

/// Accepts `host:port` as well as the bare `:port` shorthand.
fn parse_listen_addr(raw: &str) -> Result<SocketAddr, String> {
    let candidate = if raw.starts_with(':') {
        format!("0.0.0.0{raw}")
    } else {
        raw.to_string()
    };
    candidate
        .parse()
        .map_err(|e| format!("{raw:?}: {e}"))
}

/// Parses `300s` / `1500ms` / `5m` / `1h` style durations; a bare integer
/// means seconds. Zero durations are rejected.
fn parse_duration(raw: &str) -> Result<Duration, String> {
    let s = raw.trim();
    let split = s
        .find(|c: char| !c.is_ascii_digit())
        .unwrap_or(s.len());
    let (digits, unit) = s.split_at(split);
    let value: u64 = digits
        .parse()
        .map_err(|_| format!("{raw:?} is not a duration"))?;
    let duration = match unit {
        "" | "s" => Duration::from_secs(value),
        "ms" => Duration::from_millis(value),
        "m" => Duration::from_secs(value * 60),
        "h" => Duration::from_secs(value * 3600),
        _ => return Err(format!("{raw:?} has unknown unit {unit:?}")),
    };
    if duration.is_zero() {
        return Err(format!("{raw:?} must be positive"));
    }
    Ok(duration)
}

fn parse_port(raw: &str) -> Result<u16, String> {
    match raw.parse::<u16>() {
        Ok(p) if p > 0 => Ok(p),
        _ => Err(format!("{raw:?} is not a valid port")),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let cfg = Config::default();
        assert_eq!(cfg.listen_addr.port(), 19000);
        assert_eq!(cfg.idle_timeout, Duration::from_secs(300));
        assert_eq!(cfg.port_range_start, 20000);
        assert_eq!(cfg.port_range_end, 20100);
        assert_eq!(cfg.log_format, LogFormat::Plain);
        assert_eq!(cfg.max_restarts, 3);
    }

    #[test]
    fn test_parse_duration_units() {
        assert_eq!(parse_duration("300s").unwrap(), Duration::from_secs(300));
        assert_eq!(parse_duration("1500ms").unwrap(), Duration::from_millis(1500));
        assert_eq!(parse_duration("5m").unwrap(), Duration::from_secs(300));
        assert_eq!(parse_duration("2h").unwrap(), Duration::from_secs(7200));
        assert_eq!(parse_duration("45").unwrap(), Duration::from_secs(45));
    }

    #[test]
    fn test_parse_duration_rejects_invalid() {
        assert!(parse_duration("0s").is_err());
        assert!(parse_duration("-5s").is_err());
        assert!(parse_duration("abc").is_err());
        assert!(parse_duration("10parsecs").is_err());
    }

    #[test]
    fn test_parse_listen_addr_shorthand() {
        let addr = parse_listen_addr(":19000").unwrap();
        assert_eq!(addr.port(), 19000);
        assert!(addr.ip().is_unspecified());

        let addr = parse_listen_addr("127.0.0.1:9000").unwrap();
        assert_eq!(addr.port(), 9000);

        assert!(parse_listen_addr("not an address").is_err());
    }

    #[test]
    fn test_parse_port_bounds() {
        assert_eq!(parse_port("20000").unwrap(), 20000);
        assert!(parse_port("0").is_err());
        assert!(parse_port("70000").is_err());
        assert!(parse_port("-1").is_err());
    }
}
