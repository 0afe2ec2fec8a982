use anyhow::Result;
use figment::{providers::{Env, Format, Serialized, Toml}, Figment};
use serde::{Deserialize, Serialize};
use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use strum::{Display, EnumString};

pub const DEFAULT_CONFIG_PATH: &str = "config/default.toml";
pub const ENV_PREFIX: &str = "FEEDER_MCP__";

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    pub server: ServerConfig,
    pub engine: EngineConfig,
    pub analysis: AnalysisConfig,
    pub visualization: VisualizationConfig,
    pub logging: LoggingConfig,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, EnumString, Display)]
#[serde(rename_all = "lowercase")]
#[strum(serialize_all = "lowercase", ascii_case_insensitive)]
pub enum Transport {
    Stdio,
    Http,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    pub transport: Transport,
    pub host: String,
    pub port: u16,
    pub request_timeout_secs: u64,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            transport: Transport::Stdio,
            host: "127.0.0.1".to_string(),
            port: 8089,
            request_timeout_secs: 120,
        }
    }
}

impl ServerConfig {
    pub fn socket_addr(&self) -> Result<SocketAddr> {
        Ok(format!("{}:{}", self.host, self.port).parse()?)
    }
}

/// Solver defaults used when a request leaves an option out.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    pub max_iterations: u32,
    pub tolerance: f64,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            max_iterations: 100,
            tolerance: 0.0001,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct AnalysisConfig {
    pub min_voltage_pu: f64,
    pub max_voltage_pu: f64,
    pub max_line_loading_pct: f64,
    /// Upper bound on buses evaluated by the placement search when the caller
    /// does not name candidates.
    pub max_candidates: usize,
    /// Most solves a single hosting-capacity sweep may run.
    pub max_capacity_steps: usize,
    pub harmonic_orders: Vec<u32>,
}

impl Default for AnalysisConfig {
    fn default() -> Self {
        Self {
            min_voltage_pu: 0.95,
            max_voltage_pu: 1.05,
            max_line_loading_pct: 100.0,
            max_candidates: 25,
            max_capacity_steps: 10_000,
            harmonic_orders: vec![1, 3, 5, 7, 9, 11, 13],
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct VisualizationConfig {
    /// Relative `save_path` values are resolved against this directory.
    pub output_dir: PathBuf,
    pub default_dpi: u32,
    pub default_figsize: [f64; 2],
}

impl Default for VisualizationConfig {
    fn default() -> Self {
        Self {
            output_dir: PathBuf::from("."),
            default_dpi: 100,
            default_figsize: [10.0, 6.0],
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    pub filter: String,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            filter: "info,tower_http=info".to_string(),
        }
    }
}

impl Config {
    pub fn load() -> Result<Self> {
        Self::load_from(DEFAULT_CONFIG_PATH)
    }

    /// Defaults, then the TOML file (if present), then `FEEDER_MCP__*` env vars.
    pub fn load_from(path: impl AsRef<Path>) -> Result<Self> {
        let figment = Figment::from(Serialized::defaults(Config::default()))
            .merge(Toml::file(path.as_ref()))
            .merge(Env::prefixed(ENV_PREFIX).split("__"));
        let cfg: Config = figment.extract()?;
        cfg.validate()?;
        Ok(cfg)
    }

    fn validate(&self) -> Result<()> {
        let a = &self.analysis;
        if a.min_voltage_pu >= a.max_voltage_pu {
            anyhow::bail!(
                "analysis.min_voltage_pu ({}) must be below analysis.max_voltage_pu ({})",
                a.min_voltage_pu,
                a.max_voltage_pu
            );
        }
        if a.max_line_loading_pct <= 0.0 {
            anyhow::bail!("analysis.max_line_loading_pct must be positive");
        }
        if a.max_capacity_steps == 0 {
            anyhow::bail!("analysis.max_capacity_steps must be positive");
        }
        if self.engine.max_iterations == 0 || self.engine.tolerance <= 0.0 {
            anyhow::bail!("engine.max_iterations and engine.tolerance must be positive");
        }
        if self.visualization.default_dpi == 0 {
            anyhow::bail!("visualization.default_dpi must be positive");
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn test_defaults_without_file() {
        let cfg = Config::load_from("does/not/exist.toml").unwrap();
        assert_eq!(cfg.server.transport, Transport::Stdio);
        assert_eq!(cfg.engine.max_iterations, 100);
        assert_eq!(cfg.analysis.harmonic_orders, vec![1, 3, 5, 7, 9, 11, 13]);
        assert!((cfg.analysis.min_voltage_pu - 0.95).abs() < 1e-12);
        assert_eq!(cfg.analysis.max_capacity_steps, 10_000);
    }

    #[test]
    fn test_file_overrides_defaults() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(
            file,
            "[server]\ntransport = \"http\"\nport = 9000\n\n[analysis]\nmax_candidates = 5"
        )
        .unwrap();

        let cfg = Config::load_from(file.path()).unwrap();
        assert_eq!(cfg.server.transport, Transport::Http);
        assert_eq!(cfg.server.port, 9000);
        assert_eq!(cfg.analysis.max_candidates, 5);
        // untouched sections keep their defaults
        assert_eq!(cfg.visualization.default_dpi, 100);
    }

    #[test]
    fn test_inverted_voltage_band_rejected() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(file, "[analysis]\nmin_voltage_pu = 1.1\nmax_voltage_pu = 0.9").unwrap();
        assert!(Config::load_from(file.path()).is_err());
    }

    #[test]
    fn test_zero_capacity_steps_rejected() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(file, "[analysis]\nmax_capacity_steps = 0").unwrap();
        assert!(Config::load_from(file.path()).is_err());
    }

    #[test]
    fn test_transport_parse() {
        assert_eq!("HTTP".parse::<Transport>().unwrap(), Transport::Http);
        assert_eq!(Transport::Stdio.to_string(), "stdio");
    }
}
