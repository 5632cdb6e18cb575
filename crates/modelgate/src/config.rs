use anyhow::{Context, Result};
use nvml_wrapper::Nvml;
use std::env;
use std::net::SocketAddr;
use std::path::PathBuf;
use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;
use tracing::{info, warn};

use crate::catalog::{JsonDirStore, ModelCatalog};
use crate::model_runtime::{
    EchoRuntimeFactory, LlamaServerRuntimeFactory, LlamaServerSettings, RuntimeFactory,
};
use crate::orchestrator::OrchestratorConfig;

/// Which backend launched models run on.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RuntimeKind {
    Echo,
    LlamaServer,
}

impl FromStr for RuntimeKind {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "echo" => Ok(RuntimeKind::Echo),
            "llama-server" | "llama_server" | "llama" => Ok(RuntimeKind::LlamaServer),
            other => Err(anyhow::anyhow!(
                "unknown RUNTIME `{}` (expected `echo` or `llama-server`)",
                other
            )),
        }
    }
}

#[derive(Debug, Clone)]
pub struct Config {
    pub api_host: String,
    pub api_port: u16,
    pub max_running_models: usize,
    pub runtime: RuntimeKind,
    pub llama_bin: Option<PathBuf>,
    pub llama_endpoint: Option<String>,
    pub llama_host: String,
    pub llama_base_port: u16,
    pub models_dir: PathBuf,
    pub ctx_size: u32,
    pub threads: u32,
    pub gpu_layers: u32,
    pub startup_timeout_seconds: u64,
    pub generate_timeout_seconds: u64,
    pub request_timeout_seconds: u64,
    pub max_concurrent_requests: usize,
    pub registration_dir: Option<PathBuf>,
}

impl Config {
    pub fn from_env() -> Result<Self> {
        Self::from_lookup(|key| env::var(key).ok())
    }

    /// Build from any key lookup; missing keys take their defaults.
    pub fn from_lookup<F>(lookup: F) -> Result<Self>
    where
        F: Fn(&str) -> Option<String>,
    {
        let var = |key: &str, default: &str| lookup(key).unwrap_or_else(|| default.to_string());
        fn parse<T: FromStr>(key: &str, raw: String) -> Result<T>
        where
            T::Err: std::fmt::Display,
        {
            raw.trim()
                .parse()
                .map_err(|e| anyhow::anyhow!("{}", e))
                .with_context(|| format!("invalid value `{}` for {}", raw, key))
        }

        let runtime: RuntimeKind = var("RUNTIME", "echo").parse()?;

        let threads = match var("THREADS", "auto").as_str() {
            "auto" => Self::auto_detect_threads(),
            raw => parse("THREADS", raw.to_string())?,
        };

        let gpu_layers = match var("GPU_LAYERS", "auto").as_str() {
            "auto" => Self::auto_detect_gpu_layers(),
            raw => parse("GPU_LAYERS", raw.to_string())?,
        };

        let max_running_models = match var("MAX_RUNNING_MODELS", "auto").as_str() {
            "auto" => Self::auto_detect_max_running_models(),
            raw => parse("MAX_RUNNING_MODELS", raw.to_string())?,
        };
        if max_running_models == 0 {
            anyhow::bail!("MAX_RUNNING_MODELS must be at least 1");
        }

        let llama_bin = match lookup("LLAMA_BIN") {
            Some(path) => Some(PathBuf::from(path)),
            None => which::which("llama-server").ok(),
        };
        if runtime == RuntimeKind::LlamaServer
            && llama_bin.is_none()
            && lookup("LLAMA_ENDPOINT").is_none()
        {
            warn!("RUNTIME=llama-server but no llama-server binary found; launches will fail until LLAMA_BIN is set");
        }

        Ok(Self {
            api_host: var("API_HOST", "127.0.0.1"),
            api_port: parse("API_PORT", var("API_PORT", "9997"))?,
            max_running_models,
            runtime,
            llama_bin,
            llama_endpoint: lookup("LLAMA_ENDPOINT"),
            llama_host: var("LLAMA_HOST", "127.0.0.1"),
            llama_base_port: parse("LLAMA_BASE_PORT", var("LLAMA_BASE_PORT", "8100"))?,
            models_dir: PathBuf::from(var("MODELS_DIR", "./models")),
            ctx_size: parse("CTX_SIZE", var("CTX_SIZE", "2048"))?,
            threads,
            gpu_layers,
            startup_timeout_seconds: parse(
                "LLAMA_STARTUP_TIMEOUT_SECONDS",
                var("LLAMA_STARTUP_TIMEOUT_SECONDS", "60"),
            )?,
            generate_timeout_seconds: parse(
                "GENERATE_TIMEOUT_SECONDS",
                var("GENERATE_TIMEOUT_SECONDS", "600"),
            )?,
            request_timeout_seconds: parse(
                "REQUEST_TIMEOUT_SECONDS",
                var("REQUEST_TIMEOUT_SECONDS", "600"),
            )?,
            max_concurrent_requests: parse(
                "MAX_CONCURRENT_REQUESTS",
                var("MAX_CONCURRENT_REQUESTS", "256"),
            )?,
            registration_dir: lookup("REGISTRATION_DIR").map(PathBuf::from),
        })
    }

    fn auto_detect_threads() -> u32 {
        let num_cpus = num_cpus::get() as u32;
        info!("Auto-detected CPU cores: {}", num_cpus);

        match num_cpus {
            1..=2 => 1,
            3..=4 => (num_cpus * 2) / 3,
            5..=8 => (num_cpus * 3) / 5,
            9..=16 => num_cpus / 2,
            17..=32 => (num_cpus * 2) / 5,
            _ => 16,
        }
    }

    fn auto_detect_gpu_layers() -> u32 {
        if let Ok(nvml) = Nvml::init() {
            if let Ok(device_count) = nvml.device_count() {
                if device_count > 0 {
                    if let Ok(first_gpu) = nvml.device_by_index(0) {
                        if let Ok(memory) = first_gpu.memory_info() {
                            let vram_gb = memory.total / 1024 / 1024 / 1024;
                            let layers = match vram_gb {
                                0..=4 => 12,
                                5..=8 => 20,
                                9..=12 => 32,
                                13..=16 => 40,
                                _ => 50,
                            };
                            info!("Auto-detected GPU layers: {} ({} GB VRAM)", layers, vram_gb);
                            return layers;
                        }
                    }
                }
            }
        }
        info!("No GPU detected, running on CPU only");
        0
    }

    /// One model per two cores, at least one and at most sixteen.
    fn auto_detect_max_running_models() -> usize {
        (num_cpus::get() / 2).clamp(1, 16)
    }

    pub fn print_config(&self) {
        info!("Current Configuration:");
        info!("- API: {}:{}", self.api_host, self.api_port);
        info!("- Runtime: {:?}", self.runtime);
        info!("- Max Running Models: {}", self.max_running_models);
        match &self.llama_bin {
            Some(bin) => info!("- Llama Binary: {}", bin.display()),
            None => info!("- Llama Binary: <not found>"),
        }
        if let Some(endpoint) = &self.llama_endpoint {
            info!("- Llama Endpoint: {}", endpoint);
        }
        info!("- Llama Host/Base Port: {}:{}", self.llama_host, self.llama_base_port);
        info!("- Models Dir: {}", self.models_dir.display());
        info!("- Context Size: {}", self.ctx_size);
        info!("- Threads: {}", self.threads);
        info!("- GPU Layers: {}", self.gpu_layers);
        info!("- Generate Timeout: {}s", self.generate_timeout_seconds);
        info!("- Request Timeout: {}s", self.request_timeout_seconds);
        info!("- Max Concurrent Requests: {}", self.max_concurrent_requests);
        match &self.registration_dir {
            Some(dir) => info!("- Registration Dir: {}", dir.display()),
            None => info!("- Registration Dir: <in-memory only>"),
        }
    }

    pub fn api_addr(&self) -> Result<SocketAddr> {
        format!("{}:{}", self.api_host, self.api_port)
            .parse()
            .with_context(|| format!("invalid API address {}:{}", self.api_host, self.api_port))
    }

    pub fn orchestrator_config(&self) -> OrchestratorConfig {
        OrchestratorConfig {
            max_running_models: self.max_running_models,
        }
    }

    pub fn llama_settings(&self) -> LlamaServerSettings {
        LlamaServerSettings {
            binary: self.llama_bin.clone(),
            endpoint: self.llama_endpoint.clone(),
            host: self.llama_host.clone(),
            base_port: self.llama_base_port,
            models_dir: self.models_dir.clone(),
            context_size: self.ctx_size,
            threads: self.threads,
            gpu_layers: self.gpu_layers,
            request_timeout: Duration::from_secs(self.generate_timeout_seconds),
            startup_timeout: Duration::from_secs(self.startup_timeout_seconds),
        }
    }

    pub fn runtime_factory(&self) -> Arc<dyn RuntimeFactory> {
        match self.runtime {
            RuntimeKind::Echo => Arc::new(EchoRuntimeFactory::new()),
            RuntimeKind::LlamaServer => Arc::new(LlamaServerRuntimeFactory::new(self.llama_settings())),
        }
    }

    /// Built-in families plus whatever was persisted under `registration_dir`.
    pub fn build_catalog(&self) -> Result<Arc<ModelCatalog>> {
        let catalog = ModelCatalog::with_builtin()?;
        let catalog = match &self.registration_dir {
            Some(dir) => catalog.with_store(Arc::new(JsonDirStore::new(dir)?))?,
            None => catalog,
        };
        Ok(Arc::new(catalog))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn config_from(pairs: &[(&str, &str)]) -> Result<Config> {
        let vars: HashMap<String, String> = pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        Config::from_lookup(|key| vars.get(key).cloned())
    }

    #[test]
    fn test_defaults() {
        let config = config_from(&[("THREADS", "4"), ("GPU_LAYERS", "0")]).unwrap();
        assert_eq!(config.api_host, "127.0.0.1");
        assert_eq!(config.api_port, 9997);
        assert_eq!(config.runtime, RuntimeKind::Echo);
        assert_eq!(config.llama_base_port, 8100);
        assert_eq!(config.ctx_size, 2048);
        assert_eq!(config.max_concurrent_requests, 256);
        assert!(config.max_running_models >= 1);
        assert!(config.registration_dir.is_none());
    }

    #[test]
    fn test_explicit_values() {
        let config = config_from(&[
            ("API_PORT", "8080"),
            ("RUNTIME", "llama-server"),
            ("LLAMA_BIN", "/opt/llama/llama-server"),
            ("MAX_RUNNING_MODELS", "3"),
            ("THREADS", "12"),
            ("GPU_LAYERS", "33"),
            ("REGISTRATION_DIR", "/var/lib/modelgate"),
        ])
        .unwrap();
        assert_eq!(config.api_port, 8080);
        assert_eq!(config.runtime, RuntimeKind::LlamaServer);
        assert_eq!(config.llama_bin, Some(PathBuf::from("/opt/llama/llama-server")));
        assert_eq!(config.orchestrator_config().max_running_models, 3);
        assert_eq!(config.llama_settings().threads, 12);
        assert_eq!(config.llama_settings().gpu_layers, 33);
        assert_eq!(config.registration_dir, Some(PathBuf::from("/var/lib/modelgate")));
    }

    #[test]
    fn test_invalid_values_are_rejected() {
        assert!(config_from(&[("API_PORT", "not-a-port")]).is_err());
        assert!(config_from(&[("RUNTIME", "tensorrt")]).is_err());
        assert!(config_from(&[("MAX_RUNNING_MODELS", "0")]).is_err());
    }

    #[test]
    fn test_api_addr() {
        let mut config = config_from(&[("THREADS", "1"), ("GPU_LAYERS", "0")]).unwrap();
        config.api_host = "0.0.0.0".into();
        config.api_port = 5000;
        let addr = config.api_addr().unwrap();
        assert_eq!(addr.port(), 5000);
        assert_eq!(addr.ip().to_string(), "0.0.0.0");
    }

    #[test]
    fn test_auto_detect_threads_returns_positive() {
        assert!(Config::auto_detect_threads() > 0);
    }

    #[test]
    fn test_build_catalog_loads_registration_dir() {
        let tmp = tempfile::tempdir().unwrap();
        let dir = tmp.path().to_string_lossy().to_string();
        let config = config_from(&[
            ("THREADS", "1"),
            ("GPU_LAYERS", "0"),
            ("REGISTRATION_DIR", dir.as_str()),
        ])
        .unwrap();
        let catalog = config.build_catalog().unwrap();
        assert!(catalog.get("orca").is_some());
        assert!(tmp.path().exists());
    }
}
