use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use clap::{ArgAction, Parser};
use serde_json::Value as JsonValue;
use tracing::{info, warn};

use genesis_agents::{LlmBackend, OllamaBackend, ScriptedBackend};
use genesis_app::router;
use genesis_core::GenesisConfig;
use genesis_runtime::{GenesisRuntime, LlmSettings, RuntimeConfig};

#[derive(Parser, Debug)]
#[command(name = "genesis-server", version, about = "Autonomous artificial-life server")]
struct AppCli {
    /// Address the HTTP/WebSocket server binds to.
    #[arg(long, env = "GENESIS_LISTEN_ADDR", default_value = "127.0.0.1:8000")]
    listen: SocketAddr,
    /// Layered TOML world-configuration files applied in order.
    #[arg(
        long = "config",
        value_name = "FILE",
        action = ArgAction::Append,
        env = "GENESIS_CONFIG",
        value_delimiter = ';'
    )]
    config_layers: Vec<PathBuf>,
    /// Directory for persisted mutation artifacts.
    #[arg(long, env = "GENESIS_MUTATIONS_DIR", default_value = "./mutations")]
    mutations_dir: PathBuf,
    /// Ollama base URL for the LLM collaborator.
    #[arg(long, env = "GENESIS_OLLAMA_URL", default_value = "http://127.0.0.1:11434")]
    ollama_url: String,
    /// Ollama model name.
    #[arg(long, env = "GENESIS_OLLAMA_MODEL", default_value = "llama3:8b")]
    ollama_model: String,
    /// LLM request timeout in seconds.
    #[arg(long, env = "GENESIS_LLM_TIMEOUT_SEC", default_value_t = 120)]
    llm_timeout_sec: u64,
    /// Cooldown between automatic evolution triggers, in seconds.
    #[arg(long, env = "GENESIS_EVOLUTION_COOLDOWN_SEC", default_value_t = 60)]
    evolution_cooldown_sec: u64,
    /// Seed for a reproducible world.
    #[arg(long, env = "GENESIS_SEED")]
    seed: Option<u64>,
    /// Run without an LLM service (evolution cycles fail cleanly).
    #[arg(long, env = "GENESIS_OFFLINE_LLM", action = ArgAction::SetTrue)]
    offline_llm: bool,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = AppCli::parse();
    init_tracing();

    let world = compose_world_config(&cli)?;
    let runtime = Arc::new(
        GenesisRuntime::new(RuntimeConfig {
            world,
            llm: LlmSettings {
                timeout: Duration::from_secs(cli.llm_timeout_sec),
                ..LlmSettings::default()
            },
            artifacts_dir: cli.mutations_dir.clone(),
            evolution_cooldown: Duration::from_secs(cli.evolution_cooldown_sec),
        })
        .context("failed to build the runtime")?,
    );

    let backend: Arc<dyn LlmBackend> = if cli.offline_llm {
        warn!("running with the offline LLM backend; evolution cycles will fail cleanly");
        Arc::new(ScriptedBackend::new())
    } else {
        Arc::new(
            OllamaBackend::new(
                &cli.ollama_url,
                &cli.ollama_model,
                Duration::from_secs(cli.llm_timeout_sec),
            )
            .context("failed to build the Ollama backend")?,
        )
    };

    runtime.spawn_agents(backend);
    runtime
        .start_engine()
        .context("failed to start the engine")?;

    let app = router(runtime.clone());
    let listener = tokio::net::TcpListener::bind(cli.listen)
        .await
        .with_context(|| format!("failed to bind {}", cli.listen))?;
    info!(address = %cli.listen, "genesis server listening");

    axum::serve(listener, app)
        .with_graceful_shutdown(async {
            let _ = tokio::signal::ctrl_c().await;
            info!("shutdown signal received");
        })
        .await
        .context("server errored")?;

    runtime.shutdown();
    Ok(())
}

fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_writer(std::io::stderr)
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .try_init();
}

/// Defaults, then TOML layers in order, then targeted env overrides.
fn compose_world_config(cli: &AppCli) -> Result<GenesisConfig> {
    let mut merged = serde_json::to_value(GenesisConfig::default())
        .expect("serialize default configuration");
    for path in &cli.config_layers {
        let layer = load_config_layer(path)?;
        info!(layer = %path.display(), "applying configuration layer");
        merge_layer(&mut merged, layer);
    }
    let mut config: GenesisConfig = serde_json::from_value(merged)
        .context("failed to deserialize merged configuration")?;
    apply_env_overrides(&mut config);
    if let Some(seed) = cli.seed {
        config.rng_seed = Some(seed);
    }
    Ok(config)
}

fn load_config_layer(path: &Path) -> Result<JsonValue> {
    let contents = std::fs::read_to_string(path)
        .with_context(|| format!("failed to read configuration layer {}", path.display()))?;
    let value: toml::Value = toml::from_str(&contents)
        .with_context(|| format!("failed to parse TOML layer {}", path.display()))?;
    serde_json::to_value(value).context("failed to convert TOML layer")
}

fn merge_layer(base: &mut JsonValue, layer: JsonValue) {
    match (base, layer) {
        (JsonValue::Object(base_map), JsonValue::Object(layer_map)) => {
            for (key, value) in layer_map {
                if let Some(existing) = base_map.get_mut(&key) {
                    merge_layer(existing, value);
                } else {
                    base_map.insert(key, value);
                }
            }
        }
        (target, value) => *target = value,
    }
}

fn apply_env_overrides(config: &mut GenesisConfig) {
    if let Ok(value) = std::env::var("GENESIS_TICK_RATE_MS") {
        match value.parse() {
            Ok(ms) => config.tick_rate_ms = ms,
            Err(_) => warn!(%value, "invalid GENESIS_TICK_RATE_MS ignored"),
        }
    }
    if let Ok(value) = std::env::var("GENESIS_MIN_POPULATION") {
        match value.parse() {
            Ok(min) => config.min_population = min,
            Err(_) => warn!(%value, "invalid GENESIS_MIN_POPULATION ignored"),
        }
    }
    if let Ok(value) = std::env::var("GENESIS_MAX_ENTITIES") {
        match value.parse() {
            Ok(max) => config.max_entities = max,
            Err(_) => warn!(%value, "invalid GENESIS_MAX_ENTITIES ignored"),
        }
    }
}
