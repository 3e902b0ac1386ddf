use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use clap::Parser;
use tracing::info;
use tracing_subscriber::EnvFilter;

use modelmux_common::AppConfig;
use modelmux_core::{
    Auth, AuthManager, EventHub, HttpExecutor, MemoryMessageIndex, MessageIndex, ModelResolver,
    Pipeline, ProviderExecutor, RedisIndexOptions, RedisMessageIndex, RouteTable, StickySelector,
};
use modelmux_http::access::AccessControl;
use modelmux_http::{HttpState, http_router};

mod cli;

#[tokio::main]
async fn main() -> Result<()> {
    let args = cli::Cli::parse();
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("modelmux=info")),
        )
        .init();

    let mut config = load_config(&args.config)?;
    if let Some(host) = args.host {
        config.host = host;
    }
    if let Some(port) = args.port {
        config.port = port;
    }
    config.validate().context("invalid configuration")?;

    let index = build_index(&config).await?;
    let selector = StickySelector::new(index);
    let events = EventHub::new(64);
    spawn_event_logger(&events);

    let client = reqwest::Client::new();
    let mut executors: HashMap<String, Arc<dyn ProviderExecutor>> = HashMap::new();
    let mut auths: Vec<Auth> = Vec::new();
    for seed in &config.providers {
        let provider = seed.name.trim().to_ascii_lowercase();
        executors.insert(
            provider.clone(),
            Arc::new(HttpExecutor::new(
                provider.clone(),
                seed.base_url.clone(),
                seed.count_tokens_path.clone(),
                client.clone(),
            )),
        );
        for entry in &seed.auths {
            let mut auth = Auth::new(entry.id.clone(), provider.clone());
            auth.label = entry.label.clone();
            auth.disabled = entry.disabled;
            if let Some(api_key) = &entry.api_key {
                auth = auth.with_metadata("api_key", serde_json::Value::String(api_key.clone()));
            }
            auths.push(auth);
        }
    }

    let manager = AuthManager::new(executors, selector, events);
    for auth in auths {
        manager.upsert_auth(auth).await;
    }

    let mut table = RouteTable::builtin();
    for rule in &config.routes {
        table.add_rule(rule.prefix.clone(), rule.providers.clone());
    }
    let resolver = Arc::new(ModelResolver::new(
        table,
        config.openai_compat_providers.clone(),
    ));
    let pipeline = Arc::new(Pipeline::new(manager, resolver));

    let state = Arc::new(HttpState {
        pipeline,
        access: AccessControl::new(config.api_keys.clone()),
        request_log: config.request_log,
    });
    let app = http_router(state);

    let bind = format!("{}:{}", config.host, config.port);
    let listener = tokio::net::TcpListener::bind(&bind)
        .await
        .with_context(|| format!("failed to bind {bind}"))?;
    info!(%bind, "listening");
    axum::serve(listener, app).await?;
    Ok(())
}

fn load_config(path: &str) -> Result<AppConfig> {
    match std::fs::read_to_string(path) {
        Ok(raw) => {
            serde_yaml::from_str(&raw).with_context(|| format!("failed to parse config {path}"))
        }
        Err(err) if err.kind() == std::io::ErrorKind::NotFound => {
            info!(%path, "config file not found, using defaults");
            Ok(AppConfig::default())
        }
        Err(err) => Err(err).with_context(|| format!("failed to read config {path}")),
    }
}

async fn build_index(config: &AppConfig) -> Result<Arc<dyn MessageIndex>> {
    let sticky = &config.sticky_index;
    if !sticky.redis_enabled {
        return Ok(Arc::new(MemoryMessageIndex::new()));
    }
    let opts = RedisIndexOptions {
        addr: sticky
            .redis_addr
            .clone()
            .unwrap_or_else(|| "127.0.0.1:6379".to_string()),
        password: sticky.redis_password.clone(),
        db: sticky.redis_db,
        prefix: sticky.redis_prefix.clone(),
        ttl: sticky
            .ttl_seconds
            .filter(|secs| *secs > 0)
            .map(|secs| Duration::from_secs(secs as u64)),
    };
    let index = RedisMessageIndex::connect(opts)
        .await
        .context("invalid sticky index options")?;
    Ok(Arc::new(index))
}

fn spawn_event_logger(events: &EventHub) {
    let mut rx = events.subscribe();
    tokio::spawn(async move {
        while let Ok(event) = rx.recv().await {
            info!(?event, "auth event");
        }
    });
}
