//! Command handlers

use std::sync::Arc;

use anyhow::{Context as _, Result};
use countdown_core::WorkerConfig;
use countdown_net::http::Method;
use countdown_net::{LoaderConfig, Request, RequestMode, ResourceLoader};
use countdown_sw::message::reply_channel;
use countdown_sw::{CacheStorage, ClientMessage, PushMessage, ServiceWorkerContainer, SyncOutcome};
use serde_json::{json, Value};
use tracing::{debug, warn};

use crate::cli::Cli;

/// Everything a command needs: the effective config and a container over
/// the on-disk cache.
pub struct Context {
    pub config: WorkerConfig,
    pub container: ServiceWorkerContainer,
}

impl Context {
    pub async fn load(cli: &Cli) -> Result<Self> {
        let config = resolve_config(cli)?;
        let caches = CacheStorage::load(&config.cache_dir)
            .await
            .with_context(|| format!("opening cache directory {}", config.cache_dir.display()))?;
        let network = Arc::new(ResourceLoader::new(LoaderConfig::default())?);
        let scope = config.resolve("/")?;

        let (container, mut events) = ServiceWorkerContainer::new(caches, network, scope);
        tokio::spawn(async move {
            while let Some(event) = events.recv().await {
                debug!(?event, "Container event");
            }
        });

        Ok(Self { config, container })
    }

    /// Reinstate the installed generation, if any.
    async fn resume(&self) -> Result<()> {
        if !self.container.resume(self.config.clone()).await? {
            warn!(
                generation = %self.config.generation,
                "Generation not installed, requests go straight to the network"
            );
        }
        Ok(())
    }
}

/// Config file (or defaults) with command-line overrides applied.
pub fn resolve_config(cli: &Cli) -> Result<WorkerConfig> {
    let mut config = match cli.config {
        Some(ref path) => WorkerConfig::load(path)
            .with_context(|| format!("loading config {}", path.display()))?,
        None => WorkerConfig::default(),
    };
    if let Some(ref dir) = cli.cache_dir {
        config.cache_dir = dir.clone();
    }
    if let Some(ref generation) = cli.generation {
        config = config.with_generation(generation.clone());
    }
    config.validate()?;
    Ok(config)
}

pub async fn install(ctx: &Context) -> Result<()> {
    let state = ctx
        .container
        .register(ctx.config.clone())
        .await
        .with_context(|| format!("installing generation {}", ctx.config.generation))?;

    let entries = ctx.container.caches().handle(&ctx.config.bucket_name()).len().await;
    println!(
        "Generation {} is {:?} ({} cached entries)",
        ctx.config.generation, state, entries
    );
    Ok(())
}

pub async fn fetch(ctx: &Context, target: &str, navigate: bool, method: &str) -> Result<()> {
    ctx.resume().await?;

    let url = ctx.config.resolve(target)?;
    let method = Method::from_bytes(method.to_ascii_uppercase().as_bytes())
        .with_context(|| format!("invalid method {method}"))?;
    let mut request = Request::new(method, url);
    if navigate {
        request = request.mode(RequestMode::Navigate);
    }

    let (response, lifetime) = ctx.container.dispatch_fetch(request).await?;
    lifetime.settled().await;

    let source = if response.from_cache { "cache" } else { "network" };
    println!("{} {} ({source})", response.status, response.url);
    println!("{}", String::from_utf8_lossy(response.body()));
    Ok(())
}

pub async fn sync(ctx: &Context, tag: Option<&str>) -> Result<()> {
    ctx.resume().await?;

    let tag = tag.unwrap_or(ctx.config.sync_tag.as_str());
    ctx.container.register_sync(tag).await;
    match ctx.container.fire_sync(tag).await? {
        SyncOutcome::Refreshed { url } => println!("Refreshed {url}"),
        SyncOutcome::Unsuccessful { status } => println!("Endpoint answered {status}, nothing stored"),
        SyncOutcome::Failed(reason) => println!("Sync failed: {reason}"),
        SyncOutcome::UnknownTag(tag) => println!("Ignored unknown tag {tag}"),
    }
    Ok(())
}

pub async fn push(ctx: &Context, payload: Option<&str>) -> Result<()> {
    ctx.resume().await?;

    let message = payload.map(PushMessage::text_payload).unwrap_or_default();
    let Some(id) = ctx.container.push(message).await? else {
        println!("No notification shown");
        return Ok(());
    };

    let notifications = ctx.container.scope().notifications.read().await;
    if let Some(shown) = notifications.get(id) {
        let intent = &shown.intent;
        println!("{}: {}", intent.title, intent.body);
        println!("  tag: {}  icon: {}", intent.tag, intent.icon);
        for action in &intent.actions {
            println!("  [{}] {}", action.action, action.title);
        }
    }
    Ok(())
}

pub async fn message(ctx: &Context, kind: &str, data: Option<&str>) -> Result<()> {
    ctx.resume().await?;

    let envelope = match data {
        Some(raw) => {
            let data: Value = serde_json::from_str(raw).context("parsing --data as JSON")?;
            json!({ "type": kind, "data": data })
        }
        None => json!({ "type": kind }),
    };

    let expects_reply = ClientMessage::parse(&envelope)
        .map(|command| command.expects_reply())
        .unwrap_or(false);
    if !expects_reply {
        ctx.container.post_message(envelope, None).await?;
        println!("Delivered {kind}");
        return Ok(());
    }

    let (port, reply) = reply_channel();
    ctx.container.post_message(envelope, Some(port)).await?;
    match reply.await {
        Ok(reply) => println!("{}", serde_json::to_string(&reply)?),
        Err(_) => println!("(no reply)"),
    }
    Ok(())
}

pub async fn status(ctx: &Context) -> Result<()> {
    let caches = ctx.container.caches();
    let current = ctx.config.bucket_name();

    println!("Generation: {}", ctx.config.generation);
    println!("Origin: {}", ctx.config.origin);
    println!("Cache directory: {}", ctx.config.cache_dir.display());

    let buckets = caches.keys().await;
    if buckets.is_empty() {
        println!("No cache buckets");
    }
    for name in buckets {
        let entries = caches.handle(&name).len().await;
        let marker = if name == current { " (current)" } else { "" };
        println!("  {name}: {entries} entries{marker}");
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::Parser;
    use std::io::Write;

    #[test]
    fn test_overrides_apply_on_top_of_file() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        write!(file, r#"{{ "generation": "v2.0.0", "origin": "https://gaokao.test/" }}"#).unwrap();
        let path = file.path().to_str().unwrap().to_string();

        let cli = Cli::parse_from(["countdown-sw", "--config", path.as_str(), "--cache-dir", "/tmp/x", "status"]);
        let config = resolve_config(&cli).unwrap();
        assert_eq!(config.generation, "v2.0.0");
        assert_eq!(config.origin.as_str(), "https://gaokao.test/");
        assert_eq!(config.cache_dir, std::path::PathBuf::from("/tmp/x"));

        let cli = Cli::parse_from(["countdown-sw", "--config", path.as_str(), "--generation", "v3", "status"]);
        assert_eq!(resolve_config(&cli).unwrap().generation, "v3");
    }

    #[test]
    fn test_empty_generation_override_is_rejected() {
        let cli = Cli::parse_from(["countdown-sw", "--generation", "", "status"]);
        assert!(resolve_config(&cli).is_err());
    }

    #[tokio::test]
    async fn test_status_on_empty_cache_dir() {
        let dir = tempfile::tempdir().unwrap();
        let dir_arg = dir.path().to_str().unwrap().to_string();
        let cli = Cli::parse_from(["countdown-sw", "--cache-dir", dir_arg.as_str(), "status"]);

        let ctx = Context::load(&cli).await.unwrap();
        status(&ctx).await.unwrap();
        assert!(ctx.container.caches().keys().await.is_empty());
    }

    #[tokio::test]
    async fn test_message_waits_only_for_reporting_commands() {
        let dir = tempfile::tempdir().unwrap();
        let dir_arg = dir.path().to_str().unwrap().to_string();
        let cli = Cli::parse_from(["countdown-sw", "--cache-dir", dir_arg.as_str(), "status"]);
        let ctx = Context::load(&cli).await.unwrap();
        ctx.container.caches().open(&ctx.config.bucket_name()).await.unwrap();

        // no port is handed out, so this returns without waiting
        message(&ctx, "SKIP_WAITING", None).await.unwrap();
        message(&ctx, "CACHE_QUOTE", Some(r#"{"quote":{"id":"q1"}}"#)).await.unwrap();
        assert_eq!(ctx.container.caches().handle(&ctx.config.bucket_name()).len().await, 1);

        message(&ctx, "CLEAR_CACHE", None).await.unwrap();
        assert!(ctx.container.caches().keys().await.is_empty());
    }
}
