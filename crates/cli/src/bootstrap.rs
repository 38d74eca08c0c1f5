//! Session construction shared by the `run` and `unload` commands.

use std::path::Path;
use std::sync::Arc;

use anyhow::Context;
use lt_domain::config::{BackendKind, Config, ConfigSeverity};
use lt_engine::StreamingSession;
use lt_providers::{ChatTemplateRenderer, LoopbackTokenSource, ReplayTokenSource, TemplateMeta, TokenSource};
use lt_tools::ToolRegistry;

/// Validate config and wire a session to the configured token source.
/// `replay` overrides the configured backend.
pub fn build_session(config: &Config, replay: Option<&Path>, index: usize) -> anyhow::Result<StreamingSession> {
    // ── Config validation ────────────────────────────────────────────
    let issues = config.validate();
    for issue in &issues {
        match issue.severity {
            ConfigSeverity::Warning if replay.is_some() && issue.field == "backend.replay.script" => {}
            ConfigSeverity::Warning => tracing::warn!("config: {issue}"),
            ConfigSeverity::Error => tracing::error!("config: {issue}"),
        }
    }
    let errors = issues
        .iter()
        .filter(|i| i.severity == ConfigSeverity::Error)
        .count();
    if errors > 0 {
        anyhow::bail!("config validation failed with {errors} error(s)");
    }

    // ── Token source ─────────────────────────────────────────────────
    let source = build_source(config, replay)?;
    tracing::info!(
        source = %source.source_id(),
        channel = ?source.channel(),
        "token source ready"
    );

    // ── Tools and template ───────────────────────────────────────────
    let tools = Arc::new(ToolRegistry::with_builtins());
    tracing::debug!(tools = ?tools.names(), "tool registry ready");
    let renderer = Arc::new(ChatTemplateRenderer::new(config.template.system_prompt.clone()));

    Ok(StreamingSession::new(
        source,
        tools,
        renderer,
        config.session.clone(),
        TemplateMeta::from(&config.template),
    )
    .with_index(index))
}

fn build_source(config: &Config, replay: Option<&Path>) -> anyhow::Result<Arc<dyn TokenSource>> {
    let channel = config.backend.channel;
    let replay_path = replay.or(match config.backend.kind {
        BackendKind::Replay => config.backend.replay.script.as_deref(),
        BackendKind::Loopback => None,
    });

    if let Some(path) = replay_path {
        let source = ReplayTokenSource::from_file(path)
            .with_context(|| format!("loading replay script {}", path.display()))?
            .with_channel(channel);
        return Ok(Arc::new(source));
    }

    match config.backend.kind {
        BackendKind::Loopback => {
            let source = LoopbackTokenSource::from_config(&config.backend.loopback, channel)
                .context("initializing loopback source")?;
            Ok(Arc::new(source))
        }
        BackendKind::Replay => Ok(Arc::new(ReplayTokenSource::new(Vec::new()).with_channel(channel))),
    }
}
