//! CLI `chat` command: one message in, a streamed reply out.

use std::io::Write;

use anyhow::{Context, Result};
use futures::StreamExt;
use tether::app::App;
use tether::supervisor::{HealthProbe, HttpHealthProbe, ProbeOutcome};
use tracing::info;

/// Make sure a compatible server is answering, launching one if nothing is.
/// Returns `true` when this call launched it.
pub async fn ensure_server(app: &App) -> Result<bool> {
    let probe = HttpHealthProbe::new(&app.config.supervisor)?;
    if probe.probe().await != ProbeOutcome::Unreachable {
        return Ok(false);
    }

    info!("inference server not running, launching it");
    app.supervisor.start().await?;
    if let Err(e) = app
        .supervisor
        .wait_until_ready(app.config.supervisor.startup_timeout())
        .await
    {
        app.supervisor.stop().await?;
        anyhow::bail!("{}", e.user_message());
    }
    Ok(true)
}

pub async fn chat(app: &App, message: &str, entry_id: Option<&str>, remember: bool) -> Result<()> {
    let launched = ensure_server(app).await?;

    let exchange = app.context.build_exchange(message, &[], entry_id).await;
    let mut stream = app
        .client
        .chat(&exchange)
        .await
        .map_err(|e| anyhow::anyhow!(e.user_message()))?;

    let mut reply = String::new();
    let mut stdout = std::io::stdout();
    while let Some(chunk) = stream.next().await {
        let chunk = chunk.context("chat stream failed")?;
        print!("{}", chunk.content);
        stdout.flush()?;
        reply.push_str(&chunk.content);
        if chunk.is_final {
            break;
        }
    }
    println!();

    if remember && !reply.trim().is_empty() {
        if let Some(memory) = app.context.remember_exchange(message, &reply).await {
            eprintln!("remembered: {}", memory.content);
        }
    }

    if launched {
        app.supervisor.stop().await?;
    }
    Ok(())
}
