pub mod chat;
pub mod memories;

use anyhow::{bail, Context, Result};
use futures::StreamExt;
use indicatif::{ProgressBar, ProgressStyle};
use tether::app::App;
use tether::supervisor::{HealthProbe, HttpHealthProbe, ProbeOutcome, ServiceState};

/// Progress bar resolution for model pulls.
const PULL_STEPS: u64 = 1_000;

/// Report what is listening on the service port and which models it has.
pub async fn status(app: &App) -> Result<()> {
    let probe = HttpHealthProbe::new(&app.config.supervisor)?;
    let outcome = probe.probe().await;

    println!("Inference Server");
    println!("{}", "=".repeat(40));
    println!("  Address:             {}", app.config.supervisor.base_url());
    println!("  Server:              {}", describe_probe(&outcome));

    if !outcome.is_compatible() {
        return Ok(());
    }

    let report = app.client.check_health().await;
    println!("  Chat model:          {}", app.client.chat_model());
    println!(
        "  Chat model installed: {}",
        if report.ready { "yes" } else { "no" }
    );
    if !report.models.is_empty() {
        println!();
        println!("Installed models:");
        for m in &report.models {
            println!("  {m}");
        }
    }
    if !report.ready {
        println!();
        println!("Run `tether pull` to install {}.", app.client.chat_model());
    }
    Ok(())
}

fn describe_probe(outcome: &ProbeOutcome) -> String {
    match outcome {
        ProbeOutcome::Unreachable => "not running".into(),
        ProbeOutcome::Healthy => "ready".into(),
        ProbeOutcome::Loading { progress: Some(p) } => {
            format!("downloading model ({:.0}%)", p * 100.0)
        }
        ProbeOutcome::Loading { progress: None } => "loading model".into(),
        ProbeOutcome::Failed(reason) => format!("model failed to load: {reason}"),
        ProbeOutcome::Foreign => "port in use by another program".into(),
    }
}

/// Launch and supervise the server until Ctrl-C, printing each state change.
pub async fn serve(app: &App) -> Result<()> {
    let mut states = app.supervisor.subscribe();
    app.supervisor.start().await?;
    println!("{}", app.supervisor.state());

    loop {
        tokio::select! {
            _ = tokio::signal::ctrl_c() => break,
            changed = states.changed() => {
                if changed.is_err() {
                    break;
                }
                let state = states.borrow_and_update().clone();
                match &state {
                    ServiceState::Error(reason) => eprintln!("error: {reason}"),
                    other => println!("{other}  {}", app.supervisor.status_message()),
                }
            }
        }
    }

    println!("Stopping...");
    app.supervisor.stop().await?;
    Ok(())
}

/// Download a model with a progress bar.
pub async fn pull(app: &App, model: Option<&str>) -> Result<()> {
    let name = model.unwrap_or_else(|| app.client.chat_model()).to_string();
    chat::ensure_server(app).await?;

    let mut stream = app
        .client
        .pull_model(&name)
        .await
        .with_context(|| format!("failed to start pulling {name}"))?;

    let pb = ProgressBar::new(PULL_STEPS);
    pb.set_style(
        ProgressStyle::default_bar()
            .template("  {bar:40.cyan/blue} {percent:>3}% {msg}")
            .expect("valid template")
            .progress_chars("##-"),
    );

    let mut complete = false;
    while let Some(update) = stream.next().await {
        let update = update.with_context(|| format!("pull of {name} failed"))?;
        pb.set_position((update.progress.clamp(0.0, 1.0) * PULL_STEPS as f64) as u64);
        pb.set_message(update.status.clone());
        if update.is_complete() {
            complete = true;
            break;
        }
    }
    pb.finish_and_clear();

    if !complete {
        bail!("pull of {name} ended before the server reported success");
    }
    app.client.invalidate_health();
    println!("Model {name} installed.");
    Ok(())
}
