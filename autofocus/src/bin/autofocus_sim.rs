//! Run autofocus against the simulated rig
//!
//! Usage: `autofocus_sim [settings.json] [report-dir]`
//!
//! Log verbosity follows `RUST_LOG` (default `info`). Ctrl-C cancels the run and puts
//! the equipment back the way it was found.

use anyhow::Context;
use nightshade_autofocus::simulator::{
    SimulatedCamera, SimulatedFilterWheel, SimulatedFocuser, SimulatedGuider, SimulatedOptics,
};
use nightshade_autofocus::{
    new_cancellation_token, AutofocusDevices, AutofocusEngine, AutofocusSettings, JsonReportSink,
};
use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::time::Duration;
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    let mut args = std::env::args().skip(1);
    let settings = match args.next() {
        Some(path) => {
            let json = tokio::fs::read_to_string(&path)
                .await
                .with_context(|| format!("reading settings from {}", path))?;
            AutofocusSettings::from_json(&json)?
        }
        None => AutofocusSettings::default(),
    };
    let report_dir = args.next();

    let optics = SimulatedOptics::default();
    let focuser = Arc::new(
        SimulatedFocuser::new(optics.best_focus + 320, 20000)
            .with_travel_time(Duration::from_millis(200)),
    );
    let camera = Arc::new(
        SimulatedCamera::new(focuser.clone(), optics, rand::random()).with_exposure_time_scale(0.1),
    );
    let true_focus = camera.optics().best_focus;
    let devices = AutofocusDevices::new(focuser, camera)
        .with_filter_wheel(Arc::new(SimulatedFilterWheel::new(&["L", "R", "G", "B", "Ha"])))
        .with_guider(Arc::new(SimulatedGuider::new(true)));

    let mut engine = AutofocusEngine::new(devices, settings)?;
    if let Some(dir) = report_dir {
        engine = engine.with_report_sink(Arc::new(JsonReportSink::new(dir)));
    }

    let cancel = new_cancellation_token();
    let on_ctrl_c = cancel.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            tracing::warn!("Interrupted, cancelling autofocus");
            on_ctrl_c.store(true, Ordering::SeqCst);
        }
    });

    let progress: &(dyn Fn(f64, String) + Send + Sync) =
        &|pct: f64, message: String| tracing::info!("[{:>5.1}%] {}", pct, message);
    let report = engine.run(&cancel, Some(progress)).await?;

    println!("{}", report.to_json()?);
    if let Some(improvement) = report.improvement_pct() {
        tracing::info!(
            "Focus at {} ({:.1}% better than at {})",
            report.final_position,
            improvement,
            report.initial_position
        );
    }
    tracing::info!(
        "Simulated best focus was {} ({:+} steps off)",
        true_focus,
        report.final_position - true_focus
    );
    Ok(())
}
