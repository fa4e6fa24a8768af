//! Blacknet sensor daemon.

use std::path::PathBuf;

use blacknet::Sensor;
use clap::Parser;
use tokio::signal::unix::{signal, SignalKind};
use tracing::error;

#[derive(Parser)]
#[command(name = "blacknet-sensor", version, about = "Blacknet SSH honeypot sensor")]
struct Args {
    /// Configuration file (defaults to the standard search path)
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Write the daemon PID to this file
    #[arg(short, long)]
    pidfile: Option<PathBuf>,
}

enum Action {
    Continue,
    Reload,
    Stop,
}

#[tokio::main]
async fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env()
                .add_directive("blacknet=info".parse().unwrap()),
        )
        .init();

    let args = Args::parse();

    let mut sensor = match Sensor::new(args.config.as_deref()).await {
        Ok(sensor) => sensor,
        Err(e) => {
            error!("failed to start sensor: {}", e);
            std::process::exit(1);
        }
    };

    if let Some(pidfile) = &args.pidfile {
        if let Err(e) = std::fs::write(pidfile, format!("{}\n", std::process::id())) {
            error!("pidfile: {}", e);
            std::process::exit(1);
        }
    }

    let mut sigint = signal(SignalKind::interrupt()).expect("signal handler");
    let mut sigterm = signal(SignalKind::terminate()).expect("signal handler");
    let mut sighup = signal(SignalKind::hangup()).expect("signal handler");

    loop {
        let action = tokio::select! {
            _ = sigint.recv() => Action::Stop,
            _ = sigterm.recv() => Action::Stop,
            _ = sighup.recv() => Action::Reload,
            _ = sensor.serve_once() => Action::Continue,
        };
        match action {
            Action::Continue => {}
            Action::Reload => sensor.reload().await,
            Action::Stop => break,
        }
    }

    sensor.shutdown().await;
    if let Some(pidfile) = &args.pidfile {
        let _ = std::fs::remove_file(pidfile);
    }
}
