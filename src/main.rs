pub mod can;
pub mod catalog;
pub mod config;
pub mod control;
pub mod ignition;
pub mod input;
pub mod lin;
pub mod most;
pub mod mqtt;
pub mod publish;
pub mod supervisor;

use crate::config::AppConfig;
use crate::input::ChannelInputSink;
use crate::mqtt::MqttBridge;
use crate::publish::Publisher;
use crate::supervisor::{ModuleContext, ModuleSupervisor, SignalSet};
use color_eyre::Result;
use std::path::PathBuf;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, Level};
use tracing_subscriber::FmtSubscriber;

const OUTBOUND_CAPACITY: usize = 1000;
const CONTROL_CAPACITY: usize = 100;
const INPUT_CAPACITY: usize = 100;

#[tokio::main]
async fn main() -> Result<()> {
    install_error_hooks()?;

    // Logging needs the verbose flag, so the config is read first
    let dir = AppConfig::resolve_dir(std::env::args_os().nth(1).map(PathBuf::from))?;
    let config = Arc::new(AppConfig::load(&dir).await);
    setup_logging_env(config.system.verbose);
    config.report(&dir);

    let (publisher, outbound_rx) = Publisher::new(OUTBOUND_CAPACITY);
    let signals = Arc::new(SignalSet::new());
    let (control_tx, control_rx) = input::control_channel(CONTROL_CAPACITY);
    let (input_sink, mut input_rx) = ChannelInputSink::new(INPUT_CAPACITY);

    let shutdown = CancellationToken::new();

    // Synthesized input goes to the host injector. Without one it is only logged.
    let _input_handle = tokio::spawn(async move {
        while let Some(action) = input_rx.recv().await {
            debug!("Input action: {:?}", action);
        }
    });

    let mqtt_settings = config.system.mqtt.clone();
    let mqtt_handle = if mqtt_settings.enabled {
        let bridge = MqttBridge::new(mqtt_settings, outbound_rx, signals.clone());
        tokio::spawn(bridge.run(shutdown.clone()))
    } else {
        info!("MQTT disabled, outbound events are only logged");
        tokio::spawn(mqtt::drain(outbound_rx, shutdown.clone()))
    };

    let context = ModuleContext {
        config: config.clone(),
        publisher: publisher.clone(),
        signals: signals.clone(),
        control_tx,
        control_rx,
        input_sink: Arc::new(input_sink),
    };
    let supervisor = ModuleSupervisor::new(
        context,
        config.system.supervisor.clone(),
        signals,
        publisher,
    );

    let ctrl_c = shutdown.clone();
    tokio::spawn(async move {
        match tokio::signal::ctrl_c().await {
            Ok(()) => {
                info!("Ctrl-C received");
                ctrl_c.cancel();
            }
            Err(e) => error!("Unable to listen for Ctrl-C: {}", e),
        }
    });

    supervisor.run(shutdown.clone()).await;
    shutdown.cancel();

    if let Err(e) = mqtt_handle.await {
        error!("MQTT task panicked: {}", e);
    }
    info!("Bye");
    Ok(())
}

fn install_error_hooks() -> Result<()> {
    if std::env::var("RUST_LIB_BACKTRACE").is_err() {
        std::env::set_var("RUST_LIB_BACKTRACE", "0")
    }
    color_eyre::install()?;
    if std::env::var("RUST_LOG").is_err() {
        std::env::set_var("RUST_LOG", "info")
    }
    Ok(())
}

fn setup_logging_env(verbose: bool) {
    let level = if verbose { Level::DEBUG } else { Level::INFO };
    FmtSubscriber::builder()
        .with_max_level(level)
        .with_target(false)
        .with_thread_ids(true)
        .with_file(true)
        .with_line_number(true)
        .pretty()
        .init();
}
