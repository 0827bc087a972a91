//! Module supervisor
//!
//! Owns the lifecycle of every worker. Workers are plain tokio tasks with a
//! [`CancellationToken`]; everything else talks to the supervisor through the
//! [`SignalSet`], which is polled on a short fixed tick.
//!
//! ```text
//! MQTT commands ──► SignalSet ◄── long press (DisplayToggle)
//!                       │
//!                  tick │ take()
//!                       ▼
//!               ModuleSupervisor ──start/stop──► can | lin | most | input | ignition
//!                       │
//!                       └──► Publisher (<module>/state, display)
//! ```
//!
//! Stopping is cooperative. A worker that does not finish inside the grace period is
//! reported stopped and parked as draining; the module cannot start again until it
//! has actually finished, so there is never more than one live worker per module.

pub mod signals;

pub use signals::{Signal, SignalSet};

use crate::config::{AppConfig, SupervisorSettings};
use crate::input::{self, ControlReceiver, ControlSignal, InputSink, InputStateMachine};
use crate::publish::{Publisher, StatusEvent};
use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;
use std::sync::Arc;
use std::time::Instant;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum ModuleKind {
    Can,
    Lin,
    Most,
    Input,
    Ignition,
}

impl ModuleKind {
    pub const ALL: [ModuleKind; 5] = [
        ModuleKind::Can,
        ModuleKind::Lin,
        ModuleKind::Most,
        ModuleKind::Input,
        ModuleKind::Ignition,
    ];

    pub fn name(&self) -> &'static str {
        match self {
            ModuleKind::Can => "can",
            ModuleKind::Lin => "lin",
            ModuleKind::Most => "most",
            ModuleKind::Input => "input",
            ModuleKind::Ignition => "ign",
        }
    }

    pub fn toggle_signal(&self) -> Signal {
        match self {
            ModuleKind::Can => Signal::ToggleCan,
            ModuleKind::Lin => Signal::ToggleLin,
            ModuleKind::Most => Signal::ToggleMost,
            ModuleKind::Input => Signal::ToggleInput,
            ModuleKind::Ignition => Signal::ToggleIgnition,
        }
    }
}

impl fmt::Display for ModuleKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

impl FromStr for ModuleKind {
    type Err = SupervisorError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        ModuleKind::ALL
            .iter()
            .copied()
            .find(|kind| kind.name() == s)
            .ok_or_else(|| SupervisorError::UnknownModule(s.to_string()))
    }
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum SupervisorError {
    #[error("Unknown module: {0}")]
    UnknownModule(String),

    #[error("Module {0} is already running")]
    AlreadyRunning(ModuleKind),

    #[error("Module {0} is still shutting down")]
    StillDraining(ModuleKind),

    #[error("Module {0} has no configuration")]
    NotConfigured(ModuleKind),
}

/// Starts the worker of one module
pub trait ModuleLauncher: Send + Sync {
    fn launch(
        &self,
        kind: ModuleKind,
        token: CancellationToken,
    ) -> Result<JoinHandle<()>, SupervisorError>;
}

/// Dependencies handed to every worker at construction
#[derive(Clone)]
pub struct ModuleContext {
    pub config: Arc<AppConfig>,
    pub publisher: Publisher,
    pub signals: Arc<SignalSet>,
    pub control_tx: mpsc::Sender<ControlSignal>,
    pub control_rx: ControlReceiver,
    pub input_sink: Arc<dyn InputSink>,
}

impl ModuleLauncher for ModuleContext {
    fn launch(
        &self,
        kind: ModuleKind,
        token: CancellationToken,
    ) -> Result<JoinHandle<()>, SupervisorError> {
        let publisher = self.publisher.clone();
        let handle = match kind {
            ModuleKind::Can => {
                let settings = self.config.can.clone().ok_or(SupervisorError::NotConfigured(kind))?;
                tokio::spawn(crate::can::run(settings, publisher, self.control_tx.clone(), token))
            }
            ModuleKind::Lin => {
                let settings = self.config.lin.clone().ok_or(SupervisorError::NotConfigured(kind))?;
                tokio::spawn(crate::lin::run(settings, publisher, self.control_tx.clone(), token))
            }
            ModuleKind::Most => {
                let settings = self.config.most.clone().ok_or(SupervisorError::NotConfigured(kind))?;
                tokio::spawn(crate::most::run(settings, publisher, self.signals.clone(), token))
            }
            ModuleKind::Input => {
                let machine = InputStateMachine::new(
                    &self.config.input_timing(),
                    self.signals.clone(),
                    self.input_sink.clone(),
                );
                tokio::spawn(input::run(self.control_rx.clone(), machine, token))
            }
            ModuleKind::Ignition => {
                let settings = self.config.system.ignition.clone();
                if !settings.enabled {
                    return Err(SupervisorError::NotConfigured(kind));
                }
                tokio::spawn(crate::ignition::run(
                    settings,
                    publisher,
                    self.signals.clone(),
                    token,
                ))
            }
        };
        Ok(handle)
    }
}

/// A started worker
#[derive(Debug)]
pub struct ModuleHandle {
    token: CancellationToken,
    task: JoinHandle<()>,
    started: Instant,
}

impl ModuleHandle {
    pub fn is_alive(&self) -> bool {
        !self.task.is_finished()
    }
}

pub struct ModuleSupervisor<L: ModuleLauncher> {
    launcher: L,
    settings: SupervisorSettings,
    signals: Arc<SignalSet>,
    publisher: Publisher,
    modules: BTreeMap<ModuleKind, ModuleHandle>,
    draining: BTreeMap<ModuleKind, JoinHandle<()>>,
    reported: BTreeMap<ModuleKind, bool>,
    display_on: bool,
}

impl<L: ModuleLauncher> ModuleSupervisor<L> {
    pub fn new(
        launcher: L,
        settings: SupervisorSettings,
        signals: Arc<SignalSet>,
        publisher: Publisher,
    ) -> Self {
        Self {
            launcher,
            settings,
            signals,
            publisher,
            modules: BTreeMap::new(),
            draining: BTreeMap::new(),
            reported: BTreeMap::new(),
            display_on: true,
        }
    }

    pub fn is_alive(&self, kind: ModuleKind) -> bool {
        self.modules.get(&kind).is_some_and(ModuleHandle::is_alive)
    }

    pub fn is_draining(&self, kind: ModuleKind) -> bool {
        self.draining.get(&kind).is_some_and(|task| !task.is_finished())
    }

    pub fn display_on(&self) -> bool {
        self.display_on
    }

    pub fn start(&mut self, kind: ModuleKind) -> Result<(), SupervisorError> {
        if let Some(task) = self.draining.get(&kind) {
            if !task.is_finished() {
                return Err(SupervisorError::StillDraining(kind));
            }
            self.draining.remove(&kind);
        }
        if self.is_alive(kind) {
            return Err(SupervisorError::AlreadyRunning(kind));
        }
        // A worker that ended on its own leaves a finished handle behind
        self.modules.remove(&kind);

        let token = CancellationToken::new();
        let task = self.launcher.launch(kind, token.clone())?;
        self.modules.insert(
            kind,
            ModuleHandle {
                token,
                task,
                started: Instant::now(),
            },
        );
        info!("Module {} started", kind);
        self.report(kind, true);
        Ok(())
    }

    /// Cancels the worker and waits at most the grace period for it
    pub async fn stop(&mut self, kind: ModuleKind) {
        let Some(mut handle) = self.modules.remove(&kind) else {
            debug!("Module {} is not running", kind);
            return;
        };

        handle.token.cancel();
        match tokio::time::timeout(self.settings.grace(), &mut handle.task).await {
            Ok(Ok(())) => info!("Module {} stopped", kind),
            Ok(Err(e)) => error!("Module {} ended abnormally: {}", kind, e),
            Err(_) => {
                warn!(
                    "Module {} did not stop within {:?}, left draining",
                    kind,
                    self.settings.grace()
                );
                self.draining.insert(kind, handle.task);
            }
        }
        self.report(kind, false);
    }

    pub async fn toggle(&mut self, kind: ModuleKind) {
        if self.is_alive(kind) {
            self.stop(kind).await;
        } else if let Err(e) = self.start(kind) {
            warn!("Cannot start {}: {}", kind, e);
        }
    }

    /// Starts every module that has a configuration
    pub fn start_all(&mut self) {
        for kind in ModuleKind::ALL {
            match self.start(kind) {
                Ok(()) => {}
                Err(SupervisorError::NotConfigured(_)) => debug!("Module {} not configured", kind),
                Err(e) => warn!("Cannot start {}: {}", kind, e),
            }
        }
    }

    pub async fn stop_all(&mut self) {
        for kind in ModuleKind::ALL {
            self.stop(kind).await;
        }
    }

    pub async fn restart(&mut self) {
        info!("Restarting all modules");
        self.stop_all().await;
        self.start_all();
    }

    /// Consumes raised signals. Returns `false` once an exit was requested.
    pub async fn poll_signals(&mut self) -> bool {
        if self.signals.take(Signal::Exit) {
            info!("Exit requested");
            return false;
        }
        if self.signals.take(Signal::Restart) {
            self.restart().await;
        }
        for kind in ModuleKind::ALL {
            if self.signals.take(kind.toggle_signal()) {
                self.toggle(kind).await;
            }
        }
        if self.signals.take(Signal::DisplayToggle) {
            self.display_on = !self.display_on;
            info!("Display {}", if self.display_on { "on" } else { "off" });
            self.publisher.status(StatusEvent::Display {
                on: self.display_on,
            });
        }
        if self.signals.take(Signal::StatusQuery) {
            for kind in ModuleKind::ALL {
                self.report(kind, self.is_alive(kind));
            }
        }

        // Workers may end on their own
        for kind in ModuleKind::ALL {
            let alive = self.is_alive(kind);
            if self.reported.get(&kind).copied().unwrap_or(false) != alive {
                self.report(kind, alive);
            }
        }
        true
    }

    fn report(&mut self, kind: ModuleKind, alive: bool) {
        self.reported.insert(kind, alive);
        self.publisher.status(StatusEvent::ModuleState {
            module: kind.name().to_string(),
            alive,
        });
    }

    fn log_table(&self) {
        for kind in ModuleKind::ALL {
            let state = match self.modules.get(&kind) {
                Some(handle) if handle.is_alive() => {
                    format!("running for {:?}", handle.started.elapsed())
                }
                Some(handle) => format!("ended after {:?}", handle.started.elapsed()),
                None if self.is_draining(kind) => "draining".to_string(),
                None => "stopped".to_string(),
            };
            debug!("{:>6}: {}", kind, state);
        }
    }

    /// Starts all modules and supervises them until exit or `shutdown`
    pub async fn run(mut self, shutdown: CancellationToken) {
        self.start_all();

        let mut tick = tokio::time::interval(self.settings.tick());
        tick.set_missed_tick_behavior(MissedTickBehavior::Skip);
        let mut status = tokio::time::interval(self.settings.status_period());
        status.set_missed_tick_behavior(MissedTickBehavior::Skip);

        loop {
            tokio::select! {
                _ = shutdown.cancelled() => {
                    info!("Shutdown requested");
                    break;
                }
                _ = tick.tick() => {
                    if !self.poll_signals().await {
                        shutdown.cancel();
                        break;
                    }
                }
                _ = status.tick() => self.log_table(),
            }
        }

        self.stop_all().await;
        info!("All modules stopped");
    }
}
