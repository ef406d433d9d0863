//! Prediction worker: a dedicated thread that owns the engine.
//!
//! Hosts send commands over a bounded crossbeam channel and receive fresh
//! prediction lists on an unbounded one. Every mutation of learned state is
//! serialized through the one thread, so the engine itself never locks.
//! Back-to-back recompute requests collapse into one pass over the latest
//! context, and state is persisted whenever the command queue drains.

use crate::engine::PredictionEngine;
use crate::error::PredictError;
use crate::extractors::PrunePattern;
use crate::types::{AppIdentifier, Event, PredictionCandidate, PredictionContext};
use chrono::{DateTime, Utc};
use crossbeam_channel::{bounded, unbounded, Receiver, Sender};
use std::thread::{self, JoinHandle};
use tracing::{debug, info, warn};

/// Capacity of the command channel
pub const COMMAND_CAPACITY: usize = 1024;

/// Work for the prediction thread
#[derive(Debug)]
pub enum Command {
    AppLaunched(Event),
    Recompute(PredictionContext),
    PackageChanged { package: String, profile: u32 },
    PackageRemoved { package: String, profile: u32 },
    ActivityStateChanged { app: AppIdentifier, enabled: bool },
    SetHidden { app: AppIdentifier, hidden: bool },
    WorkspaceChanged(DateTime<Utc>),
    Prune(Vec<PrunePattern>),
    /// Persist now and acknowledge with the save result
    Flush(Sender<Result<bool, String>>),
    Shutdown,
}

/// A recomputed prediction list
#[derive(Debug, Clone, PartialEq)]
pub struct PredictionUpdate {
    pub computed_at: DateTime<Utc>,
    pub candidates: Vec<PredictionCandidate>,
}

/// Handle to the prediction thread
pub struct PredictionWorker {
    commands: Sender<Command>,
    updates: Receiver<PredictionUpdate>,
    handle: Option<JoinHandle<PredictionEngine>>,
}

impl PredictionWorker {
    /// Move the engine onto its own thread
    pub fn spawn(engine: PredictionEngine) -> Result<Self, PredictError> {
        let (commands, inbox) = bounded(COMMAND_CAPACITY);
        let (outbox, updates) = unbounded();
        let handle = thread::Builder::new()
            .name("launch-predictor".to_string())
            .spawn(move || run(engine, inbox, outbox))?;
        Ok(Self {
            commands,
            updates,
            handle: Some(handle),
        })
    }

    fn send(&self, command: Command) -> Result<(), PredictError> {
        self.commands
            .send(command)
            .map_err(|_| PredictError::WorkerStopped)
    }

    pub fn app_launched(&self, event: Event) -> Result<(), PredictError> {
        self.send(Command::AppLaunched(event))
    }

    pub fn recompute(&self, context: PredictionContext) -> Result<(), PredictError> {
        self.send(Command::Recompute(context))
    }

    pub fn package_changed(&self, package: impl Into<String>, profile: u32) -> Result<(), PredictError> {
        self.send(Command::PackageChanged {
            package: package.into(),
            profile,
        })
    }

    pub fn package_removed(&self, package: impl Into<String>, profile: u32) -> Result<(), PredictError> {
        self.send(Command::PackageRemoved {
            package: package.into(),
            profile,
        })
    }

    pub fn activity_state_changed(&self, app: AppIdentifier, enabled: bool) -> Result<(), PredictError> {
        self.send(Command::ActivityStateChanged { app, enabled })
    }

    /// Hide `app` from predictions, or show it again
    pub fn set_hidden(&self, app: AppIdentifier, hidden: bool) -> Result<(), PredictError> {
        self.send(Command::SetHidden { app, hidden })
    }

    pub fn workspace_changed(&self, now: DateTime<Utc>) -> Result<(), PredictError> {
        self.send(Command::WorkspaceChanged(now))
    }

    pub fn prune(&self, path: Vec<PrunePattern>) -> Result<(), PredictError> {
        self.send(Command::Prune(path))
    }

    /// Block until every earlier command is processed and state is saved
    pub fn flush(&self) -> Result<bool, PredictError> {
        let (reply, ack) = bounded(1);
        self.send(Command::Flush(reply))?;
        ack.recv()
            .map_err(|_| PredictError::WorkerStopped)?
            .map_err(PredictError::Storage)
    }

    /// Prediction lists published by the worker
    pub fn updates(&self) -> &Receiver<PredictionUpdate> {
        &self.updates
    }

    /// Stop the thread after the queued commands and hand the engine back
    pub fn shutdown(mut self) -> Result<PredictionEngine, PredictError> {
        // A closed channel means the thread is already gone; join reports it
        let _ = self.commands.send(Command::Shutdown);
        match self.handle.take() {
            Some(handle) => handle.join().map_err(|_| PredictError::WorkerStopped),
            None => Err(PredictError::WorkerStopped),
        }
    }
}

impl Drop for PredictionWorker {
    fn drop(&mut self) {
        if let Some(handle) = self.handle.take() {
            let _ = self.commands.send(Command::Shutdown);
            let _ = handle.join();
        }
    }
}

impl std::fmt::Debug for PredictionWorker {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PredictionWorker")
            .field("queued", &self.commands.len())
            .field("running", &self.handle.is_some())
            .finish()
    }
}

fn run(
    mut engine: PredictionEngine,
    inbox: Receiver<Command>,
    outbox: Sender<PredictionUpdate>,
) -> PredictionEngine {
    info!("prediction worker started");
    let mut pending: Option<Command> = None;

    loop {
        let command = match pending.take() {
            Some(command) => command,
            None => match inbox.recv() {
                Ok(command) => command,
                Err(_) => break,
            },
        };

        match command {
            Command::Recompute(mut context) => {
                // Only the newest of consecutive recompute requests matters
                while let Ok(next) = inbox.try_recv() {
                    match next {
                        Command::Recompute(newer) => context = newer,
                        other => {
                            pending = Some(other);
                            break;
                        }
                    }
                }
                let candidates = engine.predict(&context);
                if outbox
                    .send(PredictionUpdate {
                        computed_at: context.now,
                        candidates,
                    })
                    .is_err()
                {
                    debug!("no listener for prediction updates");
                }
            }
            Command::AppLaunched(event) => engine.on_app_launched(&event),
            Command::PackageChanged { package, profile } => {
                engine.on_package_changed(&package, profile)
            }
            Command::PackageRemoved { package, profile } => {
                engine.on_package_removed(&package, profile);
            }
            Command::ActivityStateChanged { app, enabled } => {
                engine.on_activity_state_changed(&app, enabled)
            }
            Command::SetHidden { app, hidden } => {
                engine.set_hidden(&app, hidden);
            }
            Command::WorkspaceChanged(now) => {
                engine.on_workspace_changed(now);
            }
            Command::Prune(path) => {
                engine.prune(&path);
            }
            Command::Flush(reply) => {
                let result = engine.save().map_err(|e| e.to_string());
                let _ = reply.send(result);
                continue;
            }
            Command::Shutdown => break,
        }

        if pending.is_none() && inbox.is_empty() {
            save(&mut engine);
        }
    }

    save(&mut engine);
    info!("prediction worker stopped");
    engine
}

fn save(engine: &mut PredictionEngine) {
    if let Err(e) = engine.save() {
        warn!(error = %e, "failed to persist prediction state");
    }
}
