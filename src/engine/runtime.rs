// src/engine/runtime.rs

use std::fmt;
use std::sync::Arc;

use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use crate::errors::Result;

use super::service::Engine;
use super::{EngineEvent, RuntimeOptions};

/// Drives the engine in response to `EngineEvent`s.
///
/// This is a thin IO shell around [`Engine`], which contains all the
/// pipeline semantics. A failing event is logged and the loop carries on:
/// one bad runner report must not stop every other pipeline.
pub struct Runtime {
    engine: Arc<Engine>,
    event_rx: mpsc::Receiver<EngineEvent>,
    options: RuntimeOptions,
}

impl fmt::Debug for Runtime {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Runtime")
            .field("engine", &self.engine)
            .field("options", &self.options)
            .finish_non_exhaustive()
    }
}

impl Runtime {
    pub fn new(
        engine: Arc<Engine>,
        event_rx: mpsc::Receiver<EngineEvent>,
        options: RuntimeOptions,
    ) -> Self {
        Self {
            engine,
            event_rx,
            options,
        }
    }

    fn should_exit(&self) -> bool {
        self.options.exit_when_idle && self.engine.is_settled()
    }

    /// Main event loop.
    ///
    /// - Consumes `EngineEvent`s from `event_rx`.
    /// - Feeds them into the engine.
    /// - Stops on shutdown, when the channel closes, or (with
    ///   `exit_when_idle`) once every pipeline has settled.
    pub async fn run(mut self) -> Result<()> {
        info!("pipeline engine runtime started");

        if self.should_exit() {
            info!("nothing to do; exiting");
            return Ok(());
        }

        loop {
            let event = match self.event_rx.recv().await {
                Some(e) => e,
                None => {
                    info!("runtime event channel closed; exiting");
                    break;
                }
            };

            debug!(?event, "runtime received event");

            if matches!(event, EngineEvent::ShutdownRequested) {
                info!("shutdown requested; stopping runtime");
                break;
            }

            if let Err(err) = self.engine.handle(event).await {
                warn!(error = %err, "event handling failed");
            }

            if self.should_exit() {
                info!("all pipelines settled; stopping runtime");
                break;
            }
        }

        info!("runtime exiting");
        Ok(())
    }
}
