// src/exec/backend.rs

//! Pluggable effect dispatch.
//!
//! The engine hands the effects of every successful write to an
//! `EffectDispatcher` instead of calling webhooks, mailers or metrics
//! directly. This makes it easy to swap in a recording dispatcher in tests.
//!
//! - `LoggingDispatcher` is the default used by the binary. It has nothing
//!   to deliver to, so it logs each effect.
//! - Tests can provide their own `EffectDispatcher` that records what was
//!   dispatched.

use std::future::Future;
use std::pin::Pin;

use tracing::info;

use crate::effects::Effect;
use crate::errors::Result;

/// Trait abstracting how effects leave the engine.
pub trait EffectDispatcher: Send + Sync {
    /// Deliver effects produced by one write, in order.
    fn dispatch(
        &self,
        effects: Vec<Effect>,
    ) -> Pin<Box<dyn Future<Output = Result<()>> + Send + '_>>;
}

/// Logs every effect at `info` level.
#[derive(Debug, Default, Clone, Copy)]
pub struct LoggingDispatcher;

impl EffectDispatcher for LoggingDispatcher {
    fn dispatch(
        &self,
        effects: Vec<Effect>,
    ) -> Pin<Box<dyn Future<Output = Result<()>> + Send + '_>> {
        Box::pin(async move {
            for effect in effects {
                info!(effect = effect.kind(), ?effect, "effect");
            }
            Ok(())
        })
    }
}
