//! Orchestration facade over the engine.
//!
//! The `fire_*` entry points mirror the steps the engine takes itself while
//! starting. Only reads may be injected from outside once it has started.

use super::{Engine, EngineState};
use crate::error::{EngineError, EngineFailure, Result};

/// Borrowed handle returned by [`Engine::pipeline`].
#[derive(Debug)]
pub struct Pipeline<'a> {
    engine: &'a mut Engine,
}

impl Engine {
    /// Access the engine's pipeline.
    ///
    /// # Errors
    /// Returns [`EngineError::Shutdown`] after shutdown.
    pub fn pipeline(&mut self) -> Result<Pipeline<'_>> {
        if matches!(self.state, EngineState::Shutdown) {
            return Err(EngineError::Shutdown);
        }
        Ok(Pipeline { engine: self })
    }
}

impl Pipeline<'_> {
    /// Inject bytes read from the peer, as [`Engine::ingest`].
    ///
    /// # Errors
    /// As for [`Engine::ingest`].
    pub fn fire_read(&mut self, bytes: &[u8]) -> Result<()> { self.engine.ingest(bytes) }

    /// Signal that the engine is starting.
    ///
    /// # Errors
    /// Returns [`EngineError::InvalidOperation`] once the engine is past
    /// starting.
    pub fn fire_engine_starting(&mut self) -> Result<()> {
        self.ensure_orchestrating("engine starting")?;
        self.engine.start().map(|_| ())
    }

    /// Signal an engine state change.
    ///
    /// # Errors
    /// As for [`Pipeline::fire_engine_starting`].
    pub fn fire_engine_state_changed(&mut self) -> Result<()> {
        self.ensure_orchestrating("engine state changed")
    }

    /// Fail the engine with `cause`.
    ///
    /// # Errors
    /// As for [`Pipeline::fire_engine_starting`].
    pub fn fire_failed(&mut self, cause: impl Into<String>) -> Result<EngineFailure> {
        self.ensure_orchestrating("engine failed")?;
        Ok(self.engine.engine_failed(cause))
    }

    fn ensure_orchestrating(&self, signal: &str) -> Result<()> {
        match self.engine.state {
            EngineState::Idle | EngineState::Starting => Ok(()),
            EngineState::Started | EngineState::Failed | EngineState::Shutdown => {
                Err(EngineError::invalid_op(format!(
                    "{signal} is reserved for the engine once it has started"
                )))
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use rstest::rstest;

    use super::*;

    #[test]
    fn orchestration_is_rejected_after_start() {
        let mut engine = Engine::default();
        assert!(engine.pipeline().and_then(|mut p| p.fire_engine_starting()).is_ok());
        assert_eq!(engine.state(), EngineState::Started);
        let mut pipeline = engine.pipeline().unwrap();
        assert!(matches!(
            pipeline.fire_engine_state_changed(),
            Err(EngineError::InvalidOperation(_))
        ));
        assert!(matches!(pipeline.fire_failed("x"), Err(EngineError::InvalidOperation(_))));
        assert!(matches!(pipeline.fire_engine_starting(), Err(EngineError::InvalidOperation(_))));
    }

    #[rstest]
    #[case(false)]
    #[case(true)]
    fn accessor_fails_after_shutdown(#[case] started: bool) {
        let mut engine = Engine::default();
        if started {
            engine.start().unwrap();
        }
        engine.shutdown();
        assert!(matches!(engine.pipeline(), Err(EngineError::Shutdown)));
    }

    #[test]
    fn reads_before_start_are_refused() {
        let mut engine = Engine::default();
        let mut pipeline = engine.pipeline().unwrap();
        assert!(matches!(pipeline.fire_read(b"AMQP"), Err(EngineError::NotStarted)));
    }

    #[test]
    fn failure_can_be_injected_before_start() {
        let mut engine = Engine::default();
        let failure = engine.pipeline().unwrap().fire_failed("boom").unwrap();
        assert!(matches!(failure, EngineFailure::Injected(ref cause) if cause == "boom"));
        assert_eq!(engine.state(), EngineState::Failed);
    }
}
