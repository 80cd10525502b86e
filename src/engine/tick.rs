//! Idle-timeout driving.
//!
//! Either the caller ticks the engine with its own clock ([`Engine::tick`])
//! or hands over a [`TickScheduler`] ([`Engine::tick_auto`]) that the engine
//! asks for the time and for the next wake-up. One engine uses one mode for
//! its whole life.

use super::{Engine, TickMode};
use crate::{
    codec::{ErrorCondition, condition},
    endpoint::EndpointState,
    error::{EngineError, EngineFailure, Result},
};

/// Clock and timer used by [`Engine::tick_auto`].
pub trait TickScheduler {
    /// Current instant in the caller's monotonic unit (milliseconds). May
    /// wrap through the whole `i64` range.
    fn now(&mut self) -> i64;

    /// Call [`Engine::scheduled_tick`] after `delay`.
    fn schedule_tick(&mut self, delay: i64);
}

impl Engine {
    /// Check idle timeouts at `now` and return the next deadline, or 0 when
    /// no timeout is active. Sends a heartbeat when one is due. Calling
    /// again with the same `now` returns the same deadline and writes
    /// nothing.
    ///
    /// # Errors
    /// Returns [`EngineError::InvalidOperation`] when the connection is not
    /// locally open or [`Engine::tick_auto`] is in use, and
    /// [`EngineError::Failed`] with [`EngineFailure::IdleTimeout`] when
    /// nothing arrived within the local idle timeout.
    pub fn tick(&mut self, now: i64) -> Result<i64> {
        self.ensure_running()?;
        self.ensure_locally_open()?;
        self.claim_tick_mode(TickMode::Manual)?;
        self.run(|engine| engine.tick_at(now))
    }

    /// Let `scheduler` drive idle timeouts from now on.
    ///
    /// # Errors
    /// As for [`Engine::tick`], with [`EngineError::InvalidOperation`] when
    /// manual ticking is in use.
    pub fn tick_auto(&mut self, scheduler: impl TickScheduler + 'static) -> Result<()> {
        self.ensure_running()?;
        self.ensure_locally_open()?;
        self.claim_tick_mode(TickMode::Auto)?;
        self.scheduler = Some(Box::new(scheduler));
        self.scheduled_tick()
    }

    /// Run the tick a [`TickScheduler`] was asked to schedule, and schedule
    /// the next one.
    ///
    /// # Errors
    /// Returns [`EngineError::InvalidOperation`] unless [`Engine::tick_auto`]
    /// is in use, otherwise as for [`Engine::tick`].
    pub fn scheduled_tick(&mut self) -> Result<()> {
        if self.tick_mode != Some(TickMode::Auto) {
            return Err(EngineError::invalid_op("no tick scheduler is installed"));
        }
        let Some(now) = self.scheduler.as_mut().map(|s| s.now()) else {
            return Err(EngineError::invalid_op("no tick scheduler is installed"));
        };
        let deadline = self.run(|engine| engine.tick_at(now))?;
        if deadline == 0 {
            self.scheduled_deadline = None;
            return Ok(());
        }
        self.scheduled_deadline = Some(deadline);
        if let Some(scheduler) = self.scheduler.as_mut() {
            scheduler.schedule_tick(deadline.wrapping_sub(now));
        }
        Ok(())
    }

    /// Deadline of the tick most recently scheduled through
    /// [`TickScheduler::schedule_tick`].
    #[must_use]
    pub const fn scheduled_deadline(&self) -> Option<i64> { self.scheduled_deadline }

    fn claim_tick_mode(&mut self, mode: TickMode) -> Result<()> {
        match self.tick_mode {
            None => {
                self.tick_mode = Some(mode);
                Ok(())
            }
            Some(current) if current == mode => Ok(()),
            Some(TickMode::Manual) => Err(EngineError::invalid_op(
                "the engine is already ticked manually",
            )),
            Some(TickMode::Auto) => Err(EngineError::invalid_op(
                "the engine is already ticked by a scheduler",
            )),
        }
    }

    fn ensure_locally_open(&self) -> Result<()> {
        if matches!(self.connection.local_state, EndpointState::Active) {
            Ok(())
        } else {
            Err(EngineError::invalid_op(
                "idle timeouts are only checked on a locally open connection",
            ))
        }
    }

    fn tick_at(&mut self, now: i64) -> Result<i64> {
        self.ensure_running()?;
        self.ensure_locally_open()?;
        let outcome = self.idle.tick(now, self.frames_read, self.frames_written);
        if outcome.local_expired {
            self.close_on_failure(ErrorCondition::new(
                condition::RESOURCE_LIMIT_EXCEEDED,
                "local-idle-timeout expired",
            ));
            return Err(self.failed(EngineFailure::IdleTimeout));
        }
        if outcome.send_heartbeat && !self.connection.close_sent {
            self.send_heartbeat()?;
        }
        Ok(outcome.deadline)
    }
}
