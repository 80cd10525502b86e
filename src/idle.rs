//! Idle-timeout deadline tracking.
//!
//! Times are opaque `i64` instants in the caller's monotonic unit
//! (milliseconds). The clock may wrap through the whole signed range, so
//! deadlines are only ever compared by the sign of a wrapping difference.

/// What a tick decided.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub(crate) struct TickOutcome {
    /// Next instant the caller should tick at; 0 when no timeout is active.
    pub deadline: i64,
    /// No frame arrived within the local idle timeout.
    pub local_expired: bool,
    /// Nothing was written within half the peer's idle timeout.
    pub send_heartbeat: bool,
}

/// Deadline state for both directions of one connection.
#[derive(Clone, Debug, Default)]
pub(crate) struct IdleTimer {
    local_timeout: u32,
    remote_timeout: u32,
    local_deadline: i64,
    remote_deadline: i64,
    last_frames_read: u64,
    last_frames_written: u64,
}

/// `now + timeout`, wrapping, with 0 reserved for "no deadline".
#[must_use]
pub const fn compute_deadline(now: i64, timeout: u32) -> i64 {
    let deadline = now.wrapping_add(timeout as i64);
    if deadline == 0 { 1 } else { deadline }
}

/// Return `true` when `deadline` is at or before `now`.
#[must_use]
pub const fn is_expired(deadline: i64, now: i64) -> bool { deadline.wrapping_sub(now) <= 0 }

/// The earlier of two deadlines, ignoring zero.
#[must_use]
pub const fn nearer(a: i64, b: i64) -> i64 {
    if a == 0 {
        b
    } else if b == 0 || a.wrapping_sub(b) < 0 {
        a
    } else {
        b
    }
}

impl IdleTimer {
    /// Local idle timeout in milliseconds.
    pub(crate) const fn set_local_timeout(&mut self, timeout: u32) { self.local_timeout = timeout; }

    /// Store the peer's advertised idle timeout, halved for slack.
    pub(crate) const fn set_remote_timeout(&mut self, advertised: u32) {
        self.remote_timeout = advertised >> 1;
    }

    pub(crate) const fn remote_timeout(&self) -> u32 { self.remote_timeout }

    /// Advance the timer to `now` given the engine's frame counters.
    ///
    /// Heartbeats must not be counted in `frames_written`.
    pub(crate) fn tick(&mut self, now: i64, frames_read: u64, frames_written: u64) -> TickOutcome {
        let mut outcome = TickOutcome::default();

        if self.local_timeout > 0 {
            if self.local_deadline == 0 || self.last_frames_read != frames_read {
                self.local_deadline = compute_deadline(now, self.local_timeout);
                self.last_frames_read = frames_read;
            } else if is_expired(self.local_deadline, now) {
                self.local_deadline = compute_deadline(now, self.local_timeout);
                outcome.local_expired = true;
            }
            outcome.deadline = self.local_deadline;
        }

        if self.remote_timeout > 0 {
            if self.remote_deadline == 0 || self.last_frames_written != frames_written {
                self.remote_deadline = compute_deadline(now, self.remote_timeout);
                self.last_frames_written = frames_written;
            } else if is_expired(self.remote_deadline, now) {
                self.remote_deadline = compute_deadline(now, self.remote_timeout);
                outcome.send_heartbeat = true;
            }
            outcome.deadline = nearer(outcome.deadline, self.remote_deadline);
        }

        outcome
    }
}
