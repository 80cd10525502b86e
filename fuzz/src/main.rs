//! AFL harness feeding arbitrary bytes to an engine with an open connection.
//!
//! Errors from `ingest` are expected; only panics count as findings.

use std::io::{self, Read};

use amqp_engine::{Engine, EngineConfig, config::DEFAULT_MAX_FRAME_SIZE};

unsafe extern "C" {
    fn __AFL_LOOP(cnt: u32) -> i32;
}

/// Feed `data` in two chunks so frames straddling reads are exercised.
fn exercise(data: &[u8]) {
    let mut engine = Engine::new(EngineConfig::default().with_container_id("fuzz"));
    if engine.start().is_err() || engine.open_connection().is_err() {
        return;
    }
    let (head, tail) = data.split_at(data.len().div_ceil(2));
    if engine.ingest(head).is_ok() && engine.ingest(tail).is_ok() {
        drop(engine.take_output());
    }
}

fn main() {
    let limit = u64::from(DEFAULT_MAX_FRAME_SIZE) * 4;
    let mut data = Vec::new();
    loop {
        // SAFETY: provided by the AFL runtime linked in through the `afl` crate.
        if unsafe { __AFL_LOOP(1000) } == 0 {
            break;
        }
        data.clear();
        if io::stdin().take(limit).read_to_end(&mut data).is_err() {
            return;
        }
        exercise(&data);
    }
}
