//! Two engines connected back to back.

use amqp_engine::{Engine, EngineConfig, EngineError};

/// A client and a server engine whose output feeds the other's input.
#[derive(Debug)]
pub struct Loopback {
    /// The end that opens first in most tests.
    pub client: Engine,
    /// The answering end.
    pub server: Engine,
}

impl Loopback {
    /// Start both engines with the default configuration under distinct
    /// container ids.
    ///
    /// # Errors
    /// Returns any error from starting either engine.
    pub fn new() -> Result<Self, EngineError> {
        Self::with_configs(
            EngineConfig::default().with_container_id("client"),
            EngineConfig::default().with_container_id("server"),
        )
    }

    /// Start both engines with explicit configurations.
    ///
    /// # Errors
    /// Returns any error from starting either engine.
    pub fn with_configs(
        client_config: EngineConfig,
        server_config: EngineConfig,
    ) -> Result<Self, EngineError> {
        let mut client = Engine::new(client_config);
        let mut server = Engine::new(server_config);
        client.start()?;
        server.start()?;
        Ok(Self { client, server })
    }

    /// Shuttle output in both directions until neither side has anything
    /// left to say. Returns the number of chunks moved.
    ///
    /// # Errors
    /// Returns the first ingest failure.
    pub fn pump(&mut self) -> Result<usize, EngineError> {
        let mut moved = 0;
        loop {
            let to_server = self.client.take_output();
            let to_client = self.server.take_output();
            if to_server.is_empty() && to_client.is_empty() {
                return Ok(moved);
            }
            moved += to_server.len() + to_client.len();
            for chunk in to_server {
                self.server.ingest(&chunk)?;
            }
            for chunk in to_client {
                self.client.ingest(&chunk)?;
            }
        }
    }
}
