//! A hand-driven remote peer.

use amqp_engine::{
    Engine,
    EngineError,
    codec::{FrameCodec, Performative, RawFrame, Transfer},
    preamble::{AMQP_HEADER, HEADER_LEN},
};
use anyhow::Context as _;
use bytes::{Buf, Bytes, BytesMut};
use tokio_util::codec::Decoder;
use tracing::trace;

use crate::{AnyError, frames};

/// One unit of engine output.
#[derive(Clone, Debug, PartialEq)]
pub enum Received {
    /// The eight protocol header bytes.
    Header([u8; HEADER_LEN]),
    /// An empty keepalive frame.
    Heartbeat,
    /// A performative with its trailing payload.
    Frame {
        /// Channel the frame arrived on.
        channel: u16,
        /// Decoded performative.
        performative: Performative,
        /// Transfer payload; empty for everything else.
        payload: Bytes,
    },
}

impl Received {
    /// The performative, for frames.
    #[must_use]
    pub const fn performative(&self) -> Option<&Performative> {
        match self {
            Self::Frame { performative, .. } => Some(performative),
            Self::Header(_) | Self::Heartbeat => None,
        }
    }
}

/// Scripted remote end: writes frames into an engine and decodes its output.
#[derive(Debug)]
pub struct ScriptedPeer {
    codec: FrameCodec,
    inbound: BytesMut,
    header_seen: bool,
    container_id: String,
}

impl Default for ScriptedPeer {
    fn default() -> Self { Self::new("peer") }
}

impl ScriptedPeer {
    /// A peer that opens as `container_id`.
    #[must_use]
    pub fn new(container_id: &str) -> Self {
        Self {
            codec: FrameCodec::default(),
            inbound: BytesMut::new(),
            header_seen: false,
            container_id: container_id.to_owned(),
        }
    }

    /// Encode `performative` on `channel`.
    #[must_use]
    pub fn frame(channel: u16, performative: &Performative) -> Bytes {
        RawFrame::performative(channel, performative, &[]).to_bytes()
    }

    /// Encode one transfer frame carrying `payload`.
    #[must_use]
    pub fn transfer_frame(channel: u16, transfer: Transfer, payload: &[u8]) -> Bytes {
        RawFrame::performative(channel, &Performative::Transfer(transfer), payload).to_bytes()
    }

    /// Feed the protocol header and this peer's Open.
    ///
    /// # Errors
    /// Returns whatever [`Engine::ingest`] reports.
    pub fn handshake(&self, engine: &mut Engine) -> Result<(), EngineError> {
        let mut bytes = AMQP_HEADER.to_vec();
        bytes.extend_from_slice(&Self::frame(0, &frames::open(&self.container_id)));
        engine.ingest(&bytes)
    }

    /// Feed one performative.
    ///
    /// # Errors
    /// Returns whatever [`Engine::ingest`] reports.
    pub fn send(
        &self,
        engine: &mut Engine,
        channel: u16,
        performative: &Performative,
    ) -> Result<(), EngineError> {
        engine.ingest(&Self::frame(channel, performative))
    }

    /// Feed one transfer frame.
    ///
    /// # Errors
    /// Returns whatever [`Engine::ingest`] reports.
    pub fn send_transfer(
        &self,
        engine: &mut Engine,
        channel: u16,
        transfer: Transfer,
        payload: &[u8],
    ) -> Result<(), EngineError> {
        engine.ingest(&Self::transfer_frame(channel, transfer, payload))
    }

    /// Drain the engine's queued output and decode it.
    ///
    /// # Errors
    /// Fails when the output is not valid AMQP framing.
    pub fn receive(&mut self, engine: &mut Engine) -> Result<Vec<Received>, AnyError> {
        self.decode(engine.take_output())
    }

    /// Drain and decode, keeping only performatives.
    ///
    /// # Errors
    /// As for [`ScriptedPeer::receive`].
    pub fn performatives(&mut self, engine: &mut Engine) -> Result<Vec<Performative>, AnyError> {
        Ok(self
            .receive(engine)?
            .into_iter()
            .filter_map(|received| match received {
                Received::Frame { performative, .. } => Some(performative),
                Received::Header(_) | Received::Heartbeat => None,
            })
            .collect())
    }

    /// Decode raw output chunks, carrying partial frames over to the next
    /// call.
    ///
    /// # Errors
    /// As for [`ScriptedPeer::receive`].
    pub fn decode(&mut self, chunks: Vec<Bytes>) -> Result<Vec<Received>, AnyError> {
        for chunk in chunks {
            self.inbound.extend_from_slice(&chunk);
        }
        let mut received = Vec::new();
        if !self.header_seen {
            let Some(raw) = self.inbound.get(..HEADER_LEN) else {
                return Ok(received);
            };
            let mut header = [0u8; HEADER_LEN];
            header.copy_from_slice(raw);
            self.inbound.advance(HEADER_LEN);
            self.header_seen = true;
            received.push(Received::Header(header));
        }
        while let Some(frame) = self
            .codec
            .decode(&mut self.inbound)
            .context("engine wrote invalid framing")?
        {
            if frame.is_heartbeat() {
                received.push(Received::Heartbeat);
                continue;
            }
            let (performative, payload) = frame
                .decode_body()
                .context("engine wrote an undecodable performative")?;
            trace!(channel = frame.channel, performative = performative.name(), "peer in");
            received.push(Received::Frame {
                channel: frame.channel,
                performative,
                payload,
            });
        }
        Ok(received)
    }
}
