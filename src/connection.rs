//! Connection state, negotiated limits and channel allocation.

use std::collections::{BTreeMap, HashMap};

use crate::{
    codec::{ErrorCondition, Fields, Open, Symbol, frame::MIN_MAX_FRAME_SIZE},
    config::EngineConfig,
    endpoint::{EndpointState, SessionId},
    error::{EngineError, Result},
};

/// The engine's single AMQP connection.
#[derive(Debug)]
pub struct Connection {
    pub(crate) local_state: EndpointState,
    pub(crate) remote_state: EndpointState,
    pub(crate) header_sent: bool,
    pub(crate) header_received: bool,
    pub(crate) open_sent: bool,
    pub(crate) close_sent: bool,
    pub(crate) container_id: String,
    pub(crate) hostname: Option<String>,
    pub(crate) max_frame_size: u32,
    pub(crate) channel_max: u16,
    pub(crate) idle_timeout: u32,
    pub(crate) offered_capabilities: Option<Vec<Symbol>>,
    pub(crate) desired_capabilities: Option<Vec<Symbol>>,
    pub(crate) properties: Option<Fields>,
    pub(crate) local_error: Option<ErrorCondition>,
    pub(crate) remote: Option<Open>,
    pub(crate) remote_error: Option<ErrorCondition>,
    pub(crate) local_channels: BTreeMap<u16, SessionId>,
    pub(crate) zombie_channels: BTreeMap<u16, SessionId>,
    pub(crate) remote_channels: HashMap<u16, SessionId>,
}

impl Connection {
    pub(crate) fn new(config: &EngineConfig) -> Self {
        Self {
            local_state: EndpointState::Idle,
            remote_state: EndpointState::Idle,
            header_sent: false,
            header_received: false,
            open_sent: false,
            close_sent: false,
            container_id: config.container_id.clone(),
            hostname: config.hostname.clone(),
            max_frame_size: config.max_frame_size.max(MIN_MAX_FRAME_SIZE),
            channel_max: config.channel_max,
            idle_timeout: config.idle_timeout,
            offered_capabilities: None,
            desired_capabilities: None,
            properties: None,
            local_error: None,
            remote: None,
            remote_error: None,
            local_channels: BTreeMap::new(),
            zombie_channels: BTreeMap::new(),
            remote_channels: HashMap::new(),
        }
    }

    /// Local state.
    #[must_use]
    pub const fn local_state(&self) -> EndpointState { self.local_state }

    /// Remote state.
    #[must_use]
    pub const fn remote_state(&self) -> EndpointState { self.remote_state }

    /// Local container id.
    #[must_use]
    pub fn container_id(&self) -> &str { &self.container_id }

    /// Local hostname.
    #[must_use]
    pub fn hostname(&self) -> Option<&str> { self.hostname.as_deref() }

    /// Largest frame accepted locally.
    #[must_use]
    pub const fn max_frame_size(&self) -> u32 { self.max_frame_size }

    /// Highest channel accepted locally.
    #[must_use]
    pub const fn channel_max(&self) -> u16 { self.channel_max }

    /// Local idle timeout in milliseconds.
    #[must_use]
    pub const fn idle_timeout(&self) -> u32 { self.idle_timeout }

    /// Peer's container id.
    #[must_use]
    pub fn remote_container_id(&self) -> Option<&str> {
        self.remote.as_ref().map(|o| o.container_id.as_str())
    }

    /// Peer's hostname.
    #[must_use]
    pub fn remote_hostname(&self) -> Option<&str> { self.remote.as_ref()?.hostname.as_deref() }

    /// Largest frame the peer accepts.
    #[must_use]
    pub fn remote_max_frame_size(&self) -> Option<u32> { self.remote.as_ref().map(|o| o.max_frame_size) }

    /// Highest channel the peer accepts.
    #[must_use]
    pub fn remote_channel_max(&self) -> Option<u16> { self.remote.as_ref().map(|o| o.channel_max) }

    /// Idle timeout advertised by the peer, as sent.
    #[must_use]
    pub fn remote_idle_timeout(&self) -> Option<u32> { self.remote.as_ref()?.idle_time_out }

    /// Capabilities offered by the peer.
    #[must_use]
    pub fn remote_offered_capabilities(&self) -> Option<&[Symbol]> {
        self.remote.as_ref()?.offered_capabilities.as_deref()
    }

    /// Error sent with the local Close.
    #[must_use]
    pub const fn local_error(&self) -> Option<&ErrorCondition> { self.local_error.as_ref() }

    /// Error received with the peer's Close.
    #[must_use]
    pub const fn remote_error(&self) -> Option<&ErrorCondition> { self.remote_error.as_ref() }

    /// Frame size used for outgoing frames: the smaller of both ends.
    #[must_use]
    pub fn negotiated_max_frame_size(&self) -> u32 {
        self.remote_max_frame_size()
            .map_or(self.max_frame_size, |remote| {
                remote.max(MIN_MAX_FRAME_SIZE).min(self.max_frame_size)
            })
    }

    /// Highest channel usable locally under both ends' channel max.
    fn usable_channel_max(&self) -> u16 {
        self.remote_channel_max()
            .map_or(self.channel_max, |remote| remote.min(self.channel_max))
    }

    fn ensure_configurable(&self, what: &str) -> Result<()> {
        if matches!(self.local_state, EndpointState::Idle) {
            Ok(())
        } else {
            Err(EngineError::invalid_op(format!(
                "cannot change {what} after the connection has been opened"
            )))
        }
    }

    /// Set the container id.
    ///
    /// # Errors
    /// Returns [`EngineError::InvalidOperation`] once the connection is open.
    pub fn set_container_id(&mut self, container_id: impl Into<String>) -> Result<()> {
        self.ensure_configurable("the container id")?;
        self.container_id = container_id.into();
        Ok(())
    }

    /// Set the hostname.
    ///
    /// # Errors
    /// Returns [`EngineError::InvalidOperation`] once the connection is open.
    pub fn set_hostname(&mut self, hostname: impl Into<String>) -> Result<()> {
        self.ensure_configurable("the hostname")?;
        self.hostname = Some(hostname.into());
        Ok(())
    }

    /// Set the largest frame accepted locally.
    ///
    /// # Errors
    /// Returns [`EngineError::InvalidOperation`] once the connection is open,
    /// or [`EngineError::InvalidArgument`] below the protocol minimum of 512.
    pub fn set_max_frame_size(&mut self, max_frame_size: u32) -> Result<()> {
        self.ensure_configurable("the max frame size")?;
        if max_frame_size < MIN_MAX_FRAME_SIZE {
            return Err(EngineError::invalid_arg(format!(
                "max frame size {max_frame_size} is below {MIN_MAX_FRAME_SIZE}"
            )));
        }
        self.max_frame_size = max_frame_size;
        Ok(())
    }

    /// Set the highest channel accepted locally.
    ///
    /// # Errors
    /// Returns [`EngineError::InvalidOperation`] once the connection is open.
    pub fn set_channel_max(&mut self, channel_max: u16) -> Result<()> {
        self.ensure_configurable("the channel max")?;
        self.channel_max = channel_max;
        Ok(())
    }

    /// Set the local idle timeout in milliseconds.
    ///
    /// # Errors
    /// Returns [`EngineError::InvalidOperation`] once the connection is open.
    pub fn set_idle_timeout(&mut self, idle_timeout: u32) -> Result<()> {
        self.ensure_configurable("the idle timeout")?;
        self.idle_timeout = idle_timeout;
        Ok(())
    }

    /// Set the offered capabilities.
    ///
    /// # Errors
    /// Returns [`EngineError::InvalidOperation`] once the connection is open.
    pub fn set_offered_capabilities(&mut self, capabilities: Vec<Symbol>) -> Result<()> {
        self.ensure_configurable("the offered capabilities")?;
        self.offered_capabilities = Some(capabilities);
        Ok(())
    }

    /// Set the desired capabilities.
    ///
    /// # Errors
    /// Returns [`EngineError::InvalidOperation`] once the connection is open.
    pub fn set_desired_capabilities(&mut self, capabilities: Vec<Symbol>) -> Result<()> {
        self.ensure_configurable("the desired capabilities")?;
        self.desired_capabilities = Some(capabilities);
        Ok(())
    }

    /// Set the connection properties.
    ///
    /// # Errors
    /// Returns [`EngineError::InvalidOperation`] once the connection is open.
    pub fn set_properties(&mut self, properties: Fields) -> Result<()> {
        self.ensure_configurable("the properties")?;
        self.properties = Some(properties);
        Ok(())
    }

    /// Build the Open announcing this end.
    pub(crate) fn open(&self) -> Open {
        Open {
            container_id: self.container_id.clone(),
            hostname: self.hostname.clone(),
            max_frame_size: self.max_frame_size,
            channel_max: self.channel_max,
            idle_time_out: (self.idle_timeout > 0).then_some(self.idle_timeout),
            outgoing_locales: None,
            incoming_locales: None,
            offered_capabilities: self.offered_capabilities.clone(),
            desired_capabilities: self.desired_capabilities.clone(),
            properties: self.properties.clone(),
        }
    }

    /// Lowest channel neither bound nor awaiting the peer's End; a channel
    /// awaiting End is reused only when nothing else is free.
    pub(crate) fn allocate_channel(&self) -> Option<u16> {
        let max = self.usable_channel_max();
        let free = |c: &u16| !self.local_channels.contains_key(c);
        (0..=max)
            .find(|c| free(c) && !self.zombie_channels.contains_key(c))
            .or_else(|| (0..=max).find(free))
    }
}

#[cfg(test)]
mod tests {
    use rstest::{fixture, rstest};

    use super::*;

    #[fixture]
    fn connection() -> Connection { Connection::new(&EngineConfig::default()) }

    #[rstest]
    fn lowest_free_channel_is_chosen(mut connection: Connection) {
        assert_eq!(connection.allocate_channel(), Some(0));
        connection.local_channels.insert(0, SessionId(0));
        connection.local_channels.insert(2, SessionId(1));
        assert_eq!(connection.allocate_channel(), Some(1));
    }

    #[rstest]
    fn half_closed_channel_reused_only_as_last_resort(mut connection: Connection) {
        assert!(connection.set_channel_max(1).is_ok());
        connection.zombie_channels.insert(0, SessionId(0));
        assert_eq!(connection.allocate_channel(), Some(1));
        connection.local_channels.insert(1, SessionId(1));
        assert_eq!(connection.allocate_channel(), Some(0));
        connection.local_channels.insert(0, SessionId(2));
        assert_eq!(connection.allocate_channel(), None);
    }

    #[rstest]
    fn remote_channel_max_limits_allocation(mut connection: Connection) {
        let mut open = Open::new("peer");
        open.channel_max = 0;
        connection.remote = Some(open);
        connection.local_channels.insert(0, SessionId(0));
        assert_eq!(connection.allocate_channel(), None);
    }

    #[rstest]
    fn negotiated_frame_size_is_smaller_end(mut connection: Connection) {
        assert!(connection.set_max_frame_size(4096).is_ok());
        let mut open = Open::new("peer");
        open.max_frame_size = 1024;
        connection.remote = Some(open);
        assert_eq!(connection.negotiated_max_frame_size(), 1024);
    }

    #[rstest]
    fn settings_lock_after_open(mut connection: Connection) {
        connection.local_state = EndpointState::Active;
        assert!(matches!(
            connection.set_container_id("late"),
            Err(EngineError::InvalidOperation(_))
        ));
    }

    #[rstest]
    fn tiny_frame_size_is_rejected(mut connection: Connection) {
        assert!(matches!(
            connection.set_max_frame_size(100),
            Err(EngineError::InvalidArgument(_))
        ));
    }
}
