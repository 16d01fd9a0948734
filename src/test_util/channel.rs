use std::sync::Arc;
use std::time::Duration;

use crate::channel::input::ReliableInputSessionChannel;
use crate::channel::output::{OutputChannelShape, ReliableOutputSessionChannel};
use crate::config::ReliableSessionConfig;
use crate::fault::ReliableSessionError;
use crate::test_util::binder::{binder_pair, InMemoryBinder};
use crate::test_util::fault::TrackingFaultDispatcher;

pub const CLIENT_ADDRESS: &str = "urn:client";
pub const SERVER_ADDRESS: &str = "urn:server";

const OPEN_TIMEOUT: Duration = Duration::from_secs(30);

/// A sending and a receiving channel connected by in-memory binders
pub struct ChannelPair {
    pub client: Arc<ReliableOutputSessionChannel>,
    pub server: Arc<ReliableInputSessionChannel>,
    pub client_binder: Arc<InMemoryBinder>,
    pub server_binder: Arc<InMemoryBinder>,
    pub client_faults: Arc<TrackingFaultDispatcher>,
    pub server_faults: Arc<TrackingFaultDispatcher>,
}

/// Creates a sequence between a duplex output channel and an input channel
pub async fn open_channel_pair(client_config: ReliableSessionConfig, server_config: ReliableSessionConfig) -> Result<ChannelPair, ReliableSessionError> {
    let (client_binder, server_binder) = binder_pair(CLIENT_ADDRESS, SERVER_ADDRESS);
    let client_faults = TrackingFaultDispatcher::new();
    let server_faults = TrackingFaultDispatcher::new();

    let accepting = tokio::spawn(ReliableInputSessionChannel::accept(
        Arc::new(server_config),
        server_binder.clone(),
        server_faults.clone(),
        OPEN_TIMEOUT,
    ));

    let client = ReliableOutputSessionChannel::new(OutputChannelShape::Duplex, Arc::new(client_config), client_binder.clone(), client_faults.clone());
    client.open(OPEN_TIMEOUT).await?;

    let server = accepting.await
        .map_err(|e| ReliableSessionError::communication("the accepting task failed", Some(e.into())))??;

    Ok(ChannelPair {
        client,
        server,
        client_binder,
        server_binder,
        client_faults,
        server_faults,
    })
}
