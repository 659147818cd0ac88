//! BLE Connection Module
//!
//! One actor task owns the lifecycle of the single GATT link. Caller
//! requests, step results of the connect/discovery flow and platform events
//! all funnel into its loop, so state only ever changes in one place.
//!
//! ```text
//! Uninitialized --connect--> Connecting --link up--> ServiceDiscovery --resolved--> Connected
//!                                 |                        |                           |
//!                                 +--- link error ---------+--- discovery error -------+--- link lost / fault
//!                                                                                      |
//!                                                     Connected --disconnect--> Disconnecting --ack--> Disconnected
//! ```
//!
//! The connect and discovery steps run in a spawned flow task tagged with an
//! attempt number. Aborting a flow bumps the number, so a result that was
//! already in flight is recognised as stale and ignored. Link loss notices
//! carry the peripheral address and only apply to the device of the current
//! attempt.

use crate::domain::models::{
    CharacteristicDirection, ConnectionStatus, DeviceAddress, GattEndpoint, GattService,
    PeripheralIdentity,
    ResolvedEndpoints,
};
use crate::infrastructure::bluetooth::error::BleError;
use crate::infrastructure::bluetooth::protocol::{
    NOTIFY_CHAR_UUID, READ_CHAR_UUID, SERVICE_UUID, WRITE_CHAR_UUID,
};
use crate::infrastructure::bluetooth::status::StatusHub;
use crate::infrastructure::bluetooth::transport::{BleTransport, TransportEvent};
use std::sync::Arc;
use tokio::sync::{broadcast, mpsc, oneshot, watch};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

/// Endpoints of the current link, tagged with the attempt that resolved them.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct LinkEndpoints {
    pub link_id: u64,
    pub endpoints: ResolvedEndpoints,
}

/// Requests accepted by the connection actor.
#[derive(Debug)]
pub enum LinkRequest {
    Connect {
        peripheral: PeripheralIdentity,
        reply: oneshot::Sender<Result<(), BleError>>,
    },
    Disconnect {
        reply: oneshot::Sender<()>,
    },
    /// A GATT operation on link `link_id` failed outside the actor.
    Fault { link_id: u64, error: BleError },
}

#[derive(Debug)]
enum Step {
    LinkEstablished,
    LinkFailed(BleError),
    ServicesResolved(ResolvedEndpoints),
    DiscoveryFailed(BleError),
}

/// Cloneable front end of the connection actor.
#[derive(Debug, Clone)]
pub struct ConnectionHandle {
    requests: mpsc::UnboundedSender<LinkRequest>,
    endpoints: watch::Receiver<LinkEndpoints>,
    peripheral: watch::Receiver<Option<PeripheralIdentity>>,
}

impl ConnectionHandle {
    /// Starts a connection attempt, tearing down any existing link first.
    ///
    /// Returns once `Connecting` has been published; progress after that is
    /// reported on the status stream.
    pub async fn connect(&self, peripheral: PeripheralIdentity) -> Result<(), BleError> {
        let (reply, rx) = oneshot::channel();
        self.requests
            .send(LinkRequest::Connect { peripheral, reply })
            .map_err(|_| BleError::ServiceClosed)?;
        rx.await.map_err(|_| BleError::ServiceClosed)?
    }

    /// Tears down the link. Returns once `Disconnected` has been published.
    pub async fn disconnect(&self) -> Result<(), BleError> {
        let (reply, rx) = oneshot::channel();
        self.requests
            .send(LinkRequest::Disconnect { reply })
            .map_err(|_| BleError::ServiceClosed)?;
        rx.await.map_err(|_| BleError::ServiceClosed)
    }

    /// Reports a failed GATT operation so the actor can drop the link.
    pub fn report_fault(&self, link_id: u64, error: BleError) {
        let _ = self.requests.send(LinkRequest::Fault { link_id, error });
    }

    pub fn endpoints(&self) -> watch::Receiver<LinkEndpoints> {
        self.endpoints.clone()
    }

    pub fn connected_device(&self) -> Option<PeripheralIdentity> {
        self.peripheral.borrow().clone()
    }
}

/// Picks the control service endpoints out of a discovery result.
pub fn resolve_endpoints(services: &[GattService]) -> ResolvedEndpoints {
    let Some(service) = services.iter().find(|s| s.uuid == SERVICE_UUID) else {
        return ResolvedEndpoints::default();
    };

    let find = |uuid, direction| {
        service
            .characteristics
            .iter()
            .find(|c| **c == uuid)
            .map(|c| GattEndpoint {
                service: service.uuid,
                characteristic: *c,
                direction,
            })
    };

    ResolvedEndpoints {
        read: find(READ_CHAR_UUID, CharacteristicDirection::Read),
        write: find(WRITE_CHAR_UUID, CharacteristicDirection::Write),
        notify: find(NOTIFY_CHAR_UUID, CharacteristicDirection::Notify),
    }
}

/// Queries services and subscribes to telemetry on a fresh link.
async fn discover(transport: Arc<dyn BleTransport>) -> Result<ResolvedEndpoints, BleError> {
    let services = transport.discover_services().await?;
    for service in &services {
        debug!(
            "Service {} with {} characteristic(s)",
            service.uuid,
            service.characteristics.len()
        );
    }

    let endpoints = resolve_endpoints(&services);
    match &endpoints.notify {
        Some(notify) => {
            transport.enable_notifications(notify).await?;
            info!("Notifications enabled on {}", notify.characteristic);
        }
        None => warn!("Telemetry characteristic not found, no notifications"),
    }
    Ok(endpoints)
}

pub struct ConnectionActor {
    transport: Arc<dyn BleTransport>,
    status: Arc<StatusHub>,
    endpoints: watch::Sender<LinkEndpoints>,
    peripheral: watch::Sender<Option<PeripheralIdentity>>,
    steps: mpsc::UnboundedSender<(u64, Step)>,
    attempt: u64,
    flow: Option<JoinHandle<()>>,
}

impl ConnectionActor {
    /// Spawns the actor and returns its handle.
    pub fn spawn(
        transport: Arc<dyn BleTransport>,
        status: Arc<StatusHub>,
    ) -> (ConnectionHandle, JoinHandle<()>) {
        let (requests_tx, requests_rx) = mpsc::unbounded_channel();
        let (steps_tx, steps_rx) = mpsc::unbounded_channel();
        let (endpoints_tx, endpoints_rx) = watch::channel(LinkEndpoints::default());
        let (peripheral_tx, peripheral_rx) = watch::channel(None);
        let events = transport.events();

        let actor = ConnectionActor {
            transport,
            status,
            endpoints: endpoints_tx,
            peripheral: peripheral_tx,
            steps: steps_tx,
            attempt: 0,
            flow: None,
        };
        let task = tokio::spawn(actor.run(requests_rx, steps_rx, events));

        let handle = ConnectionHandle {
            requests: requests_tx,
            endpoints: endpoints_rx,
            peripheral: peripheral_rx,
        };
        (handle, task)
    }

    async fn run(
        mut self,
        mut requests: mpsc::UnboundedReceiver<LinkRequest>,
        mut steps: mpsc::UnboundedReceiver<(u64, Step)>,
        mut events: broadcast::Receiver<TransportEvent>,
    ) {
        debug!("Connection actor started");
        loop {
            tokio::select! {
                request = requests.recv() => match request {
                    Some(request) => self.handle_request(request).await,
                    None => break,
                },
                Some((attempt, step)) = steps.recv() => self.handle_step(attempt, step).await,
                event = events.recv() => match event {
                    Ok(TransportEvent::LinkLost(address)) => {
                        self.handle_link_lost(address).await
                    }
                    Ok(_) => {}
                    Err(broadcast::error::RecvError::Lagged(missed)) => {
                        debug!("Connection actor skipped {} transport events", missed);
                    }
                    Err(broadcast::error::RecvError::Closed) => {
                        error!("Transport event stream closed");
                        break;
                    }
                },
            }
        }

        self.abandon_flow();
        debug!("Connection actor stopped");
    }

    async fn handle_request(&mut self, request: LinkRequest) {
        match request {
            LinkRequest::Connect { peripheral, reply } => {
                let result = self.connect(peripheral).await;
                let _ = reply.send(result);
            }
            LinkRequest::Disconnect { reply } => {
                if self.status.link().has_link() {
                    info!("Disconnect requested");
                    self.teardown(true).await;
                }
                let _ = reply.send(());
            }
            LinkRequest::Fault { link_id, error } => {
                if link_id == self.attempt && self.status.link() == ConnectionStatus::Connected {
                    error!("GATT operation failed, dropping link: {}", error);
                    self.teardown(false).await;
                } else {
                    debug!("Ignoring fault from stale link {}: {}", link_id, error);
                }
            }
        }
    }

    async fn connect(&mut self, peripheral: PeripheralIdentity) -> Result<(), BleError> {
        if !self.transport.radio_enabled().await {
            warn!("Cannot connect: Bluetooth radio is off");
            return Err(BleError::RadioUnavailable);
        }

        if self.status.link().has_link() {
            info!("Replacing current link with {}", peripheral.address);
            self.teardown(true).await;
        }

        self.attempt += 1;
        let attempt = self.attempt;
        info!(
            "Connecting to {} ({}), attempt {}",
            peripheral.display_name(),
            peripheral.address,
            attempt
        );
        self.status.publish_link(ConnectionStatus::Connecting);
        self.peripheral.send_replace(Some(peripheral.clone()));

        let transport = Arc::clone(&self.transport);
        let steps = self.steps.clone();
        self.flow = Some(tokio::spawn(async move {
            let step = match transport.connect(&peripheral).await {
                Ok(()) => Step::LinkEstablished,
                Err(e) => Step::LinkFailed(e),
            };
            let _ = steps.send((attempt, step));
        }));
        Ok(())
    }

    async fn handle_step(&mut self, attempt: u64, step: Step) {
        if attempt != self.attempt {
            debug!("Dropping stale step from attempt {}: {:?}", attempt, step);
            return;
        }
        let current = self.status.link();

        match (current, step) {
            (ConnectionStatus::Connecting, Step::LinkEstablished) => {
                info!("Link established, discovering services");
                self.status.publish_link(ConnectionStatus::ServiceDiscovery);

                let transport = Arc::clone(&self.transport);
                let steps = self.steps.clone();
                self.flow = Some(tokio::spawn(async move {
                    let step = match discover(transport).await {
                        Ok(endpoints) => Step::ServicesResolved(endpoints),
                        Err(e) => Step::DiscoveryFailed(e),
                    };
                    let _ = steps.send((attempt, step));
                }));
            }
            (ConnectionStatus::Connecting, Step::LinkFailed(e)) => {
                error!("Connection failed: {}", e);
                self.flow = None;
                self.peripheral.send_replace(None);
                self.status.publish_link(ConnectionStatus::Disconnected);
            }
            (ConnectionStatus::ServiceDiscovery, Step::ServicesResolved(endpoints)) => {
                self.flow = None;
                if !endpoints.is_complete() {
                    warn!("Control service incomplete, link degraded: {:?}", endpoints);
                }
                self.endpoints.send_replace(LinkEndpoints {
                    link_id: attempt,
                    endpoints,
                });
                info!("Connected");
                self.status.publish_link(ConnectionStatus::Connected);
            }
            (ConnectionStatus::ServiceDiscovery, Step::DiscoveryFailed(e)) => {
                error!("Service discovery failed: {}", e);
                self.flow = None;
                self.teardown(false).await;
            }
            (state, step) => {
                warn!("Unexpected {:?} while {:?}", step, state);
            }
        }
    }

    async fn handle_link_lost(&mut self, address: DeviceAddress) {
        let current = self.status.link();
        let ours = self
            .peripheral
            .borrow()
            .as_ref()
            .is_some_and(|p| p.address == address);
        if !current.has_link() || !ours {
            debug!("Ignoring loss of {} while {:?}", address, current);
            return;
        }

        warn!("Link to {} lost while {:?}", address, current);
        let half_open = self.flow.is_some();
        self.abandon_flow();
        self.clear_link();
        if half_open {
            // The platform may still hold the half-built link
            if let Err(e) = self.transport.disconnect().await {
                warn!("Transport disconnect failed: {}", e);
            }
        }
        self.status.publish_link(ConnectionStatus::Disconnected);
    }

    /// Drops the current link. `graceful` passes through `Disconnecting`
    /// when a fully established link is being closed on request.
    async fn teardown(&mut self, graceful: bool) {
        let current = self.status.link();
        self.abandon_flow();
        self.clear_link();

        if graceful && current == ConnectionStatus::Connected {
            self.status.publish_link(ConnectionStatus::Disconnecting);
        }
        if let Err(e) = self.transport.disconnect().await {
            warn!("Transport disconnect failed: {}", e);
        }
        self.status.publish_link(ConnectionStatus::Disconnected);
        info!("Disconnected from device");
    }

    fn abandon_flow(&mut self) {
        self.attempt += 1;
        if let Some(flow) = self.flow.take() {
            flow.abort();
        }
    }

    fn clear_link(&mut self) {
        self.endpoints.send_replace(LinkEndpoints::default());
        self.peripheral.send_replace(None);
    }
}
