//! Command Dispatcher
//!
//! Outbound writes go through a single task so that at most one GATT write
//! is outstanding per link. While a write waits for its acknowledgement,
//! newer commands collect in a backlog:
//!
//! - coalescible commands (joystick samples) keep only the newest pending
//!   one; the replaced sample resolves with [`DispatchError::Superseded`]
//! - must-deliver commands (PID settings) are all kept, in arrival order

use crate::domain::models::{DeliveryClass, OutboundCommand};
use crate::infrastructure::bluetooth::connection::{ConnectionHandle, LinkEndpoints};
use crate::infrastructure::bluetooth::error::{BleError, DispatchError};
use crate::infrastructure::bluetooth::protocol;
use crate::infrastructure::bluetooth::transport::BleTransport;
use std::collections::VecDeque;
use std::sync::Arc;
use tokio::sync::{mpsc, oneshot, watch};
use tokio::task::JoinHandle;
use tracing::{debug, trace, warn};

pub type Delivery = oneshot::Receiver<Result<(), DispatchError>>;

#[derive(Debug)]
struct Pending {
    command: OutboundCommand,
    reply: oneshot::Sender<Result<(), DispatchError>>,
}

impl Pending {
    fn class(&self) -> DeliveryClass {
        self.command.delivery_class()
    }

    fn resolve(self, result: Result<(), DispatchError>) {
        // The caller may have stopped waiting
        let _ = self.reply.send(result);
    }
}

/// Commands waiting behind the outstanding write.
#[derive(Debug)]
struct Backlog {
    queue: VecDeque<Pending>,
    max_must_deliver: usize,
}

impl Backlog {
    fn new(max_must_deliver: usize) -> Self {
        Self {
            queue: VecDeque::new(),
            max_must_deliver,
        }
    }

    fn admit(&mut self, pending: Pending) {
        match pending.class() {
            DeliveryClass::Coalescible => {
                if let Some(at) = self
                    .queue
                    .iter()
                    .position(|p| p.class() == DeliveryClass::Coalescible)
                {
                    if let Some(old) = self.queue.remove(at) {
                        trace!("Coalescing {:?}", old.command);
                        old.resolve(Err(DispatchError::Superseded));
                    }
                }
                self.queue.push_back(pending);
            }
            DeliveryClass::MustDeliver => {
                let waiting = self
                    .queue
                    .iter()
                    .filter(|p| p.class() == DeliveryClass::MustDeliver)
                    .count();
                if waiting >= self.max_must_deliver {
                    warn!("Settings backlog full, rejecting {:?}", pending.command);
                    pending.resolve(Err(DispatchError::QueueFull(self.max_must_deliver)));
                } else {
                    self.queue.push_back(pending);
                }
            }
        }
    }

    fn pop(&mut self) -> Option<Pending> {
        self.queue.pop_front()
    }

    fn is_empty(&self) -> bool {
        self.queue.is_empty()
    }
}

/// Front end of the dispatcher task.
#[derive(Debug, Clone)]
pub struct CommandDispatcher {
    tx: mpsc::UnboundedSender<Pending>,
    endpoints: watch::Receiver<LinkEndpoints>,
}

impl CommandDispatcher {
    pub fn spawn(
        transport: Arc<dyn BleTransport>,
        connection: ConnectionHandle,
        max_must_deliver: usize,
    ) -> (Self, JoinHandle<()>) {
        let (tx, rx) = mpsc::unbounded_channel();
        let endpoints = connection.endpoints();
        let worker = DispatchWorker {
            transport,
            connection,
            endpoints: endpoints.clone(),
            backlog: Backlog::new(max_must_deliver.max(1)),
        };
        let task = tokio::spawn(worker.run(rx));
        (Self { tx, endpoints }, task)
    }

    /// Queues `command` and returns a receiver for its delivery outcome.
    ///
    /// Fails immediately with [`DispatchError::EndpointNotReady`] when no
    /// write characteristic is resolved.
    pub fn submit(&self, command: OutboundCommand) -> Result<Delivery, DispatchError> {
        if self.endpoints.borrow().endpoints.write.is_none() {
            debug!("Dropping {:?}: no write endpoint", command);
            return Err(DispatchError::EndpointNotReady);
        }
        let (reply, rx) = oneshot::channel();
        self.tx
            .send(Pending { command, reply })
            .map_err(|_| DispatchError::Closed)?;
        Ok(rx)
    }

    /// Sends `command` and waits until the robot acknowledged it or it was
    /// dropped.
    pub async fn send(&self, command: OutboundCommand) -> Result<(), DispatchError> {
        let delivery = self.submit(command)?;
        delivery.await.unwrap_or(Err(DispatchError::Closed))
    }
}

struct DispatchWorker {
    transport: Arc<dyn BleTransport>,
    connection: ConnectionHandle,
    endpoints: watch::Receiver<LinkEndpoints>,
    backlog: Backlog,
}

impl DispatchWorker {
    async fn run(mut self, mut rx: mpsc::UnboundedReceiver<Pending>) {
        loop {
            if self.backlog.is_empty() {
                match rx.recv().await {
                    Some(pending) => self.backlog.admit(pending),
                    None => break,
                }
            }
            // Everything that arrived during the last write competes now
            while let Ok(pending) = rx.try_recv() {
                self.backlog.admit(pending);
            }

            if let Some(next) = self.backlog.pop() {
                let result = self.deliver(&next.command).await;
                next.resolve(result);
            }
        }
        debug!("Command dispatcher stopped");
    }

    async fn deliver(&self, command: &OutboundCommand) -> Result<(), DispatchError> {
        let (link_id, endpoint) = {
            let current = self.endpoints.borrow();
            (current.link_id, current.endpoints.write)
        };
        let Some(endpoint) = endpoint else {
            debug!("Link gone before {:?} was written", command);
            return Err(DispatchError::EndpointNotReady);
        };

        let frame = protocol::encode_command(command);
        trace!("Writing {:02X?}", frame);

        match self.transport.write(&endpoint, &frame).await {
            Ok(()) => Ok(()),
            Err(err) => {
                warn!("Write of {:?} failed: {}", command, err);
                if let BleError::Transport(_) = &err {
                    self.connection.report_fault(link_id, err.clone());
                }
                Err(DispatchError::from(err))
            }
        }
    }
}
