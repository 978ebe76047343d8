//! CALC request/answer bridging.
//!
//! A requester resolves the owning login, takes the broker-wide dispatch
//! lock, and hands the worker a [`Dispatch`]: the payload plus a single-use
//! reply slot. The worker's connection loop forwards the payload as a `C`
//! frame, binds the reply slot via [`WorkerRole`], and delivers the next raw
//! line it reads into it. The lock is held for the whole round trip, so at
//! most one CALC is in flight across the server.

use std::time::Duration;

use bytes::Bytes;
use tokio::sync::{Mutex, oneshot};
use tracing::{debug, warn};

use crate::error::{BackendFailure, RoutingError, SessionError};
use crate::protocol::CalcRequest;
use crate::registry::SessionRegistry;

/// What the requester eventually receives.
pub type Reply = Result<Bytes, BackendFailure>;

/// One calculation handed to a worker.
#[derive(Debug)]
pub struct Dispatch {
    pub payload: Bytes,
    reply: oneshot::Sender<Reply>,
}

impl Dispatch {
    pub fn new(payload: Bytes) -> (Self, oneshot::Receiver<Reply>) {
        let (reply, rx) = oneshot::channel();
        (Self { payload, reply }, rx)
    }
}

pub struct DispatchBroker {
    registry: SessionRegistry,
    /// Held from bind to answer; serializes every CALC server-wide.
    exclusive: Mutex<()>,
    timeout: Option<Duration>,
}

impl DispatchBroker {
    pub fn new(registry: SessionRegistry, timeout: Option<Duration>) -> Self {
        Self {
            registry,
            exclusive: Mutex::new(()),
            timeout,
        }
    }

    /// Run one CALC on behalf of `requester` and return the worker's answer
    /// line exactly as it was read.
    pub async fn calc(&self, requester: &str, request: &CalcRequest) -> Result<Bytes, SessionError> {
        let function = request.function.as_str();
        let owner = self
            .registry
            .resolve_function(function)
            .await
            .ok_or_else(|| RoutingError::FunctionNotRegistered(function.to_string()))?;

        if owner == requester {
            return Err(RoutingError::SelfInvocation(function.to_string()).into());
        }

        let _exclusive = self.exclusive.lock().await;

        // The owner may have disconnected since the function was resolved.
        let worker = self
            .registry
            .lookup(&owner)
            .await
            .ok_or_else(|| RoutingError::OwnerOffline(owner.clone()))?;

        let (dispatch, reply) = Dispatch::new(request.worker_payload());
        debug!(function = %function, worker = %owner, "Dispatching calculation");

        let round_trip = async {
            worker
                .requests
                .send(dispatch)
                .await
                .map_err(|_| BackendFailure::WorkerGone)?;
            reply.await.map_err(|_| BackendFailure::WorkerGone)?
        };

        let answer = match self.timeout {
            Some(limit) => tokio::time::timeout(limit, round_trip)
                .await
                .unwrap_or(Err(BackendFailure::Timeout)),
            None => round_trip.await,
        };

        match &answer {
            Ok(_) => debug!(function = %function, worker = %owner, "Calculation answered"),
            Err(e) => warn!(function = %function, worker = %owner, error = %e, "Calculation failed"),
        }

        Ok(answer?)
    }
}

/// Outcome of handing a worker's answer line to its reply slot.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Delivery {
    Delivered,
    /// The requester stopped waiting.
    Abandoned,
    /// Nothing was in flight.
    Unsolicited,
}

/// Worker-side reply slot binding, owned by the worker's connection loop.
#[derive(Debug, Default)]
pub struct WorkerRole {
    in_flight: Option<oneshot::Sender<Reply>>,
}

impl WorkerRole {
    pub fn is_idle(&self) -> bool {
        self.in_flight.is_none()
    }

    /// Bind the dispatch's reply slot and return the payload to forward.
    ///
    /// Returns `None` for a dispatch whose requester already gave up.
    pub fn accept(&mut self, dispatch: Dispatch) -> Option<Bytes> {
        if dispatch.reply.is_closed() {
            return None;
        }
        self.in_flight = Some(dispatch.reply);
        Some(dispatch.payload)
    }

    /// Deliver an answer line and unbind the reply slot.
    pub fn answer(&mut self, line: Bytes) -> Delivery {
        match self.in_flight.take() {
            Some(slot) => match slot.send(Ok(line)) {
                Ok(()) => Delivery::Delivered,
                Err(_) => Delivery::Abandoned,
            },
            None => Delivery::Unsolicited,
        }
    }

    /// Push a synthetic failure into the bound reply slot, if any.
    pub fn fail(&mut self, failure: BackendFailure) -> bool {
        match self.in_flight.take() {
            Some(slot) => slot.send(Err(failure)).is_ok(),
            None => false,
        }
    }
}
