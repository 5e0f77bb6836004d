//! Fixtures shared by the integration tests: a host and a remote instance
//! on one loopback link, and a handler that records what it sees.

#![allow(dead_code)]

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use ipc_service::config::ELEMENT_SIZE;
use ipc_service::mock::LoopbackLink;
use ipc_service::{
    Endpoint, EndpointConfig, EndpointHandler, Instance, InstanceConfig, InstanceRegistry, IpcError,
    ReceiveSummary, RxFrame,
};

/// Handler recording frames, bind notifications and errors
#[derive(Clone, Default)]
pub struct Recorder {
    frames: Arc<Mutex<Vec<Vec<u8>>>>,
    bound: Arc<AtomicUsize>,
    errors: Arc<Mutex<Vec<IpcError>>>,
}

impl Recorder {
    pub fn frames(&self) -> Vec<Vec<u8>> {
        self.frames.lock().expect("recorder poisoned").clone()
    }

    pub fn bound_count(&self) -> usize {
        self.bound.load(Ordering::SeqCst)
    }

    pub fn errors(&self) -> Vec<IpcError> {
        self.errors.lock().expect("recorder poisoned").clone()
    }

    pub fn clear_errors(&self) {
        self.errors.lock().expect("recorder poisoned").clear();
    }
}

impl EndpointHandler for Recorder {
    fn bound(&mut self) {
        self.bound.fetch_add(1, Ordering::SeqCst);
    }

    fn received(&mut self, frame: &RxFrame<'_>) {
        self.frames
            .lock()
            .expect("recorder poisoned")
            .push(frame.data().to_vec());
    }

    fn error(&mut self, err: IpcError) {
        self.errors.lock().expect("recorder poisoned").push(err);
    }
}

/// Host and remote instance of one loopback link, opened in a private
/// registry so tests do not share state
pub struct Link {
    pub registry: InstanceRegistry,
    pub loopback: LoopbackLink,
    pub host: Arc<Instance>,
    pub remote: Arc<Instance>,
}

impl Link {
    pub fn new(slots: usize) -> Self {
        let loopback = LoopbackLink::new(slots, ELEMENT_SIZE).expect("Failed to allocate link");
        let host = loopback.host_config("host").build();
        let remote = loopback.remote_config("remote").build();
        Self::with_configs(loopback, host, remote)
    }

    pub fn with_configs(loopback: LoopbackLink, host: InstanceConfig, remote: InstanceConfig) -> Self {
        let registry = InstanceRegistry::new();
        let host = registry.create(host).expect("Failed to open host");
        let remote = registry.create(remote).expect("Failed to open remote");
        Self {
            registry,
            loopback,
            host,
            remote,
        }
    }

    /// Service both mailboxes and both rx rings until nothing moves
    ///
    /// Returns what the host and the remote received.
    pub fn pump(&self) -> (ReceiveSummary, ReceiveSummary) {
        let mut host_total = ReceiveSummary::default();
        let mut remote_total = ReceiveSummary::default();

        for _ in 0..1000 {
            let mut kicked = 0u32;
            self.registry
                .mailbox_event_handle(&**self.loopback.host_mailbox(), &mut kicked)
                .expect("host mailbox fault");
            self.registry
                .mailbox_event_handle(&**self.loopback.remote_mailbox(), &mut kicked)
                .expect("remote mailbox fault");

            let host = self.host.receive().expect("host receive failed");
            let remote = self.remote.receive().expect("remote receive failed");
            accumulate(&mut host_total, host);
            accumulate(&mut remote_total, remote);

            let idle = ReceiveSummary::default();
            if kicked == 0 && host == idle && remote == idle {
                return (host_total, remote_total);
            }
        }
        panic!("link never went quiet");
    }

    /// Register `name` on both sides and complete the handshake
    ///
    /// Returns the host endpoint first.
    pub fn bind_pair<H, R>(&self, name: &str, host_handler: H, remote_handler: R) -> (Endpoint, Endpoint)
    where
        H: EndpointHandler + 'static,
        R: EndpointHandler + 'static,
    {
        self.bind_pair_with(EndpointConfig::new(name), host_handler, remote_handler)
    }

    pub fn bind_pair_with<H, R>(
        &self,
        cfg: EndpointConfig,
        host_handler: H,
        remote_handler: R,
    ) -> (Endpoint, Endpoint)
    where
        H: EndpointHandler + 'static,
        R: EndpointHandler + 'static,
    {
        let host = self
            .host
            .register_endpoint(cfg.clone(), host_handler)
            .expect("Failed to register host endpoint");
        let remote = self
            .remote
            .register_endpoint(cfg, remote_handler)
            .expect("Failed to register remote endpoint");
        self.pump();
        assert!(host.is_bound(), "host endpoint {} not bound", host.name());
        assert!(remote.is_bound(), "remote endpoint {} not bound", remote.name());
        (host, remote)
    }
}

fn accumulate(total: &mut ReceiveSummary, pass: ReceiveSummary) {
    total.delivered += pass.delivered;
    total.control += pass.control;
    total.dropped += pass.dropped;
}

/// `(i + seq) mod 256` test pattern
pub fn pattern(len: usize, seq: usize) -> Vec<u8> {
    (0..len).map(|i| ((i + seq) % 256) as u8).collect()
}
