//! Instance registry
//!
//! The one piece of process-wide state: a bounded table mapping instance
//! names to handles, plus the error sink for frames no endpoint can claim.
//! Everything else hangs off an [`Instance`].

use alloc::string::String;
use alloc::sync::Arc;
use alloc::vec::Vec;

use crate::config::{InstanceConfig, NUM_INSTANCES};
use crate::error::{IpcError, Result};
use crate::instance::Instance;
use crate::mailbox::{Mailbox, MailboxErr, MailboxInt};

/// Receives errors that cannot be attributed to an endpoint
pub type ErrorHook = Arc<dyn Fn(&str, IpcError) + Send + Sync>;

/// Process-wide error sink; logs when no hook is installed
pub struct ErrorSink {
    hook: spin::Mutex<Option<ErrorHook>>,
}

impl ErrorSink {
    pub fn new() -> Self {
        Self {
            hook: spin::Mutex::new(None),
        }
    }

    pub fn set(&self, hook: ErrorHook) {
        *self.hook.lock() = Some(hook);
    }

    /// Report `err` raised on `instance`
    pub fn report(&self, instance: &str, err: IpcError) {
        let hook = self.hook.lock().clone();
        match hook {
            Some(hook) => hook(instance, err),
            None => log::error!("{}: {}", instance, err),
        }
    }
}

impl Default for ErrorSink {
    fn default() -> Self {
        Self::new()
    }
}

enum Slot {
    Empty,
    /// Name claimed, open in progress
    Opening(String),
    Open(Arc<Instance>),
}

impl Slot {
    fn name(&self) -> Option<&str> {
        match self {
            Slot::Empty => None,
            Slot::Opening(name) => Some(name),
            Slot::Open(instance) => Some(instance.name()),
        }
    }
}

/// Bounded table of open instances
pub struct InstanceRegistry {
    slots: spin::Mutex<Vec<Slot>>,
    sink: Arc<ErrorSink>,
}

impl InstanceRegistry {
    pub fn new() -> Self {
        Self {
            slots: spin::Mutex::new((0..NUM_INSTANCES).map(|_| Slot::Empty).collect()),
            sink: Arc::new(ErrorSink::new()),
        }
    }

    /// Open an instance and record it under its name
    ///
    /// # Errors
    /// - `InvalidConfig` for an empty name, bad region geometry or a region
    ///   too small for the layout
    /// - `AlreadyOpen` if the name is taken; the existing instance is left
    ///   untouched
    /// - `NoSpace` if all `NUM_INSTANCES` slots are used
    pub fn create(&self, config: InstanceConfig) -> Result<Arc<Instance>> {
        if config.name.is_empty() {
            return Err(IpcError::InvalidConfig);
        }

        let index = {
            let mut slots = self.slots.lock();
            if slots.iter().any(|slot| slot.name() == Some(config.name.as_str())) {
                log::debug!("instance {} already open", config.name);
                return Err(IpcError::AlreadyOpen);
            }
            let index = slots
                .iter()
                .position(|slot| matches!(slot, Slot::Empty))
                .ok_or(IpcError::NoSpace)?;
            slots[index] = Slot::Opening(config.name.clone());
            index
        };

        match Instance::open(config, index, Arc::clone(&self.sink)) {
            Ok(instance) => {
                self.slots.lock()[index] = Slot::Open(Arc::clone(&instance));
                Ok(instance)
            }
            Err(err) => {
                self.slots.lock()[index] = Slot::Empty;
                Err(err)
            }
        }
    }

    pub fn get(&self, name: &str) -> Option<Arc<Instance>> {
        self.slots.lock().iter().find_map(|slot| match slot {
            Slot::Open(instance) if instance.name() == name => Some(Arc::clone(instance)),
            _ => None,
        })
    }

    /// Number of open instances
    pub fn len(&self) -> usize {
        self.slots
            .lock()
            .iter()
            .filter(|slot| matches!(slot, Slot::Open(_)))
            .count()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Install the hook for unroutable frames and other instance-level errors
    pub fn set_error_sink<F>(&self, hook: F)
    where
        F: Fn(&str, IpcError) + Send + Sync + 'static,
    {
        self.sink.set(Arc::new(hook));
    }

    fn open_instances(&self) -> Vec<Arc<Instance>> {
        self.slots
            .lock()
            .iter()
            .filter_map(|slot| match slot {
                Slot::Open(instance) => Some(Arc::clone(instance)),
                _ => None,
            })
            .collect()
    }

    /// Drain the mailbox and route each kick to its instances
    ///
    /// For every word that matches an instance's `mbox_data_rcv`, the
    /// instance's bit (its registry index) is set in `received` and its
    /// `user_kick` callback runs. Both interrupt bits are cleared at the end.
    ///
    /// # Errors
    /// `HardwareFault` if a register access fails; `received` then holds
    /// the kicks drained before the fault
    pub fn mailbox_event_handle(&self, mbox: &dyn Mailbox, received: &mut u32) -> Result<()> {
        let status = mbox.int_status()?;
        let instances = self.open_instances();
        let mut result = Ok(());

        if status.contains(MailboxInt::THRESHOLD) {
            loop {
                match mbox.read() {
                    Ok(Some(word)) => self.dispatch_kick(&instances, word, received),
                    Ok(None) => break,
                    Err(err) => {
                        result = Err(err);
                        break;
                    }
                }
            }
        }

        if status.contains(MailboxInt::ERROR) {
            let err = mbox.error_status()?;
            if err.contains(MailboxErr::FULL) {
                log::warn!("mailbox fifo overflowed, kicks were lost");
            }
            if err.contains(MailboxErr::EMPTY) {
                log::warn!("mailbox read from empty fifo");
            }
            mbox.clear_error(err)?;
        }

        mbox.clear_int(MailboxInt::THRESHOLD | MailboxInt::ERROR)?;
        result
    }

    fn dispatch_kick(&self, instances: &[Arc<Instance>], word: u32, received: &mut u32) {
        let mut matched = false;
        for instance in instances.iter().filter(|i| i.mbox_data_rcv() == word) {
            matched = true;
            *received |= 1 << instance.index();
            if let Some(cbk) = instance.user_kick() {
                if !cbk(instance) {
                    log::trace!("{}: kick not acknowledged", instance.name());
                }
            }
        }
        if !matched {
            log::debug!("unrecognized kick {:#x}", word);
        }
    }
}

impl Default for InstanceRegistry {
    fn default() -> Self {
        Self::new()
    }
}

static GLOBAL: spin::Lazy<InstanceRegistry> = spin::Lazy::new(InstanceRegistry::new);

/// The process-wide registry
pub fn global() -> &'static InstanceRegistry {
    &GLOBAL
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{Role, ELEMENT_SIZE};
    use crate::layout::ShmLayout;
    use crate::shm::ShmRegion;
    use core::sync::atomic::{AtomicUsize, Ordering};

    fn config(name: &str) -> InstanceConfig {
        let shm = ShmRegion::allocate(ShmLayout::required_size(2, ELEMENT_SIZE)).unwrap();
        InstanceConfig::builder(name, Role::Host, shm).slots(2).build()
    }

    #[test]
    fn test_create_is_idempotent_safe() {
        let registry = InstanceRegistry::new();
        let first = registry.create(config("ipc0")).unwrap();
        assert_eq!(registry.create(config("ipc0")).unwrap_err(), IpcError::AlreadyOpen);
        assert_eq!(registry.len(), 1);
        assert!(Arc::ptr_eq(&registry.get("ipc0").unwrap(), &first));
    }

    #[test]
    fn test_table_bounded() {
        let registry = InstanceRegistry::new();
        for i in 0..NUM_INSTANCES {
            let name = alloc::format!("ipc{}", i);
            let instance = registry.create(config(&name)).unwrap();
            assert_eq!(instance.index(), i);
        }
        assert_eq!(registry.create(config("extra")).unwrap_err(), IpcError::NoSpace);
    }

    #[test]
    fn test_failed_open_frees_slot() {
        let registry = InstanceRegistry::new();
        let tiny = ShmRegion::allocate(64).unwrap();
        let cfg = InstanceConfig::builder("small", Role::Host, tiny).build();
        assert_eq!(registry.create(cfg).unwrap_err(), IpcError::InvalidConfig);
        assert!(registry.is_empty());
        assert!(registry.create(config("small")).is_ok());
    }

    #[test]
    fn test_error_sink_hook() {
        let sink = ErrorSink::new();
        let hits = Arc::new(AtomicUsize::new(0));
        let seen = hits.clone();
        sink.report("ipc0", IpcError::BadMessage);
        sink.set(Arc::new(move |name: &str, err: IpcError| {
            assert_eq!(name, "ipc0");
            assert_eq!(err, IpcError::UnknownEndpoint { addr: 7 });
            seen.fetch_add(1, Ordering::SeqCst);
        }));
        sink.report("ipc0", IpcError::UnknownEndpoint { addr: 7 });
        assert_eq!(hits.load(Ordering::SeqCst), 1);
    }
}
