//! Attachment management
//!
//! [`AttachmentManager`] installs a probe through a [`KernelLinker`],
//! allocates the probe's [`EventChannel`] and keeps a registry of live
//! attachments so a symbol is never instrumented twice.
//!
//! [`AttachmentHandle`] owns the kernel link and the channel. It detaches
//! when dropped, so every exit path of the attaching scope releases the
//! kernel-side hook.

use crate::{
    channel::{ChannelError, EventChannel},
    descriptor::ProbeDescriptor,
};
use log::{info, warn};
use std::{
    collections::HashMap,
    sync::{Arc, Mutex, MutexGuard, PoisonError},
};
use thiserror::Error;

/// Identifier the linker hands out for one installed hook
pub type LinkId = u64;

/// Failures reported by a kernel instrumentation loader
#[derive(Error, Debug)]
pub enum LinkerError {
    #[error("symbol {0} is not an instrumentable kernel function")]
    SymbolNotFound(String),

    #[error("permission denied: {0}")]
    PermissionDenied(String),

    #[error("unknown link id {0}")]
    UnknownLink(LinkId),

    #[error("{context}")]
    Other {
        context: String,
        #[source]
        source: Box<dyn std::error::Error + Send + Sync>,
    },
}

/// Installs and removes kernel-side hooks
///
/// The attachment manager calls exactly these two operations and treats the
/// implementation as a black box.
pub trait KernelLinker: Send + Sync {
    fn install(&self, target_symbol: &str) -> Result<LinkId, LinkerError>;

    fn uninstall(&self, link: LinkId) -> Result<(), LinkerError>;
}

#[derive(Error, Debug)]
pub enum AttachError {
    #[error("a probe is already attached to {0}")]
    AlreadyAttached(String),

    #[error("kernel symbol {0} not found")]
    SymbolNotFound(String),

    #[error("not permitted to instrument {symbol}: {reason}")]
    Permission { symbol: String, reason: String },

    #[error("failed to allocate event channel for {symbol}")]
    Channel {
        symbol: String,
        #[source]
        source: ChannelError,
    },

    #[error("failed to install probe on {symbol}")]
    Install {
        symbol: String,
        #[source]
        source: LinkerError,
    },

    #[error("failed to remove probe from {symbol}")]
    Uninstall {
        symbol: String,
        #[source]
        source: LinkerError,
    },
}

/// Channel geometry applied to every attachment
#[derive(Debug, Clone, Copy)]
pub struct ChannelConfig {
    /// Slot count, must be a power of two
    pub capacity: usize,
    /// Slot width in bytes; `None` uses the schema width
    pub slot_size: Option<usize>,
}

impl Default for ChannelConfig {
    fn default() -> Self {
        Self {
            capacity: kprobe_common::DEFAULT_CHANNEL_CAPACITY,
            slot_size: None,
        }
    }
}

type Registry = Arc<Mutex<HashMap<String, LinkId>>>;

fn lock(registry: &Registry) -> MutexGuard<'_, HashMap<String, LinkId>> {
    registry.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Owner of all live attachments of one process
///
/// Constructed once and passed to whoever needs to attach.
pub struct AttachmentManager {
    linker: Arc<dyn KernelLinker>,
    registry: Registry,
    channel: ChannelConfig,
}

impl AttachmentManager {
    pub fn new(linker: Arc<dyn KernelLinker>, channel: ChannelConfig) -> Self {
        Self {
            linker,
            registry: Arc::new(Mutex::new(HashMap::new())),
            channel,
        }
    }

    /// Install the probe and allocate its event channel
    pub fn attach(&self, descriptor: ProbeDescriptor) -> Result<AttachmentHandle, AttachError> {
        let symbol = descriptor.target_symbol().to_string();

        // Held across install so two callers cannot race on one symbol.
        let mut live = lock(&self.registry);
        if live.contains_key(&symbol) {
            return Err(AttachError::AlreadyAttached(symbol));
        }

        let slot_size = self
            .channel
            .slot_size
            .unwrap_or_else(|| descriptor.schema().total_width());
        let channel = EventChannel::new(self.channel.capacity, slot_size).map_err(|source| {
            AttachError::Channel {
                symbol: symbol.clone(),
                source,
            }
        })?;

        let link = self.linker.install(&symbol).map_err(|err| match err {
            LinkerError::SymbolNotFound(_) => AttachError::SymbolNotFound(symbol.clone()),
            LinkerError::PermissionDenied(reason) => AttachError::Permission {
                symbol: symbol.clone(),
                reason,
            },
            source => AttachError::Install {
                symbol: symbol.clone(),
                source,
            },
        })?;
        live.insert(symbol.clone(), link);
        drop(live);

        info!(
            "Attached probe to {} (link {}, {} slots x {} bytes)",
            symbol,
            link,
            channel.capacity(),
            channel.slot_size()
        );

        Ok(AttachmentHandle {
            descriptor,
            link: Some(link),
            channel: Arc::new(channel),
            linker: Arc::clone(&self.linker),
            registry: Arc::clone(&self.registry),
        })
    }

    /// Detach `handle`; a no-op when it is already detached
    pub fn detach(&self, handle: &mut AttachmentHandle) -> Result<(), AttachError> {
        handle.detach()
    }

    pub fn is_attached(&self, target_symbol: &str) -> bool {
        lock(&self.registry).contains_key(target_symbol)
    }

    pub fn attached_count(&self) -> usize {
        lock(&self.registry).len()
    }
}

/// One live kernel link and the channel it feeds
pub struct AttachmentHandle {
    descriptor: ProbeDescriptor,
    link: Option<LinkId>,
    channel: Arc<EventChannel>,
    linker: Arc<dyn KernelLinker>,
    registry: Registry,
}

impl AttachmentHandle {
    pub fn descriptor(&self) -> &ProbeDescriptor {
        &self.descriptor
    }

    /// Shared channel; feeds write into it, the delivery loop reads from it
    pub fn channel(&self) -> Arc<EventChannel> {
        Arc::clone(&self.channel)
    }

    pub fn link(&self) -> Option<LinkId> {
        self.link
    }

    pub fn is_attached(&self) -> bool {
        self.link.is_some()
    }

    /// Remove the kernel hook and release the channel
    ///
    /// Idempotent. The handle counts as detached even when the linker fails
    /// to uninstall; the failure is returned once.
    pub fn detach(&mut self) -> Result<(), AttachError> {
        let Some(link) = self.link.take() else {
            return Ok(());
        };
        let symbol = self.descriptor.target_symbol();

        self.channel.close();
        let result = self.linker.uninstall(link);
        lock(&self.registry).remove(symbol);

        match result {
            Ok(()) => {
                info!("Detached probe from {} (link {})", symbol, link);
                Ok(())
            }
            Err(source) => Err(AttachError::Uninstall {
                symbol: symbol.to_string(),
                source,
            }),
        }
    }
}

impl Drop for AttachmentHandle {
    fn drop(&mut self) {
        if let Err(e) = self.detach() {
            warn!("Detach on drop failed: {}", e);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::descriptor::RecordSchema;
    use std::sync::atomic::{AtomicU64, Ordering};

    #[derive(Default)]
    struct FakeLinker {
        next: AtomicU64,
        installed: Mutex<Vec<(LinkId, String)>>,
        uninstalled: Mutex<Vec<LinkId>>,
        deny: bool,
    }

    impl KernelLinker for FakeLinker {
        fn install(&self, target_symbol: &str) -> Result<LinkId, LinkerError> {
            if self.deny {
                return Err(LinkerError::PermissionDenied("CAP_BPF required".to_string()));
            }
            if target_symbol.starts_with("missing_") {
                return Err(LinkerError::SymbolNotFound(target_symbol.to_string()));
            }
            let link = self.next.fetch_add(1, Ordering::SeqCst);
            self.installed
                .lock()
                .unwrap()
                .push((link, target_symbol.to_string()));
            Ok(link)
        }

        fn uninstall(&self, link: LinkId) -> Result<(), LinkerError> {
            self.uninstalled.lock().unwrap().push(link);
            Ok(())
        }
    }

    fn descriptor(symbol: &str) -> ProbeDescriptor {
        ProbeDescriptor::new(symbol, RecordSchema::parse("pid:u32").unwrap()).unwrap()
    }

    fn manager(linker: &Arc<FakeLinker>) -> AttachmentManager {
        let linker: Arc<dyn KernelLinker> = linker.clone();
        AttachmentManager::new(linker, ChannelConfig::default())
    }

    #[test]
    fn test_attach_allocates_channel() {
        let linker = Arc::new(FakeLinker::default());
        let manager = manager(&linker);

        let handle = manager.attach(descriptor("do_sys_openat2")).unwrap();

        assert!(handle.is_attached());
        assert!(manager.is_attached("do_sys_openat2"));
        assert_eq!(handle.channel().capacity(), kprobe_common::DEFAULT_CHANNEL_CAPACITY);
        assert_eq!(handle.channel().slot_size(), 4);
    }

    #[test]
    fn test_second_attach_fails_and_keeps_first() {
        let linker = Arc::new(FakeLinker::default());
        let manager = manager(&linker);

        let first = manager.attach(descriptor("do_sys_openat2")).unwrap();
        let second = manager.attach(descriptor("do_sys_openat2"));

        assert!(matches!(second, Err(AttachError::AlreadyAttached(s)) if s == "do_sys_openat2"));
        assert!(first.is_attached());
        assert!(!first.channel().is_closed());
        assert_eq!(linker.installed.lock().unwrap().len(), 1);
        assert!(linker.uninstalled.lock().unwrap().is_empty());
    }

    #[test]
    fn test_detach_is_idempotent() {
        let linker = Arc::new(FakeLinker::default());
        let manager = manager(&linker);

        let mut handle = manager.attach(descriptor("do_sys_openat2")).unwrap();
        manager.detach(&mut handle).unwrap();
        manager.detach(&mut handle).unwrap();
        drop(handle);

        assert_eq!(*linker.uninstalled.lock().unwrap(), vec![0]);
        assert!(!manager.is_attached("do_sys_openat2"));
    }

    #[test]
    fn test_drop_detaches() {
        let linker = Arc::new(FakeLinker::default());
        let manager = manager(&linker);

        let handle = manager.attach(descriptor("do_sys_openat2")).unwrap();
        assert_eq!(manager.attached_count(), 1);
        drop(handle);

        assert_eq!(manager.attached_count(), 0);
        assert_eq!(linker.uninstalled.lock().unwrap().len(), 1);

        // The symbol is free again
        let handle = manager.attach(descriptor("do_sys_openat2")).unwrap();
        assert_eq!(handle.link(), Some(1));
    }

    #[test]
    fn test_linker_errors_are_mapped() {
        let linker = Arc::new(FakeLinker::default());
        let manager = manager(&linker);
        assert!(matches!(
            manager.attach(descriptor("missing_fn")),
            Err(AttachError::SymbolNotFound(s)) if s == "missing_fn"
        ));
        assert!(!manager.is_attached("missing_fn"));

        let denied = Arc::new(FakeLinker {
            deny: true,
            ..Default::default()
        });
        let manager = self::manager(&denied);
        assert!(matches!(
            manager.attach(descriptor("do_sys_openat2")),
            Err(AttachError::Permission { .. })
        ));
        assert_eq!(manager.attached_count(), 0);
    }

    #[test]
    fn test_invalid_capacity_does_not_install() {
        let linker = Arc::new(FakeLinker::default());
        let dyn_linker: Arc<dyn KernelLinker> = linker.clone();
        let manager = AttachmentManager::new(
            dyn_linker,
            ChannelConfig {
                capacity: 300,
                slot_size: None,
            },
        );

        assert!(matches!(
            manager.attach(descriptor("do_sys_openat2")),
            Err(AttachError::Channel { .. })
        ));
        assert!(linker.installed.lock().unwrap().is_empty());
    }
}
