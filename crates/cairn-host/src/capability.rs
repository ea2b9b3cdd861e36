//! Capability plugins — versioned sub-protocols layered over sessions.
//!
//! A capability registers once with the Host, then gets instantiated per
//! session with a contiguous packet-id range carved out above
//! [`USER_PACKET_BASE`]. Ranges are assigned in registration order, so both
//! sides of a connection that share the same registration set agree on the
//! numbering without negotiating it.
//!
//! The registry is deliberately not thread-safe: it is populated before
//! `Host::start()` and frozen into an `Arc` for the lifetime of the run.

use std::sync::Arc;

use cairn_core::wire::{CapDesc, CapTag, USER_PACKET_BASE};

use crate::session::Session;

/// A protocol module bindable onto sessions.
pub trait Capability: Send + Sync {
    /// Three-byte ASCII protocol tag, e.g. `b"chn"`.
    fn static_name(&self) -> CapTag;

    /// Protocol version under that tag.
    fn static_version(&self) -> u8;

    /// How many packet ids this capability consumes per session.
    fn message_count(&self) -> u8;

    /// Called once when the Host starts.
    fn on_starting(&self) {}

    /// Called once while the Host drains.
    fn on_stopping(&self) {}

    /// Instantiate the per-session half. `base_packet` is the first packet
    /// id assigned to this capability on this session.
    fn new_session_capability(
        &self,
        session: &Arc<Session>,
        base_packet: u8,
    ) -> Box<dyn SessionCapability>;
}

/// Per-session capability instance. Packets are delivered with ids relative
/// to the capability's base.
pub trait SessionCapability: Send + Sync {
    fn on_packet(&self, packet: u8, payload: &[u8]);
}

/// A capability bound onto one session, with its assigned id range.
pub struct BoundCapability {
    pub desc: CapDesc,
    pub base_packet: u8,
    pub message_count: u8,
    pub handler: Box<dyn SessionCapability>,
}

impl BoundCapability {
    pub fn owns(&self, packet: u8) -> bool {
        packet >= self.base_packet && (packet - self.base_packet) < self.message_count
    }
}

/// Registration-ordered set of capabilities.
#[derive(Default, Clone)]
pub struct CapabilityRegistry {
    entries: Vec<(CapDesc, Arc<dyn Capability>)>,
}

impl CapabilityRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a capability under `(static_name, static_version)`.
    /// Re-registering the same descriptor replaces the plugin in place,
    /// keeping its original position in the order.
    pub fn register(&mut self, capability: Arc<dyn Capability>) -> Arc<dyn Capability> {
        let desc = CapDesc::new(capability.static_name(), capability.static_version());
        if let Some(slot) = self.entries.iter_mut().find(|(d, _)| *d == desc) {
            slot.1 = capability.clone();
        } else {
            self.entries.push((desc, capability.clone()));
        }
        capability
    }

    pub fn have(&self, desc: &CapDesc) -> bool {
        self.entries.iter().any(|(d, _)| d == desc)
    }

    /// Descriptors in registration order.
    pub fn descs(&self) -> Vec<CapDesc> {
        self.entries.iter().map(|(d, _)| *d).collect()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn on_starting(&self) {
        for (_, capability) in &self.entries {
            capability.on_starting();
        }
    }

    pub fn on_stopping(&self) {
        for (_, capability) in &self.entries {
            capability.on_stopping();
        }
    }

    /// Instantiate every capability both sides support, walking registrations
    /// in insertion order and handing out packet-id ranges from
    /// [`USER_PACKET_BASE`] upward.
    pub fn bind(&self, session: &Arc<Session>, remote: &[CapDesc]) -> Vec<BoundCapability> {
        let mut base = USER_PACKET_BASE;
        let mut bound = Vec::new();
        for (desc, capability) in &self.entries {
            if !remote.contains(desc) {
                continue;
            }
            let handler = capability.new_session_capability(session, base);
            bound.push(BoundCapability {
                desc: *desc,
                base_packet: base,
                message_count: capability.message_count(),
                handler,
            });
            base = base.saturating_add(capability.message_count());
        }
        bound
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};

    struct CountingCap {
        tag: CapTag,
        version: u8,
        messages: u8,
        started: AtomicU32,
        stopped: AtomicU32,
    }

    impl CountingCap {
        fn new(tag: CapTag, version: u8, messages: u8) -> Arc<Self> {
            Arc::new(Self {
                tag,
                version,
                messages,
                started: AtomicU32::new(0),
                stopped: AtomicU32::new(0),
            })
        }
    }

    struct NopSessionCap;

    impl SessionCapability for NopSessionCap {
        fn on_packet(&self, _packet: u8, _payload: &[u8]) {}
    }

    impl Capability for CountingCap {
        fn static_name(&self) -> CapTag {
            self.tag
        }
        fn static_version(&self) -> u8 {
            self.version
        }
        fn message_count(&self) -> u8 {
            self.messages
        }
        fn on_starting(&self) {
            self.started.fetch_add(1, Ordering::Relaxed);
        }
        fn on_stopping(&self) {
            self.stopped.fetch_add(1, Ordering::Relaxed);
        }
        fn new_session_capability(
            &self,
            _session: &Arc<Session>,
            _base_packet: u8,
        ) -> Box<dyn SessionCapability> {
            Box::new(NopSessionCap)
        }
    }

    #[test]
    fn ranges_follow_registration_order() {
        let mut registry = CapabilityRegistry::new();
        registry.register(CountingCap::new(*b"aaa", 1, 8));
        registry.register(CountingCap::new(*b"bbb", 2, 3));
        registry.register(CountingCap::new(*b"ccc", 1, 5));

        let session = Session::detached();
        let remote = registry.descs();
        let bound = registry.bind(&session, &remote);

        assert_eq!(bound.len(), 3);
        assert_eq!(bound[0].base_packet, USER_PACKET_BASE);
        assert_eq!(bound[1].base_packet, USER_PACKET_BASE + 8);
        assert_eq!(bound[2].base_packet, USER_PACKET_BASE + 11);
    }

    #[test]
    fn unshared_capabilities_are_skipped_without_consuming_ids() {
        let mut registry = CapabilityRegistry::new();
        registry.register(CountingCap::new(*b"aaa", 1, 8));
        registry.register(CountingCap::new(*b"bbb", 2, 3));

        let session = Session::detached();
        // remote only speaks bbb/2
        let bound = registry.bind(&session, &[CapDesc::new(*b"bbb", 2)]);

        assert_eq!(bound.len(), 1);
        assert_eq!(bound[0].desc, CapDesc::new(*b"bbb", 2));
        assert_eq!(bound[0].base_packet, USER_PACKET_BASE);
    }

    #[test]
    fn packet_range_ownership() {
        let bound = BoundCapability {
            desc: CapDesc::new(*b"aaa", 1),
            base_packet: 0x10,
            message_count: 4,
            handler: Box::new(NopSessionCap),
        };
        assert!(!bound.owns(0x0f));
        assert!(bound.owns(0x10));
        assert!(bound.owns(0x13));
        assert!(!bound.owns(0x14));
    }

    #[test]
    fn reregistration_replaces_in_place() {
        let mut registry = CapabilityRegistry::new();
        registry.register(CountingCap::new(*b"aaa", 1, 8));
        registry.register(CountingCap::new(*b"bbb", 1, 2));
        registry.register(CountingCap::new(*b"aaa", 1, 4));

        let descs = registry.descs();
        assert_eq!(descs.len(), 2);
        assert_eq!(descs[0], CapDesc::new(*b"aaa", 1));

        let session = Session::detached();
        let bound = registry.bind(&session, &descs);
        // replacement's message_count (4) is in effect
        assert_eq!(bound[1].base_packet, USER_PACKET_BASE + 4);
    }

    #[test]
    fn lifecycle_hooks_reach_every_capability() {
        let mut registry = CapabilityRegistry::new();
        let a = CountingCap::new(*b"aaa", 1, 1);
        let b = CountingCap::new(*b"bbb", 1, 1);
        registry.register(a.clone());
        registry.register(b.clone());

        registry.on_starting();
        registry.on_stopping();
        assert_eq!(a.started.load(Ordering::Relaxed), 1);
        assert_eq!(b.stopped.load(Ordering::Relaxed), 1);
    }
}
