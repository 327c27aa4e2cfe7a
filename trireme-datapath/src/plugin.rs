use trireme_packet::Packet;

use crate::error::Result;
use crate::pu::PuContext;

/// A fixed capability trait for an optional packet-processor collaborator,
/// injected at `Datapath` construction. A missing plugin is simply `None`
/// held by the `Datapath`; there is no branch on "is this the right kind
/// of processor", only on presence.
pub trait PacketProcessor: Send + Sync {
    /// Called once, before the first packet, with the secrets/filter-queue
    /// configuration the plugin needs to set itself up.
    fn initialize(&self, validity_seconds: u64) -> Result<()>;

    /// Runs before the datapath's own handshake logic sees the packet.
    /// Returning `Err` aborts processing of this packet with that error;
    /// the plugin may also rewrite `packet` in place.
    fn pre_process(&self, packet: &mut Packet<'_>, pu: &PuContext) -> Result<()>;

    /// Runs after the datapath has reached a verdict, before the verdict is
    /// handed back to the capture transport.
    fn post_process(&self, packet: &mut Packet<'_>, pu: &PuContext) -> Result<()>;
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use trireme_packet::Direction;

    struct CountingProcessor {
        pre: AtomicUsize,
        post: AtomicUsize,
    }

    impl PacketProcessor for CountingProcessor {
        fn initialize(&self, _validity_seconds: u64) -> Result<()> {
            Ok(())
        }
        fn pre_process(&self, _packet: &mut Packet<'_>, _pu: &PuContext) -> Result<()> {
            self.pre.fetch_add(1, Ordering::Relaxed);
            Ok(())
        }
        fn post_process(&self, _packet: &mut Packet<'_>, _pu: &PuContext) -> Result<()> {
            self.post.fetch_add(1, Ordering::Relaxed);
            Ok(())
        }
    }

    #[test]
    fn plugin_hooks_are_invoked_independently() {
        use crate::pu::PuKind;
        let processor = CountingProcessor { pre: AtomicUsize::new(0), post: AtomicUsize::new(0) };
        let pu = PuContext::new("pu-1", None, PuKind::LinuxProcessPu);
        let mut buf = vec![0u8; 64];
        buf[0] = 0x45;
        buf[9] = 6;
        let mut packet = Packet::parse(&mut buf, Direction::AppOriginated).unwrap();

        processor.pre_process(&mut packet, &pu).unwrap();
        processor.post_process(&mut packet, &pu).unwrap();

        assert_eq!(processor.pre.load(Ordering::Relaxed), 1);
        assert_eq!(processor.post.load(Ordering::Relaxed), 1);
    }
}
