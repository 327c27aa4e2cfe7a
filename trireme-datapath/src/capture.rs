use async_trait::async_trait;
use trireme_packet::Direction;

use crate::error::Result;

/// The verdict the datapath returns for one captured buffer. `Accept`
/// leaves the buffer untouched; `AcceptModified` tells the transport the
/// (possibly grown) prefix of `buf` is what should go out instead.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Verdict {
    Accept,
    AcceptModified,
    Drop,
}

/// Abstracts the packet-capture transport: either a netfilter userspace
/// queue attachment or a TUN device. The datapath does not care which; it
/// only needs `(buffer, mark, direction)` in and a verdict out.
#[async_trait]
pub trait CaptureTransport: Send {
    /// Blocks until the next packet is available, or returns `None` once
    /// the transport has been closed (e.g. by cancellation).
    async fn recv(&mut self) -> Option<(Vec<u8>, u32, Direction)>;

    /// Delivers the verdict for a previously received buffer. `buf` is the
    /// (possibly rewritten, possibly grown) packet bytes for `Accept` /
    /// `AcceptModified`; ignored for `Drop`.
    async fn send_verdict(&mut self, verdict: Verdict, buf: Vec<u8>) -> Result<()>;

    /// Releases any held kernel/OS resources. Called once during
    /// cancellation, after the last `recv` returns `None`.
    async fn close(&mut self);
}

/// An in-memory `CaptureTransport` for tests: a fixed queue of inbound
/// packets and a recording of the verdicts issued for them. Gated behind
/// the `test-support` feature (enabled by default under `cfg(test)` too)
/// so external integration tests can drive `Datapath::run` deterministically
/// without a real netfilter-queue or TUN attachment.
#[cfg(any(test, feature = "test-support"))]
pub mod testing {
    use super::*;
    use std::collections::VecDeque;

    pub struct ChannelTransport {
        pub inbound: VecDeque<(Vec<u8>, u32, Direction)>,
        pub verdicts: Vec<(Verdict, Vec<u8>)>,
        pub closed: bool,
    }

    impl ChannelTransport {
        pub fn new(packets: Vec<(Vec<u8>, u32, Direction)>) -> Self {
            ChannelTransport { inbound: packets.into(), verdicts: Vec::new(), closed: false }
        }
    }

    #[async_trait]
    impl CaptureTransport for ChannelTransport {
        async fn recv(&mut self) -> Option<(Vec<u8>, u32, Direction)> {
            self.inbound.pop_front()
        }

        async fn send_verdict(&mut self, verdict: Verdict, buf: Vec<u8>) -> Result<()> {
            self.verdicts.push((verdict, buf));
            Ok(())
        }

        async fn close(&mut self) {
            self.closed = true;
        }
    }
}
