//! Five-tuple identifying a client flow

use crate::net::Protocol;
use std::fmt;
use std::net::SocketAddr;

/// Identity of a client flow: transport protocol, client address and server
/// address
///
/// Equality is structural over all three fields and is the sole identity of
/// an allocation. Addresses are optional because a decoded request may lack
/// them; the allocation manager rejects tuples that do.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash)]
pub struct FiveTuple {
    /// Transport protocol
    pub protocol: Protocol,
    /// Client-side address
    pub src_addr: Option<SocketAddr>,
    /// Server-side listening address
    pub dst_addr: Option<SocketAddr>,
}

impl FiveTuple {
    /// Create a tuple with both addresses present
    pub fn new(protocol: Protocol, src_addr: SocketAddr, dst_addr: SocketAddr) -> Self {
        FiveTuple {
            protocol,
            src_addr: Some(src_addr),
            dst_addr: Some(dst_addr),
        }
    }
}

struct MaybeAddr(Option<SocketAddr>);

impl fmt::Display for MaybeAddr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.0 {
            Some(addr) => write!(f, "{}", addr),
            None => f.write_str("<none>"),
        }
    }
}

impl fmt::Display for FiveTuple {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{} {}->{}",
            self.protocol,
            MaybeAddr(self.src_addr),
            MaybeAddr(self.dst_addr)
        )
    }
}
