#![forbid(unsafe_code)]

mod checksum;
mod error;
mod packet;

pub use error::{ParseError, Result};
pub use packet::{
    Direction, FiveTuple, IpProto, Packet, TcpFlags, MAX_TCP_HEADER, MIN_IPV4_HEADER, MIN_TCP_HEADER,
    TOKEN_OPTION_KIND, UDP_HEADER,
};
