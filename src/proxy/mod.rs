//! SOCKS5 front end feeding the tunnel pool.
//!
//! Parses CONNECT requests from local clients and hands them to a
//! [`RequestHandler`] (the connection pool).

pub mod socks5;

pub use socks5::{
    run_socks5_server, LocalReader, LocalStream, LocalWriter, RequestHandler, SocksRequest,
    TargetAddr,
};
