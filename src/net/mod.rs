//! Concrete transports: in-memory pipes and TCP.

mod io_conn;
pub mod pipe;
pub mod tcp;

pub use io_conn::IoConn;
pub use pipe::{pipe, ConnHub, HubDialer, HubListener, PipeConn, PipePair};
pub use tcp::{TcpDialer, TcpListener};
