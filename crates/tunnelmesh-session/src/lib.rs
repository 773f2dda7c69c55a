//! Multiplexed WebSocket sessions
//!
//! A session carries many virtual connections over one WebSocket. Agents
//! dial a [`SessionServer`] with [`connect::dial`] and serve connect requests
//! with a [`ConnectHandler`]; the server dials through them with a
//! [`SessionDialer`]. Server instances link to each other as peers so that a
//! dial for an agent connected elsewhere is forwarded over the peer session.

pub mod config;
pub mod conn;
pub mod connect;
pub mod error;
pub mod server;
pub mod session;
pub mod tls;

pub use config::SessionConfig;
pub use conn::SessionConn;
pub use connect::dial;
pub use error::{SessionError, SessionResult};
pub use server::{
    Admission, AuthorizeError, Authorizer, PeerCredentials, SessionDialer, SessionServer,
};
pub use session::{AsyncIo, ConnectHandler, Session, TcpConnectHandler};
