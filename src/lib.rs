pub mod config;
pub mod error;
pub mod proxy;
pub mod tunnel;

pub use config::{Config, LogFormat};
pub use error::{PreambleError, TunnelError};
pub use proxy::{
    handle_connection, parse_client_hello_sni, read_preamble, Preamble, ProxyListener,
    TLS_ALERT_UNRECOGNIZED_NAME,
};
pub use tunnel::{
    derive_tunnel_hostname, CloudflaredSpawner, ManagerConfig, PortPool, TunnelManager,
    TunnelSpawner,
};
