pub mod hostname;
pub mod manager;
pub mod port_pool;

pub use hostname::derive_tunnel_hostname;
pub use manager::{CloudflaredSpawner, ManagerConfig, TunnelManager, TunnelSpawner};
pub use port_pool::PortPool;
