pub mod handler;
pub mod listener;
pub mod preamble;
pub mod sni;

pub use handler::{handle_connection, TLS_ALERT_UNRECOGNIZED_NAME};
pub use listener::ProxyListener;
pub use preamble::{read_preamble, Preamble};
pub use sni::parse_client_hello_sni;
