pub mod addr;
pub mod socks4;
pub mod socks5;

pub use socks4::{Socks4Acceptor, Socks4ClientCodec, Socks4ServerCodec};
pub use socks5::{Socks5Acceptor, Socks5AcceptorConfig};
