mod addr;
mod creds;
mod decode;

pub use addr::{AddrError, DomainName, HostAddr, TargetAddr, ToTargetAddr};
pub use creds::{CredentialsError, UserId, UserPass};
pub use decode::{DecodeError, DecodeResult};
