use std::net::{IpAddr, Ipv4Addr, Ipv6Addr, SocketAddr};

use gangway_types::*;
use proptest::array::{uniform4, uniform8};
use proptest::prelude::*;

pub fn port() -> impl Strategy<Value = u16> {
    1..=u16::MAX
}

pub fn ipv4_addr() -> impl Strategy<Value = Ipv4Addr> {
    uniform4(any::<u8>()).prop_map(Ipv4Addr::from)
}

pub fn ipv6_addr() -> impl Strategy<Value = Ipv6Addr> {
    uniform8(any::<u16>()).prop_map(Ipv6Addr::from)
}

pub fn ip_addr() -> impl Strategy<Value = IpAddr> {
    prop_oneof![ipv4_addr().prop_map(IpAddr::from), ipv6_addr().prop_map(IpAddr::from)]
}

pub fn socket_addr() -> impl Strategy<Value = SocketAddr> {
    (ip_addr(), port()).prop_map(|(ip, port)| SocketAddr::new(ip, port))
}

pub fn domain_name() -> impl Strategy<Value = DomainName> {
    "[a-z][a-z0-9-]{0,10}\\.[a-z]{2,5}".prop_map(|name| DomainName::new(name).expect("generated domain is valid"))
}

pub fn domain_addr() -> impl Strategy<Value = (DomainName, u16)> {
    (domain_name(), port())
}

pub fn target_addr() -> impl Strategy<Value = TargetAddr> {
    prop_oneof![
        socket_addr().prop_map(TargetAddr::Ip),
        domain_addr().prop_map(|(host, port)| TargetAddr::Domain(host, port))
    ]
}

pub fn host_addr() -> impl Strategy<Value = HostAddr> {
    prop_oneof![
        ipv4_addr().prop_map(HostAddr::Ipv4),
        ipv6_addr().prop_map(HostAddr::Ipv6),
        domain_name().prop_map(HostAddr::Domain),
    ]
}

pub fn status_code() -> impl Strategy<Value = u16> {
    100..=599u16
}

pub fn user_id() -> impl Strategy<Value = UserId> {
    "[a-zA-Z0-9]{0,16}".prop_map(|id| UserId::new(id).expect("generated user-id is valid"))
}

pub fn user_pass() -> impl Strategy<Value = UserPass> {
    ("[a-zA-Z0-9]{1,16}", "[ -~]{1,16}")
        .prop_map(|(user, pass)| UserPass::new(user, pass).expect("generated credentials are valid"))
}
