//! Network interface configuration.
//!
//! Brings up an attached interface with the address and MTU the host
//! staged. Loopback is the kernel's business; anything else arrives via
//! `ConfigureInterface`.

use silo_shared::config::Interface;
use silo_shared::{SiloError, SiloResult};
use tracing::debug;

#[cfg(target_os = "linux")]
pub(crate) async fn configure(interface: &Interface, privileged: bool) -> SiloResult<()> {
    use futures::TryStreamExt;

    if !privileged {
        debug!(name = %interface.name, "skipping interface configuration (embedded)");
        return Ok(());
    }

    let (address, prefix) = parse_cidr(&interface.address)?;

    let (connection, handle, _) = rtnetlink::new_connection()
        .map_err(|e| SiloError::Io(format!("netlink connection failed: {}", e)))?;
    tokio::spawn(connection);

    let link = handle
        .link()
        .get()
        .match_name(interface.name.clone())
        .execute()
        .try_next()
        .await
        .map_err(|e| SiloError::Io(format!("link lookup failed: {}", e)))?
        .ok_or_else(|| SiloError::NotFound(format!("interface {}", interface.name)))?;
    let index = link.header.index;

    handle
        .address()
        .add(index, address, prefix)
        .execute()
        .await
        .map_err(|e| {
            SiloError::Io(format!(
                "failed to add {} to {}: {}",
                interface.address, interface.name, e
            ))
        })?;

    let mut set = handle.link().set(index).up();
    if let Some(mtu) = interface.mtu {
        set = set.mtu(mtu);
    }
    set.execute()
        .await
        .map_err(|e| SiloError::Io(format!("failed to bring {} up: {}", interface.name, e)))?;

    debug!(name = %interface.name, address = %interface.address, "configured interface");
    Ok(())
}

#[cfg(not(target_os = "linux"))]
pub(crate) async fn configure(interface: &Interface, _privileged: bool) -> SiloResult<()> {
    debug!(name = %interface.name, "interface configuration requires linux");
    Ok(())
}

#[allow(dead_code)]
fn parse_cidr(address: &str) -> SiloResult<(std::net::IpAddr, u8)> {
    let (ip, prefix) = address.split_once('/').ok_or_else(|| {
        SiloError::InvalidArgument(format!("address {} is not CIDR", address))
    })?;
    let ip = ip
        .parse()
        .map_err(|e| SiloError::InvalidArgument(format!("bad address {}: {}", address, e)))?;
    let prefix = prefix
        .parse()
        .map_err(|e| SiloError::InvalidArgument(format!("bad prefix {}: {}", address, e)))?;
    Ok((ip, prefix))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_cidr() {
        let (ip, prefix) = parse_cidr("192.168.64.2/24").unwrap();
        assert_eq!(ip, "192.168.64.2".parse::<std::net::IpAddr>().unwrap());
        assert_eq!(prefix, 24);
    }

    #[test]
    fn test_parse_cidr_rejects_bare_address() {
        assert!(parse_cidr("192.168.64.2").is_err());
    }
}
