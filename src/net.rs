use crate::traits::{InterfaceDirectory, InterfaceInfo};
use log::debug;

/// Host interfaces as reported by `getifaddrs`.
#[derive(Debug, Default, Clone, Copy)]
pub struct HostInterfaces;

impl InterfaceDirectory for HostInterfaces {
    fn lookup(&self, name: &str) -> Option<InterfaceInfo> {
        let all = match if_addrs::get_if_addrs() {
            Ok(list) => list,
            Err(e) => {
                debug!("[Net] getifaddrs failed: {}", e);
                return None;
            }
        };
        let addresses: Vec<_> = all
            .iter()
            .filter(|iface| iface.name == name)
            .map(|iface| iface.ip())
            .collect();

        // An interface without addresses never shows up in getifaddrs'
        // AF_INET/AF_INET6 entries; fall back to sysfs for presence.
        if addresses.is_empty() && !sysfs_has_interface(name) {
            return None;
        }
        Some(InterfaceInfo {
            name: name.to_string(),
            addresses,
        })
    }
}

fn sysfs_has_interface(name: &str) -> bool {
    !name.is_empty() && !name.contains('/') && std::path::Path::new("/sys/class/net").join(name).exists()
}

/// Non-loopback interface names, sorted.
pub fn list_interfaces() -> Vec<String> {
    let mut names: Vec<String> = match if_addrs::get_if_addrs() {
        Ok(list) => list
            .into_iter()
            .filter(|iface| !iface.is_loopback())
            .map(|iface| iface.name)
            .collect(),
        Err(e) => {
            debug!("[Net] getifaddrs failed: {}", e);
            Vec::new()
        }
    };
    names.sort();
    names.dedup();
    names
}
