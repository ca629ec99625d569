use std::net::IpAddr;

/// Runs an external tool and returns its decoded stdout.
///
/// Returns `None` when the tool is missing, times out, or exits non-zero.
/// Callers treat that as "no data", never as a failure.
#[cfg_attr(test, mockall::automock)]
pub trait CommandRunner: Send + Sync {
    fn run(&self, program: &str, args: &[String]) -> Option<String>;
}

/// A network interface present on the host.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InterfaceInfo {
    pub name: String,
    pub addresses: Vec<IpAddr>,
}

/// Looks up host interfaces by name.
#[cfg_attr(test, mockall::automock)]
pub trait InterfaceDirectory: Send + Sync {
    fn lookup(&self, name: &str) -> Option<InterfaceInfo>;
}
