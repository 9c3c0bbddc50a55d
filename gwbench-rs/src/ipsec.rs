//! IPsec stack selection and tunnel-count acceptance thresholds.
//!
//! Devices run one of two IPsec stacks depending on their kernel version,
//! and the two expose tunnel state through different commands with different
//! tolerated shortfalls from the expected tunnel count. The stack is
//! resolved once from the version string; everything downstream is
//! table-driven on the enum.

use std::fmt;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IpsecStack {
    /// Racoon/ISAKMP, used on 4.15 kernels.
    Racoon,
    /// strongSwan, used on 5.4 kernels.
    Strongswan,
}

impl IpsecStack {
    /// Resolves the stack from a kernel version string, or `None` for a
    /// version no known stack is associated with.
    pub fn from_kernel_version(version: &str) -> Option<IpsecStack> {
        if version.contains("4.15") {
            Some(IpsecStack::Racoon)
        } else if version.contains("5.4") {
            Some(IpsecStack::Strongswan)
        } else {
            None
        }
    }

    /// Shell command whose first line of output is the count of established
    /// site-to-cloud tunnels.
    pub fn count_command(&self) -> &'static str {
        match self {
            // Phase-2 security associations with a non-zero count.
            IpsecStack::Racoon => "sudo racoonctl -ll ss isakmp | grep -c '[^a-zA-Z][1-9] *$'",
            // Installed child security associations.
            IpsecStack::Strongswan => "sudo swanctl -l | grep -c INSTALL",
        }
    }

    /// Minimum established-tunnel count accepted for `expected` configured
    /// tunnels. Racoon requires 90% (rounded up); strongSwan tolerates two
    /// missing tunnels. The asymmetry is deliberate and matches observed
    /// convergence behavior of the two stacks.
    pub fn required_tunnels(&self, expected: u32) -> u32 {
        match self {
            IpsecStack::Racoon => (expected * 9).div_ceil(10),
            IpsecStack::Strongswan => expected.saturating_sub(2),
        }
    }
}

impl fmt::Display for IpsecStack {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            IpsecStack::Racoon => write!(f, "Racoon"),
            IpsecStack::Strongswan => write!(f, "strongSwan"),
        }
    }
}
