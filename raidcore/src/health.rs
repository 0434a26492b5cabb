// vim: tw=80
//! Health reporting for arrays and their member disks

use serde_derive::{Deserialize, Serialize};
use std::{fmt, num::NonZeroU8};

/// The ordering reflects which Health is "sicker".  That is, a degraded array
/// is sicker than an online one, a doubly-degraded array is sicker than a
/// singly-degraded one, etc.
#[derive(Clone, Copy, Debug, Deserialize, Eq, PartialEq, PartialOrd, Ord, Serialize)]
pub enum Health {
    /// Perfectly healthy
    Online,
    /// Operating with reduced redundancy
    Degraded(NonZeroU8),
    /// Rebuild in progress.  The rebuilding disk's contents are only partially
    /// valid.
    Rebuilding,
    /// More members are missing than the redundancy scheme tolerates.  No I/O
    /// is possible
    Faulted,
}

impl Health {
    /// If this array is degraded, how many levels of redundancy is it missing?
    pub fn as_degraded(self) -> Option<NonZeroU8> {
        if let Health::Degraded(d) = self {
            Some(d)
        } else {
            None
        }
    }

    /// Classify an array from its count of failed members
    pub fn from_failures(nfailed: usize, tolerance: usize) -> Self {
        if nfailed > tolerance {
            Health::Faulted
        } else {
            u8::try_from(nfailed).ok()
                .and_then(NonZeroU8::new)
                .map(Health::Degraded)
                .unwrap_or(Health::Online)
        }
    }
}

impl fmt::Display for Health {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match *self {
            Self::Online => "Online".fmt(f),
            Self::Degraded(n) => write!(f, "Degraded({})", n),
            Self::Rebuilding => "Rebuilding".fmt(f),
            Self::Faulted => "Faulted".fmt(f),
        }
    }
}

#[cfg(test)]
mod t {
    use super::*;

    fn nz(n: u8) -> NonZeroU8 {
        NonZeroU8::new(n).unwrap()
    }

    #[test]
    fn health_cmp() {
        assert!(Health::Online < Health::Degraded(nz(1)));
        assert!(Health::Degraded(nz(1)) < Health::Degraded(nz(2)));
        assert!(Health::Degraded(nz(2)) < Health::Rebuilding);
        assert!(Health::Rebuilding < Health::Faulted);
    }

    #[test]
    fn from_failures() {
        assert_eq!(Health::from_failures(0, 2), Health::Online);
        assert_eq!(Health::from_failures(2, 2), Health::Degraded(nz(2)));
        assert_eq!(Health::from_failures(2, 1), Health::Faulted);
    }

    #[test]
    fn display() {
        assert_eq!(Health::Degraded(nz(1)).to_string(), "Degraded(1)");
        assert_eq!(Health::Faulted.to_string(), "Faulted");
    }
}
