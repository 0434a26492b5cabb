// vim: tw=80
//! Array configuration, supplied once at activation time

use serde_derive::{Deserialize, Serialize};

use crate::{
    disk_queue::Discipline,
    raid::{codec::EVENODD_P, SchemeKind},
    types::*,
};

fn default_sectors_per_su() -> SectorT {
    8
}

fn default_bytes_per_sector() -> usize {
    512
}

fn default_depth() -> u32 {
    4
}

fn default_floating_buffers() -> usize {
    4
}

fn default_bufs_to_accumulate() -> usize {
    1
}

/// Disk queue settings
#[derive(Clone, Copy, Debug, Deserialize, Eq, PartialEq, Serialize)]
#[serde(deny_unknown_fields)]
pub struct QueueConfig {
    #[serde(default)]
    pub discipline: Discipline,
    /// Max requests simultaneously issued to one disk's transport
    #[serde(default = "default_depth")]
    pub depth: u32,
}

impl Default for QueueConfig {
    fn default() -> Self {
        QueueConfig {
            discipline: Discipline::default(),
            depth: default_depth()
        }
    }
}

/// Reconstruction buffer pool settings
#[derive(Clone, Copy, Debug, Deserialize, Eq, PartialEq, Serialize)]
#[serde(deny_unknown_fields)]
pub struct ReconConfig {
    /// Number of pool-shared buffers
    #[serde(default = "default_floating_buffers")]
    pub floating_buffers: usize,
    /// How many contributions may wait before they're combined in one pass
    #[serde(default = "default_bufs_to_accumulate")]
    pub bufs_to_accumulate: usize,
}

impl Default for ReconConfig {
    fn default() -> Self {
        ReconConfig {
            floating_buffers: default_floating_buffers(),
            bufs_to_accumulate: default_bufs_to_accumulate()
        }
    }
}

/// Static description of an array.
///
/// Usually deserialized from YAML, like this:
/// ```yaml
/// scheme: evenodd
/// disks: 5
/// sectors_per_disk: 65536
/// sectors_per_su: 8
/// queue:
///   discipline: sstf
/// ```
#[derive(Clone, Debug, Deserialize, Eq, PartialEq, Serialize)]
#[serde(deny_unknown_fields)]
pub struct ArrayConfig {
    pub scheme: SchemeKind,
    /// Number of member disks
    pub disks: DiskT,
    /// Usable sectors on each member disk
    pub sectors_per_disk: SectorT,
    /// Stripe unit size, in sectors
    #[serde(default = "default_sectors_per_su")]
    pub sectors_per_su: SectorT,
    #[serde(default = "default_bytes_per_sector")]
    pub bytes_per_sector: usize,
    #[serde(default)]
    pub queue: QueueConfig,
    #[serde(default)]
    pub recon: ReconConfig,
}

impl ArrayConfig {
    pub fn new(scheme: SchemeKind, disks: DiskT, sectors_per_disk: SectorT)
        -> Self
    {
        ArrayConfig {
            scheme,
            disks,
            sectors_per_disk,
            sectors_per_su: default_sectors_per_su(),
            bytes_per_sector: default_bytes_per_sector(),
            queue: QueueConfig::default(),
            recon: ReconConfig::default(),
        }
    }

    /// Parse and validate a YAML array description
    pub fn from_yaml(s: &str) -> Result<Self> {
        let config: ArrayConfig = serde_yaml_ng::from_str(s)
            .map_err(|e| {
                tracing::error!("Cannot parse array configuration: {}", e);
                Error::EINVAL
            })?;
        config.validate()?;
        Ok(config)
    }

    pub fn to_yaml(&self) -> Result<String> {
        serde_yaml_ng::to_string(self)
            .map_err(|e| {
                tracing::error!("Cannot serialize array configuration: {}", e);
                Error::EINVAL
            })
    }

    pub fn bytes_per_su(&self) -> usize {
        self.sectors_per_su as usize * self.bytes_per_sector
    }

    /// Reject geometry that no redundancy scheme could use
    pub fn validate(&self) -> Result<()> {
        let bad = |why: &str| {
            tracing::error!("Invalid array configuration: {}", why);
            Err(Error::EINVAL)
        };
        if self.bytes_per_sector == 0 || self.sectors_per_su == 0 {
            return bad("zero-sized sectors or stripe units");
        }
        if self.sectors_per_disk < self.sectors_per_su {
            return bad("disks are smaller than one stripe unit");
        }
        if self.queue.depth == 0 {
            return bad("queue depth must be at least 1");
        }
        if self.recon.bufs_to_accumulate == 0 {
            return bad("bufs_to_accumulate must be at least 1");
        }
        match self.scheme {
            SchemeKind::Mirror => {
                if self.disks < 2 || self.disks % 2 != 0 {
                    return bad("mirrors need an even number of disks");
                }
            }
            SchemeKind::EvenOdd => {
                if self.disks < 4 || usize::from(self.disks) > EVENODD_P + 2 {
                    return bad("evenodd needs between 4 and 19 disks");
                }
                if self.bytes_per_su() % (EVENODD_P - 1) != 0 {
                    return bad("evenodd stripe units must be a multiple of 16 bytes");
                }
            }
        }
        Ok(())
    }
}
