// vim: tw=80
//! Common type definitions used throughout raidcore

use divbuf::{DivBuf, DivBufMut};
use enum_primitive_derive::Primitive;
use num_traits::{FromPrimitive, ToPrimitive};
use serde_derive::{Deserialize, Serialize};
use thiserror::Error;
use std::io;

/// Indexes a member disk within the array.
pub type DiskT = u16;

/// Indexes a sector on a member disk, or a logical sector of the array.
pub type SectorT = u64;

/// Parity Stripe Identifier.  Names one redundancy group.
pub type PsidT = u64;

/// Our `IoVec`.  Unlike the standard library's, ours is reference-counted so it
/// can have more than one owner.
pub type IoVec = DivBuf;

/// Mutable version of `IoVec`.  Uniquely owned.
pub type IoVecMut = DivBufMut;

/// raidcore's error type.  Basically just an errno, plus a few conditions that
/// have no errno of their own.
#[derive(Clone, Copy, Debug, Deserialize, Error, Eq, PartialEq, Primitive, Serialize)]
pub enum Error {
    // Standard errnos
    #[error("Input/output error")]
    EIO             = libc::EIO as isize,
    #[error("Device not configured")]
    ENXIO           = libc::ENXIO as isize,
    #[error("Device busy")]
    EBUSY           = libc::EBUSY as isize,
    #[error("File exists")]
    EEXIST          = libc::EEXIST as isize,
    #[error("Invalid argument")]
    EINVAL          = libc::EINVAL as isize,
    #[error("No space left on device")]
    ENOSPC          = libc::ENOSPC as isize,
    #[error("Broken pipe")]
    EPIPE           = libc::EPIPE as isize,
    #[error("Operation canceled")]
    ECANCELED       = libc::ECANCELED as isize,

    // Codes that are not errnos
    #[error("Unknown error")]
    EUNKNOWN        = 256,
    /// More member disks are down than the redundancy scheme tolerates
    #[error("Fault tolerance exceeded")]
    ETOOMANYFAULTS  = 257,
    /// An internal invariant was violated
    #[error("Programming error")]
    EDOOFUS         = 258,
}

impl From<io::Error> for Error {
    fn from(e: io::Error) -> Self {
        e.raw_os_error()
            .and_then(Error::from_i32)
            .unwrap_or(Error::EUNKNOWN)
    }
}

impl From<Error> for i32 {
    fn from(e: Error) -> Self {
        // Every discriminant fits in an i32
        e.to_i32().unwrap_or(libc::EIO)
    }
}

pub type Result<T> = ::std::result::Result<T, Error>;
