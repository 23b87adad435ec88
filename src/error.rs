// Copyright (c) 2022 by Rivos Inc.
// Licensed under the Apache License, Version 2.0, see LICENSE for details.
// SPDX-License-Identifier: Apache-2.0

use arm_page_tables::PageTableError;
use page_tracking::{MemMapError, PoolError};
use thiserror::Error;

/// Errors returned by the ownership operations. Each one maps onto the errno the hypercall ABI
/// reports back to the caller.
#[derive(Clone, Copy, Debug, Error, PartialEq, Eq)]
pub enum Error {
    #[error("operation not permitted")]
    PermissionDenied,
    #[error("invalid argument")]
    InvalidArgument,
    #[error("out of page-table pages")]
    OutOfMemory,
    #[error("resource busy")]
    Busy,
    #[error("no such entry")]
    NotFound,
    #[error("page not mapped by the caller")]
    Fault,
    #[error("request spans more than the caller can pay for")]
    TooBig,
    #[error("already exists")]
    Exists,
    #[error("try again")]
    Again,
}

pub type Result<T> = core::result::Result<T, Error>;

impl Error {
    /// Returns the negative errno reported to the caller of the hypercall.
    pub fn to_errno(&self) -> i64 {
        match self {
            Error::PermissionDenied => -1,
            Error::NotFound => -2,
            Error::TooBig => -7,
            Error::Again => -11,
            Error::OutOfMemory => -12,
            Error::Fault => -14,
            Error::Busy => -16,
            Error::Exists => -17,
            Error::InvalidArgument => -22,
        }
    }
}

impl From<PageTableError> for Error {
    fn from(e: PageTableError) -> Self {
        match e {
            PageTableError::InsufficientPtePages => Error::OutOfMemory,
            PageTableError::NotMapped => Error::Again,
            PageTableError::OutOfBounds
            | PageTableError::Misaligned
            | PageTableError::InvalidIaBits => Error::InvalidArgument,
        }
    }
}

impl From<MemMapError> for Error {
    fn from(e: MemMapError) -> Self {
        match e {
            MemMapError::RangeNotAllowed => Error::PermissionDenied,
            _ => Error::InvalidArgument,
        }
    }
}

impl From<PoolError> for Error {
    fn from(_: PoolError) -> Self {
        Error::InvalidArgument
    }
}

/// Logs a warning if `cond` holds and evaluates to `cond`. Used for states that should be
/// impossible but that the caller can still recover from.
#[macro_export]
macro_rules! warn_on {
    ($cond:expr) => {{
        let cond: bool = $cond;
        if cond {
            log::warn!(
                "WARN_ON({}) at {}:{}",
                stringify!($cond),
                file!(),
                line!()
            );
        }
        cond
    }};
}

/// Logs a warning if `res` is an error and evaluates to `res`. Used for mutations that can't fail
/// once both ends of a transition have been checked.
#[macro_export]
macro_rules! warn_on_err {
    ($res:expr) => {{
        let res = $res;
        if let Err(ref e) = res {
            log::warn!(
                "{} failed with {:?} at {}:{}",
                stringify!($res),
                e,
                file!(),
                line!()
            );
        }
        res
    }};
}
