// SPDX-License-Identifier: MPL-2.0

mod mutex;
mod rwlock;
mod spin;
mod wait;

pub use self::{
    mutex::{Mutex, MutexGuard},
    rwlock::{RwLock, RwLockReadGuard, RwLockUpgradeableGuard, RwLockWriteGuard},
    spin::{SpinLock, SpinLockGuard},
    wait::WaitQueue,
};
