#![forbid(unsafe_code)]

//! The SMC key-value store: typed values behind read/write hooks, sorted
//! public/hidden partitions, plugin override with lock-free resolution,
//! single-use privilege unlock and the save/restore blob.
//!
//! The protocol engines in `vsmc-device` sit on top of this crate and only
//! ever speak [`SmcResult`](vsmc_types::SmcResult) codes; Rust errors here
//! are construction-time problems.

mod clock;
mod snapshot;
mod store;
mod value;

pub use clock::{Clock, ManualClock, SystemClock};
pub use snapshot::{SnapshotError, SNAPSHOT_MAGIC};
pub use store::{
    KeyDef, KeyInfo, Keystore, KeystoreCallbacks, KeystoreConfig, KeystoreError, PluginDef,
    RegisterError, ValueBytes, MAX_PLUGINS,
};
pub use value::{
    BufferValue, KeyBacking, NoWatchdog, ValueMeta, WatchdogSink, UNLOCK_PASSWORD_V1,
    UNLOCK_PASSWORD_V2,
};
