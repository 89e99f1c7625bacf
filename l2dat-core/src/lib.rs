#![forbid(unsafe_code)]

pub mod error;

pub mod util {
    pub mod atomic;
}

pub mod config;

pub mod chronicle;
pub mod codec;
pub mod crypto;

pub mod task;
pub mod validate;

pub mod actions;

// Re-exports: stable API surface
pub use actions::{
    BatchReport, MassPack, MassRecrypt, MassUnpack, OpenDat, Registries, SaveDat, SaveTxt,
};
pub use chronicle::{Chronicle, DescriptorRegistry};
pub use codec::{DatCodec, Record, Value};
pub use config::Settings;
pub use crypto::{CipherChoice, CipherRegistry, DatCrypter};
pub use error::{DatError, Result};
pub use task::{Action, TaskEvent, TaskEvents, TaskObserver, TaskRunner, TaskStatus};
pub use validate::{ValidationResult, validate_data};
