pub mod codec;
pub mod crypto;
pub mod error;
pub mod hash;

pub use crypto::{verify, KeyPair, PublicKeyBytes, PUBLIC_KEY_BYTES, SECRET_KEY_BYTES, SIGNATURE_BYTES};
pub use error::CoreError;
pub use hash::Hash256;

pub type Result<T> = std::result::Result<T, CoreError>;
