use std::fmt;

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};

/// Prefix of every type URL produced by [`Any::pack`].
pub const TYPE_URL_PREFIX: &str = "type.googleapis.com/";

/// A message type with a fully-qualified name.
pub trait Message: Serialize + DeserializeOwned {
    /// Fully-qualified message name, e.g. `connectrpc.conformance.v1.UnaryRequest`.
    const TYPE_NAME: &'static str;

    fn type_url() -> String {
        format!("{TYPE_URL_PREFIX}{}", Self::TYPE_NAME)
    }
}

/// A message packed together with its type URL.
///
/// The value is always the binary encoding of the message, regardless of the
/// codec used to carry the `Any` itself.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct Any {
    pub type_url: String,
    #[serde(with = "crate::bytes_serde")]
    pub value: Vec<u8>,
}

impl Any {
    pub fn pack<M: Message>(msg: &M) -> Result<Self, postcard::Error> {
        Ok(Any {
            type_url: M::type_url(),
            value: postcard::to_allocvec(msg)?,
        })
    }

    /// The message name part of the type URL (everything after the last `/`).
    pub fn type_name(&self) -> &str {
        match self.type_url.rfind('/') {
            Some(idx) => &self.type_url[idx + 1..],
            None => &self.type_url,
        }
    }

    pub fn is<M: Message>(&self) -> bool {
        self.type_name() == M::TYPE_NAME
    }

    pub fn unpack<M: Message>(&self) -> Result<M, UnpackError> {
        if !self.is::<M>() {
            return Err(UnpackError::TypeMismatch {
                expected: M::TYPE_NAME,
                actual: self.type_url.clone(),
            });
        }
        postcard::from_bytes(&self.value).map_err(UnpackError::Decode)
    }
}

/// Error unpacking an [`Any`].
#[derive(Debug)]
pub enum UnpackError {
    TypeMismatch {
        expected: &'static str,
        actual: String,
    },
    Decode(postcard::Error),
}

impl fmt::Display for UnpackError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            UnpackError::TypeMismatch { expected, actual } => {
                write!(f, "expected message {expected}, got type URL {actual:?}")
            }
            UnpackError::Decode(e) => write!(f, "decode message: {e}"),
        }
    }
}

impl std::error::Error for UnpackError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            UnpackError::Decode(e) => Some(e),
            UnpackError::TypeMismatch { .. } => None,
        }
    }
}
