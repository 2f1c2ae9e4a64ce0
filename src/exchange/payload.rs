use crate::Error;
use serde::Serialize;

pub(crate) const TEXT_PLAIN: &str = "text/plain";
const APPLICATION_JSON: &str = "application/json";
const OCTET_STREAM: &str = "application/octet-stream";

/// The body of a message, along with its content type.
///
/// Strings and numbers are sent as `text/plain`, raw bytes as `application/octet-stream`;
/// [`Payload::json`] encodes any serializable value as `application/json`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Payload {
    bytes: Vec<u8>,
    content_type: &'static str,
}

impl Payload {
    pub fn json<T: Serialize + ?Sized>(value: &T) -> Result<Self, Error> {
        Ok(Self {
            bytes: serde_json::to_vec(value).map_err(Error::Encoding)?,
            content_type: APPLICATION_JSON,
        })
    }

    pub fn bytes(&self) -> &[u8] {
        &self.bytes
    }

    pub fn content_type(&self) -> &str {
        self.content_type
    }

    pub fn into_bytes(self) -> Vec<u8> {
        self.bytes
    }

    fn text(text: String) -> Self {
        Self {
            bytes: text.into_bytes(),
            content_type: TEXT_PLAIN,
        }
    }
}

impl From<String> for Payload {
    fn from(text: String) -> Self {
        Self::text(text)
    }
}

impl From<&str> for Payload {
    fn from(text: &str) -> Self {
        Self::text(text.to_owned())
    }
}

impl From<&String> for Payload {
    fn from(text: &String) -> Self {
        Self::text(text.clone())
    }
}

impl From<Vec<u8>> for Payload {
    fn from(bytes: Vec<u8>) -> Self {
        Self {
            bytes,
            content_type: OCTET_STREAM,
        }
    }
}

impl From<&[u8]> for Payload {
    fn from(bytes: &[u8]) -> Self {
        bytes.to_vec().into()
    }
}

macro_rules! text_payload {
    ($($number:ty),*) => {
        $(
            impl From<$number> for Payload {
                fn from(number: $number) -> Self {
                    Self::text(number.to_string())
                }
            }
        )*
    };
}

text_payload!(i32, i64, u32, u64, usize, f64, bool);
