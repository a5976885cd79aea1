// Request description — immutable descriptors, their builder and wire encodings.

use std::collections::HashMap;

use serde_json::Value;

pub mod descriptor;
pub mod encoding;

pub use descriptor::{
    CachePolicy, MultipartForm, MultipartPart, ProgressFn, RequestBuilder, RequestDescriptor,
    RequestKind, ResultFormat,
};
pub use encoding::{ParameterEncoding, ResultEncoding};

pub type Headers = HashMap<String, String>;
pub type Params = HashMap<String, Value>;
