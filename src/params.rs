//! The parameter map a published `Request` carries, decoded from `PARAMS`
//! records.

use std::collections::HashMap;
use std::str;

use bytes::Bytes;

/// Name/value pairs decoded from a request's `PARAMS` stream.
///
/// Names and values are arbitrary byte strings; UTF-8 is never assumed.
/// `get_str` is a convenience for the common case where the web server sent
/// ASCII/UTF-8 CGI variable names such as `REQUEST_METHOD`.
#[derive(Debug, Clone, Default)]
pub struct Params {
    map: HashMap<Bytes, Bytes>,
}

impl Params {
    pub(crate) fn new(map: HashMap<Bytes, Bytes>) -> Self {
        Self { map }
    }

    /// Raw bytes of the value for `name`, if present.
    pub fn get(&self, name: &[u8]) -> Option<&[u8]> {
        self.map.get(name).map(|v| v.as_ref())
    }

    /// Value for `name` interpreted as UTF-8, if present and valid.
    pub fn get_str(&self, name: &str) -> Option<&str> {
        self.map.get(name.as_bytes()).and_then(|v| str::from_utf8(v).ok())
    }

    pub fn len(&self) -> usize {
        self.map.len()
    }

    pub fn is_empty(&self) -> bool {
        self.map.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&[u8], &[u8])> {
        self.map.iter().map(|(k, v)| (k.as_ref(), v.as_ref()))
    }
}
