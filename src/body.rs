use std::fmt;

use bytes::Bytes;

/// A request body.
///
/// Bodies are buffered so a call can retry on a fresh connection: the
/// dispatch layer re-sends the same bytes after a refused stream or a
/// failed reused connection. Duplex semantics still hold — the engine may
/// hand back response headers before the body write completes.
#[derive(Clone, Default)]
pub struct Body {
    inner: Option<Bytes>,
}

impl Body {
    /// An empty body.
    pub fn empty() -> Body {
        Body { inner: None }
    }

    /// True if there is nothing to send.
    pub fn is_empty(&self) -> bool {
        self.inner.as_ref().map(|b| b.is_empty()).unwrap_or(true)
    }

    /// The body length in bytes.
    pub fn len(&self) -> u64 {
        self.inner.as_ref().map(|b| b.len() as u64).unwrap_or(0)
    }

    pub(crate) fn as_bytes(&self) -> Option<&Bytes> {
        self.inner.as_ref()
    }
}

impl From<Bytes> for Body {
    fn from(bytes: Bytes) -> Body {
        Body { inner: Some(bytes) }
    }
}

impl From<Vec<u8>> for Body {
    fn from(vec: Vec<u8>) -> Body {
        Body {
            inner: Some(vec.into()),
        }
    }
}

impl From<String> for Body {
    fn from(s: String) -> Body {
        Body {
            inner: Some(s.into()),
        }
    }
}

impl From<&'static str> for Body {
    fn from(s: &'static str) -> Body {
        Body {
            inner: Some(Bytes::from_static(s.as_bytes())),
        }
    }
}

impl fmt::Debug for Body {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Body").field("len", &self.len()).finish()
    }
}
