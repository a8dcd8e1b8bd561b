//! Raw-block output buffers
//!
//! A raw block is a pluggable output buffer with its own append semantics.
//! The serializer opens one per `#raw` scope and for embedded raw inlines;
//! on scope close the buffer's contents join the enclosing buffer.

use std::sync::Arc;

/// A pluggable output buffer.
pub trait RawBlock: Send {
    fn append(&mut self, bytes: &[u8]);

    /// Drain the buffered output.
    fn take(&mut self) -> Vec<u8>;
}

/// The default pass-through buffer.
#[derive(Default)]
pub struct PlainRaw {
    buffer: Vec<u8>,
}

impl RawBlock for PlainRaw {
    fn append(&mut self, bytes: &[u8]) {
        self.buffer.extend_from_slice(bytes);
    }

    fn take(&mut self) -> Vec<u8> {
        std::mem::take(&mut self.buffer)
    }
}

type MakeFn = dyn Fn() -> Box<dyn RawBlock> + Send + Sync;

/// A registered raw-block entity.
#[derive(Clone)]
pub struct RawFactory {
    pub name: String,
    make: Arc<MakeFn>,
}

impl RawFactory {
    pub fn new<F>(name: impl Into<String>, make: F) -> Self
    where
        F: Fn() -> Box<dyn RawBlock> + Send + Sync + 'static,
    {
        Self {
            name: name.into(),
            make: Arc::new(make),
        }
    }

    pub fn open(&self) -> Box<dyn RawBlock> {
        (self.make)()
    }
}

/// Name of the default buffer every engine carries.
pub const DEFAULT_RAW: &str = "raw";

pub fn builtin_raws() -> Vec<RawFactory> {
    vec![RawFactory::new(DEFAULT_RAW, || Box::<PlainRaw>::default())]
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_plain_raw_round_trip() {
        let factory = builtin_raws().into_iter().next().unwrap();
        assert_eq!(factory.name, DEFAULT_RAW);
        let mut buffer = factory.open();
        buffer.append(b"one ");
        buffer.append(b"two");
        assert_eq!(buffer.take(), b"one two");
        assert!(buffer.take().is_empty());
    }
}
