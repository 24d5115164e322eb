//! In-memory stream used by protocol tests

#![allow(missing_docs)]

use std::{
    io::{self, Cursor, Read, Write},
    sync::{Arc, Mutex},
};

/// A bidirectional in-memory stream.
///
/// What the client writes is captured and can be taken out with
/// [`MockStream::take_written`]; what the "server" should reply is queued
/// with [`MockStream::push_read`]. Clones share the same buffers, so a test
/// can keep a handle while the client owns the stream.
#[derive(Clone, Debug, Default)]
pub struct MockStream {
    reader: Arc<Mutex<Cursor<Vec<u8>>>>,
    writer: Arc<Mutex<Cursor<Vec<u8>>>>,
}

impl MockStream {
    pub fn new() -> MockStream {
        MockStream::default()
    }

    /// Creates a stream that will serve `data` to the reader
    pub fn with_reply(data: &[u8]) -> MockStream {
        let stream = MockStream::new();
        stream.push_read(data);
        stream
    }

    /// Appends bytes to the pending server replies
    pub fn push_read(&self, data: &[u8]) {
        let mut cursor = self.reader.lock().unwrap();
        cursor.get_mut().extend_from_slice(data);
    }

    /// Takes everything the client has written so far
    pub fn take_written(&self) -> Vec<u8> {
        let mut cursor = self.writer.lock().unwrap();
        let bytes = cursor.get_ref().clone();
        cursor.set_position(0);
        cursor.get_mut().clear();
        bytes
    }
}

impl Read for MockStream {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        self.reader.lock().unwrap().read(buf)
    }
}

impl Write for MockStream {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        self.writer.lock().unwrap().write(buf)
    }

    fn flush(&mut self) -> io::Result<()> {
        self.writer.lock().unwrap().flush()
    }
}
