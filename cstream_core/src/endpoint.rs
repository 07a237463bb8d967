use std::io::{self, Read, Write};

/// A byte source an adapter pulls from.
///
/// `read` follows `std::io::Read` semantics: `Ok(0)` is end-of-stream and a
/// short read is normal. `close` is called exactly once, by the adapter that
/// owns the source.
pub trait Source {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize>;

    fn close(&mut self) -> io::Result<()> {
        Ok(())
    }
}

/// A byte sink an adapter pushes to.
///
/// `write` may accept fewer bytes than offered. Adapters in this crate treat
/// that as fatal rather than retrying, so a sink that wants every byte
/// delivered must loop internally.
pub trait Sink {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize>;

    fn close(&mut self) -> io::Result<()> {
        Ok(())
    }
}

impl<S: Source + ?Sized> Source for Box<S> {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        (**self).read(buf)
    }

    fn close(&mut self) -> io::Result<()> {
        (**self).close()
    }
}

impl<S: Sink + ?Sized> Sink for Box<S> {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        (**self).write(buf)
    }

    fn close(&mut self) -> io::Result<()> {
        (**self).close()
    }
}

/// Adapts any `std::io::Read` (files, stdin, sockets) into a [`Source`].
pub struct IoSource<R> {
    inner: R,
}

impl<R: Read> IoSource<R> {
    pub fn new(inner: R) -> Self {
        Self { inner }
    }

    pub fn get_ref(&self) -> &R {
        &self.inner
    }
}

impl<R: Read> Source for IoSource<R> {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        loop {
            match self.inner.read(buf) {
                Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                other => return other,
            }
        }
    }
}

/// Adapts any `std::io::Write` into a [`Sink`].
///
/// Writes go through `write_all`, so this sink never reports a short write;
/// `close` flushes.
pub struct IoSink<W> {
    inner: W,
}

impl<W: Write> IoSink<W> {
    pub fn new(inner: W) -> Self {
        Self { inner }
    }

    pub fn get_ref(&self) -> &W {
        &self.inner
    }
}

impl<W: Write> Sink for IoSink<W> {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        self.inner.write_all(buf)?;
        Ok(buf.len())
    }

    fn close(&mut self) -> io::Result<()> {
        self.inner.flush()
    }
}
