//! Data-plane pass-through: read, write, cursor moves. No ancestor
//! choreography lives here; reads and writes only ever touch the one node
//! the handle already holds open.

use std::rc::Rc;

use crate::engine::{Engine, FileFlags, TimeUpdate};
use crate::error::{QuickbeamError, Result};
use crate::handle::FileHandle;
use crate::volume::Volume;

impl<E: Engine> Volume<E> {
    /// Read from the handle's cursor into `buf`, advancing the cursor.
    ///
    /// A cursor already past end-of-data is a device error; a read
    /// straddling end-of-data clamps to the bytes available.
    pub fn read(&self, handle: &Rc<FileHandle<E>>, buf: &mut [u8]) -> Result<usize> {
        self.ensure_mounted()?;
        if handle.is_dir() {
            return Err(QuickbeamError::Unsupported);
        }

        let engine = &self.inner.engine;
        let guard = handle.node.borrow();
        let node = guard.as_ref().ok_or(QuickbeamError::NotFound)?;

        let size = engine.data_size(node);
        let offset = handle.offset.get();
        if offset > size {
            return Err(QuickbeamError::DeviceError);
        }
        let want = (buf.len() as u64).min(size - offset) as usize;

        let mut done = 0;
        while done < want {
            let n = engine.read(node, offset + done as u64, &mut buf[done..want])?;
            if n == 0 {
                tracing::error!(
                    "short read on '{}' at offset {}: {} of {} bytes",
                    handle.path(),
                    offset,
                    done,
                    want
                );
                return Err(QuickbeamError::DeviceError);
            }
            done += n;
        }
        handle.offset.set(offset + done as u64);

        // Reads refresh the access stamps on writable volumes.
        if !self.is_read_only() {
            engine.touch_times(node, TimeUpdate::Modified);
        }
        Ok(done)
    }

    /// Write `buf` at the handle's cursor, advancing it.
    pub fn write(&self, handle: &Rc<FileHandle<E>>, buf: &[u8]) -> Result<usize> {
        if cfg!(feature = "readonly") {
            return Err(QuickbeamError::WriteProtected);
        }
        self.ensure_mounted()?;
        if self.is_read_only() {
            return Err(QuickbeamError::WriteProtected);
        }
        if handle.is_dir() {
            return Err(QuickbeamError::Unsupported);
        }

        let engine = &self.inner.engine;
        let guard = handle.node.borrow();
        let node = guard.as_ref().ok_or(QuickbeamError::NotFound)?;

        if engine.attrs(node).flags.contains(FileFlags::READ_ONLY) {
            return Err(QuickbeamError::WriteProtected);
        }

        let offset = handle.offset.get();
        let mut done = 0;
        while done < buf.len() {
            let n = engine.write(node, offset + done as u64, &buf[done..])?;
            if n == 0 {
                tracing::error!(
                    "short write on '{}' at offset {}: {} of {} bytes",
                    handle.path(),
                    offset,
                    done,
                    buf.len()
                );
                return Err(QuickbeamError::DeviceError);
            }
            done += n;
        }
        handle.offset.set(offset + done as u64);

        engine.touch_times(node, TimeUpdate::Modified);
        Ok(done)
    }

    /// Current cursor. Directories have no cursor to report.
    pub fn position(&self, handle: &Rc<FileHandle<E>>) -> Result<u64> {
        if handle.is_dir() {
            return Err(QuickbeamError::Unsupported);
        }
        Ok(handle.offset.get())
    }

    /// Move the cursor. Directories accept only a reset to zero; on files,
    /// `u64::MAX` seeks to end-of-data.
    pub fn set_position(&self, handle: &Rc<FileHandle<E>>, position: u64) -> Result<()> {
        if handle.is_dir() {
            if position != 0 {
                return Err(QuickbeamError::Unsupported);
            }
            handle.offset.set(0);
            return Ok(());
        }
        if position == u64::MAX {
            let guard = handle.node.borrow();
            let node = guard.as_ref().ok_or(QuickbeamError::NotFound)?;
            handle.offset.set(self.inner.engine.data_size(node));
            return Ok(());
        }
        handle.offset.set(position);
        Ok(())
    }
}
