use std::sync::Arc;

use bytes::BytesMut;
use parking_lot::Mutex;

/// Fixed-capacity pool of same-sized buffer cells.
///
/// The pool never grows: once every cell is out, `acquire` returns `None`
/// and the caller is expected to stop reading until a cell comes back. That
/// makes pool exhaustion the back-pressure signal for anything feeding bytes
/// into a connection.
#[derive(Clone)]
pub struct Pool {
    inner: Arc<Inner>,
}

struct Inner {
    cell_size: usize,
    capacity: usize,
    cells: Mutex<Vec<BytesMut>>,
}

impl Pool {
    pub fn new(cell_size: usize, capacity: usize) -> Self {
        Self {
            inner: Arc::new(Inner {
                cell_size,
                capacity,
                cells: Mutex::new(
                    (0..capacity)
                        .map(|_| BytesMut::with_capacity(cell_size))
                        .collect(),
                ),
            }),
        }
    }

    /// Takes a cell out of the pool, or `None` when every cell is in use.
    pub fn acquire(&self) -> Option<PoolBuf> {
        self.inner.cells.lock().pop().map(|bytes| PoolBuf {
            bytes,
            inner: self.inner.clone(),
        })
    }

    pub fn cell_size(&self) -> usize {
        self.inner.cell_size
    }

    pub fn capacity(&self) -> usize {
        self.inner.capacity
    }

    pub fn available(&self) -> usize {
        self.inner.cells.lock().len()
    }
}

/// A cell checked out of a [`Pool`]. Returns itself, cleared, on drop.
pub struct PoolBuf {
    bytes: BytesMut,
    inner: Arc<Inner>,
}

impl std::ops::Deref for PoolBuf {
    type Target = BytesMut;

    fn deref(&self) -> &Self::Target {
        &self.bytes
    }
}

impl std::ops::DerefMut for PoolBuf {
    fn deref_mut(&mut self) -> &mut Self::Target {
        &mut self.bytes
    }
}

impl Drop for PoolBuf {
    fn drop(&mut self) {
        let mut bytes = std::mem::take(&mut self.bytes);
        bytes.clear();
        self.inner.cells.lock().push(bytes);
    }
}
