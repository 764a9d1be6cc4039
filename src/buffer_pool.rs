use bytes::BytesMut;
use std::sync::Mutex;
use tracing::trace;

/// Pools the short-lived buffers of the hot send paths (ack replies in
///  particular, which are produced once per inbound data packet). Buffers
///  returned in excess of the pool size are discarded.
pub struct SendBufferPool {
    buf_size: usize,
    buffers: Mutex<Vec<BytesMut>>,
}

impl SendBufferPool {
    pub fn new(buf_size: usize, max_pool_size: usize) -> SendBufferPool {
        SendBufferPool {
            buf_size,
            buffers: Mutex::new(Vec::with_capacity(max_pool_size)),
        }
    }

    pub fn get_from_pool(&self) -> BytesMut {
        {
            let mut buffers = self.buffers.lock().unwrap();
            if let Some(buffer) = buffers.pop() {
                trace!("returning buffer from pool");
                return buffer;
            }
        }

        trace!("no buffer in pool: creating new buffer");
        BytesMut::with_capacity(self.buf_size)
    }

    pub fn return_to_pool(&self, mut buffer: BytesMut) {
        buffer.clear();

        let mut buffers = self.buffers.lock().unwrap();
        if buffers.capacity() > buffers.len() {
            trace!("returning buffer to pool");
            buffers.push(buffer);
        } else {
            trace!("pool is full: discarding returned buffer");
        }
    }
}
