use std::io::{self, Write};
use std::sync::atomic::{AtomicUsize, Ordering};

use bytes::BytesMut;
use may::queue::mpsc::Queue;
use may::sync::Mutex;

#[derive(Debug)]
struct Batch<W: Write> {
    writer: W,
    pending: BytesMut,
}

impl<W: Write> Batch<W> {
    fn new(writer: W) -> Self {
        Batch {
            writer,
            pending: BytesMut::with_capacity(1024 * 32),
        }
    }

    #[inline]
    fn put_frame(&mut self, frame: &[u8]) {
        self.pending.extend_from_slice(frame)
    }

    #[inline]
    fn flush_frames(&mut self) -> io::Result<()> {
        let ret = self
            .writer
            .write_all(&self.pending)
            .and_then(|_| self.writer.flush());
        self.pending.clear();
        ret
    }
}

/// Frame writer shared by every coroutine answering on one stream.
///
/// Frames are queued and the first concurrent writer flushes the whole
/// queue, so frames are never interleaved and writers rarely contend.
#[derive(Debug)]
pub struct QueuedWriter<W: Write> {
    frame_count: AtomicUsize,
    frame_queue: Queue<Vec<u8>>,
    batch: Mutex<Batch<W>>,
}

impl<W: Write> QueuedWriter<W> {
    pub fn new(writer: W) -> Self {
        QueuedWriter {
            frame_count: AtomicUsize::new(0),
            frame_queue: Queue::new(),
            batch: Mutex::new(Batch::new(writer)),
        }
    }

    /// Queue one encoded frame.
    ///
    /// Only the writer that flushes observes an io error, the frames of the
    /// other writers are part of the failed batch.
    pub fn write(&self, frame: Vec<u8>) -> io::Result<()> {
        self.frame_queue.push(frame);
        // a nonzero count means a flush is in progress and will pick this frame up
        if self.frame_count.fetch_add(1, Ordering::AcqRel) != 0 {
            return Ok(());
        }

        let mut batch = self
            .batch
            .lock()
            .map_err(|_| io::Error::new(io::ErrorKind::Other, "queued writer poisoned"))?;

        loop {
            let mut cnt = 0;
            while let Some(frame) = self.frame_queue.pop() {
                batch.put_frame(&frame);
                cnt += 1;
            }

            // frames queued while we were draining keep the count above cnt
            if self.frame_count.fetch_sub(cnt, Ordering::AcqRel) == cnt {
                break;
            }
        }

        batch.flush_frames().map_err(|e| {
            error!("frame flush failed: err = {e}");
            e
        })
    }
}
