use std::collections::VecDeque;
use std::fs::File;
use std::io::{self, Seek, SeekFrom, Write};
use std::mem;
use std::sync::{Arc, Condvar, Mutex, PoisonError};

use log::{debug, error};

use crate::data::decoded_bytes;
use crate::map::MapBlocks;
use crate::workqueue::{lock, WorkQueue};
use crate::Error;

/// Turns one extent into bytes. `raw` and `out` are reused between calls; what ends up in them
/// is read back through `decoded_bytes`.
pub trait Decode: Send + Sync {
    fn decode(&self, map: &MapBlocks, raw: &mut Vec<u8>, out: &mut Vec<u8>) -> Result<(), Error>;
}

/// Where a file's decoded content goes, in file order.
pub trait Sink: Write {
    /// Move past `len` bytes that read back as zeros without writing them.
    fn skip(&mut self, len: u64) -> io::Result<()>;
}

// the caller sizes the file once everything is out, so trailing holes need nothing more
impl Sink for File {
    fn skip(&mut self, len: u64) -> io::Result<()> {
        let len = i64::try_from(len).map_err(|_| io::Error::from(io::ErrorKind::InvalidInput))?;
        self.seek(SeekFrom::Current(len)).map(|_| ())
    }
}

impl Sink for Vec<u8> {
    fn skip(&mut self, len: u64) -> io::Result<()> {
        let len = usize::try_from(len).map_err(|_| io::Error::from(io::ErrorKind::OutOfMemory))?;
        self.try_reserve(len)
            .map_err(|_| io::Error::from(io::ErrorKind::OutOfMemory))?;
        self.resize(self.len() + len, 0);
        Ok(())
    }
}

#[derive(Debug)]
enum State {
    Idle,
    Submitted,
    Running,
    Completed(Option<Error>),
}

// the decoder travels with the item: a stale job for a recycled index decodes whatever the index
// holds now, with the right decoder
struct WorkItem {
    map: Option<MapBlocks>,
    decoder: Option<Arc<dyn Decode>>,
    raw: Vec<u8>,
    out: Vec<u8>,
    state: State,
}

struct Arena {
    items: Vec<WorkItem>,
    idle: Vec<usize>,
}

/// Arena of work items shared by every pipeline of one walk. Items are addressed by index and
/// recycled through the idle list so their buffers are reused.
pub struct WorkPool {
    arena: Mutex<Arena>,
    done: Condvar,
}

impl Default for WorkPool {
    fn default() -> Self {
        WorkPool::new()
    }
}

impl WorkPool {
    pub fn new() -> WorkPool {
        WorkPool {
            arena: Mutex::new(Arena {
                items: vec![],
                idle: vec![],
            }),
            done: Condvar::new(),
        }
    }

    fn acquire(&self, map: MapBlocks, decoder: Arc<dyn Decode>) -> usize {
        let mut arena = lock(&self.arena);
        let idx = match arena.idle.pop() {
            Some(idx) => idx,
            None => {
                arena.items.push(WorkItem {
                    map: None,
                    decoder: None,
                    raw: vec![],
                    out: vec![],
                    state: State::Idle,
                });
                arena.items.len() - 1
            }
        };
        let item = &mut arena.items[idx];
        item.map = Some(map);
        item.decoder = Some(decoder);
        item.state = State::Submitted;
        idx
    }

    // Submitted -> Running, handing the buffers to the caller
    #[allow(clippy::type_complexity)]
    fn claim(&self, idx: usize) -> Option<(MapBlocks, Arc<dyn Decode>, Vec<u8>, Vec<u8>)> {
        let mut arena = lock(&self.arena);
        let item = &mut arena.items[idx];
        if !matches!(item.state, State::Submitted) {
            return None;
        }
        item.state = State::Running;
        let map = item.map.clone()?;
        let decoder = item.decoder.clone()?;
        Some((map, decoder, mem::take(&mut item.raw), mem::take(&mut item.out)))
    }

    fn complete(&self, idx: usize, raw: Vec<u8>, out: Vec<u8>, res: Result<(), Error>) {
        let mut arena = lock(&self.arena);
        let item = &mut arena.items[idx];
        item.raw = raw;
        item.out = out;
        item.state = State::Completed(res.err());
        self.done.notify_all();
    }

    /// Decode item `idx` on this thread if nobody has started it yet. Returns whether it ran.
    pub fn run(&self, idx: usize) -> bool {
        let Some((map, decoder, mut raw, mut out)) = self.claim(idx) else {
            return false;
        };
        let res = decoder.decode(&map, &mut raw, &mut out);
        self.complete(idx, raw, out, res);
        true
    }

    fn wait(&self, idx: usize) {
        let arena = lock(&self.arena);
        let _arena = self
            .done
            .wait_while(arena, |a| {
                !matches!(a.items[idx].state, State::Completed(_))
            })
            .unwrap_or_else(PoisonError::into_inner);
    }

    // take a completed head item's result and payload; None if it is still in flight
    fn take_completed(&self, idx: usize) -> Option<(Option<Error>, MapBlocks, Vec<u8>, Vec<u8>)> {
        let mut arena = lock(&self.arena);
        let item = &mut arena.items[idx];
        if !matches!(item.state, State::Completed(_)) {
            return None;
        }
        let State::Completed(err) = mem::replace(&mut item.state, State::Running) else {
            return None;
        };
        item.decoder = None;
        let map = item.map.take()?;
        Some((err, map, mem::take(&mut item.raw), mem::take(&mut item.out)))
    }

    fn recycle(&self, idx: usize, raw: Vec<u8>, out: Vec<u8>) {
        let mut arena = lock(&self.arena);
        let item = &mut arena.items[idx];
        item.raw = raw;
        item.out = out;
        item.state = State::Idle;
        arena.idle.push(idx);
    }

    #[cfg(test)]
    fn is_quiescent(&self) -> bool {
        let arena = lock(&self.arena);
        arena.idle.len() == arena.items.len()
            && arena.items.iter().all(|x| matches!(x.state, State::Idle))
    }
}

enum Pending {
    Item(usize),
    Hole { la: u64, len: u64 },
}

/// Decodes the extents of one file on the work queue and writes them to a sink in the order
/// they were submitted. Only completed items at the head of the in-flight list are written, so
/// workers may finish in any order.
pub struct DecodePipeline<'a> {
    pool: &'a Arc<WorkPool>,
    queue: &'a WorkQueue,
    decoder: Arc<dyn Decode>,
    inflight: VecDeque<Pending>,
    error: Option<Error>,
}

impl<'a> DecodePipeline<'a> {
    pub fn new(
        pool: &'a Arc<WorkPool>,
        queue: &'a WorkQueue,
        decoder: Arc<dyn Decode>,
    ) -> DecodePipeline<'a> {
        DecodePipeline {
            pool,
            queue,
            decoder,
            inflight: VecDeque::new(),
            error: None,
        }
    }

    /// Whether an item or the sink has failed. Callers stop submitting once this is set.
    pub fn failed(&self) -> bool {
        self.error.is_some()
    }

    pub fn submit(&mut self, map: MapBlocks, sink: Option<&mut (dyn Sink + '_)>) {
        let idx = self.pool.acquire(map, self.decoder.clone());
        self.inflight.push_back(Pending::Item(idx));
        let pool = self.pool.clone();
        if let Err(job) = self.queue.add(Box::new(move || {
            pool.run(idx);
        })) {
            debug!("work queue unavailable, decoding item {} inline", idx);
            job();
        }
        self.drain(sink);
    }

    /// Queue `len` bytes of hole at `la`; they are skipped in the sink once everything before
    /// them is out.
    pub fn skip(&mut self, la: u64, len: u64, sink: Option<&mut (dyn Sink + '_)>) {
        self.inflight.push_back(Pending::Hole { la, len });
        self.drain(sink);
    }

    // write out whatever has completed at the head, without blocking
    fn drain(&mut self, mut sink: Option<&mut (dyn Sink + '_)>) {
        while let Some(front) = self.inflight.front() {
            let idx = match *front {
                Pending::Item(idx) => idx,
                Pending::Hole { la, len } => {
                    self.inflight.pop_front();
                    if self.error.is_none() {
                        if let Some(sink) = sink.as_deref_mut() {
                            if let Err(e) = sink.skip(len) {
                                error!("failed to skip hole at la {}: {}", la, e);
                                self.error = Some(e.into());
                            }
                        }
                    }
                    continue;
                }
            };
            let Some((err, map, raw, out)) = self.pool.take_completed(idx) else {
                break;
            };
            self.inflight.pop_front();
            match err {
                Some(e) => {
                    if self.error.is_none() {
                        self.error = Some(e);
                    }
                }
                None if self.error.is_none() => {
                    if let Some(sink) = sink.as_deref_mut() {
                        if let Err(e) = sink.write_all(decoded_bytes(&map, &raw, &out)) {
                            error!("failed to write out la {}: {}", map.la, e);
                            self.error = Some(e.into());
                        }
                    }
                }
                None => {}
            }
            self.pool.recycle(idx, raw, out);
        }
    }

    fn flush(&mut self, mut sink: Option<&mut (dyn Sink + '_)>) {
        loop {
            self.drain(sink.as_deref_mut());
            let idx = match self.inflight.front() {
                Some(Pending::Item(idx)) => *idx,
                Some(Pending::Hole { .. }) => continue,
                None => return,
            };
            // either nobody picked it up yet and we do it ourselves, or a worker has it
            if !self.pool.run(idx) {
                self.pool.wait(idx);
            }
        }
    }

    /// Wait for everything in flight, write it out and report the first failure.
    pub fn finish(mut self, sink: Option<&mut (dyn Sink + '_)>) -> Result<(), Error> {
        self.flush(sink);
        match self.error.take() {
            Some(e) => Err(e),
            None => Ok(()),
        }
    }
}

impl Drop for DecodePipeline<'_> {
    fn drop(&mut self) {
        if !self.inflight.is_empty() {
            self.flush(None);
        }
    }
}
