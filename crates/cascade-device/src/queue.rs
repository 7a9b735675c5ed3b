//! In-order command queue served by a dedicated worker thread.
//!
//! Enqueue calls never block on earlier commands. Each command carries the
//! events it must wait for and returns a fresh event that fires once it has
//! run. When any awaited event failed, the command is skipped and its own
//! event fails with the same error, so a device failure reaches every result
//! that depends on it.

use std::fmt;
use std::panic::{self, AssertUnwindSafe};
use std::sync::mpsc::{self, Receiver, Sender};
use std::sync::Arc;
use std::thread::{self, JoinHandle};

use cascade_core::{CascadeError, Result};
use parking_lot::Mutex;

use crate::event::Event;
use crate::launch::{KernelArg, KernelInvocation, LaunchConfig};
use crate::memory::DeviceBuffer;
use crate::program::Kernel;

enum CommandKind {
    Write {
        buffer: DeviceBuffer,
        data: Vec<u8>,
    },
    Read {
        buffer: DeviceBuffer,
        len: usize,
        out: Arc<Mutex<Option<Vec<u8>>>>,
    },
    Launch {
        kernel: Kernel,
        args: Vec<KernelArg>,
        config: LaunchConfig,
    },
    Marker,
}

struct Command {
    kind: CommandKind,
    wait_for: Vec<Event>,
    signal: Event,
}

/// Host bytes produced by a queued read, available once its event fires.
pub struct Readback {
    event: Event,
    data: Arc<Mutex<Option<Vec<u8>>>>,
}

impl Readback {
    pub fn event(&self) -> &Event {
        &self.event
    }

    /// Block until the read has run and take the bytes.
    pub fn wait(self) -> Result<Vec<u8>> {
        self.event.wait()?;
        self.data
            .lock()
            .take()
            .ok_or_else(|| CascadeError::Device("read completed without data".into()))
    }
}

struct QueueShared {
    label: String,
    sender: Mutex<Option<Sender<Command>>>,
    worker: Mutex<Option<JoinHandle<()>>>,
}

impl QueueShared {
    fn close(&self) {
        // Closing the channel lets the worker drain what is queued and exit.
        let sender = self.sender.lock().take();
        drop(sender);
    }

    fn shutdown(&self) {
        self.close();
        let worker = self.worker.lock().take();
        if let Some(handle) = worker {
            if handle.thread().id() == thread::current().id() {
                return;
            }
            if handle.join().is_err() {
                tracing::warn!("{}: queue worker panicked", self.label);
            }
        }
    }
}

impl Drop for QueueShared {
    fn drop(&mut self) {
        // Commands still gated on user events may never run, so the worker
        // is left to exit on its own instead of being joined here.
        self.close();
    }
}

/// Handle to a device command queue. Clones share the same queue.
#[derive(Clone)]
pub struct CommandQueue {
    shared: Arc<QueueShared>,
}

impl CommandQueue {
    pub fn new(label: impl Into<String>) -> Result<Self> {
        let label = label.into();
        let (sender, receiver) = mpsc::channel();
        let worker_label = label.clone();
        let handle = thread::Builder::new()
            .name(format!("cascade-queue-{}", label))
            .spawn(move || run_worker(&worker_label, receiver))
            .map_err(|e| CascadeError::Device(format!("failed to start queue worker: {}", e)))?;

        Ok(Self {
            shared: Arc::new(QueueShared {
                label,
                sender: Mutex::new(Some(sender)),
                worker: Mutex::new(Some(handle)),
            }),
        })
    }

    pub fn label(&self) -> &str {
        &self.shared.label
    }

    fn submit(&self, kind: CommandKind, wait_for: Vec<Event>) -> Result<Event> {
        let signal = Event::user();
        let command = Command {
            kind,
            wait_for,
            signal: signal.clone(),
        };
        let sender = self.shared.sender.lock();
        let sender = sender
            .as_ref()
            .ok_or_else(|| CascadeError::Device(format!("{}: queue has been shut down", self.label())))?;
        sender
            .send(command)
            .map_err(|_| CascadeError::Device(format!("{}: queue worker has exited", self.label())))?;
        Ok(signal)
    }

    /// Copy host bytes into the start of `buffer`.
    pub fn enqueue_write(
        &self,
        buffer: &DeviceBuffer,
        data: Vec<u8>,
        wait_for: Vec<Event>,
    ) -> Result<Event> {
        if data.len() > buffer.len() {
            return Err(CascadeError::InvalidArgument(format!(
                "cannot write {} bytes into a buffer of {} bytes",
                data.len(),
                buffer.len()
            )));
        }
        self.submit(
            CommandKind::Write {
                buffer: buffer.clone(),
                data,
            },
            wait_for,
        )
    }

    /// Copy the first `len` bytes of `buffer` back to the host.
    pub fn enqueue_read(
        &self,
        buffer: &DeviceBuffer,
        len: usize,
        wait_for: Vec<Event>,
    ) -> Result<Readback> {
        if len > buffer.len() {
            return Err(CascadeError::InvalidArgument(format!(
                "cannot read {} bytes from a buffer of {} bytes",
                len,
                buffer.len()
            )));
        }
        let data = Arc::new(Mutex::new(None));
        let event = self.submit(
            CommandKind::Read {
                buffer: buffer.clone(),
                len,
                out: Arc::clone(&data),
            },
            wait_for,
        )?;
        Ok(Readback { event, data })
    }

    /// Run `kernel` over `config.global_size` work items.
    pub fn enqueue_kernel(
        &self,
        kernel: &Kernel,
        args: Vec<KernelArg>,
        config: LaunchConfig,
        wait_for: Vec<Event>,
    ) -> Result<Event> {
        tracing::trace!(
            "{}: enqueue {} ({} work items, {} waits)",
            self.label(),
            kernel.name(),
            config.global_size,
            wait_for.len()
        );
        self.submit(
            CommandKind::Launch {
                kernel: kernel.clone(),
                args,
                config,
            },
            wait_for,
        )
    }

    /// An event that fires once every event in `wait_for` has fired.
    pub fn enqueue_marker(&self, wait_for: Vec<Event>) -> Result<Event> {
        self.submit(CommandKind::Marker, wait_for)
    }

    /// Block until everything enqueued so far has run.
    pub fn finish(&self) -> Result<()> {
        self.enqueue_marker(Vec::new())?.wait()
    }

    /// Stop accepting commands, drain the queue and join the worker.
    ///
    /// Blocks until every queued command has run, including commands still
    /// waiting on user events.
    pub fn shutdown(&self) {
        self.shared.shutdown();
    }
}

impl fmt::Debug for CommandQueue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CommandQueue")
            .field("label", &self.shared.label)
            .field("open", &self.shared.sender.lock().is_some())
            .finish()
    }
}

// ============================================================================
// Worker
// ============================================================================

fn run_worker(label: &str, receiver: Receiver<Command>) {
    for Command {
        kind,
        wait_for,
        signal,
    } in receiver
    {
        // Buffers held by `kind` are released before `signal` fires.
        if let Err(err) = Event::wait_all(&wait_for) {
            drop(kind);
            signal.fail(err);
            continue;
        }
        let outcome = panic::catch_unwind(AssertUnwindSafe(|| execute(kind)))
            .unwrap_or_else(|_| Err(CascadeError::Device("command panicked on the device".into())));
        match outcome {
            Ok(()) => {
                signal.complete();
            }
            Err(err) => {
                tracing::warn!("{}: command failed: {}", label, err);
                signal.fail(err);
            }
        }
    }
    tracing::debug!("{}: queue worker drained", label);
}

fn execute(kind: CommandKind) -> Result<()> {
    match kind {
        CommandKind::Write { buffer, data } => {
            let mut bytes = buffer.block().bytes.write();
            bytes[..data.len()].copy_from_slice(&data);
            Ok(())
        }
        CommandKind::Read { buffer, len, out } => {
            let bytes = buffer.block().bytes.read()[..len].to_vec();
            *out.lock() = Some(bytes);
            Ok(())
        }
        CommandKind::Launch {
            kernel,
            args,
            config,
        } => {
            let invocation = KernelInvocation::new(kernel.name(), &args, config);
            (kernel.entry())(&invocation)
        }
        CommandKind::Marker => Ok(()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::memory::BufferPool;

    fn setup() -> (CommandQueue, BufferPool) {
        (
            CommandQueue::new("test").unwrap(),
            BufferPool::new("test", 64, None),
        )
    }

    #[test]
    fn test_write_then_read() {
        let (queue, pool) = setup();
        let buffer = pool.allocate(4).unwrap();
        let written = queue.enqueue_write(&buffer, vec![1, 2, 3, 4], Vec::new()).unwrap();
        let readback = queue.enqueue_read(&buffer, 4, vec![written]).unwrap();
        assert_eq!(readback.wait().unwrap(), vec![1, 2, 3, 4]);
    }

    #[test]
    fn test_waits_for_user_event() {
        let (queue, pool) = setup();
        let buffer = pool.allocate(2).unwrap();
        let gate = Event::user();
        let written = queue.enqueue_write(&buffer, vec![9, 9], vec![gate.clone()]).unwrap();
        assert!(!written.is_complete());
        gate.complete();
        written.wait().unwrap();
    }

    #[test]
    fn test_failure_propagates() {
        let (queue, pool) = setup();
        let buffer = pool.allocate(2).unwrap();
        let broken = Event::failed(CascadeError::Device("bad launch".into()));
        let written = queue.enqueue_write(&buffer, vec![1, 1], vec![broken]).unwrap();
        let after = queue.enqueue_marker(vec![written.clone()]).unwrap();
        assert_eq!(after.wait().unwrap_err(), CascadeError::Device("bad launch".into()));
        assert!(written.is_failed());
    }

    #[test]
    fn test_oversized_transfers_rejected() {
        let (queue, pool) = setup();
        let buffer = pool.allocate(2).unwrap();
        assert!(queue.enqueue_write(&buffer, vec![0; 3], Vec::new()).is_err());
        assert!(queue.enqueue_read(&buffer, 3, Vec::new()).is_err());
    }

    #[test]
    fn test_shutdown_rejects_new_commands() {
        let (queue, _pool) = setup();
        queue.finish().unwrap();
        queue.shutdown();
        let err = queue.enqueue_marker(Vec::new()).unwrap_err();
        assert!(err.is_device_error());
    }
}
