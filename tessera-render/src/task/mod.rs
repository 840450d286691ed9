//! Prioritized background work on top of `choir`.
//!
//! Every queued item spawns one `choir` task, and every task pops the most
//! urgent item from the shared queue when it gets to run. Items never touch
//! the device queue: whatever they record comes back as a [`Submission`]
//! that the main thread submits in completion order.

mod model_build;

pub use model_build::ModelBuildTask;

use parking_lot::{Condvar, Mutex};
use std::{
    cmp,
    collections::BinaryHeap,
    sync::{
        atomic::{AtomicU64, Ordering},
        Arc,
    },
};
use tessera_graphics::{self as gpu, CommandDevice as _, MemoryManager as _};

/// Lower values run first.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Priority(pub i32);

impl Priority {
    pub const HIGH: Self = Self(-1);
    pub const DEFAULT: Self = Self(0);
    pub const BACKGROUND: Self = Self(1);
}

/// Recorded GPU work handed back to the main thread.
pub struct Submission {
    pub name: String,
    pub encoder: gpu::CommandEncoder,
    /// Buffers to release once the submission has retired.
    pub temp_buffers: Vec<gpu::Buffer>,
    /// Frame image the work was scheduled for.
    pub image_index: usize,
    /// Structure to attach to its model once the encoder is submitted.
    pub bottom_level: Option<(Arc<crate::Model>, crate::BottomLevelHandle)>,
}

impl Submission {
    /// Attach the recorded structure to its model. Call right after
    /// submitting the encoder, never before.
    pub fn publish(&mut self, hub: &crate::StructureHub) {
        if let Some((model, handle)) = self.bottom_level.take() {
            if model.set_bottom_level(handle).is_err() {
                log::warn!("Model '{}' is already built", model.name);
                hub.release_bottom_level(handle);
            }
        }
    }

    /// Release everything held by a submission that never reached the device.
    pub fn discard(self, hub: &crate::StructureHub) {
        let device = hub.device().as_ref();
        for buffer in self.temp_buffers {
            device.release_buffer(buffer);
        }
        if let Some((_, handle)) = self.bottom_level {
            hub.release_bottom_level(handle);
        }
    }
}

/// What a unit of work gets from the thread it runs on.
pub struct WorkerContext<'a> {
    device: &'a Arc<dyn gpu::Device>,
}

impl<'a> WorkerContext<'a> {
    pub fn new(device: &'a Arc<dyn gpu::Device>) -> Self {
        Self { device }
    }

    pub fn device(&self) -> &dyn gpu::Device {
        self.device.as_ref()
    }

    pub fn create_command_encoder(&self, name: &str) -> gpu::CommandEncoder {
        self.device
            .create_command_encoder(gpu::CommandEncoderDesc { name })
    }
}

pub trait Work: Send + 'static {
    fn name(&self) -> &str;
    fn priority(&self) -> Priority {
        Priority::DEFAULT
    }
    fn process(
        self: Box<Self>,
        context: &WorkerContext,
    ) -> Result<Option<Submission>, crate::Error>;
}

struct Queued {
    priority: Priority,
    sequence: u64,
    work: Box<dyn Work>,
}

impl PartialEq for Queued {
    fn eq(&self, other: &Self) -> bool {
        self.priority == other.priority && self.sequence == other.sequence
    }
}
impl Eq for Queued {}
impl PartialOrd for Queued {
    fn partial_cmp(&self, other: &Self) -> Option<cmp::Ordering> {
        Some(self.cmp(other))
    }
}
impl Ord for Queued {
    // `BinaryHeap` pops the greatest, which has to be the lowest priority
    // value and then the earliest sequence.
    fn cmp(&self, other: &Self) -> cmp::Ordering {
        other
            .priority
            .cmp(&self.priority)
            .then_with(|| other.sequence.cmp(&self.sequence))
    }
}

struct Shared {
    device: Arc<dyn gpu::Device>,
    queue: Mutex<BinaryHeap<Queued>>,
    completed: Mutex<Vec<Submission>>,
    faults: Mutex<Vec<crate::Error>>,
    pending: Mutex<usize>,
    idle: Condvar,
}

/// Decrements the pending count even if the work panics.
struct PendingGuard<'a>(&'a Shared);

impl Drop for PendingGuard<'_> {
    fn drop(&mut self) {
        let mut pending = self.0.pending.lock();
        *pending -= 1;
        if *pending == 0 {
            self.0.idle.notify_all();
        }
    }
}

impl Shared {
    fn run_next(&self) {
        let _guard = PendingGuard(self);
        let queued = match self.queue.lock().pop() {
            Some(queued) => queued,
            None => return,
        };
        let name = queued.work.name().to_string();
        profiling::scope!("work", &name);
        let context = WorkerContext::new(&self.device);
        match queued.work.process(&context) {
            Ok(Some(submission)) => {
                log::debug!("Work '{}' is done", name);
                self.completed.lock().push(submission);
            }
            Ok(None) => log::debug!("Work '{}' had nothing to submit", name),
            Err(e) => {
                log::error!("Work '{}' failed: {}", name, e);
                self.faults.lock().push(e);
            }
        }
    }
}

pub struct WorkerPool {
    choir: Arc<choir::Choir>,
    shared: Arc<Shared>,
    sequence: AtomicU64,
}

impl WorkerPool {
    pub fn new(choir: &Arc<choir::Choir>, device: &Arc<dyn gpu::Device>) -> Self {
        Self {
            choir: Arc::clone(choir),
            shared: Arc::new(Shared {
                device: Arc::clone(device),
                queue: Mutex::new(BinaryHeap::new()),
                completed: Mutex::new(Vec::new()),
                faults: Mutex::new(Vec::new()),
                pending: Mutex::new(0),
                idle: Condvar::new(),
            }),
            sequence: AtomicU64::new(0),
        }
    }

    pub fn add_work(&self, work: Box<dyn Work>) {
        let name = work.name().to_string();
        let priority = work.priority();
        let sequence = self.sequence.fetch_add(1, Ordering::Relaxed);
        log::trace!("Queueing '{}' with {:?}", name, priority);
        *self.shared.pending.lock() += 1;
        self.shared.queue.lock().push(Queued {
            priority,
            sequence,
            work,
        });
        let shared = Arc::clone(&self.shared);
        let _ = self
            .choir
            .spawn(format!("work {}", name))
            .init(move |_| shared.run_next())
            .run();
    }

    /// Number of items queued or running.
    pub fn pending(&self) -> usize {
        *self.shared.pending.lock()
    }

    /// Drain finished work, in completion order.
    pub fn take_submissions(&self) -> Vec<Submission> {
        std::mem::take(&mut *self.shared.completed.lock())
    }

    /// Oldest error reported by a work item, if any.
    pub fn take_fault(&self) -> Option<crate::Error> {
        let mut faults = self.shared.faults.lock();
        if faults.is_empty() {
            None
        } else {
            Some(faults.remove(0))
        }
    }

    /// Block until every queued item has run. Needs at least one worker.
    pub fn wait_idle(&self) {
        let mut pending = self.shared.pending.lock();
        while *pending != 0 {
            self.shared.idle.wait(&mut pending);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::{Priority, Submission, Work, WorkerContext, WorkerPool};
    use parking_lot::Mutex;
    use std::sync::Arc;
    use tessera_graphics as gpu;

    struct Record {
        name: String,
        priority: Priority,
        log: Arc<Mutex<Vec<String>>>,
        fail: bool,
    }

    impl Work for Record {
        fn name(&self) -> &str {
            &self.name
        }
        fn priority(&self) -> Priority {
            self.priority
        }
        fn process(
            self: Box<Self>,
            context: &WorkerContext,
        ) -> Result<Option<Submission>, crate::Error> {
            self.log.lock().push(self.name.clone());
            if self.fail {
                return Err(crate::Error::InvalidConfiguration("broken"));
            }
            Ok(Some(Submission {
                encoder: context.create_command_encoder(&self.name),
                name: self.name,
                temp_buffers: Vec::new(),
                image_index: 0,
                bottom_level: None,
            }))
        }
    }

    #[test]
    fn lower_priority_runs_first() {
        let context = Arc::new(gpu::capture::Context::new());
        let device: Arc<dyn gpu::Device> = context;
        let choir = choir::Choir::new();
        let pool = WorkerPool::new(&choir, &device);
        let log = Arc::new(Mutex::new(Vec::new()));
        // queue everything before there is anyone to run it
        for (name, priority) in [
            ("late", Priority::BACKGROUND),
            ("first", Priority::HIGH),
            ("normal-a", Priority::DEFAULT),
            ("normal-b", Priority::DEFAULT),
        ] {
            pool.add_work(Box::new(Record {
                name: name.to_string(),
                priority,
                log: Arc::clone(&log),
                fail: false,
            }));
        }
        let _worker = choir.add_worker("worker");
        pool.wait_idle();
        assert_eq!(
            *log.lock(),
            vec!["first", "normal-a", "normal-b", "late"]
        );
        let names = pool
            .take_submissions()
            .into_iter()
            .map(|s| s.name)
            .collect::<Vec<_>>();
        assert_eq!(names, vec!["first", "normal-a", "normal-b", "late"]);
        assert!(pool.take_fault().is_none());
    }

    #[test]
    fn failures_become_faults() {
        let context = Arc::new(gpu::capture::Context::new());
        let device: Arc<dyn gpu::Device> = context;
        let choir = choir::Choir::new();
        let _worker = choir.add_worker("worker");
        let pool = WorkerPool::new(&choir, &device);
        pool.add_work(Box::new(Record {
            name: "broken".to_string(),
            priority: Priority::DEFAULT,
            log: Arc::new(Mutex::new(Vec::new())),
            fail: true,
        }));
        pool.wait_idle();
        assert!(pool.take_submissions().is_empty());
        assert!(matches!(
            pool.take_fault(),
            Some(crate::Error::InvalidConfiguration("broken"))
        ));
        assert_eq!(pool.pending(), 0);
    }
}
