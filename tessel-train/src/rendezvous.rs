use parking_lot::{Condvar, Mutex};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Phase {
    Running,
    Suspending,
    Cancelled,
}

#[derive(Debug)]
struct State {
    workers: usize,
    parked: usize,
    phase: Phase,
    generation: u64,
}

/// A two-phase pause point shared by a fixed set of workers.
///
/// Workers call [`Rendezvous::checkpoint`] between steps. Once a controller calls
/// [`Rendezvous::suspend`], every worker parks at its next checkpoint and `suspend` returns only
/// when all live workers are parked. [`Rendezvous::resume`] releases them together. Workers that
/// finish call [`Rendezvous::retire`] so they are no longer waited for.
#[derive(Debug)]
pub struct Rendezvous {
    state: Mutex<State>,
    parked: Condvar,
    released: Condvar,
}

impl Rendezvous {
    pub fn new(workers: usize) -> Self {
        Self {
            state: Mutex::new(State {
                workers,
                parked: 0,
                phase: Phase::Running,
                generation: 0,
            }),
            parked: Condvar::new(),
            released: Condvar::new(),
        }
    }

    /// Park here if a suspension is pending. Returns `false` once cancelled.
    pub fn checkpoint(&self) -> bool {
        let mut state = self.state.lock();
        if state.phase == Phase::Suspending {
            let generation = state.generation;
            state.parked += 1;
            self.parked.notify_all();
            while state.generation == generation && state.phase == Phase::Suspending {
                self.released.wait(&mut state);
            }
        }
        state.phase != Phase::Cancelled
    }

    /// Block until every live worker is parked. Returns `false` if cancelled meanwhile.
    pub fn suspend(&self) -> bool {
        let mut state = self.state.lock();
        if state.phase == Phase::Cancelled {
            return false;
        }
        state.phase = Phase::Suspending;
        while state.phase == Phase::Suspending && state.parked < state.workers {
            self.parked.wait(&mut state);
        }
        state.phase == Phase::Suspending
    }

    /// Release every parked worker.
    pub fn resume(&self) {
        let mut state = self.state.lock();
        if state.phase == Phase::Suspending {
            state.phase = Phase::Running;
        }
        state.parked = 0;
        state.generation += 1;
        self.released.notify_all();
    }

    /// Stop all workers at their next checkpoint, releasing any that are parked.
    pub fn cancel(&self) {
        let mut state = self.state.lock();
        state.phase = Phase::Cancelled;
        state.generation += 1;
        self.released.notify_all();
        self.parked.notify_all();
    }

    pub fn is_cancelled(&self) -> bool {
        self.state.lock().phase == Phase::Cancelled
    }

    /// Add one worker to the set a suspension waits for.
    pub fn enlist(&self) {
        self.state.lock().workers += 1;
    }

    /// Remove one worker from the set a suspension waits for.
    pub fn retire(&self) {
        let mut state = self.state.lock();
        state.workers = state.workers.saturating_sub(1);
        self.parked.notify_all();
    }

    pub fn workers(&self) -> usize {
        self.state.lock().workers
    }
}
