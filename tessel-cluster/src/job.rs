use std::fmt::{Display, Formatter};
use std::sync::Arc;
use std::time::Duration;

use dashmap::DashMap;
use parking_lot::{Condvar, Mutex};
use tessel_error::{TesselResult, tessel_err};
use uuid::Uuid;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct JobId(Uuid);

impl JobId {
    pub fn random() -> Self {
        Self(Uuid::new_v4())
    }
}

impl Display for JobId {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "job-{}", self.0)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum JobStatus {
    Running,
    Done,
    Cancelled(String),
}

/// A unit of long-running work that can be cancelled cooperatively and waited on.
#[derive(Debug)]
pub struct Job {
    id: JobId,
    description: String,
    status: Mutex<JobStatus>,
    changed: Condvar,
}

impl Job {
    pub fn new(description: impl Into<String>) -> Self {
        Self {
            id: JobId::random(),
            description: description.into(),
            status: Mutex::new(JobStatus::Running),
            changed: Condvar::new(),
        }
    }

    pub fn id(&self) -> JobId {
        self.id
    }

    pub fn description(&self) -> &str {
        &self.description
    }

    pub fn status(&self) -> JobStatus {
        self.status.lock().clone()
    }

    pub fn is_running(&self) -> bool {
        matches!(*self.status.lock(), JobStatus::Running)
    }

    pub fn is_cancelled(&self) -> bool {
        matches!(*self.status.lock(), JobStatus::Cancelled(_))
    }

    /// Request cancellation. Only the first request on a running job takes effect.
    pub fn cancel(&self, reason: impl Into<String>) -> bool {
        self.transition(JobStatus::Cancelled(reason.into()))
    }

    /// Mark the job complete. Has no effect if it was cancelled first.
    pub fn finish(&self) -> bool {
        self.transition(JobStatus::Done)
    }

    fn transition(&self, next: JobStatus) -> bool {
        let mut status = self.status.lock();
        if *status != JobStatus::Running {
            return false;
        }
        match &next {
            JobStatus::Cancelled(reason) => {
                log::warn!("{} ({}) cancelled: {reason}", self.id, self.description)
            }
            _ => log::info!("{} ({}) done", self.id, self.description),
        }
        *status = next;
        self.changed.notify_all();
        true
    }

    /// Block until the job leaves the running state; a cancelled job is a `Cancelled` error.
    pub fn wait(&self) -> TesselResult<()> {
        let mut status = self.status.lock();
        while *status == JobStatus::Running {
            self.changed.wait(&mut status);
        }
        Self::outcome(&status)
    }

    /// Like [`Job::wait`], but gives up after `timeout`, returning `Ok(false)` if still running.
    pub fn wait_for(&self, timeout: Duration) -> TesselResult<bool> {
        let mut status = self.status.lock();
        if *status == JobStatus::Running {
            self.changed.wait_for(&mut status, timeout);
        }
        match *status {
            JobStatus::Running => Ok(false),
            _ => Self::outcome(&status).map(|()| true),
        }
    }

    fn outcome(status: &JobStatus) -> TesselResult<()> {
        match status {
            JobStatus::Cancelled(reason) => Err(tessel_err!(Cancelled: "{reason}")),
            _ => Ok(()),
        }
    }
}

/// Registry of the jobs known to a cluster.
#[derive(Debug, Default)]
pub struct Jobs {
    jobs: DashMap<JobId, Arc<Job>>,
}

impl Jobs {
    pub fn create(&self, description: impl Into<String>) -> Arc<Job> {
        let job = Arc::new(Job::new(description));
        self.jobs.insert(job.id(), job.clone());
        job
    }

    pub fn get(&self, id: JobId) -> TesselResult<Arc<Job>> {
        self.jobs
            .get(&id)
            .map(|job| job.value().clone())
            .ok_or_else(|| tessel_err!(NotFound: "{id}"))
    }

    pub fn is_cancelled(&self, id: JobId) -> TesselResult<bool> {
        Ok(self.get(id)?.is_cancelled())
    }

    pub fn cancel(&self, id: JobId, reason: impl Into<String>) -> TesselResult<bool> {
        Ok(self.get(id)?.cancel(reason))
    }

    pub fn remove(&self, id: JobId) -> Option<Arc<Job>> {
        self.jobs.remove(&id).map(|(_, job)| job)
    }

    pub fn len(&self) -> usize {
        self.jobs.len()
    }

    pub fn is_empty(&self) -> bool {
        self.jobs.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use std::thread;

    use super::*;

    #[test]
    fn first_transition_wins() {
        let job = Job::new("test");
        assert!(job.cancel("stop"));
        assert!(!job.finish());
        assert!(!job.cancel("again"));
        assert_eq!(job.status(), JobStatus::Cancelled("stop".into()));
        let err = job.wait().unwrap_err();
        assert!(err.is_cancelled());
    }

    #[test]
    fn wait_blocks_until_finished() {
        let job = Arc::new(Job::new("waited"));
        let finisher = {
            let job = job.clone();
            thread::spawn(move || {
                thread::sleep(Duration::from_millis(10));
                job.finish()
            })
        };
        job.wait().unwrap();
        assert!(finisher.join().unwrap());
        assert!(!job.is_running());
    }

    #[test]
    fn wait_for_times_out() {
        let job = Job::new("slow");
        assert!(!job.wait_for(Duration::from_millis(5)).unwrap());
        job.finish();
        assert!(job.wait_for(Duration::from_millis(5)).unwrap());
    }

    #[test]
    fn registry_lookup() {
        let jobs = Jobs::default();
        let job = jobs.create("registered");
        assert!(!jobs.is_cancelled(job.id()).unwrap());
        assert!(jobs.cancel(job.id(), "no longer needed").unwrap());
        assert!(job.is_cancelled());
        assert!(jobs.remove(job.id()).is_some());
        assert!(jobs.get(job.id()).is_err());
        assert!(jobs.is_empty());
    }
}
