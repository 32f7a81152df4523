//! Stateful property testing for job stores.
//!
//! Drives random sequences of puts, claims, retries, completions, cancels,
//! reschedules and removals against a real store and a reference model.
//! After every step the store must agree with the model on:
//!
//! - status and attempt of every job
//! - due time of every job
//! - the order `list_due` returns pending jobs in

use chrono::{DateTime, Duration, Utc};
use proptest::prelude::*;
use proptest_state_machine::{ReferenceStateMachine, StateMachineTest, prop_state_machine};
use tokio::runtime::Runtime;

use quill_scheduler::{
    Job, JobId, JobPayload, JobStatus, JobStore, MemoryJobStore, Platform, PostId,
    SqliteJobStore, StatusUpdate, StoreError,
};

/// Number of distinct job ids the machine plays with.
const SLOTS: usize = 4;

/// Operations that can be performed on a job store.
#[derive(Debug, Clone)]
pub enum StoreOp {
    Put { slot: usize, due: i64 },
    Claim { slot: usize },
    Retry { slot: usize, due: i64 },
    Succeed { slot: usize },
    Fail { slot: usize },
    Cancel { slot: usize },
    Reschedule { slot: usize, due: i64 },
    Remove { slot: usize },
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct ModelJob {
    pub status: JobStatus,
    pub attempt: u32,
    /// Seconds after the base time.
    pub due: i64,
    /// Insertion order.
    pub seq: u64,
}

/// Reference model of the store contents.
#[derive(Clone, Debug, Default)]
pub struct StoreModel {
    pub jobs: [Option<ModelJob>; SLOTS],
    pub next_seq: u64,
}

impl StoreModel {
    fn with_status(
        &mut self,
        slot: usize,
        expected: &[JobStatus],
        f: impl FnOnce(&mut ModelJob),
    ) {
        if let Some(job) = self.jobs[slot].as_mut() {
            if expected.contains(&job.status) {
                f(job);
            }
        }
    }

    fn pending_in_order(&self) -> Vec<usize> {
        let mut pending: Vec<(i64, u64, usize)> = self
            .jobs
            .iter()
            .enumerate()
            .filter_map(|(slot, job)| {
                job.filter(|j| j.status == JobStatus::Pending)
                    .map(|j| (j.due, j.seq, slot))
            })
            .collect();
        pending.sort();
        pending.into_iter().map(|(_, _, slot)| slot).collect()
    }
}

fn slot() -> impl Strategy<Value = usize> {
    0..SLOTS
}

fn due() -> impl Strategy<Value = i64> {
    0i64..20
}

impl ReferenceStateMachine for StoreModel {
    type State = Self;
    type Transition = StoreOp;

    fn init_state() -> BoxedStrategy<Self::State> {
        Just(Self::default()).boxed()
    }

    fn transitions(_state: &Self::State) -> BoxedStrategy<Self::Transition> {
        prop_oneof![
            3 => (slot(), due()).prop_map(|(slot, due)| StoreOp::Put { slot, due }),
            3 => slot().prop_map(|slot| StoreOp::Claim { slot }),
            2 => (slot(), due()).prop_map(|(slot, due)| StoreOp::Retry { slot, due }),
            2 => slot().prop_map(|slot| StoreOp::Succeed { slot }),
            1 => slot().prop_map(|slot| StoreOp::Fail { slot }),
            2 => slot().prop_map(|slot| StoreOp::Cancel { slot }),
            2 => (slot(), due()).prop_map(|(slot, due)| StoreOp::Reschedule { slot, due }),
            1 => slot().prop_map(|slot| StoreOp::Remove { slot }),
        ]
        .boxed()
    }

    fn apply(mut state: Self::State, transition: &Self::Transition) -> Self::State {
        use JobStatus::*;

        match *transition {
            StoreOp::Put { slot, due } => {
                if state.jobs[slot].is_none() {
                    state.jobs[slot] = Some(ModelJob {
                        status: Pending,
                        attempt: 0,
                        due,
                        seq: state.next_seq,
                    });
                    state.next_seq += 1;
                }
            }
            StoreOp::Claim { slot } => state.with_status(slot, &[Pending], |job| {
                job.status = Running;
                job.attempt += 1;
            }),
            StoreOp::Retry { slot, due } => state.with_status(slot, &[Running], |job| {
                job.status = Pending;
                job.due = due;
            }),
            // Succeeded -> Succeeded is accepted but changes nothing
            StoreOp::Succeed { slot } => {
                state.with_status(slot, &[Running], |job| job.status = Succeeded)
            }
            StoreOp::Fail { slot } => state.with_status(slot, &[Running], |job| job.status = Failed),
            StoreOp::Cancel { slot } => {
                state.with_status(slot, &[Pending], |job| job.status = Cancelled)
            }
            StoreOp::Reschedule { slot, due } => {
                state.with_status(slot, &[Pending], |job| job.due = due)
            }
            StoreOp::Remove { slot } => state.jobs[slot] = None,
        }
        state
    }
}

fn base_time() -> DateTime<Utc> {
    DateTime::from_timestamp(1_700_000_000, 0).unwrap()
}

fn at(due: i64) -> DateTime<Utc> {
    base_time() + Duration::seconds(due)
}

fn job_id(slot: usize) -> JobId {
    JobId::from(format!("job-{}", slot))
}

/// Creates the store under test.
pub trait FreshStore: JobStore + Sized {
    fn fresh() -> Self;
}

impl FreshStore for MemoryJobStore {
    fn fresh() -> Self {
        MemoryJobStore::new()
    }
}

impl FreshStore for SqliteJobStore {
    fn fresh() -> Self {
        SqliteJobStore::open_in_memory().unwrap()
    }
}

/// Test harness that wraps a real store with a tokio runtime.
pub struct StoreHarness<S> {
    runtime: Runtime,
    store: S,
}

pub type MemoryHarness = StoreHarness<MemoryJobStore>;
pub type SqliteHarness = StoreHarness<SqliteJobStore>;

impl<S: FreshStore> StoreHarness<S> {
    fn new() -> Self {
        let runtime = Runtime::new().expect("Failed to create tokio runtime");
        Self {
            runtime,
            store: S::fresh(),
        }
    }

    async fn transition(
        &self,
        slot: usize,
        expected: JobStatus,
        f: impl FnOnce(StatusUpdate) -> StatusUpdate,
    ) -> Result<Job, StoreError> {
        let id = job_id(slot);
        let job = self.store.get(&id).await?;
        self.store
            .compare_and_swap(&id, expected, f(StatusUpdate::from_job(&job, base_time())))
            .await
    }

    async fn finish(&self, slot: usize, status: JobStatus) -> Result<Job, StoreError> {
        let id = job_id(slot);
        let job = self.store.get(&id).await?;
        self.store
            .update_status(&id, StatusUpdate::from_job(&job, base_time()).status(status))
            .await
    }

    fn apply_operation(&self, op: &StoreOp) {
        self.runtime.block_on(async {
            // Rejections are expected; the invariants check decides.
            let _ = match *op {
                StoreOp::Put { slot, due } => {
                    let mut job = Job::new(
                        JobPayload::PublishPost {
                            post_id: PostId::from("post"),
                            platform: Platform::new("twitter"),
                            content: "hello".to_string(),
                        },
                        at(due),
                        base_time(),
                    );
                    job.id = job_id(slot);
                    self.store.put(job).await.map(|_| ())
                }
                StoreOp::Claim { slot } => self
                    .transition(slot, JobStatus::Pending, |u| {
                        let attempt = u.attempt + 1;
                        u.status(JobStatus::Running).attempt(attempt)
                    })
                    .await
                    .map(|_| ()),
                StoreOp::Retry { slot, due } => self
                    .transition(slot, JobStatus::Running, |u| {
                        u.status(JobStatus::Pending).due_at(at(due))
                    })
                    .await
                    .map(|_| ()),
                StoreOp::Succeed { slot } => {
                    self.finish(slot, JobStatus::Succeeded).await.map(|_| ())
                }
                StoreOp::Fail { slot } => self.finish(slot, JobStatus::Failed).await.map(|_| ()),
                StoreOp::Cancel { slot } => self
                    .transition(slot, JobStatus::Pending, |u| u.status(JobStatus::Cancelled))
                    .await
                    .map(|_| ()),
                StoreOp::Reschedule { slot, due } => self
                    .transition(slot, JobStatus::Pending, |u| u.due_at(at(due)))
                    .await
                    .map(|_| ()),
                StoreOp::Remove { slot } => self.store.remove(&job_id(slot)).await,
            };
        });
    }

    fn verify_invariants(&self, model: &StoreModel) {
        self.runtime.block_on(async {
            // Invariant 1: every job matches the model
            for (slot, expected) in model.jobs.iter().enumerate() {
                match (self.store.get(&job_id(slot)).await, expected) {
                    (Ok(job), Some(expected)) => {
                        assert_eq!(job.status, expected.status, "status of slot {}", slot);
                        assert_eq!(job.attempt, expected.attempt, "attempt of slot {}", slot);
                        assert_eq!(job.due_at, at(expected.due), "due time of slot {}", slot);
                    }
                    (Err(StoreError::NotFound(_)), None) => {}
                    (actual, expected) => {
                        panic!("slot {}: store has {:?}, model has {:?}", slot, actual, expected)
                    }
                }
            }

            // Invariant 2: due jobs come back by due time, FIFO on ties
            let due: Vec<JobId> = self
                .store
                .list_due(at(1000))
                .await
                .unwrap()
                .into_iter()
                .map(|job| job.id)
                .collect();
            let expected: Vec<JobId> = model.pending_in_order().into_iter().map(job_id).collect();
            assert_eq!(due, expected, "list_due order");

            // Invariant 3: next_due_at is the earliest pending due time
            let next = self.store.next_due_at().await.unwrap();
            let expected_next = model
                .jobs
                .iter()
                .flatten()
                .filter(|j| j.status == JobStatus::Pending)
                .map(|j| at(j.due))
                .min();
            assert_eq!(next, expected_next, "next_due_at");
        });
    }
}

impl<S: FreshStore> StateMachineTest for StoreHarness<S> {
    type SystemUnderTest = Self;
    type Reference = StoreModel;

    fn init_test(
        _ref_state: &<Self::Reference as ReferenceStateMachine>::State,
    ) -> Self::SystemUnderTest {
        Self::new()
    }

    fn apply(
        state: Self::SystemUnderTest,
        ref_state: &<Self::Reference as ReferenceStateMachine>::State,
        transition: <Self::Reference as ReferenceStateMachine>::Transition,
    ) -> Self::SystemUnderTest {
        state.apply_operation(&transition);
        state.verify_invariants(ref_state);
        state
    }

    fn check_invariants(
        state: &Self::SystemUnderTest,
        ref_state: &<Self::Reference as ReferenceStateMachine>::State,
    ) {
        state.verify_invariants(ref_state);
    }
}

prop_state_machine! {
    #![proptest_config(ProptestConfig {
        cases: 100,
        max_shrink_iters: 10000,
        ..ProptestConfig::default()
    })]

    #[test]
    fn memory_store_state_machine(sequential 1..50 => MemoryHarness);

    #[test]
    fn sqlite_store_state_machine(sequential 1..50 => SqliteHarness);
}

// Additional targeted tests

#[tokio::test]
async fn test_cancelled_job_cannot_be_claimed() {
    let store = MemoryJobStore::new();
    let now = base_time();
    let mut job = Job::new(
        JobPayload::PublishPost {
            post_id: PostId::from("post"),
            platform: Platform::new("twitter"),
            content: "hello".to_string(),
        },
        now,
        now,
    );
    job.id = job_id(0);
    store.put(job.clone()).await.unwrap();

    store
        .compare_and_swap(
            &job.id,
            JobStatus::Pending,
            StatusUpdate::from_job(&job, now).status(JobStatus::Cancelled),
        )
        .await
        .unwrap();

    let err = store
        .update_status(
            &job.id,
            StatusUpdate::from_job(&job, now)
                .status(JobStatus::Running)
                .attempt(1),
        )
        .await
        .unwrap_err();
    assert!(matches!(
        err,
        StoreError::InvalidTransition {
            from: JobStatus::Cancelled,
            to: JobStatus::Running,
            ..
        }
    ));
}
