//! Runs batches of matches on a fixed pool of workers and scores duels.
//!
//! Matches are independent: the environment they run in is built before scheduling, so a
//! worker only runs the simulation. Results come back in completion order, which is not the
//! scheduling order.

use std::{
    fmt,
    panic::{self, AssertUnwindSafe},
    sync::{
        atomic::{AtomicBool, Ordering},
        mpsc, Arc, Mutex,
    },
};

use anyhow::{anyhow, bail};
use tracing::{error, trace};

use crate::{
    build_runner::{BuildRunner, Options},
    environment::Environment,
    ids::IdAllocator,
    outcome::{Side, Winner},
    test_match::TestMatch,
};

/// Runs a single match to completion.
pub trait MatchExecutor: Sync {
    fn execute(&self, test_match: &TestMatch) -> anyhow::Result<()>;
}

/// Runs matches through the simulation engine.
pub struct SimulationExecutor<'a> {
    runner: &'a BuildRunner,
    ids: &'a IdAllocator,
    live: bool,
}

impl<'a> SimulationExecutor<'a> {
    pub fn new(runner: &'a BuildRunner, ids: &'a IdAllocator) -> SimulationExecutor<'a> {
        SimulationExecutor {
            runner,
            ids,
            live: false,
        }
    }

    /// Show matches in the live viewer.
    pub fn with_live(mut self, live: bool) -> Self {
        self.live = live;
        self
    }
}

impl MatchExecutor for SimulationExecutor<'_> {
    fn execute(&self, test_match: &TestMatch) -> anyhow::Result<()> {
        test_match.run(self.runner, self.ids, self.live)
    }
}

/// Steps of a duel, logged as it progresses.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DuelPhase {
    Idle,
    Validating,
    Building,
    Scheduling,
    Draining,
    Aggregating,
    Done,
}

impl fmt::Display for DuelPhase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            DuelPhase::Idle => "idle",
            DuelPhase::Validating => "validating",
            DuelPhase::Building => "building",
            DuelPhase::Scheduling => "scheduling",
            DuelPhase::Draining => "draining",
            DuelPhase::Aggregating => "aggregating",
            DuelPhase::Done => "done",
        };
        write!(f, "{name}")
    }
}

/// Every map played from both sides, map by map.
pub fn schedule_duel(
    environment: &Arc<Environment>,
    opponent: &str,
    maps: &[String],
) -> Vec<Arc<TestMatch>> {
    maps.iter()
        .flat_map(|map| {
            Side::BOTH.map(|side| {
                Arc::new(TestMatch::new(
                    side,
                    opponent,
                    map.clone(),
                    environment.clone(),
                    Options::new(),
                ))
            })
        })
        .collect()
}

/// Runs `matches` on `workers` threads and hands each finished match to `on_result`, on the
/// calling thread, in completion order.
///
/// The first failing match aborts the whole batch: workers stop picking new matches and the
/// error is returned once the running ones are done.
pub fn drain<E, F>(
    matches: Vec<Arc<TestMatch>>,
    workers: usize,
    executor: &E,
    mut on_result: F,
) -> anyhow::Result<Vec<Arc<TestMatch>>>
where
    E: MatchExecutor + ?Sized,
    F: FnMut(&Arc<TestMatch>),
{
    let total = matches.len();
    if total == 0 {
        return Ok(vec![]);
    }
    let workers = workers.clamp(1, total);

    let (tx_job, rx_job) = mpsc::channel();
    for test_match in matches {
        tx_job.send(test_match)?;
    }
    // closing the queue is the done signal of every worker
    drop(tx_job);
    let rx_job = Mutex::new(rx_job);
    let abort = AtomicBool::new(false);

    std::thread::scope(|s| {
        let (tx_result, rx_result) = mpsc::channel();
        for worker in 0..workers {
            let tx_result = tx_result.clone();
            let (rx_job, abort) = (&rx_job, &abort);
            s.spawn(move || {
                while !abort.load(Ordering::Acquire) {
                    let next = rx_job.lock().expect("poisoned").recv();
                    let Ok(test_match) = next else {
                        break;
                    };
                    trace!(worker, "running {test_match}");
                    let result = match panic::catch_unwind(AssertUnwindSafe(|| {
                        executor.execute(&test_match)
                    })) {
                        Ok(Ok(())) => Ok(test_match),
                        Ok(Err(e)) => Err(e.context(format!("match {test_match} failed"))),
                        Err(_) => Err(anyhow!("worker {worker} panicked on {test_match}")),
                    };
                    if result.is_err() {
                        abort.store(true, Ordering::Release);
                    }
                    if tx_result.send(result).is_err() {
                        break;
                    }
                }
            });
        }
        drop(tx_result);

        let mut finished = Vec::with_capacity(total);
        while finished.len() < total {
            match rx_result.recv() {
                Ok(Ok(test_match)) => {
                    on_result(&test_match);
                    finished.push(test_match);
                }
                Ok(Err(e)) => {
                    error!("aborting after {} of {total} matches: {e:#}", finished.len());
                    abort.store(true, Ordering::Release);
                    return Err(e);
                }
                Err(_) => bail!("workers stopped after {} of {total} matches", finished.len()),
            }
        }
        Ok(finished)
    })
}

/// +1 when the environment's player won, -1 when it lost, 0 for ties and broken logs.
pub fn score_delta(test_match: &TestMatch) -> i32 {
    match test_match.winner() {
        Winner::Side(side) if side == test_match.side() => 1,
        Winner::Side(_) => -1,
        Winner::Error => 0,
    }
}

/// Score of a duel, from the point of view of the player under test.
#[derive(Debug, Clone, Default)]
pub struct DuelResult {
    /// `wins - losses`
    pub score: i64,
    pub wins: usize,
    pub losses: usize,
    pub ties: usize,
    pub won: Vec<Arc<TestMatch>>,
    pub lost: Vec<Arc<TestMatch>>,
    pub tied: Vec<Arc<TestMatch>>,
}

impl DuelResult {
    pub fn add(&mut self, test_match: Arc<TestMatch>) {
        let delta = score_delta(&test_match);
        self.score += i64::from(delta);
        match delta {
            1 => {
                self.wins += 1;
                self.won.push(test_match);
            }
            -1 => {
                self.losses += 1;
                self.lost.push(test_match);
            }
            _ => {
                self.ties += 1;
                self.tied.push(test_match);
            }
        }
    }

    /// Number of matches scored.
    pub fn total(&self) -> usize {
        self.wins + self.losses + self.ties
    }
}

pub fn aggregate(matches: impl IntoIterator<Item = Arc<TestMatch>>) -> DuelResult {
    let mut result = DuelResult::default();
    for test_match in matches {
        result.add(test_match);
    }
    result
}

pub(crate) fn print_duel_progress(test_match: &TestMatch) {
    // clear line, coloured verdict, default colour
    let verdict = match score_delta(test_match) {
        1 => "\x1b[32mwon\x1b[39m",
        -1 => "\x1b[31mlost\x1b[39m",
        _ => "\x1b[33mtie\x1b[39m",
    };
    println!("\x1b[2K{verdict} {test_match}");
}
