//! # bcpm
//!
//! A test harness for players of a turn-based robot simulation engine, driven through an
//! external build tool.
//!
//! It provides:
//! - Private, rewritten copies of a player's source tree (`Environment`)
//! - Text level code transplants from a test suite into those copies (`transplant`)
//! - Match execution and log parsing (`TestMatch`, `outcome`)
//! - Duels scored over several maps and both sides, on a pool of workers (`scheduler`)
//! - Test suites with match assertions (`suite`, `assertions`)
//!
//! Players live in a player root, each laid out as `<name>/src/<name>/...`. They are made
//! visible to the simulation distribution by links in its `teams` directory. The engine itself
//! is never linked: every build and every match is one invocation of the build tool against
//! a generated build descriptor.
//!
//! # Documentation Overview
//!
//! - For the orchestrator, see [`Harness`](crate::harness::Harness).
//! - For configuring paths, workers and logging, see
//!   [`Configuration`](crate::configuration::Configuration).
//! - For writing test suites, see the [`suite`] module and the [`assertions`].
//! - For the source directives understood by the transplants, see the [`transplant`] and
//!   [`regen`] modules.
//!
//! # Usage Example
//!
//! ```no_run
//! use bcpm::prelude::*;
//!
//! fn main() -> anyhow::Result<()> {
//!     let config = Configuration::from_env()?.with_workers(4);
//!     let harness = Harness::new(config)?;
//!
//!     let maps = vec!["fortress".to_owned(), "lanes".to_owned()];
//!     let result = harness.duel("team042", "team017", &maps)?;
//!     println!(
//!         "score {} ({} won, {} lost, {} tied)",
//!         result.score, result.wins, result.losses, result.ties
//!     );
//!
//!     let mut builder = harness.suite_builder();
//!     builder.map("fortress").vs("team017");
//!     builder.stub_call("yield", "team000.Stubs.noYield")?;
//!     builder.match_with(|m| {
//!         m.it("wins without yielding", |t| should_win(t));
//!     })?;
//!     let report = harness.run_suite(&builder.build(), "team042")?;
//!     println!("{report}");
//!
//!     harness.cleanup()?;
//!     Ok(())
//! }
//! ```

pub use anyhow;
pub mod assertions;
pub mod build_runner;
pub mod configuration;
pub mod environment;
pub mod harness;
pub mod ids;
mod logger;
pub mod outcome;
pub mod regen;
pub mod scheduler;
pub mod suite;
pub mod test_match;
pub mod transplant;
pub mod workspace;

/// Commonly used types and functions for quick access.
///
/// ```rust
/// use bcpm::prelude::*;
/// ```
pub mod prelude {
    pub use crate::assertions::{should_lose, should_not_throw, should_win, should_win_by};
    pub use crate::configuration::Configuration;
    pub use crate::harness::Harness;
    pub use crate::ids::IdAllocator;
    pub use crate::outcome::{Side, Winner};
    pub use crate::scheduler::DuelResult;
    pub use crate::suite::{Suite, SuiteBuilder, SuiteReport};
    pub use crate::test_match::TestMatch;
}
