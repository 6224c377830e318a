use std::{
    path::PathBuf,
    sync::{
        atomic::{AtomicBool, Ordering},
        Mutex,
    },
};

use anyhow::Context;
use tracing::{error, info, instrument, warn};

use crate::{
    build_runner::BuildRunner,
    suite::SuiteTree,
    transplant::{SourceRewriter, StubCall, Transplant, TransplantOp},
    workspace::Workspace,
};

/// What an environment needs to materialize itself.
#[derive(Clone, Copy)]
pub struct SetupContext<'a> {
    pub workspace: &'a Workspace,
    pub runner: &'a BuildRunner,
    /// Source of transplanted code. Only needed when operations were queued.
    pub suite: Option<&'a SuiteTree>,
    pub rewriter: &'a dyn SourceRewriter,
}

#[derive(Debug, Default)]
struct Blueprint {
    file_ops: Vec<TransplantOp>,
    patch_ops: Vec<StubCall>,
    sealed: bool,
    build_log: String,
    package: Option<PathBuf>,
}

/// An isolated copy of a player's source tree, rewritten for testing and compiled.
///
/// Operations are queued on the blueprint, then [`setup`](Environment::setup) materializes
/// it once. Matches only run in environments that are [available](Environment::is_available).
#[derive(Debug)]
pub struct Environment {
    name: String,
    blueprint: Mutex<Blueprint>,
    available: AtomicBool,
}

impl Environment {
    /// A blueprint. `name` becomes both the player name and its package.
    pub fn new(name: impl Into<String>) -> Environment {
        Environment {
            name: name.into(),
            blueprint: Mutex::new(Blueprint::default()),
            available: AtomicBool::new(false),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn is_available(&self) -> bool {
        self.available.load(Ordering::Acquire)
    }

    /// Log of the last build, empty before setup.
    pub fn build_log(&self) -> String {
        self.blueprint.lock().expect("poisoned").build_log.clone()
    }

    /// Queues a copy operation. Stub operations are routed to the patch queue.
    ///
    /// Ignored once setup started.
    pub fn queue_file_operation(&self, op: TransplantOp) {
        if let TransplantOp::Stub(stub) = op {
            self.queue_patch_operation(stub);
            return;
        }
        let mut blueprint = self.blueprint.lock().expect("poisoned");
        if blueprint.sealed {
            warn!("{}: operation queued after setup, ignored", self.name);
            return;
        }
        blueprint.file_ops.push(op);
    }

    /// Queues a call stub. Ignored once setup started.
    pub fn queue_patch_operation(&self, stub: StubCall) {
        let mut blueprint = self.blueprint.lock().expect("poisoned");
        if blueprint.sealed {
            warn!("{}: operation queued after setup, ignored", self.name);
            return;
        }
        blueprint.patch_ops.push(stub);
    }

    /// Whether any operation is queued.
    pub fn has_operations(&self) -> bool {
        let blueprint = self.blueprint.lock().expect("poisoned");
        !blueprint.file_ops.is_empty() || !blueprint.patch_ops.is_empty()
    }

    /// Copies `source_player`, applies the queued operations and builds the result.
    ///
    /// Never fails: problems are logged and leave the environment unavailable for good.
    /// Returns availability.
    #[instrument(skip(self, ctx), fields(environment = %self.name))]
    pub fn setup(&self, ctx: &SetupContext, source_player: &str) -> bool {
        if self.is_available() {
            return true;
        }
        let mut blueprint = self.blueprint.lock().expect("poisoned");
        if blueprint.sealed {
            return false;
        }
        blueprint.sealed = true;

        match self.materialize(&mut blueprint, ctx, source_player) {
            Ok(true) => {
                info!("environment {} ready", self.name);
                self.available.store(true, Ordering::Release);
                return true;
            }
            Ok(false) => error!("environment {}: build failed", self.name),
            Err(e) => error!("environment {}: setup failed: {e:#}", self.name),
        }
        if blueprint.package.take().is_some() {
            if let Err(e) = ctx.workspace.uninstall(&self.name) {
                error!("could not remove {}: {e:#}", self.name);
            }
        }
        false
    }

    fn materialize(
        &self,
        blueprint: &mut Blueprint,
        ctx: &SetupContext,
        source_player: &str,
    ) -> anyhow::Result<bool> {
        let package = ctx.workspace.checkpoint(source_player, &self.name)?;
        blueprint.package = Some(package.clone());

        if !blueprint.file_ops.is_empty() || !blueprint.patch_ops.is_empty() {
            let suite = ctx
                .suite
                .context("code transplants need a test suite")?;
            let suite_package = suite.package_path()?;
            let transplant = Transplant::new(
                &suite_package,
                &package,
                suite.target_player(),
                &self.name,
                ctx.rewriter,
            );
            for op in &blueprint.file_ops {
                transplant.apply_file_op(op)?;
            }
            transplant.apply_patch_ops(&blueprint.patch_ops)?;
        }

        let outcome = ctx.runner.build(&self.name)?;
        blueprint.build_log = outcome.log;
        Ok(outcome.success)
    }

    #[cfg(test)]
    pub(crate) fn mark_available(&self) {
        self.available.store(true, Ordering::Release);
    }

    /// Removes the environment's workspace. No-op when it never became available.
    pub fn teardown(&self, workspace: &Workspace) -> anyhow::Result<()> {
        if !self.available.swap(false, Ordering::AcqRel) {
            return Ok(());
        }
        self.blueprint.lock().expect("poisoned").package = None;
        workspace.uninstall(&self.name)
    }
}
