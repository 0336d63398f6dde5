//! Step abstraction and the sequencer that drives a build.

use async_trait::async_trait;

use crate::context::BuildContext;
use crate::error::BuildError;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StepAction {
    Continue,
    Halt,
}

/// One stage of a build.
///
/// `run` records failures in [`BuildContext::error`] and returns
/// [`StepAction::Halt`]. `cleanup` runs for every step that ran, in reverse
/// order, and only undoes what the step itself created.
#[async_trait]
pub trait Step: Send + Sync {
    fn name(&self) -> &'static str;

    async fn run(&mut self, ctx: &mut BuildContext) -> StepAction;

    async fn cleanup(&mut self, _ctx: &mut BuildContext) {}
}

/// Record `err` as the build error and halt.
pub fn halt(ctx: &mut BuildContext, err: impl Into<BuildError>) -> StepAction {
    let err = err.into();
    tracing::error!("{err}");
    ctx.error = Some(err);
    StepAction::Halt
}

/// Unwrap a result inside [`Step::run`], halting the build on error.
macro_rules! try_step {
    ($ctx:expr, $e:expr) => {
        match $e {
            Ok(v) => v,
            Err(e) => return $crate::step::halt($ctx, e),
        }
    };
}
pub(crate) use try_step;

pub struct Sequencer {
    steps: Vec<Box<dyn Step>>,
}

impl Sequencer {
    pub fn new(steps: Vec<Box<dyn Step>>) -> Self {
        Self { steps }
    }

    pub fn step_names(&self) -> Vec<&'static str> {
        self.steps.iter().map(|s| s.name()).collect()
    }

    /// Run every step in order, stopping on halt or cancellation, then clean
    /// up the steps that ran in reverse order.
    pub async fn run(&mut self, ctx: &mut BuildContext) {
        let mut ran = 0;
        for step in self.steps.iter_mut() {
            if ctx.cancel.is_cancelled() {
                ctx.cancelled = true;
                break;
            }

            let name = step.name();
            tracing::info!(step = name, "running");
            ran += 1;
            let action = step.run(ctx).await;

            if ctx.cancel.is_cancelled() {
                ctx.cancelled = true;
            }
            if action == StepAction::Halt {
                tracing::debug!(step = name, "halted");
                ctx.halted = true;
            }
            if ctx.halted || ctx.cancelled {
                break;
            }
        }

        for step in self.steps[..ran].iter_mut().rev() {
            tracing::debug!(step = step.name(), "cleaning up");
            step.cleanup(ctx).await;
        }
    }
}
