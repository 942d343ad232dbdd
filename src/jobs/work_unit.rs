use super::context::JobContext;
use super::error::WorkUnitError;

/// A unit of work submitted for asynchronous execution.
///
/// Units are invoked once, from a blocking context (a pooled or dedicated
/// worker thread). Long-running work should check `ctx.is_cancelled()`
/// (or call `ctx.checkpoint()?`) between steps and return
/// `WorkUnitError::Cancelled` when asked to stop.
pub trait WorkUnit: Send + Sync {
    /// Display name recorded on the job.
    fn name(&self) -> &str;

    /// Run the unit, writing output through `ctx`.
    fn invoke(&self, ctx: &JobContext) -> Result<(), WorkUnitError>;
}

impl<W: WorkUnit + ?Sized> WorkUnit for Box<W> {
    fn name(&self) -> &str {
        (**self).name()
    }

    fn invoke(&self, ctx: &JobContext) -> Result<(), WorkUnitError> {
        (**self).invoke(ctx)
    }
}

/// A work unit backed by a closure. The closure's captures are its input.
pub struct FnUnit<F> {
    name: String,
    func: F,
}

impl<F> FnUnit<F>
where
    F: Fn(&JobContext) -> Result<(), WorkUnitError> + Send + Sync,
{
    pub fn new(name: impl Into<String>, func: F) -> Self {
        Self {
            name: name.into(),
            func,
        }
    }
}

impl<F> WorkUnit for FnUnit<F>
where
    F: Fn(&JobContext) -> Result<(), WorkUnitError> + Send + Sync,
{
    fn name(&self) -> &str {
        &self.name
    }

    fn invoke(&self, ctx: &JobContext) -> Result<(), WorkUnitError> {
        (self.func)(ctx)
    }
}
