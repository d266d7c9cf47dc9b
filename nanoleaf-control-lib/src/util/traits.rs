use std::fmt;

use crate::util::context::Context;

/// Receives trace lines for device operations.
///
/// A tracer is attached to a single [`Controller`](crate::control_interface::Controller)
/// and is called when an operation starts and when it finishes, including all
/// of its retries. Controllers without a tracer skip tracing entirely.
///
/// Any `Fn(&Context, fmt::Arguments<'_>)` closure that is `Send + Sync` is a tracer:
///
/// ```
/// use nanoleaf_control_lib::util::context::Context;
/// use nanoleaf_control_lib::util::traits::Tracer;
///
/// let tracer = |_ctx: &Context, line: std::fmt::Arguments<'_>| eprintln!("\t| {}", line);
/// tracer.trace(&Context::background(), format_args!("Nanoleaf GET to {}", "/"));
/// ```
pub trait Tracer: Send + Sync {
    fn trace(&self, ctx: &Context, line: fmt::Arguments<'_>);
}

impl<F> Tracer for F
where
    F: Fn(&Context, fmt::Arguments<'_>) + Send + Sync,
{
    fn trace(&self, ctx: &Context, line: fmt::Arguments<'_>) {
        self(ctx, line)
    }
}
