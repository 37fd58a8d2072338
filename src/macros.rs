/// Builds a [`BoxedExecFn`](crate::job::BoxedExecFn) from a block.
///
/// The first token names the per-firing [`JobContext`](crate::job::JobContext)
/// binding. An optional setup block runs synchronously on every call, before
/// the async body is created; clone shared handles there so the closure stays
/// `Fn`. The body must evaluate to `Result<(), JobError>`.
///
/// # Usage
///
/// ```ignore
/// # use lockstep::{job_fn, FnJob, JobError};
/// # use std::sync::{Arc, atomic::{AtomicUsize, Ordering}};
/// let counter = Arc::new(AtomicUsize::new(0));
///
/// let exec = job_fn!(ctx => {
///     let counter = counter.clone();
/// } {
///     ctx.check()?;
///     counter.fetch_add(1, Ordering::SeqCst);
///     Ok(())
/// });
/// let job = FnJob::new("count", "@every 30s", exec);
///
/// // Without a setup block:
/// let exec = job_fn!(ctx => {
///     ctx.sleep(std::time::Duration::from_millis(5)).await?;
///     Ok(())
/// });
/// ```
#[macro_export]
macro_rules! job_fn {
    // Context binding, setup block, then the main logic block
    (
        $ctx:ident => { $($setup_stmts:stmt);* $(;)? }
        $main_block:block
    ) => {
        Box::new(move |$ctx: $crate::job::JobContext| {
            $($setup_stmts)*

            let fut = async move {
                let result: ::std::result::Result<(), $crate::error::JobError> = $main_block;
                result
            };

            Box::pin(fut)
                as ::std::pin::Pin<
                    Box<
                        dyn ::std::future::Future<
                                Output = ::std::result::Result<(), $crate::error::JobError>,
                            > + Send
                            + 'static,
                    >,
                >
        }) as $crate::job::BoxedExecFn
    };

    // Context binding and main logic block only
    (
        $ctx:ident => $main_block:block
    ) => {
        Box::new(move |$ctx: $crate::job::JobContext| {
            let fut = async move {
                let result: ::std::result::Result<(), $crate::error::JobError> = $main_block;
                result
            };

            Box::pin(fut)
                as ::std::pin::Pin<
                    Box<
                        dyn ::std::future::Future<
                                Output = ::std::result::Result<(), $crate::error::JobError>,
                            > + Send
                            + 'static,
                    >,
                >
        }) as $crate::job::BoxedExecFn
    };
}
