use crate::error::{Error, Result};

/// Build a named thread pool. Worker threads are labeled `{name}-{index}` so
/// they are attributable in stack dumps and profiles. A thread count of zero
/// lets the pool size itself to the machine.
pub fn named(name: &'static str, threads: usize) -> Result<rayon::ThreadPool> {
    rayon::ThreadPoolBuilder::new()
        .num_threads(threads)
        .thread_name(move |index| format!("{name}-{index}"))
        .build()
        .map_err(|e| Error::IO(e.to_string()))
}
