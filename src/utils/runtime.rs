use anyhow::Result;

/// Every timer callback of the tracker shares one thread, so state is never mutated in parallel.
pub fn single_thread_runtime() -> Result<tokio::runtime::Runtime> {
    Ok(tokio::runtime::Builder::new_current_thread()
        .enable_all()
        .build()?)
}
