//! Shared output-writer trait, adapted from the reference toolkit's
//! `writers.rs::OutWriter<T>`.

pub trait OutWriter<T> {
    fn write(&mut self, item: T) -> anyhow::Result<u64>;
}
