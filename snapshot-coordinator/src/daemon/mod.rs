//! Process lifecycle for `serve`.

pub mod shutdown;
