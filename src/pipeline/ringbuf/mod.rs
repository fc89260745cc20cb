mod common;
mod spsc;

pub(crate) use spsc::*;
