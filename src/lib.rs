pub mod counters;
pub mod experiment;
pub mod logging;
pub mod observer;
pub mod options;
pub mod process;
pub mod producer;
pub mod signals;
