// Release pipeline: fetch new releases, then dispatch notifications

pub mod dispatch;
pub mod fetch;

pub use dispatch::{DispatchError, DispatchManager, DispatchReport, DispatchSettings};
pub use fetch::{FetchFailure, FetchOrchestrator, FetchReport, FetchSettings, FetchStats};
