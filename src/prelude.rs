//! Prelude module for `tapmeter`. Use as a star-import.

pub use crate::config::*;
pub use crate::engine::*;
pub use crate::error::*;
pub use crate::multi::*;
pub use crate::schedule::*;
pub use crate::single::*;
pub use crate::tap::*;
pub use crate::SendEverywhereButOnWeb;
pub use tapmeter_core::buffer::{AudioBuffer, AudioMut, AudioRef};
pub use tapmeter_core::estimator::LevelEstimator;
pub use tapmeter_core::levels::*;
pub use tapmeter_core::sample::ConvertSample;
