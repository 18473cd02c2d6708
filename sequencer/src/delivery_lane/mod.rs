// (c) Cartesi and individual authors (see AUTHORS)
// SPDX-License-Identifier: Apache-2.0 (see LICENSE)

mod error;
mod lane;
mod profiling;

pub use error::DeliveryLaneError;
pub use lane::{DeliveryLane, DeliveryLaneConfig, DeliveryLaneStop};
