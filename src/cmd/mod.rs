//! CLI command implementations.
//!
//! | Module   | Commands handled                       |
//! |----------|----------------------------------------|
//! | `up`     | `Up` — supervise the service fleet     |
//! | `bridge` | `Bridge` — run the control API server  |
//! | `train`  | `Train start/stop/status/log`          |

pub mod bridge;
pub mod train;
pub mod up;

pub use bridge::cmd_bridge;
pub use train::{cmd_train_log, cmd_train_start, cmd_train_status, cmd_train_stop};
pub use up::cmd_up;
