//! 公共模块
//!
//! 提供跨模块使用的通用组件

mod clock;

pub use clock::{Clock, ManualClock, SystemClock};
