//! 事件模块
//!
//! 上传子系统本身不渲染任何界面，状态和进度通过事件推送给 UI 层
//! - `types.rs`: 上传事件类型与广播总线
//! - `throttle.rs`: 按任务节流进度事件

mod throttle;
mod types;

pub use throttle::*;
pub use types::*;
