//! 跨上下文桥接：页面代理与协调端之间只传递 MessagePack 消息
pub mod agent;
pub mod coordinator;
pub mod messages;

pub use self::agent::{PageAgent, PageHandle};
pub use self::coordinator::Coordinator;
pub use self::messages::{BridgeRequest, BridgeResponse, ReportUpdated};
