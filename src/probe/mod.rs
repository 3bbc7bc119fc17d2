//! 延迟探测：页面检测之后补充的响应头与脚本分块证据
//! 探测失败不影响已有结果
pub mod chunk;
pub mod header;

pub use self::chunk::ChunkScanner;
pub use self::header::HeaderProbe;
