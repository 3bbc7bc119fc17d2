//! 全局错误类型定义

use regex::Error as RegexError;
use serde_json::Error as SerdeJsonError;
use std::io::Error as IoError;
use thiserror::Error;
use url::ParseError as UrlParseError;

#[derive(Error, Debug)]
pub enum StackprintError {
    // 规则相关错误
    #[error("规则加载失败：{0}")]
    RuleLoadError(String),
    #[error("规则解析失败：{0}")]
    RuleParseError(String),

    // 编译相关错误
    #[error("正则编译失败：{0}")]
    RegexCompileError(#[from] RegexError),
    #[error("CSS选择器编译失败：{0}")]
    SelectorError(String),

    // 证据采集相关错误（仅在探针内部传递，不会中断采集）
    #[error("探针不可用：{0}")]
    ProbeUnavailable(String),

    // 跨上下文通信错误
    #[error("消息通道已关闭：{0}")]
    ChannelClosed(String),
    #[error("等待响应超时：{0}")]
    Timeout(String),
    #[error("无可用检测数据：{0}")]
    NoData(String),

    // 网络相关错误
    #[error("网络请求失败：{0}")]
    HttpError(#[from] reqwest::Error),

    // 序列化/反序列化错误
    #[error("JSON解析失败：{0}")]
    JsonError(#[from] SerdeJsonError),
    #[error("MessagePack编码失败：{0}")]
    MsgPackEncode(#[from] rmp_serde::encode::Error),
    #[error("MessagePack解码失败：{0}")]
    MsgPackDecode(#[from] rmp_serde::decode::Error),

    // 基础错误
    #[error("IO操作失败：{0}")]
    IoError(#[from] IoError),
    #[error("URL解析失败：{0}")]
    UrlError(#[from] UrlParseError),
    #[error("无效输入：{0}")]
    InvalidInput(String),
}

// 全局Result类型
pub type SpResult<T> = Result<T, StackprintError>;
