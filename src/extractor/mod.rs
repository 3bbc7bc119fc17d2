//! 提取模块：从页面HTML中提取证据
pub mod html_extractor;

pub use self::html_extractor::{HtmlExtraction, HtmlExtractor};
