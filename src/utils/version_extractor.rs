//! 版本提取工具模块
//! 负责从正则捕获结果中，根据版本模板提取合法的技术版本号
//! 支持 \1/\2 或 $1/$2 两种分组引用格式，自动过滤无效版本

use regex::Captures;

/// 版本提取工具类
pub struct VersionExtractor;

impl VersionExtractor {
    /// 从正则捕获结果中提取有效版本号
    ///
    /// 模板中的 `\N` / `$N` 替换为第 N 个捕获分组（去除首尾空白）；
    /// 未发生任何替换、结果为空或残留占位符时返回 `None`
    pub fn extract(version_template: Option<&str>, captures: &Captures) -> Option<String> {
        let template = version_template.filter(|t| !t.trim().is_empty())?;
        let mut version = template.to_string();
        let mut replaced = false;

        // 倒序替换，避免 \1 误伤 \10
        for group_index in (1..captures.len()).rev() {
            let placeholder_backslash = format!("\\{}", group_index);
            let placeholder_dollar = format!("${}", group_index);

            let matched = captures
                .get(group_index)
                .map(|m| m.as_str().trim())
                .unwrap_or("");
            if !matched.is_empty()
                && (version.contains(&placeholder_backslash) || version.contains(&placeholder_dollar))
            {
                replaced = true;
            }
            version = version.replace(&placeholder_backslash, matched);
            version = version.replace(&placeholder_dollar, matched);
        }

        let final_version = version.trim().to_string();
        let is_valid_version = replaced
            && !final_version.is_empty()
            && !final_version.contains('\\')
            && !final_version.contains('$');

        is_valid_version.then_some(final_version)
    }
}
