//! Header格式转换工具
//! 各类响应头来源统一转换为小写键的多值映射

use std::time::Instant;

use reqwest::header::HeaderMap;
use tracing::{debug, warn};

use crate::evidence::HeaderMultiMap;

/// 单个响应最多处理的Header条数
const MAX_HEADER_ENTRIES: usize = 1000;

/// Header转换工具
pub struct HeaderConverter;

impl HeaderConverter {
    /// 将HeaderMap转换为小写键多值映射
    pub fn to_multimap(header_map: &HeaderMap) -> HeaderMultiMap {
        let start = Instant::now();
        let mut map = HeaderMultiMap::new();

        for (iter_count, (key, value)) in header_map.iter().enumerate() {
            if iter_count >= MAX_HEADER_ENTRIES {
                warn!("Header条目超过{}条，截断处理", MAX_HEADER_ENTRIES);
                break;
            }
            let value_str = String::from_utf8_lossy(value.as_bytes()).into_owned();
            map.entry(key.as_str().to_lowercase())
                .or_default()
                .push(value_str);
        }

        debug!(
            "Header转换完成，耗时{:?}，生成{}条记录",
            start.elapsed(),
            map.len()
        );
        map
    }

    /// 将名称/值对（网络观测事件携带的形式）转换为多值映射
    pub fn from_pairs<K, V>(pairs: &[(K, V)]) -> HeaderMultiMap
    where
        K: AsRef<str>,
        V: AsRef<str>,
    {
        let mut map = HeaderMultiMap::new();
        for (key, value) in pairs.iter().take(MAX_HEADER_ENTRIES) {
            map.entry(key.as_ref().trim().to_lowercase())
                .or_default()
                .push(value.as_ref().trim().to_string());
        }
        map
    }

    /// 由 Set-Cookie 响应头拼出 `document.cookie` 形式的字符串
    pub fn cookie_string(headers: &HeaderMultiMap) -> String {
        headers
            .get("set-cookie")
            .map(|values| {
                values
                    .iter()
                    .filter_map(|v| v.split(';').next())
                    .map(str::trim)
                    .filter(|pair| !pair.is_empty())
                    .collect::<Vec<_>>()
                    .join("; ")
            })
            .unwrap_or_default()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use reqwest::header::{HeaderValue, SET_COOKIE};

    #[test]
    fn test_to_multimap_keeps_repeated_headers() {
        let mut headers = HeaderMap::new();
        headers.append(SET_COOKIE, HeaderValue::from_static("a=1; Path=/"));
        headers.append(SET_COOKIE, HeaderValue::from_static("PHPSESSID=xyz; HttpOnly"));
        headers.insert("X-Vercel-Id", HeaderValue::from_static("fra1::abc"));

        let map = HeaderConverter::to_multimap(&headers);
        assert_eq!(map["set-cookie"].len(), 2);
        assert_eq!(map["x-vercel-id"], vec!["fra1::abc".to_string()]);
        assert_eq!(HeaderConverter::cookie_string(&map), "a=1; PHPSESSID=xyz");
    }

    #[test]
    fn test_from_pairs_lowercases_names() {
        let map = HeaderConverter::from_pairs(&[("Server", "Vercel"), ("X-Powered-By", "Express")]);
        assert_eq!(map["server"], vec!["Vercel".to_string()]);
        assert_eq!(map["x-powered-by"], vec!["Express".to_string()]);
    }
}
