//! 跨上下文消息定义，统一以 MessagePack 编码传输
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};

use crate::error::SpResult;
use crate::evidence::{EvidencePatch, NetworkEvent, PageSnapshot};
use crate::report::{AggregateReport, PageId};

/// 协调端发往页面代理的请求
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum BridgeRequest {
    /// 页面快照，触发完整检测
    Snapshot(PageSnapshot),
    Network(NetworkEvent),
    /// 延迟探测结果
    Patch(EvidencePatch),
    Navigate { url: Option<String> },
    /// 页面切换到前台或后台
    Focus { active: bool },
    /// 用最近一次快照重新检测
    Rerun,
    GetReport,
}

/// 页面代理的应答
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum BridgeResponse {
    Report(AggregateReport),
    Ack,
}

/// 报告变化的主动通知
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ReportUpdated {
    pub page_id: PageId,
    /// 发布时页面所处的导航代次
    pub generation: u64,
    pub report: AggregateReport,
}

/// 编码为带字段名的 MessagePack
pub fn encode<T: Serialize>(message: &T) -> SpResult<Vec<u8>> {
    Ok(rmp_serde::to_vec_named(message)?)
}

pub fn decode<T: DeserializeOwned>(bytes: &[u8]) -> SpResult<T> {
    Ok(rmp_serde::from_slice(bytes)?)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::StackprintError;
    use crate::evidence::RequestKind;
    use crate::report::Finding;

    #[test]
    fn test_report_update_survives_encoding() {
        let mut report = AggregateReport::new();
        report.frameworks.upsert(Finding::new("React").with_version("18.2.0"));
        report.databases.upsert(Finding::new("PostgreSQL").inferred());
        report.hosting.upsert(Finding::new("Vercel").via("headers"));
        let update = ReportUpdated {
            page_id: PageId::new("tab-7"),
            generation: 3,
            report,
        };
        let decoded: ReportUpdated = decode(&encode(&update).unwrap()).unwrap();
        assert_eq!(decoded, update);
    }

    #[test]
    fn test_network_request_encoding() {
        let request = BridgeRequest::Network(NetworkEvent::ResponseReceived {
            kind: RequestKind::Xhr,
            url: "/api/items".to_string(),
            headers: vec![("server".to_string(), "node".to_string())],
        });
        let decoded: BridgeRequest = decode(&encode(&request).unwrap()).unwrap();
        assert_eq!(decoded, request);
    }

    #[test]
    fn test_garbage_is_decode_error() {
        let err = decode::<BridgeRequest>(&[0xc1, 0x00]).unwrap_err();
        assert!(matches!(err, StackprintError::MsgPackDecode(_)));
    }
}
