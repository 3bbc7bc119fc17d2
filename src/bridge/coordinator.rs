//! 协调端：登记页面、跟踪前台页面、转发网络事件并缓存各页面报告
//! 缓存可能落后于页面代理，查询时以代理应答为准
use std::collections::HashMap;
use std::sync::Arc;

use reqwest::Client;
use tokio::sync::mpsc;
use tracing::{debug, info, warn};
use url::Url;

use super::agent::{PageAgent, PageHandle};
use super::messages::{decode, BridgeRequest, BridgeResponse, ReportUpdated};
use crate::config::{BridgeConfig, DetectionSettings};
use crate::detector::TechDetector;
use crate::error::{SpResult, StackprintError};
use crate::evidence::{NetworkEvent, PageSnapshot};
use crate::report::{AggregateReport, PageId, ResultAggregator};
use crate::session::DetectionSession;

/// 已登记页面
struct PageEntry {
    handle: PageHandle,
    // 与页面代理同步递增的导航代次
    generation: u64,
}

impl PageEntry {
    fn new(handle: PageHandle) -> Self {
        Self { handle, generation: 0 }
    }
}

/// 多页面协调器
pub struct Coordinator {
    settings: DetectionSettings,
    config: BridgeConfig,
    detector: Arc<TechDetector>,
    client: Client,
    pages: HashMap<PageId, PageEntry>,
    active: Option<PageId>,
    cache: ResultAggregator,
    updates_tx: mpsc::UnboundedSender<Vec<u8>>,
    updates_rx: mpsc::UnboundedReceiver<Vec<u8>>,
}

impl Coordinator {
    pub fn new(settings: DetectionSettings, config: BridgeConfig, detector: Arc<TechDetector>) -> Self {
        Self::with_client(settings, config, detector, Client::new())
    }

    pub fn with_client(
        settings: DetectionSettings,
        config: BridgeConfig,
        detector: Arc<TechDetector>,
        client: Client,
    ) -> Self {
        let (updates_tx, updates_rx) = mpsc::unbounded_channel();
        let cache = ResultAggregator::new(detector.post_processor().clone());
        Self {
            settings,
            config,
            detector,
            client,
            pages: HashMap::new(),
            active: None,
            cache,
            updates_tx,
            updates_rx,
        }
    }

    /// 登记页面并启动页面代理（已登记则直接返回）
    pub fn open_page(&mut self, page_id: PageId) -> &PageHandle {
        let settings = &self.settings;
        let detector = &self.detector;
        let client = &self.client;
        let updates = &self.updates_tx;
        let active = self.active.as_ref() == Some(&page_id);
        let entry = self.pages.entry(page_id.clone()).or_insert_with(|| {
            let session = DetectionSession::new(page_id, settings.clone(), Arc::clone(detector));
            let handle = PageAgent::spawn(session, client.clone(), updates.clone());
            // 新信箱必有空位
            if active {
                if let Err(e) = handle.try_notify(&BridgeRequest::Focus { active: true }) {
                    debug!("前台状态同步失败：{}", e);
                }
            }
            PageEntry::new(handle)
        });
        &entry.handle
    }

    /// 注销页面，句柄释放后代理任务退出
    pub fn close_page(&mut self, page_id: &PageId) {
        if self.pages.remove(page_id).is_some() {
            info!("页面已关闭：{}", page_id);
        }
        self.cache.remove(page_id);
        if self.active.as_ref() == Some(page_id) {
            self.active = None;
        }
    }

    /// 切换前台页面，并通知新旧页面代理
    pub async fn set_active_page(&mut self, page_id: PageId) {
        debug!("前台页面切换：{}", page_id);
        if let Some(previous) = self.active.replace(page_id.clone()) {
            if previous != page_id {
                self.send_focus(&previous, false).await;
            }
        }
        self.send_focus(&page_id, true).await;
    }

    async fn send_focus(&self, page_id: &PageId, active: bool) {
        if let Ok(handle) = self.handle(page_id) {
            if let Err(e) = handle.notify(&BridgeRequest::Focus { active }).await {
                debug!("前台状态同步失败：{}", e);
            }
        }
    }

    pub fn active_page(&self) -> Option<&PageId> {
        self.active.as_ref()
    }

    /// 提交页面快照，返回检测结果并刷新缓存
    pub async fn submit_snapshot(&mut self, page_id: &PageId, snapshot: PageSnapshot) -> SpResult<AggregateReport> {
        let response = self.handle(page_id)?
            .request(&BridgeRequest::Snapshot(snapshot), self.config.query_timeout)
            .await?;
        let report = expect_report(response)?;
        self.cache.replace(page_id, report.clone());
        Ok(report)
    }

    /// 页面导航：缓存清空，导航前发布的报告更新此后一律丢弃
    pub async fn navigate(&mut self, page_id: &PageId, url: Option<&Url>) -> SpResult<()> {
        let entry = self
            .pages
            .get_mut(page_id)
            .ok_or_else(|| StackprintError::ChannelClosed(format!("页面{}未登记", page_id)))?;
        entry
            .handle
            .notify(&BridgeRequest::Navigate {
                url: url.map(|u| u.to_string()),
            })
            .await?;
        entry.generation += 1;
        self.cache.reset(page_id);
        Ok(())
    }

    /// 转发网络事件，仅观察前台页面时后台页面的事件被丢弃
    pub async fn route_network_event(&self, page_id: &PageId, event: NetworkEvent) -> SpResult<bool> {
        if self.settings.active_tab_only && self.active.as_ref() != Some(page_id) {
            debug!("后台页面{}的网络事件已丢弃：{}", page_id, event.url());
            return Ok(false);
        }
        self.handle(page_id)?.notify(&BridgeRequest::Network(event)).await?;
        Ok(true)
    }

    /// 用页面代理推送的完整报告替换缓存，返回处理的消息数
    pub fn drain_updates(&mut self) -> usize {
        let mut count = 0;
        while let Ok(bytes) = self.updates_rx.try_recv() {
            count += 1;
            let update = match decode::<ReportUpdated>(&bytes) {
                Ok(update) => update,
                Err(e) => {
                    warn!("报告更新解析失败：{}", e);
                    continue;
                }
            };
            match self.pages.get(&update.page_id) {
                Some(entry) if entry.generation == update.generation => {
                    self.cache.replace(&update.page_id, update.report);
                }
                Some(_) => debug!("丢弃导航前的报告更新：{}", update.page_id),
                None => {}
            }
        }
        count
    }

    /// 缓存中的报告（可能过期）
    pub fn cached_report(&self, page_id: &PageId) -> AggregateReport {
        self.cache.query(page_id)
    }

    /// 向页面代理查询当前报告；失败时触发重新检测后重试，全部失败返回 NoData
    pub async fn query(&mut self, page_id: &PageId) -> SpResult<AggregateReport> {
        let attempts = self.config.retry.attempts();
        for attempt in 1..=attempts {
            let result = match self.handle(page_id) {
                Ok(handle) => handle
                    .request(&BridgeRequest::GetReport, self.config.query_timeout)
                    .await
                    .and_then(expect_report),
                Err(e) => Err(e),
            };
            match result {
                Ok(report) => {
                    self.cache.replace(page_id, report.clone());
                    return Ok(report);
                }
                Err(e) => {
                    warn!("查询页面{}报告失败（第{}/{}次）：{}", page_id, attempt, attempts, e);
                    if attempt < attempts {
                        self.rerun(page_id).await;
                    }
                }
            }
        }
        Err(StackprintError::NoData(format!("页面{}无检测结果", page_id)))
    }

    async fn rerun(&self, page_id: &PageId) {
        if let Ok(handle) = self.handle(page_id) {
            if let Err(e) = handle.notify(&BridgeRequest::Rerun).await {
                debug!("重新检测触发失败：{}", e);
            }
        }
    }

    fn handle(&self, page_id: &PageId) -> SpResult<&PageHandle> {
        self.pages
            .get(page_id)
            .map(|entry| &entry.handle)
            .ok_or_else(|| StackprintError::ChannelClosed(format!("页面{}未登记", page_id)))
    }

    #[cfg(test)]
    fn insert_handle(&mut self, handle: PageHandle) {
        self.pages.insert(handle.page_id().clone(), PageEntry::new(handle));
    }
}

fn expect_report(response: BridgeResponse) -> SpResult<AggregateReport> {
    match response {
        BridgeResponse::Report(report) => Ok(report),
        BridgeResponse::Ack => Err(StackprintError::InvalidInput("期望报告应答，收到 Ack".to_string())),
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;

    use super::*;
    use crate::config::{ConfigManager, RetryPolicy};
    use crate::evidence::RequestKind;
    use crate::probe::test_server;

    fn coordinator(config: BridgeConfig) -> Coordinator {
        Coordinator::with_client(
            ConfigManager::custom().enable_header_hosting_detection(false).build(),
            config,
            Arc::new(TechDetector::builtin().unwrap()),
            Client::builder().no_proxy().build().unwrap(),
        )
    }

    fn next_snapshot() -> PageSnapshot {
        PageSnapshot {
            location: Some("https://app.example.com/".to_string()),
            document_html: Some(
                r#"<script id="__NEXT_DATA__" type="application/json">{"page":"/"}</script>"#.to_string(),
            ),
            ..PageSnapshot::default()
        }
    }

    fn api_event() -> NetworkEvent {
        NetworkEvent::ResponseReceived {
            kind: RequestKind::Fetch,
            url: "/api/me".to_string(),
            headers: vec![("server".to_string(), "node".to_string())],
        }
    }

    #[tokio::test]
    async fn test_snapshot_then_query() {
        let mut coord = coordinator(BridgeConfig::default());
        let tab = PageId::new("tab-1");
        coord.open_page(tab.clone());
        coord.set_active_page(tab.clone()).await;

        let report = coord.submit_snapshot(&tab, next_snapshot()).await.unwrap();
        assert!(report.frameworks.contains("Next.js"));
        assert_eq!(coord.cached_report(&tab), report);

        assert!(coord.route_network_event(&tab, api_event()).await.unwrap());
        let report = coord.query(&tab).await.unwrap();
        assert_eq!(report.backend.names(), vec!["Next.js API"]);
    }

    #[tokio::test]
    async fn test_background_events_dropped() {
        let mut coord = coordinator(BridgeConfig::default());
        let fg = PageId::new("fg");
        let bg = PageId::new("bg");
        coord.open_page(fg.clone());
        coord.open_page(bg.clone());
        coord.set_active_page(fg).await;

        coord.submit_snapshot(&bg, next_snapshot()).await.unwrap();
        assert!(!coord.route_network_event(&bg, api_event()).await.unwrap());
        let report = coord.query(&bg).await.unwrap();
        assert!(!report.backend.contains("Next.js API"));
    }

    #[tokio::test]
    async fn test_unresponsive_page_yields_no_data() {
        let mut coord = coordinator(BridgeConfig {
            query_timeout: Duration::from_millis(50),
            retry: RetryPolicy::Times(1),
        });
        let tab = PageId::new("stuck");
        // 信箱存在但无人处理
        let (tx, _rx) = mpsc::channel(8);
        coord.insert_handle(PageHandle::from_parts(tab.clone(), tx));

        let err = coord.query(&tab).await.unwrap_err();
        assert!(matches!(err, StackprintError::NoData(_)));
    }

    #[tokio::test]
    async fn test_unknown_page_yields_no_data() {
        let mut coord = coordinator(BridgeConfig {
            query_timeout: Duration::from_millis(50),
            retry: RetryPolicy::Never,
        });
        let err = coord.query(&PageId::new("missing")).await.unwrap_err();
        assert!(matches!(err, StackprintError::NoData(_)));
        assert!(coord.cached_report(&PageId::new("missing")).is_empty());
    }

    #[tokio::test]
    async fn test_drain_updates_replaces_cache() {
        let mut coord = coordinator(BridgeConfig::default());
        let tab = PageId::new("tab-1");
        coord.open_page(tab.clone());
        coord.set_active_page(tab.clone()).await;
        coord.submit_snapshot(&tab, next_snapshot()).await.unwrap();
        coord.route_network_event(&tab, api_event()).await.unwrap();
        // 代理按顺序处理，查询返回时更新已推送
        coord.query(&tab).await.unwrap();
        coord.cache.reset(&tab);

        assert!(coord.drain_updates() >= 2);
        assert_eq!(coord.cached_report(&tab).backend.names(), vec!["Next.js API"]);
    }

    #[tokio::test]
    async fn test_navigate_resets_cache_and_close_removes() {
        let mut coord = coordinator(BridgeConfig::default());
        let tab = PageId::new("tab-1");
        coord.open_page(tab.clone());
        coord.submit_snapshot(&tab, next_snapshot()).await.unwrap();

        let next = Url::parse("https://other.example/").unwrap();
        coord.navigate(&tab, Some(&next)).await.unwrap();
        assert!(coord.cached_report(&tab).is_empty());
        assert!(coord.query(&tab).await.unwrap().is_empty());

        coord.close_page(&tab);
        assert!(matches!(coord.query(&tab).await, Err(StackprintError::NoData(_))));
    }

    #[tokio::test]
    async fn test_navigate_discards_stale_updates() {
        let mut coord = coordinator(BridgeConfig::default());
        let tab = PageId::new("tab-1");
        coord.open_page(tab.clone());
        let angular = PageSnapshot {
            location: Some("https://a.example/".to_string()),
            document_html: Some(r#"<div ng-app="demo"></div>"#.to_string()),
            ..PageSnapshot::default()
        };
        coord.submit_snapshot(&tab, angular).await.unwrap();

        let next = Url::parse("https://b.example/").unwrap();
        coord.navigate(&tab, Some(&next)).await.unwrap();
        assert!(coord.query(&tab).await.unwrap().is_empty());

        assert!(coord.drain_updates() >= 2);
        assert!(coord.cached_report(&tab).is_empty());
    }

    #[tokio::test]
    async fn test_header_request_waits_for_foreground() {
        static HITS: AtomicUsize = AtomicUsize::new(0);
        let addr = test_server::spawn(|_| {
            HITS.fetch_add(1, Ordering::SeqCst);
            Some(test_server::ok(&[("x-nf-request-id", "01H")], "<html></html>"))
        })
        .await;
        let mut coord = Coordinator::with_client(
            ConfigManager::get_default(),
            BridgeConfig::default(),
            Arc::new(TechDetector::builtin().unwrap()),
            Client::builder().no_proxy().build().unwrap(),
        );
        let fg = PageId::new("fg");
        let bg = PageId::new("bg");
        coord.open_page(fg.clone());
        coord.open_page(bg.clone());
        coord.set_active_page(fg).await;

        let snapshot = PageSnapshot {
            location: Some(format!("http://{}/", addr)),
            document_html: Some("<html></html>".to_string()),
            ..PageSnapshot::default()
        };
        coord.submit_snapshot(&bg, snapshot).await.unwrap();
        tokio::time::sleep(Duration::from_millis(300)).await;
        assert_eq!(HITS.load(Ordering::SeqCst), 0);
        assert!(!coord.query(&bg).await.unwrap().hosting.contains("Netlify"));

        coord.set_active_page(bg.clone()).await;
        let deadline = tokio::time::Instant::now() + Duration::from_secs(2);
        while !coord.query(&bg).await.unwrap().hosting.contains("Netlify") {
            assert!(tokio::time::Instant::now() < deadline, "foreground page headers were never requested");
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
        assert_eq!(HITS.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_page_opened_after_activation_is_foreground() {
        static HITS: AtomicUsize = AtomicUsize::new(0);
        let addr = test_server::spawn(|_| {
            HITS.fetch_add(1, Ordering::SeqCst);
            Some(test_server::ok(&[("x-nf-request-id", "01H")], "<html></html>"))
        })
        .await;
        let mut coord = Coordinator::with_client(
            ConfigManager::get_default(),
            BridgeConfig::default(),
            Arc::new(TechDetector::builtin().unwrap()),
            Client::builder().no_proxy().build().unwrap(),
        );
        let tab = PageId::new("tab-1");
        coord.set_active_page(tab.clone()).await;
        coord.open_page(tab.clone());
        assert_eq!(coord.active_page(), Some(&tab));

        let snapshot = PageSnapshot {
            location: Some(format!("http://{}/", addr)),
            ..PageSnapshot::default()
        };
        coord.submit_snapshot(&tab, snapshot).await.unwrap();
        let deadline = tokio::time::Instant::now() + Duration::from_secs(2);
        while HITS.load(Ordering::SeqCst) == 0 {
            assert!(tokio::time::Instant::now() < deadline, "foreground page headers were never requested");
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
    }
}
