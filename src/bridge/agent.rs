//! 页面代理：独占一个检测会话的 tokio 任务，按顺序处理消息
//! 延迟探测在独立任务中执行，结果以 Patch 消息回送
use std::time::Duration;

use reqwest::Client;
use tokio::sync::{mpsc, oneshot};
use tracing::{debug, info, warn};
use url::Url;

use super::messages::{decode, encode, BridgeRequest, BridgeResponse, ReportUpdated};
use crate::error::{SpResult, StackprintError};
use crate::evidence::{EvidencePatch, PageSnapshot};
use crate::probe::{ChunkScanner, HeaderProbe};
use crate::report::PageId;
use crate::session::DetectionSession;

const MAILBOX_CAPACITY: usize = 64;

/// 代理信箱中的一条消息
#[derive(Debug)]
pub(crate) struct Envelope {
    payload: Vec<u8>,
    reply: Option<oneshot::Sender<Vec<u8>>>,
    // 延迟探测结果所属的导航代次，过期即丢弃
    generation: Option<u64>,
}

/// 页面代理句柄
#[derive(Debug, Clone)]
pub struct PageHandle {
    page_id: PageId,
    tx: mpsc::Sender<Envelope>,
}

impl PageHandle {
    pub(crate) fn from_parts(page_id: PageId, tx: mpsc::Sender<Envelope>) -> Self {
        Self { page_id, tx }
    }

    pub fn page_id(&self) -> &PageId {
        &self.page_id
    }

    /// 发送请求并在超时内等待应答
    pub async fn request(&self, request: &BridgeRequest, timeout: Duration) -> SpResult<BridgeResponse> {
        let (reply_tx, reply_rx) = oneshot::channel();
        let envelope = Envelope {
            payload: encode(request)?,
            reply: Some(reply_tx),
            generation: None,
        };
        self.tx
            .send(envelope)
            .await
            .map_err(|_| StackprintError::ChannelClosed(format!("页面{}代理已退出", self.page_id)))?;

        match tokio::time::timeout(timeout, reply_rx).await {
            Ok(Ok(bytes)) => decode(&bytes),
            Ok(Err(_)) => Err(StackprintError::ChannelClosed(format!("页面{}未应答即退出", self.page_id))),
            Err(_) => Err(StackprintError::Timeout(format!("页面{}应答超过{:?}", self.page_id, timeout))),
        }
    }

    /// 不等待信箱空位的 `notify`，信箱已满或已关闭时返回错误
    pub fn try_notify(&self, request: &BridgeRequest) -> SpResult<()> {
        let envelope = Envelope {
            payload: encode(request)?,
            reply: None,
            generation: None,
        };
        self.tx
            .try_send(envelope)
            .map_err(|e| StackprintError::ChannelClosed(format!("页面{}信箱不可用：{}", self.page_id, e)))
    }

    /// 发送无需应答的请求
    pub async fn notify(&self, request: &BridgeRequest) -> SpResult<()> {
        let envelope = Envelope {
            payload: encode(request)?,
            reply: None,
            generation: None,
        };
        self.tx
            .send(envelope)
            .await
            .map_err(|_| StackprintError::ChannelClosed(format!("页面{}代理已退出", self.page_id)))
    }
}

/// 页面代理
pub struct PageAgent {
    session: DetectionSession,
    client: Client,
    updates: mpsc::UnboundedSender<Vec<u8>>,
    // 自身信箱的弱引用，回送延迟探测结果用，句柄全部释放后任务退出
    mailbox: mpsc::WeakSender<Envelope>,
    last_snapshot: Option<PageSnapshot>,
    generation: u64,
    // 是否为前台页面
    active: bool,
    header_probe_started: bool,
    chunk_scan_started: bool,
}

impl PageAgent {
    /// 启动代理任务，报告变化时向 updates 推送编码后的 `ReportUpdated`
    pub fn spawn(
        session: DetectionSession,
        client: Client,
        updates: mpsc::UnboundedSender<Vec<u8>>,
    ) -> PageHandle {
        let (tx, rx) = mpsc::channel(MAILBOX_CAPACITY);
        let page_id = session.page_id().clone();
        let agent = PageAgent {
            session,
            client,
            updates,
            mailbox: tx.downgrade(),
            last_snapshot: None,
            generation: 0,
            active: false,
            header_probe_started: false,
            chunk_scan_started: false,
        };
        tokio::spawn(agent.run(rx));
        info!("页面代理已启动：{}", page_id);
        PageHandle::from_parts(page_id, tx)
    }

    async fn run(mut self, mut rx: mpsc::Receiver<Envelope>) {
        while let Some(envelope) = rx.recv().await {
            if envelope.generation.is_some_and(|g| g != self.generation) {
                debug!("丢弃过期的探测结果：{}", self.session.page_id());
                continue;
            }
            let request: BridgeRequest = match decode(&envelope.payload) {
                Ok(request) => request,
                Err(e) => {
                    warn!("页面{}收到无法解析的消息：{}", self.session.page_id(), e);
                    continue;
                }
            };

            let response = self.handle(request);
            if let Some(reply) = envelope.reply {
                match encode(&response) {
                    Ok(bytes) => {
                        let _ = reply.send(bytes);
                    }
                    Err(e) => warn!("应答编码失败：{}", e),
                }
            }
        }
        info!("页面代理退出：{}", self.session.page_id());
    }

    fn handle(&mut self, request: BridgeRequest) -> BridgeResponse {
        let (changed, response) = match request {
            BridgeRequest::Snapshot(snapshot) => {
                let changed = self.session.run_page_pass(&snapshot);
                self.last_snapshot = Some(snapshot);
                self.session.install_network_observation();
                self.start_chunk_scan();
                self.start_header_probe();
                (changed, BridgeResponse::Report(self.session.snapshot()))
            }
            BridgeRequest::Rerun => {
                let changed = match &self.last_snapshot {
                    Some(snapshot) => self.session.run_page_pass(snapshot),
                    None => false,
                };
                (changed, BridgeResponse::Report(self.session.snapshot()))
            }
            BridgeRequest::Network(event) => (self.session.observe_network_event(&event), BridgeResponse::Ack),
            BridgeRequest::Patch(patch) => (self.session.apply_patch(patch), BridgeResponse::Ack),
            BridgeRequest::Navigate { url } => {
                let url = url.as_deref().and_then(|u| Url::parse(u).ok());
                let changed = self.session.reset(url);
                self.last_snapshot = None;
                self.generation += 1;
                self.header_probe_started = false;
                self.chunk_scan_started = false;
                (changed, BridgeResponse::Ack)
            }
            BridgeRequest::Focus { active } => {
                self.active = active;
                // 快照先于切换到前台到达时，补做响应头探测
                if active && self.last_snapshot.is_some() {
                    self.start_header_probe();
                }
                (false, BridgeResponse::Ack)
            }
            BridgeRequest::GetReport => (false, BridgeResponse::Report(self.session.snapshot())),
        };

        if changed {
            self.publish();
        }
        response
    }

    fn publish(&self) {
        let update = ReportUpdated {
            page_id: self.session.page_id().clone(),
            generation: self.generation,
            report: self.session.snapshot(),
        };
        match encode(&update) {
            Ok(bytes) => {
                if self.updates.send(bytes).is_err() {
                    debug!("协调端已关闭，报告更新未送达：{}", update.page_id);
                }
            }
            Err(e) => warn!("报告更新编码失败：{}", e),
        }
    }

    /// 每次导航最多探测一次；仅观察前台页面时后台页面不探测
    fn start_header_probe(&mut self) {
        let settings = self.session.settings();
        if self.header_probe_started || !settings.enable_header_hosting_detection {
            return;
        }
        if settings.active_tab_only && !self.active {
            debug!("页面{}处于后台，暂不探测响应头", self.session.page_id());
            return;
        }
        let Some(url) = self.session.evidence().page_url.clone() else {
            return;
        };
        self.header_probe_started = true;

        let probe = HeaderProbe::new(self.client.clone(), settings);
        let mailbox = self.mailbox.clone();
        let generation = self.generation;
        tokio::spawn(async move {
            if let Some(request) = probe.probe(&url).await {
                send_patch(&mailbox, EvidencePatch::from_request(request), generation).await;
            }
        });
    }

    /// 每次导航只扫描一次
    fn start_chunk_scan(&mut self) {
        let settings = self.session.settings();
        if self.chunk_scan_started || !settings.enable_chunk_scan {
            return;
        }
        self.chunk_scan_started = true;

        let resources = self.session.evidence().resources.clone();
        if ChunkScanner::candidates(&resources).is_empty() {
            return;
        }
        let scanner = ChunkScanner::new(self.client.clone(), settings, self.session.detector().rules());
        let mailbox = self.mailbox.clone();
        let generation = self.generation;
        tokio::spawn(async move {
            let patch = scanner.scan(&resources).await;
            if !patch.is_empty() {
                send_patch(&mailbox, patch, generation).await;
            }
        });
    }
}

async fn send_patch(mailbox: &mpsc::WeakSender<Envelope>, patch: EvidencePatch, generation: u64) {
    let Some(mailbox) = mailbox.upgrade() else {
        debug!("页面代理已退出，探测结果丢弃");
        return;
    };
    let payload = match encode(&BridgeRequest::Patch(patch)) {
        Ok(payload) => payload,
        Err(e) => {
            warn!("探测结果编码失败：{}", e);
            return;
        }
    };
    let envelope = Envelope {
        payload,
        reply: None,
        generation: Some(generation),
    };
    if mailbox.send(envelope).await.is_err() {
        debug!("页面代理已退出，探测结果丢弃");
    }
}
