//! stackprint 命令行：抓取页面并输出技术栈报告
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Instant;

use anyhow::{Context, Result};
use clap::Parser;
use reqwest::Client;
use tracing::{debug, info};
use tracing_subscriber::EnvFilter;
use url::Url;

use stackprint::{
    ChunkScanner, ConfigManager, DetectionSession, EvidencePatch, HeaderConverter, HeaderProbe,
    PageId, PageSnapshot, RuleCompiler, RuleLoader, TechDetector,
};

#[derive(Debug, Parser)]
#[command(name = "stackprint", version, about = "被动式网页技术栈指纹识别")]
struct Cli {
    /// 目标页面地址
    url: Url,

    /// 自定义规则文件（JSON 或 .mp）
    #[arg(long, value_name = "FILE")]
    rules: Option<PathBuf>,

    /// 拉取并扫描 Next.js 脚本分块
    #[arg(long)]
    chunk_scan: bool,

    /// 关闭响应头托管平台探测
    #[arg(long)]
    no_header_probe: bool,

    /// 响应头探测超时（毫秒）
    #[arg(long, value_name = "N", default_value_t = 800)]
    header_timeout_ms: u64,

    /// 格式化输出 JSON
    #[arg(long)]
    pretty: bool,

    /// 输出调试日志
    #[arg(short, long)]
    verbose: bool,
}

fn init_tracing(verbose: bool) {
    let default_level = if verbose { "debug" } else { "warn" };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_level));
    tracing_subscriber::fmt().with_env_filter(filter).with_writer(std::io::stderr).init();
}

async fn load_detector(rules: Option<&PathBuf>) -> Result<TechDetector> {
    match rules {
        Some(path) => {
            let rule_lib = RuleLoader::from_path(path)
                .await
                .with_context(|| format!("加载规则文件失败：{}", path.display()))?;
            let compiled = RuleCompiler::compile(&rule_lib).context("规则编译失败")?;
            Ok(TechDetector::new(Arc::new(compiled)))
        }
        None => TechDetector::builtin().context("内置规则库初始化失败"),
    }
}

/// 抓取页面，构造页面快照（无脚本执行环境，全局变量与存储不可用）
async fn fetch_snapshot(client: &Client, url: &Url) -> Result<PageSnapshot> {
    let response = client
        .get(url.clone())
        .send()
        .await
        .with_context(|| format!("请求页面失败：{}", url))?;
    let final_url = response.url().clone();
    let headers = HeaderConverter::to_multimap(response.headers());
    let html = response.text().await.context("读取页面正文失败")?;
    debug!("页面抓取完成：{}，{} 字节", final_url, html.len());

    Ok(PageSnapshot {
        location: Some(final_url.to_string()),
        document_html: Some(html),
        cookie: Some(HeaderConverter::cookie_string(&headers)),
        ..PageSnapshot::default()
    })
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    init_tracing(cli.verbose);

    let settings = ConfigManager::custom()
        .enable_chunk_scan(cli.chunk_scan)
        .enable_header_hosting_detection(!cli.no_header_probe)
        .header_detection_timeout_ms(cli.header_timeout_ms)
        .build();
    let client = Client::builder().gzip(true).build().context("HTTP 客户端初始化失败")?;

    let start = Instant::now();
    let detector = Arc::new(load_detector(cli.rules.as_ref()).await?);
    let mut session = DetectionSession::new(PageId::new(cli.url.as_str()), settings.clone(), detector);

    let snapshot = fetch_snapshot(&client, &cli.url).await?;
    session.run_page_pass(&snapshot);

    if settings.enable_header_hosting_detection {
        let page_url = session.evidence().page_url.clone().unwrap_or_else(|| cli.url.clone());
        if let Some(request) = HeaderProbe::new(client.clone(), &settings).probe(&page_url).await {
            session.apply_patch(EvidencePatch::from_request(request));
        }
    }

    if settings.enable_chunk_scan {
        let resources = session.evidence().resources.clone();
        let patch = ChunkScanner::new(client.clone(), &settings, session.detector().rules())
            .scan(&resources)
            .await;
        session.apply_patch(patch);
    }

    info!("检测完成：{}项，耗时{:?}", session.report().total(), start.elapsed());

    let report = session.snapshot();
    let output = if cli.pretty {
        serde_json::to_string_pretty(&report)?
    } else {
        serde_json::to_string(&report)?
    };
    println!("{}", output);
    Ok(())
}
