//! 漫画章节下载器：解析章节图片地址，并发下载后打包为 CBZ。
//!
//! 代码结构（读代码入口）：
//! - `base_system`：配置/日志/重试/命名等基础设施
//! - `network_parser`：HTTP 抓取与传输层重试
//! - `chapter_parser`：章节列表、混淆脚本解包、分页图片解析
//! - `download`：单章编排、图片并发下载、批处理
//! - `packaging`：CBZ 归档
//! - `ui`：命令行流程

use std::path::Path;
use std::process::ExitCode;

use anyhow::{Context, Result, anyhow};
use clap::Parser;
use tracing::info;

mod base_system;
mod chapter_parser;
mod download;
mod network_parser;
mod packaging;
mod ui;

use base_system::config::{ConfigSpec, load_or_create_with_base};
use base_system::context::Config;
use base_system::logging::{LogOptions, LogSystem};
use chapter_parser::SourceKind;

const VERSION: &str = env!("CARGO_PKG_VERSION");

#[derive(Debug, Parser)]
#[command(name = "manga-cbz-downloader")]
#[command(about = "Download manga chapters and pack them as CBZ archives")]
struct Cli {
    /// 启用调试日志输出
    #[arg(long, default_value_t = false)]
    debug: bool,

    /// 显示版本信息后退出
    #[arg(long, default_value_t = false)]
    version: bool,

    /// 数据目录路径（存放 config.yml 和 logs）
    #[arg(long)]
    data_dir: Option<String>,

    /// 覆盖配置中的来源
    #[arg(long, value_enum)]
    source: Option<SourceKind>,

    /// 覆盖 ninemanga 站点语言
    #[arg(long)]
    language: Option<String>,

    /// 漫画名，用于归档文件名与子文件夹
    #[arg(long)]
    title: Option<String>,

    /// 漫画主页地址
    #[arg(long, required_unless_present_any = ["chapter_url", "version"])]
    manga_url: Option<String>,

    /// 章节范围：N 或 A,B（从 1 开始，闭区间）
    #[arg(long, requires = "manga_url")]
    range: Option<String>,

    /// 只列出章节，不下载
    #[arg(long, default_value_t = false, requires = "manga_url")]
    list: bool,

    /// 直接下载单个章节
    #[arg(long, conflicts_with = "manga_url")]
    chapter_url: Option<String>,

    /// 单章节模式下的章节名
    #[arg(long, requires = "chapter_url")]
    chapter_name: Option<String>,

    /// 单章图片并发数
    #[arg(long)]
    concurrency: Option<usize>,

    /// 任一章节失败即停止
    #[arg(long, default_value_t = false)]
    halt_on_error: bool,

    /// CBZ 保存目录
    #[arg(long)]
    output: Option<String>,
}

fn main() -> Result<ExitCode> {
    let cli = Cli::parse();

    if cli.version {
        println!("manga-cbz-downloader v{}", VERSION);
        return Ok(ExitCode::SUCCESS);
    }

    let data_dir = cli.data_dir.as_deref().map(Path::new);
    let log = init_logging(cli.debug, data_dir)?;
    info!(target: "startup", "当前版本: v{}", VERSION);

    let mut config =
        load_or_create_with_base::<Config>(None, data_dir).context("加载配置失败")?;
    apply_overrides(&mut config, &cli)?;

    let request = ui::noui::RunRequest {
        title: cli.title,
        manga_url: cli.manga_url,
        range: cli.range,
        list_only: cli.list,
        chapter_url: cli.chapter_url,
        chapter_name: cli.chapter_name,
    };
    let cancel = log.cancel_flag();

    let code = match ui::noui::run(&config, &request, &cancel)? {
        Some(summary) if summary.failed() > 0 || summary.cancelled => ExitCode::FAILURE,
        _ => ExitCode::SUCCESS,
    };
    Ok(code)
}

/// 命令行参数优先于配置文件，仅对本次运行生效。
fn apply_overrides(config: &mut Config, cli: &Cli) -> Result<()> {
    if let Some(source) = cli.source {
        config.source = source;
    }
    if let Some(language) = cli.language.as_ref() {
        config.language = language.clone();
    }
    if let Some(concurrency) = cli.concurrency {
        config.concurrency_limit = concurrency;
    }
    if cli.halt_on_error {
        config.halt_on_error = true;
    }
    if let Some(output) = cli.output.as_ref() {
        config.save_path = output.clone();
    }
    config.validate().context("命令行参数无效")
}

fn init_logging(debug: bool, base_dir: Option<&Path>) -> Result<LogSystem> {
    let opts = LogOptions {
        debug,
        use_color: true,
        archive_on_exit: true,
    };
    LogSystem::init_with_base(opts, base_dir).map_err(|e| anyhow!(e))
}
