//! `translate` 命令行入口
//!
//! 输入输出为 JSON 序列化的书籍结构树。退出码：0 成功，1 参数或配置错误，
//! 2 翻译失败。

use std::io::{Read, Write};
use std::path::{Path, PathBuf};
use std::process::ExitCode;

use clap::Parser;
use tokio_util::sync::CancellationToken;
use tracing_subscriber::EnvFilter;

use ebook_translator::book::Book;
use ebook_translator::env::{core::LogLevel, EnvVar};
use ebook_translator::translation::config::BackendConfig;
use ebook_translator::translation::core::CallContext;
use ebook_translator::translation::{
    BackendRequest, ConfigManager, ErrorClass, EventBus, Script, SessionMeta, TranslationError,
    TranslationResult, TranslationService, TranslatorConfig,
};

const EXIT_USAGE: u8 = 1;
const EXIT_TRANSLATION_FAILED: u8 = 2;

#[derive(Parser, Debug, Default)]
#[command(name = "translate", version, about = "Translate a book with multiple LLM backends")]
struct Args {
    /// Input book (JSON tree)
    #[arg(short, long, value_name = "FILE")]
    input: Option<PathBuf>,

    /// Output file [default: <input>.<target>.json]
    #[arg(short, long, value_name = "FILE")]
    output: Option<PathBuf>,

    /// Translation provider
    #[arg(long, value_name = "NAME")]
    provider: Option<String>,

    #[arg(long, value_name = "NAME")]
    model: Option<String>,

    #[arg(long, value_name = "KEY")]
    api_key: Option<String>,

    #[arg(long, value_name = "URL")]
    base_url: Option<String>,

    /// Source language code
    #[arg(short, long, value_name = "LANG")]
    source: Option<String>,

    /// Target language code
    #[arg(short, long, value_name = "LANG")]
    target: Option<String>,

    /// Output script for Serbian text
    #[arg(long, value_name = "cyrillic|latin")]
    script: Option<String>,

    /// Write a commented default configuration and exit
    #[arg(long, value_name = "PATH")]
    create_config: Option<PathBuf>,

    /// Configuration file
    #[arg(short, long, value_name = "PATH")]
    config: Option<PathBuf>,

    /// Resume a stored session
    #[arg(long, value_name = "SESSION_ID")]
    resume: Option<String>,

    /// Translate standard input to standard output
    #[arg(long)]
    stdin: bool,
}

/// 命令失败，按阶段区分退出码
enum Failure {
    Usage(TranslationError),
    Translation(TranslationError),
}

impl Failure {
    fn exit_code(&self) -> u8 {
        match self {
            Failure::Usage(_) => EXIT_USAGE,
            Failure::Translation(_) => EXIT_TRANSLATION_FAILED,
        }
    }

    fn error(&self) -> &TranslationError {
        match self {
            Failure::Usage(e) | Failure::Translation(e) => e,
        }
    }
}

/// 校验类错误视为用法错误，其余视为翻译失败
fn classify(error: TranslationError) -> Failure {
    if error.class() == ErrorClass::Validation {
        Failure::Usage(error)
    } else {
        Failure::Translation(error)
    }
}

fn init_logging() {
    let level = LogLevel::get().unwrap_or_else(|e| {
        eprintln!("{}, using info", e);
        "info".to_string()
    });
    let filter = EnvFilter::try_new(format!("ebook_translator={level},translate={level}"))
        .unwrap_or_else(|_| EnvFilter::new("info"));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .with_target(false)
        .init();
}

#[tokio::main]
async fn main() -> ExitCode {
    let args = match Args::try_parse() {
        Ok(args) => args,
        Err(e) => {
            let _ = e.print();
            return if e.use_stderr() {
                ExitCode::from(EXIT_USAGE)
            } else {
                ExitCode::SUCCESS
            };
        }
    };

    ConfigManager::load_dotenv();
    init_logging();

    match run(args).await {
        Ok(()) => ExitCode::SUCCESS,
        Err(failure) => {
            eprintln!("Error: {}", failure.error());
            ExitCode::from(failure.exit_code())
        }
    }
}

async fn run(args: Args) -> Result<(), Failure> {
    if let Some(path) = &args.create_config {
        ConfigManager::create_default_config(path).map_err(Failure::Usage)?;
        println!("已生成配置文件: {}", path.display());
        return Ok(());
    }

    let config = load_config(&args).map_err(Failure::Usage)?;
    let cancel = CancellationToken::new();
    spawn_interrupt_handler(cancel.clone());

    if args.stdin {
        return translate_stdin(&config, &cancel).await;
    }

    let input = args.input.as_deref().ok_or_else(|| {
        Failure::Usage(TranslationError::InvalidInput(
            "缺少 --input（或使用 --stdin / --create-config）".to_string(),
        ))
    })?;
    let output = args
        .output
        .clone()
        .unwrap_or_else(|| default_output(input, &config.translation.target_lang));

    let mut book = Book::load_json(input).map_err(Failure::Usage)?;
    let service = TranslationService::from_config(&config, EventBus::new())
        .await
        .map_err(classify)?;

    let report = match &args.resume {
        Some(session_id) => service.resume(session_id, &mut book, &cancel).await,
        None => {
            let meta = SessionMeta {
                input_ref: input.display().to_string(),
                output_ref: output.display().to_string(),
                ..Default::default()
            };
            service.translate_book(&mut book, meta, &cancel).await
        }
    }
    .map_err(classify)?;

    book.save_json(&output).map_err(Failure::Translation)?;

    let session = &report.session;
    println!("会话: {}", session.session_id);
    println!(
        "完成 {} / 失败 {} / 共 {} 个单元，缓存命中 {}，回退 {}，耗时 {:.1}s",
        session.items_completed,
        session.items_failed,
        session.items_total,
        report.cache_hits,
        report.fallbacks,
        session.duration_secs().unwrap_or_default()
    );
    for (backend, count) in &report.backend_usage {
        println!("  {}: {}", backend, count);
    }
    println!("输出: {}", output.display());

    if session.items_total > 0 && session.items_completed == 0 {
        return Err(Failure::Translation(TranslationError::ProviderError(
            "所有单元均翻译失败".to_string(),
        )));
    }
    Ok(())
}

/// 读取配置文件并叠加命令行参数，最后重新校验
fn load_config(args: &Args) -> TranslationResult<TranslatorConfig> {
    let mut config = match &args.config {
        Some(path) => ConfigManager::from_file(path)?.into_config(),
        None => ConfigManager::new()?.into_config(),
    };

    if let Some(source) = &args.source {
        config.translation.source_lang = source.clone();
    }
    if let Some(target) = &args.target {
        config.translation.target_lang = target.clone();
    }
    if let Some(script) = &args.script {
        config.translation.output_script = Some(script.parse::<Script>()?);
    }

    let overrides_backend = args.provider.is_some()
        || args.model.is_some()
        || args.api_key.is_some()
        || args.base_url.is_some();
    if overrides_backend {
        let provider = args
            .provider
            .clone()
            .unwrap_or_else(|| config.translation.default_provider.clone());
        let mut backend = config
            .effective_backends()
            .into_iter()
            .find(|b| b.provider == provider)
            .unwrap_or_else(|| BackendConfig::new(provider.clone(), provider.clone()));
        if let Some(model) = &args.model {
            backend.model = Some(model.clone());
        }
        if let Some(key) = &args.api_key {
            backend.api_key = Some(key.clone());
        }
        if let Some(url) = &args.base_url {
            backend.base_url = Some(url.clone());
        }
        config.translation.default_provider = provider;
        config.backends = vec![backend];
    }

    Ok(ConfigManager::from_config(config)?.into_config())
}

/// 远程节点模式：标准输入的全文作为一个单元翻译
async fn translate_stdin(config: &TranslatorConfig, cancel: &CancellationToken) -> Result<(), Failure> {
    let mut text = String::new();
    std::io::stdin()
        .read_to_string(&mut text)
        .map_err(|e| Failure::Usage(e.into()))?;
    if text.trim().is_empty() {
        return Err(Failure::Usage(TranslationError::InvalidInput(
            "标准输入为空".to_string(),
        )));
    }

    let service = TranslationService::from_config(config, EventBus::new())
        .await
        .map_err(classify)?;
    let request = BackendRequest::new(
        text,
        config.translation.source_lang.clone(),
        config.translation.target_lang.clone(),
    );
    let outcome = service
        .coordinator()
        .translate(&request, CallContext::default(), cancel)
        .await
        .map_err(Failure::Translation)?;

    let mut stdout = std::io::stdout();
    writeln!(stdout, "{}", outcome.text)
        .and_then(|_| stdout.flush())
        .map_err(|e| Failure::Translation(e.into()))?;
    Ok(())
}

fn default_output(input: &Path, target: &str) -> PathBuf {
    let stem = input
        .file_stem()
        .map(|s| s.to_string_lossy().into_owned())
        .unwrap_or_else(|| "book".to_string());
    input.with_file_name(format!("{}.{}.json", stem, target))
}

fn spawn_interrupt_handler(cancel: CancellationToken) {
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            tracing::warn!("收到中断信号，正在取消翻译");
            cancel.cancel();
        }
    });
}
