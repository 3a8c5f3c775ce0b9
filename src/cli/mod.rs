//! CLI 모듈
//!
//! qalam-rag CLI 명령어 정의 및 구현

use std::io::Write as _;
use std::path::PathBuf;

use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand};
use regex::Regex;
use tokio::io::{AsyncBufReadExt, BufReader};

use crate::config::Config;
use crate::embedding::has_api_key;
use crate::knowledge::{AnswerRoute, KnowledgeStore, RagRetriever, SearchBy};

// ============================================================================
// CLI Definition
// ============================================================================

#[derive(Parser)]
#[command(name = "qalam-rag")]
#[command(version, about = "아랍어 학습 질문 응답 RAG 시스템", long_about = None)]
pub struct Cli {
    /// 지식 파일 경로 (QALAM_DATA_FILE보다 우선)
    #[arg(long, global = true)]
    pub data_file: Option<PathBuf>,

    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand)]
pub enum Commands {
    /// 질문 하나에 답변
    Ask {
        /// 질문
        question: String,

        /// 답변 경로와 점수 표시
        #[arg(short, long)]
        verbose: bool,
    },

    /// 대화형 모드 (خروج / exit 로 종료)
    Chat,

    /// 지식 레코드 추가
    Add {
        /// 내용
        content: String,

        /// 이미지 경로 또는 URL
        #[arg(short, long)]
        media: Option<String>,
    },

    /// 지식 레코드 수정
    Update {
        /// 레코드 ID
        id: i64,

        /// 새 내용
        content: String,
    },

    /// 지식 레코드 삭제 (이후 ID는 1부터 다시 매겨짐)
    Delete {
        /// 레코드 ID
        id: i64,
    },

    /// 저장된 레코드 검색 (임베딩 없이)
    Search {
        /// 검색어
        query: String,

        /// 검색 기준: text | id
        #[arg(short, long, default_value = "text")]
        by: SearchBy,

        /// 결과 개수 제한
        #[arg(short, long, default_value = "20")]
        limit: usize,
    },

    /// 저장된 레코드 목록
    List {
        /// 결과 개수 제한
        #[arg(short, long, default_value = "20")]
        limit: usize,
    },

    /// 상태 확인
    Status,
}

// ============================================================================
// CLI Runner
// ============================================================================

/// CLI 명령어 실행
pub async fn run(cli: Cli) -> Result<()> {
    let mut config = Config::from_env().context("설정 로드 실패")?;
    if let Some(path) = cli.data_file {
        config.data_file = path;
    }

    match cli.command {
        Commands::Ask { question, verbose } => cmd_ask(&config, &question, verbose).await,
        Commands::Chat => cmd_chat(&config).await,
        Commands::Add { content, media } => cmd_add(&config, &content, media).await,
        Commands::Update { id, content } => cmd_update(&config, id, &content).await,
        Commands::Delete { id } => cmd_delete(&config, id).await,
        Commands::Search { query, by, limit } => cmd_search(&config, &query, by, limit),
        Commands::List { limit } => cmd_list(&config, limit),
        Commands::Status => cmd_status(&config),
    }
}

// ============================================================================
// Command Implementations
// ============================================================================

/// 임베딩 API 키 확인 후 retriever 생성
async fn open_retriever(config: &Config) -> Result<RagRetriever> {
    if !has_api_key() {
        bail!(
            "API 키가 설정되지 않았습니다.\n\n\
             설정 방법:\n  \
             export GEMINI_API_KEY=your-api-key\n  \
             또는\n  \
             export GOOGLE_AI_API_KEY=your-api-key\n\n\
             API 키 발급: https://aistudio.google.com/app/apikey"
        );
    }

    RagRetriever::from_config(config)
        .await
        .context("RagRetriever 초기화 실패")
}

/// 질문 명령어 (ask)
async fn cmd_ask(config: &Config, question: &str, verbose: bool) -> Result<()> {
    let retriever = open_retriever(config).await?;
    let answer = retriever.answer_detailed(question).await;

    println!("{}", answer.text);
    if verbose {
        println!();
        println!("[*] 경로: {}", describe_route(&answer.route));
    }

    Ok(())
}

/// 대화형 명령어 (chat)
///
/// 한 줄에 질문 하나. `/add`, `/update`, `/delete`로 지식을 편집할 수 있습니다.
async fn cmd_chat(config: &Config) -> Result<()> {
    let retriever = open_retriever(config).await?;

    println!("qalam-rag v{} (refiner: {})", env!("CARGO_PKG_VERSION"), retriever.refiner_name());
    println!("질문을 입력하세요. 종료: خروج / exit");
    println!("편집: /add <내용>, /update <id> <내용>, /delete <id>");
    println!();

    let mut lines = BufReader::new(tokio::io::stdin()).lines();

    loop {
        print!("> ");
        std::io::stdout().flush().ok();

        let Some(line) = lines.next_line().await.context("입력 읽기 실패")? else {
            break;
        };
        let line = line.trim();
        if line.is_empty() {
            continue;
        }
        if is_exit_command(line) {
            println!("👋 مع السلامة!");
            break;
        }

        match parse_chat_command(line) {
            Some(ChatCommand::Add(content)) => match retriever.add_record(&content, None).await {
                Ok(record) => println!("[OK] 레코드 #{} 추가됨", record.id),
                Err(e) => println!("[!] 추가 실패: {:#}", e),
            },
            Some(ChatCommand::Update(id, content)) => {
                match retriever.update_record(id, &content).await {
                    Ok(true) => println!("[OK] 레코드 #{} 수정됨", id),
                    Ok(false) => println!("[!] ID {}인 레코드가 없습니다", id),
                    Err(e) => println!("[!] 수정 실패: {:#}", e),
                }
            }
            Some(ChatCommand::Delete(id)) => match retriever.delete_record(id).await {
                Ok(true) => println!("[OK] 레코드 #{} 삭제됨 (ID 재정렬)", id),
                Ok(false) => println!("[!] ID {}인 레코드가 없습니다", id),
                Err(e) => println!("[!] 삭제 실패: {:#}", e),
            },
            Some(ChatCommand::Invalid(usage)) => println!("[!] 사용법: {}", usage),
            None => {
                let answer = retriever.answer(line).await;
                println!("{}", answer);
            }
        }
        println!();
    }

    Ok(())
}

/// 추가 명령어 (add)
async fn cmd_add(config: &Config, content: &str, media: Option<String>) -> Result<()> {
    if content.trim().is_empty() && media.is_none() {
        bail!("내용 또는 --media 중 하나는 필요합니다");
    }

    // 키가 있으면 인덱스까지 갱신, 없으면 파일만 수정
    let record = if has_api_key() {
        let retriever = open_retriever(config).await?;
        retriever.add_record(content, media).await?
    } else {
        let store = open_store(config)?;
        store.add(content, media)?
    };

    println!("[OK] 레코드가 추가되었습니다 (ID: {})", record.id);
    if let Some(ref media) = record.media_ref {
        println!("     미디어: {}", media);
    }

    Ok(())
}

/// 수정 명령어 (update)
async fn cmd_update(config: &Config, id: i64, content: &str) -> Result<()> {
    let updated = if has_api_key() {
        open_retriever(config).await?.update_record(id, content).await?
    } else {
        open_store(config)?.update(id, content)?
    };

    if !updated {
        bail!("ID {}인 레코드를 찾을 수 없습니다", id);
    }
    println!("[OK] 레코드 #{} 수정됨", id);

    Ok(())
}

/// 삭제 명령어 (delete)
async fn cmd_delete(config: &Config, id: i64) -> Result<()> {
    let deleted = if has_api_key() {
        open_retriever(config).await?.delete_record(id).await?
    } else {
        open_store(config)?.delete(id)?
    };

    if !deleted {
        bail!("ID {}인 레코드를 찾을 수 없습니다", id);
    }
    println!("[OK] 레코드 #{} 삭제됨", id);
    println!("     (이후 레코드의 ID가 하나씩 당겨졌습니다)");

    Ok(())
}

/// 검색 명령어 (search)
fn cmd_search(config: &Config, query: &str, by: SearchBy, limit: usize) -> Result<()> {
    let store = open_store(config)?;
    let results = store.search(query, by);

    if results.is_empty() {
        println!("[!] 검색 결과가 없습니다.");
        return Ok(());
    }

    println!("[OK] 검색 결과 ({} 건):\n", results.len());
    for record in results.iter().take(limit) {
        print_record(record);
    }

    Ok(())
}

/// 목록 명령어 (list)
fn cmd_list(config: &Config, limit: usize) -> Result<()> {
    let store = open_store(config)?;
    let records = store.list();

    if records.is_empty() {
        println!("[!] 저장된 레코드가 없습니다.");
        return Ok(());
    }

    println!("[OK] 저장된 레코드 ({} 건):\n", records.len());
    for record in records.iter().take(limit) {
        print_record(record);
    }

    Ok(())
}

/// 상태 명령어 (status)
fn cmd_status(config: &Config) -> Result<()> {
    println!("qalam-rag v{}", env!("CARGO_PKG_VERSION"));
    println!();

    println!("[*] 지식 파일: {}", config.data_file.display());
    println!(
        "[*] top-k: {}, 임계값: {:.2}, 다듬기 타임아웃: {:?}",
        config.top_k, config.similarity_threshold, config.refine_timeout
    );

    // API 키 상태
    if has_api_key() {
        println!("[OK] 임베딩 API 키: 설정됨");
    } else {
        println!("[!] 임베딩 API 키: 미설정");
        println!("    설정: export GEMINI_API_KEY=your-key");
    }
    if std::env::var("OPENAI_API_KEY").map(|k| !k.trim().is_empty()).unwrap_or(false) {
        println!("[OK] 다듬기 모델: {}", config.chat_model);
    } else {
        println!("[!] OPENAI_API_KEY 미설정: 답변 다듬기 없이 동작");
    }

    match open_store(config) {
        Ok(store) => {
            let stats = store.stats();
            println!("[OK] 저장된 레코드: {} 건 (미디어 {} 건)", stats.record_count, stats.media_count);
            println!("     총 콘텐츠: {}", format_bytes(stats.total_content_bytes));
            println!("     revision: {}", stats.revision);
            if let Some(modified) = stats.last_modified {
                println!("     수정 시각: {}", modified.format("%Y-%m-%d %H:%M:%S UTC"));
            }
        }
        Err(e) => {
            println!("[!] 지식 파일 열기 실패: {:#}", e);
        }
    }

    Ok(())
}

// ============================================================================
// Helper Functions
// ============================================================================

fn open_store(config: &Config) -> Result<KnowledgeStore> {
    KnowledgeStore::open(&config.data_file).context("KnowledgeStore 열기 실패")
}

fn print_record(record: &crate::knowledge::KnowledgeRecord) {
    match record.media_ref {
        Some(ref media) => println!("  #{:<4} [IMG] {}", record.id, media),
        None => println!("  #{:<4}", record.id),
    }
    if !record.content.is_empty() {
        println!("        {}", truncate_text(&record.content, 120));
    }
    println!();
}

fn describe_route(route: &AnswerRoute) -> String {
    match route {
        AnswerRoute::Intent(kind) => format!("intent ({})", kind.as_str()),
        AnswerRoute::DirectMatch { id } => format!("direct match (#{})", id),
        AnswerRoute::Vector { position, score } => {
            format!("vector (position {}, score {:.4})", position, score)
        }
        AnswerRoute::Clarify => "clarify".to_string(),
        AnswerRoute::Failed => "failed".to_string(),
    }
}

fn is_exit_command(line: &str) -> bool {
    matches!(line.to_lowercase().as_str(), "خروج" | "exit" | "quit")
}

/// 대화형 모드의 편집 명령
#[derive(Debug, PartialEq)]
enum ChatCommand {
    Add(String),
    Update(i64, String),
    Delete(i64),
    Invalid(&'static str),
}

/// `/`로 시작하는 편집 명령 파싱 (일반 질문이면 `None`)
fn parse_chat_command(line: &str) -> Option<ChatCommand> {
    let re = Regex::new(r"^/(add|update|delete)(?:\s+(.*))?$").ok()?;
    let caps = re.captures(line.trim())?;
    let rest = caps.get(2).map(|m| m.as_str().trim()).unwrap_or("");

    let command = match &caps[1] {
        "add" if !rest.is_empty() => ChatCommand::Add(rest.to_string()),
        "add" => ChatCommand::Invalid("/add <내용>"),
        "update" => {
            let parsed = rest
                .split_once(char::is_whitespace)
                .and_then(|(id, content)| Some((id.parse().ok()?, content.trim())))
                .filter(|(_, content)| !content.is_empty());
            match parsed {
                Some((id, content)) => ChatCommand::Update(id, content.to_string()),
                None => ChatCommand::Invalid("/update <id> <내용>"),
            }
        }
        _ => match rest.parse() {
            Ok(id) => ChatCommand::Delete(id),
            Err(_) => ChatCommand::Invalid("/delete <id>"),
        },
    };
    Some(command)
}

/// 텍스트 자르기 (UTF-8 안전)
fn truncate_text(text: &str, max_chars: usize) -> String {
    let cleaned = text.replace('\n', " ").replace('\r', "");
    let cleaned = cleaned.trim();

    if cleaned.chars().count() <= max_chars {
        cleaned.to_string()
    } else {
        let truncated: String = cleaned.chars().take(max_chars).collect();
        format!("{}...", truncated)
    }
}

/// 바이트 크기 포맷팅
fn format_bytes(bytes: usize) -> String {
    const KB: usize = 1024;
    const MB: usize = KB * 1024;

    if bytes >= MB {
        format!("{:.2} MB", bytes as f64 / MB as f64)
    } else if bytes >= KB {
        format!("{:.2} KB", bytes as f64 / KB as f64)
    } else {
        format!("{} B", bytes)
    }
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_truncate_text() {
        assert_eq!(truncate_text("hello", 10), "hello");
        assert_eq!(truncate_text("hello world", 5), "hello...");
        assert_eq!(truncate_text("hello\nworld", 20), "hello world");
    }

    #[test]
    fn test_truncate_arabic() {
        assert_eq!(truncate_text("الخلية وحدة الحياة", 6), "الخلية...");
    }

    #[test]
    fn test_format_bytes() {
        assert_eq!(format_bytes(500), "500 B");
        assert_eq!(format_bytes(1024), "1.00 KB");
        assert_eq!(format_bytes(1536), "1.50 KB");
        assert_eq!(format_bytes(1048576), "1.00 MB");
    }

    #[test]
    fn test_exit_commands() {
        assert!(is_exit_command("خروج"));
        assert!(is_exit_command("EXIT"));
        assert!(!is_exit_command("ما هي الخلية"));
    }

    #[test]
    fn test_parse_chat_commands() {
        assert_eq!(
            parse_chat_command("/add الماء يغلي"),
            Some(ChatCommand::Add("الماء يغلي".to_string()))
        );
        assert_eq!(
            parse_chat_command("/update 3  نص جديد"),
            Some(ChatCommand::Update(3, "نص جديد".to_string()))
        );
        assert_eq!(parse_chat_command("/delete 2"), Some(ChatCommand::Delete(2)));
        assert_eq!(parse_chat_command("ما هي الخلية"), None);
    }

    #[test]
    fn test_parse_chat_command_usage() {
        assert_eq!(parse_chat_command("/add"), Some(ChatCommand::Invalid("/add <내용>")));
        assert_eq!(
            parse_chat_command("/update 3"),
            Some(ChatCommand::Invalid("/update <id> <내용>"))
        );
        assert_eq!(
            parse_chat_command("/delete abc"),
            Some(ChatCommand::Invalid("/delete <id>"))
        );
    }

    #[test]
    fn test_cli_parses_global_data_file() {
        let cli = Cli::try_parse_from([
            "qalam-rag",
            "search",
            "الخلية",
            "--by",
            "text",
            "--data-file",
            "/tmp/k.json",
        ])
        .unwrap();
        assert_eq!(cli.data_file, Some(PathBuf::from("/tmp/k.json")));
        assert!(matches!(cli.command, Commands::Search { by: SearchBy::Text, .. }));
    }
}
