//! bot_session 命令行：和某个 bot 进行多轮对话，结束时写入 checkpoint
//!
//! ```bash
//! bot_session --config bot-session.yaml --bot 7            # 全新会话
//! bot_session --config bot-session.yaml --bot 7 --resume   # 恢复最新 checkpoint
//! bot_session --config bot-session.yaml --bot 7 --resume 3 --stream
//! ```

use bot_session::bot::InMemoryBotDirectory;
use bot_session::checkpoint::FileCheckpointStore;
use bot_session::config::Config;
use bot_session::error::Result;
use bot_session::llm::DefaultLlmClient;
use bot_session::llm::config::LlmConfig;
use bot_session::runtime::LlmAgentRuntime;
use bot_session::session::{ResumeFrom, SessionManager, SessionOptions, Turn, UserMessage};
use clap::Parser;
use futures::StreamExt;
use rustyline::DefaultEditor;
use rustyline::error::ReadlineError;
use std::io::Write;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::info;

#[derive(Parser, Debug)]
#[command(name = "bot_session", about = "Chat with a bot and keep checkpoints of the conversation")]
struct Cli {
    /// YAML 配置文件
    #[arg(short, long, env = "BOT_SESSION_CONFIG", default_value = "bot-session.yaml")]
    config: String,

    /// 要对话的 bot
    #[arg(short, long)]
    bot: u64,

    /// 从 checkpoint 恢复，不带编号（或 0）表示最新
    #[arg(short, long, num_args = 0..=1, default_missing_value = "0")]
    resume: Option<u64>,

    /// 流式输出回复
    #[arg(short, long)]
    stream: bool,
}

enum Command {
    Save,
    End,
    History(u64),
    Checkpoints,
    State,
    Quit,
    Help,
    Unknown(String),
}

impl Command {
    fn parse(line: &str) -> Option<Self> {
        let rest = line.strip_prefix('/')?;
        let mut parts = rest.split_whitespace();
        let cmd = parts.next().unwrap_or_default();
        Some(match cmd {
            "save" => Command::Save,
            "end" => Command::End,
            "history" => Command::History(parts.next().and_then(|n| n.parse().ok()).unwrap_or(0)),
            "checkpoints" => Command::Checkpoints,
            "state" => Command::State,
            "quit" | "exit" => Command::Quit,
            "help" => Command::Help,
            other => Command::Unknown(other.to_string()),
        })
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    dotenv::dotenv().ok();

    tracing_subscriber::fmt()
        .with_env_filter(
            std::env::var("RUST_LOG").unwrap_or_else(|_| "bot_session=info".into()),
        )
        .init();

    let cli = Cli::parse();
    let config = if std::path::Path::new(&cli.config).exists() {
        Config::load(&cli.config)?
    } else {
        info!(path = %cli.config, "配置文件不存在，使用默认配置");
        Config::default()
    };

    let store = Arc::new(FileCheckpointStore::new(&config.store.path)?);
    let bots = Arc::new(InMemoryBotDirectory::new(config.bots.clone()));
    let llm = Arc::new(DefaultLlmClient::new(
        Arc::new(reqwest::Client::new()),
        LlmConfig::from_env()?,
    ));
    let mut runtime = LlmAgentRuntime::new(llm);
    if let Some(model) = &config.default_model {
        runtime = runtime.with_default_model(model.clone());
    }
    let manager = SessionManager::new(store, bots, Arc::new(runtime))
        .with_options(SessionOptions::from(&config.session));

    let bot_id = cli.bot;
    let state = manager
        .start(bot_id, ResumeFrom::from_number(cli.resume))
        .await?;
    match state.origin {
        Some(n) => println!("📂 已从 checkpoint #{n} 恢复 {} 条消息", state.turns.len()),
        None => println!("🆕 新会话 (bot {bot_id})"),
    }
    print_turns(&state.turns);
    println!("输入 /help 查看命令，Ctrl-C 取消正在生成的回复\n");

    let mut rl = DefaultEditor::new().map_err(|e| bot_session::error::BotError::Other(e.to_string()))?;
    loop {
        let line = match tokio::task::block_in_place(|| rl.readline("👤 > ")) {
            Ok(line) => line,
            Err(ReadlineError::Interrupted) => {
                println!("输入 /quit 退出（会话不会保存），/end 保存并退出");
                continue;
            }
            Err(ReadlineError::Eof) => break,
            Err(e) => {
                eprintln!("❌ {e}");
                break;
            }
        };
        let input = line.trim();
        if input.is_empty() {
            continue;
        }
        let _ = rl.add_history_entry(input);

        if let Some(command) = Command::parse(input) {
            match command {
                Command::Save => match manager.save_checkpoint(bot_id).await {
                    Ok(n) => println!("📌 已保存为 checkpoint #{n}"),
                    Err(e) => eprintln!("❌ {e}"),
                },
                Command::End => match manager.end(bot_id).await {
                    Ok(outcome) => {
                        match outcome.checkpoint_number {
                            Some(n) => println!("⏹️ 会话已结束，保存为 checkpoint #{n}"),
                            None => println!("⏹️ 会话已结束（无消息，未保存）"),
                        }
                        break;
                    }
                    Err(e) => eprintln!("❌ {e}\n   对话仍保留，可以再次 /end"),
                },
                Command::History(n) => match manager.history(bot_id, n).await {
                    Ok(turns) => print_turns(&turns),
                    Err(e) => eprintln!("❌ {e}"),
                },
                Command::Checkpoints => match manager.checkpoints(bot_id).await {
                    Ok(list) if list.is_empty() => println!("（没有 checkpoint）"),
                    Ok(list) => {
                        for cp in list {
                            println!(
                                "  #{:<4} {:<20} {} 条消息  {}",
                                cp.checkpoint_number,
                                cp.name,
                                cp.history().map(|h| h.len()).unwrap_or(0),
                                cp.description
                            );
                        }
                    }
                    Err(e) => eprintln!("❌ {e}"),
                },
                Command::State => match manager.state(bot_id).await {
                    Ok(Some(state)) => {
                        let origin = state
                            .origin
                            .map(|n| format!("#{n}"))
                            .unwrap_or_else(|| "fresh".to_string());
                        println!(
                            "  来源 {origin}，{} 条消息，{}",
                            state.turns.len(),
                            if state.dirty { "有未保存的修改" } else { "已保存" }
                        );
                    }
                    Ok(None) => println!("  （没有进行中的会话）"),
                    Err(e) => eprintln!("❌ {e}"),
                },
                Command::Quit => break,
                Command::Help => print_help(),
                Command::Unknown(cmd) => println!("未知命令 /{cmd}，输入 /help 查看命令"),
            }
            continue;
        }

        let cancel = CancellationToken::new();
        let watcher = tokio::spawn({
            let cancel = cancel.clone();
            async move {
                if tokio::signal::ctrl_c().await.is_ok() {
                    cancel.cancel();
                }
            }
        });

        let message = UserMessage::user(input);
        let outcome = if cli.stream {
            tokio::select! {
                r = stream_reply(&manager, bot_id, message) => Some(r),
                _ = cancel.cancelled() => None,
            }
        } else {
            tokio::select! {
                r = manager.post_message(bot_id, message) => Some(r.map(|turns| {
                    if let Some(last) = turns.last() {
                        println!("🤖 {}\n", last.content);
                    }
                })),
                _ = cancel.cancelled() => None,
            }
        };
        watcher.abort();

        match outcome {
            Some(Ok(())) => {}
            Some(Err(e)) => eprintln!("❌ {e}"),
            None => println!("\n⚠️ 已取消，本轮消息未记录"),
        }
    }

    Ok(())
}

async fn stream_reply(manager: &SessionManager, bot_id: u64, message: UserMessage) -> Result<()> {
    let mut stream = manager.post_message_stream(bot_id, message).await?;
    print!("🤖 ");
    while let Some(fragment) = stream.next().await {
        print!("{}", fragment?);
        let _ = std::io::stdout().flush();
    }
    println!("\n");
    Ok(())
}

fn print_turns(turns: &[Turn]) {
    for turn in turns {
        let icon = match turn.role {
            bot_session::session::Role::User => "👤",
            bot_session::session::Role::Assistant => "🤖",
            bot_session::session::Role::System => "⚙️",
        };
        println!("{icon} {}", turn.content);
    }
}

fn print_help() {
    println!("  /save           保存当前对话为新的 checkpoint，继续会话");
    println!("  /end            保存并结束会话");
    println!("  /history [N]    查看 checkpoint N 的对话（默认最新）");
    println!("  /checkpoints    列出所有 checkpoint");
    println!("  /state          查看当前会话状态");
    println!("  /quit           退出（不保存）");
}
