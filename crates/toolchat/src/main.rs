//! Interactive chat in the terminal, with tools from MCP servers.

#[macro_use]
extern crate tracing;

use std::io::Write as _;
use std::pin::pin;
use std::time::Duration;

use anyhow::Context as _;
use clap::Parser;
use indicatif::{ProgressBar, ProgressStyle};
use owo_colors::OwoColorize;
use tokio::io::{self, AsyncBufReadExt};
use tokio::select;
use tokio::sync::mpsc;
use tokio::time::sleep;
use toolchat::SessionBuilder;
use toolchat::config::provider_config_from_env;
use toolchat::core::{TurnOptions, TurnOutcome};
use toolchat::mcp::ServerConfig;
use toolchat_openai_model::OpenAIProvider;

/// Chat with a model that can call tools served by MCP servers.
#[derive(Debug, Parser)]
#[command(name = "toolchat", version)]
struct Cli {
    /// MCP servers to connect to: a `.py` script, an `http(s)://` SSE
    /// endpoint or a command line.
    #[arg(value_name = "TARGET")]
    targets: Vec<String>,

    /// Connect to a server and expose its tools as `NAME_<tool>`.
    #[arg(long = "prefix", value_name = "NAME=TARGET", value_parser = parse_mount)]
    mounts: Vec<(String, String)>,

    /// Maximum number of model calls while answering one message.
    #[arg(long, value_name = "N")]
    max_iterations: Option<u32>,

    /// Wall-clock limit for answering one message, in seconds.
    #[arg(long, value_name = "SECS", value_parser = parse_seconds)]
    time_budget: Option<Duration>,

    /// Limit for a single tool call, in seconds.
    #[arg(long, value_name = "SECS", value_parser = parse_seconds)]
    tool_timeout: Option<Duration>,

    /// Run the tool calls of one model response one after another.
    #[arg(long)]
    sequential_tools: bool,

    /// Replace the default system prompt.
    #[arg(long, value_name = "TEXT")]
    system_prompt: Option<String>,

    /// Do not offer the built-in tools.
    #[arg(long)]
    no_builtin_tools: bool,
}

impl Cli {
    fn turn_options(&self) -> TurnOptions {
        let mut options = TurnOptions::default()
            .with_time_budget(self.time_budget)
            .with_tool_timeout(self.tool_timeout)
            .with_parallel_tool_calls(!self.sequential_tools);
        if self.max_iterations.is_some() {
            options = options.with_max_iterations(self.max_iterations);
        }
        options
    }
}

fn parse_mount(value: &str) -> Result<(String, String), String> {
    match value.split_once('=') {
        Some((name, target)) if !name.is_empty() && !target.is_empty() => {
            Ok((name.to_owned(), target.to_owned()))
        }
        _ => Err(format!("expected NAME=TARGET, got `{value}`")),
    }
}

fn parse_seconds(value: &str) -> Result<Duration, String> {
    let secs: f64 = value.parse().map_err(|err| format!("{err}"))?;
    Duration::try_from_secs_f64(secs).map_err(|err| format!("{err}"))
}

enum SessionEvent {
    Transcript(String),
    ToolResult { name: String, output: Result<String, String> },
}

const BAR_CHAR: &str = "▎";

#[tokio::main(flavor = "current_thread")]
async fn main() -> anyhow::Result<()> {
    dotenvy::dotenv().ok();
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();
    let config = provider_config_from_env()
        .context("cannot configure the model provider")?;
    info!("using model `{}`", config.model());
    let model_provider = OpenAIProvider::new(config);

    let (event_tx, mut event_rx) = mpsc::unbounded_channel();

    let mut builder = SessionBuilder::with_model_provider(model_provider)
        .with_options(cli.turn_options())
        .with_builtin_tools(!cli.no_builtin_tools)
        .on_transcript({
            let event_tx = event_tx.clone();
            move |delta| {
                event_tx.send(SessionEvent::Transcript(delta.to_owned())).ok();
            }
        })
        .on_tool_result({
            let event_tx = event_tx.clone();
            move |call, outcome| {
                let output = match outcome {
                    Ok(text) => Ok(text.clone()),
                    Err(err) => Err(err.to_string()),
                };
                event_tx
                    .send(SessionEvent::ToolResult {
                        name: call.name.clone(),
                        output,
                    })
                    .ok();
            }
        });
    if let Some(prompt) = &cli.system_prompt {
        builder = builder.with_system_prompt(prompt.as_str());
    }
    for target in &cli.targets {
        builder = builder.with_server(ServerConfig::from_target(target)?);
    }
    for (name, target) in &cli.mounts {
        let server = ServerConfig::from_target(target)?.with_name(name.as_str());
        builder = builder.mount_server(name.as_str(), server);
    }
    let mut session = builder
        .build()
        .await
        .context("cannot connect to the MCP servers")?;

    match session.tools().await {
        Ok(tools) => {
            let names: Vec<_> = tools.iter().map(|tool| tool.name.as_str()).collect();
            println!(
                "{}Connected, tools: {}",
                BAR_CHAR.bright_green(),
                names.join(", ").bright_white()
            );
        }
        Err(err) => eprintln!("{}Error: {err}", BAR_CHAR.bright_red()),
    }
    println!("Type your queries or `quit` to exit.");

    let progress_style = ProgressStyle::with_template("{spinner} {wide_msg}")?
        .tick_chars("⠋⠙⠹⠸⠼⠴⠦⠧⠇⠏");
    let mut stdin = io::BufReader::new(io::stdin()).lines();

    loop {
        print!("\n> ");
        std::io::stdout().flush().ok();

        let line = match stdin.next_line().await {
            Ok(Some(line)) => line,
            Ok(None) => break,
            Err(err) => {
                error!("error reading input: {err}");
                break;
            }
        };
        let query = line.trim();
        if query.is_empty() {
            continue;
        }
        if query.eq_ignore_ascii_case("quit") || query.eq_ignore_ascii_case("exit") {
            break;
        }

        let mut turn = pin!(session.send_message(query));
        let mut progress_bar: Option<ProgressBar> = None;
        let mut streaming = false;

        let result = loop {
            if !streaming {
                // Create a new progress bar if it has been finished.
                progress_bar
                    .get_or_insert_with(|| {
                        let progress_bar = ProgressBar::new_spinner();
                        progress_bar.set_style(progress_style.clone());
                        progress_bar.set_message("🤔 Thinking...");
                        progress_bar
                    })
                    .inc(1);
            }

            select! {
                result = &mut turn => break result,
                Some(event) = event_rx.recv() => {
                    // Finish the progress bar before printing anything else.
                    if let Some(progress_bar) = progress_bar.take() {
                        progress_bar.finish_and_clear();
                    }
                    print_event(event, &mut streaming);
                }
                _ = sleep(Duration::from_millis(100)) => {}
            }
        };

        if let Some(progress_bar) = progress_bar.take() {
            progress_bar.finish_and_clear();
        }
        while let Ok(event) = event_rx.try_recv() {
            print_event(event, &mut streaming);
        }
        if streaming {
            println!();
        }

        match result {
            Ok(TurnOutcome::Answer(_)) => {}
            Ok(TurnOutcome::BudgetExceeded(exceeded)) => {
                println!("{}⚠️  {exceeded}", BAR_CHAR.bright_yellow());
            }
            Err(err) => {
                println!("{}Error: {err}", BAR_CHAR.bright_red());
            }
        }
    }

    session.close().await;
    Ok(())
}

fn print_event(event: SessionEvent, streaming: &mut bool) {
    match event {
        SessionEvent::Transcript(delta) => {
            if !*streaming {
                print!("{}🤖 ", BAR_CHAR.bright_cyan());
                *streaming = true;
            }
            print!("{}", delta.bright_white());
            std::io::stdout().flush().ok();
        }
        SessionEvent::ToolResult { name, output } => {
            if *streaming {
                println!();
                *streaming = false;
            }
            let bar = BAR_CHAR.bright_magenta();
            match output {
                Ok(text) => println!(
                    "{bar}🔧 {} {}",
                    name.bright_white().bold(),
                    first_line(&text).dimmed()
                ),
                Err(err) => println!(
                    "{bar}🔧 {} {}",
                    name.bright_white().bold(),
                    err.red()
                ),
            }
        }
    }
}

fn first_line(text: &str) -> String {
    const MAX_CHARS: usize = 80;
    let line = text.lines().next().unwrap_or_default();
    if line.chars().count() > MAX_CHARS || text.lines().nth(1).is_some() {
        let mut line: String = line.chars().take(MAX_CHARS).collect();
        line.push('…');
        line
    } else {
        line.to_owned()
    }
}
