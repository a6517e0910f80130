//! Quill CLI entry point

use std::io::Write;
use std::sync::{Arc, Mutex};

use anyhow::Result;
use clap::{Parser, Subcommand};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing_subscriber::EnvFilter;

use quill::agent::{
    AgentLoop, ContextSource, ExchangeEnd, ExchangeEvent, ExchangeRequest, Message, ProviderRegistry,
};
use quill::config::Config;
use quill::tools::{KnowledgeSearch, ListFilesTool, ReadFileTool, SearchKnowledgeBaseTool, ToolRegistry, VaultSearch};
use quill::ui;

#[derive(Parser)]
#[command(name = "quill")]
#[command(about = "Quill - ask questions about your notes")]
#[command(version)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Create the configuration file and notes folder
    Init,

    /// Ask a question; without a message, start an interactive session
    Ask {
        /// Question to ask
        message: Option<String>,

        /// Answer language, overriding the configured one
        #[arg(short, long)]
        language: Option<String>,

        /// Search the notes up front and inject the best matches
        #[arg(short, long)]
        retrieve: bool,

        /// Do not offer tools to the model
        #[arg(long)]
        no_tools: bool,
    },

    /// Show configuration status
    Status,

    /// List the tools offered to the model
    Tools,
}

#[tokio::main]
async fn main() -> Result<()> {
    // Initialize logging
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .with_writer(std::io::stderr)
        .init();

    // Ctrl+C cancels the running exchange; a second press with nothing running exits.
    let current: Arc<Mutex<CancellationToken>> = Arc::new(Mutex::new(CancellationToken::new()));
    let handler_token = current.clone();
    ctrlc::set_handler(move || {
        let token = match handler_token.lock() {
            Ok(token) => token.clone(),
            Err(_) => std::process::exit(130),
        };
        if token.is_cancelled() {
            eprintln!("\nBye!");
            std::process::exit(130);
        }
        token.cancel();
    })
    .ok();

    let cli = Cli::parse();

    match cli.command {
        Commands::Init => {
            let config = quill::config::init()?;
            ui::print_success(&format!("Config written to {}", quill::config::config_path().display()));
            ui::print_step(&format!("Notes folder: {}", config.notes_dir.display()));
            ui::print_step("Set provider.vendor, provider.model and provider.api_key, then run: quill ask \"Hello\"");
        }

        Commands::Ask {
            message,
            language,
            retrieve,
            no_tools,
        } => {
            let config = quill::config::load()?;
            let session = Session::new(&config, language, retrieve, no_tools, current)?;
            ui::print_header(config.provider.model_name(), config.provider.vendor.as_str());

            match message {
                Some(msg) => {
                    let mut history = Vec::new();
                    session.ask(&mut history, &msg).await?;
                }
                None => session.interactive().await?,
            }
        }

        Commands::Status => {
            let config = quill::config::load()?;
            println!("Quill Status\n");
            println!("Config: {}", quill::config::config_path().display());
            println!("Notes: {}", config.notes_dir.display());
            println!("Provider: {}", config.provider.vendor);
            println!("Model: {}", config.provider.model_name());
            println!("Endpoint: {}", config.provider.endpoint_url());
            if config.provider.vendor.requires_api_key() {
                println!(
                    "API key: {}",
                    if config.provider.api_key.is_empty() { "not set" } else { "✓" }
                );
            }
            println!(
                "Limits: {} rounds, {}s per round, {}s per exchange",
                config.orchestration.max_rounds,
                config.orchestration.round_timeout_secs,
                config.orchestration.exchange_timeout_secs
            );
            println!("Providers available: {}", ProviderRegistry::available().join(", "));
        }

        Commands::Tools => {
            let config = quill::config::load()?;
            let registry = build_registry(&config);
            for def in registry.definitions() {
                println!("{:<24} {}", def.name, def.description);
            }
        }
    }

    Ok(())
}

fn build_registry(config: &Config) -> ToolRegistry {
    let root = config.notes_dir.clone();
    let search: Arc<dyn KnowledgeSearch> = Arc::new(VaultSearch::new(root.clone()));

    let mut registry = ToolRegistry::new().with_max_result_chars(config.orchestration.max_result_chars);
    registry.register(ReadFileTool::new(root.clone()));
    registry.register(ListFilesTool::new(root));
    registry.register(SearchKnowledgeBaseTool::new(
        search,
        config.provider.clone(),
        config.orchestration.max_search_results,
    ));
    registry
}

/// Everything needed to run exchanges from the command line.
struct Session {
    agent: AgentLoop,
    config: Config,
    search: VaultSearch,
    language: Option<String>,
    retrieve: bool,
    current: Arc<Mutex<CancellationToken>>,
}

impl Session {
    fn new(
        config: &Config,
        language: Option<String>,
        retrieve: bool,
        no_tools: bool,
        current: Arc<Mutex<CancellationToken>>,
    ) -> Result<Self> {
        let adapter = ProviderRegistry::create(&config.provider)?;
        let mut agent = AgentLoop::new(adapter, &config.orchestration).with_instruction(&config.system_prompt);
        if !no_tools {
            agent = agent.with_tools(Arc::new(build_registry(config)));
        }
        Ok(Self {
            agent,
            config: config.clone(),
            search: VaultSearch::new(config.notes_dir.clone()),
            language: language.or_else(|| config.language.clone()),
            retrieve,
            current,
        })
    }

    async fn ask(&self, history: &mut Vec<Message>, prompt: &str) -> Result<()> {
        let cancel = CancellationToken::new();
        if let Ok(mut slot) = self.current.lock() {
            *slot = cancel.clone();
        }

        let context = if self.retrieve {
            let found = self
                .search
                .search_with_results(prompt, &self.config.provider, self.config.orchestration.max_search_results)
                .await?;
            ContextSource::Retrieved(found.context)
        } else {
            ContextSource::None
        };
        let files = self.search.list_notes().unwrap_or_default();

        let (tx, mut rx) = mpsc::unbounded_channel();
        let printer = tokio::spawn(async move {
            let mut stdout = std::io::stdout();
            while let Some(event) = rx.recv().await {
                match event {
                    ExchangeEvent::TextDelta(text) => {
                        print!("{}", text);
                        let _ = stdout.flush();
                    }
                    ExchangeEvent::ToolCall(call) => ui::print_tool_event(&call),
                    ExchangeEvent::Notice(notice) => ui::print_warning(&notice),
                    ExchangeEvent::RoundStarted { round } => {
                        tracing::debug!("Round {} started", round);
                    }
                }
            }
        });

        let request = ExchangeRequest::new(prompt)
            .language(self.language.clone())
            .context(context)
            .files(files)
            .events(tx)
            .cancel(cancel);
        let result = self.agent.run(history, request).await;
        // The request, and with it the sender, is gone; the printer drains and stops.
        let _ = printer.await;
        println!();

        let outcome = result?;
        match outcome.end {
            ExchangeEnd::Cancelled => ui::print_warning("Cancelled"),
            ExchangeEnd::Failed(e) => ui::print_error(&e),
            _ => {}
        }
        Ok(())
    }

    async fn interactive(&self) -> Result<()> {
        ui::print_step("Interactive mode (type 'exit' to quit, Ctrl+C stops an answer)");
        let mut history = Vec::new();
        loop {
            print!("\n› ");
            std::io::stdout().flush()?;

            let mut input = String::new();
            if std::io::stdin().read_line(&mut input)? == 0 {
                break;
            }
            let input = input.trim();
            if input.eq_ignore_ascii_case("exit") || input.eq_ignore_ascii_case("quit") {
                break;
            }
            if input.is_empty() {
                continue;
            }

            if let Err(e) = self.ask(&mut history, input).await {
                ui::print_error(&e.to_string());
            }
        }
        Ok(())
    }
}
