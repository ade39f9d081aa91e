use anyhow::Result;
use clap::{Parser, Subcommand};
use farm_query::presenter::{render_error, render_narrative, render_preview};
use farm_query::{AgentConfig, DatasetCache, Presenter, QueryAgent};
use std::io::{self, BufRead, Write};
use std::path::PathBuf;
use std::sync::Arc;
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(name = "farm-query")]
#[command(about = "Ask questions about farm operations records in plain language")]
#[command(version)]
struct Args {
    /// Spreadsheet or CSV file with the farm records
    #[arg(short, long, default_value = "Fazendas.xlsx", global = true)]
    source: PathBuf,

    /// OpenAI API key (or set OPENAI_API_KEY env var)
    #[arg(long, global = true)]
    api_key: Option<String>,

    /// Model name (or set OPENAI_MODEL env var)
    #[arg(long, global = true)]
    model: Option<String>,

    /// Print results as JSON
    #[arg(long, global = true)]
    json: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Answer one question
    Ask { question: String },
    /// List the suggested questions, or run one of them
    Suggest {
        /// Number of the suggestion to run (1-based)
        #[arg(long)]
        run: Option<usize>,
    },
    /// Narrative summary of the whole table for a context label
    Summarize { context: String },
    /// Show the first rows of the loaded table
    Preview {
        #[arg(long, default_value_t = 10)]
        rows: usize,
    },
    /// Interactive question loop
    Repl,
}

#[tokio::main]
async fn main() -> Result<()> {
    dotenv::dotenv().ok();

    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn")),
        )
        .with_writer(io::stderr)
        .init();

    let args = Args::parse();

    let config = AgentConfig::from_lookup(|name| match name {
        "OPENAI_API_KEY" if args.api_key.is_some() => args.api_key.clone(),
        "OPENAI_MODEL" if args.model.is_some() => args.model.clone(),
        _ => std::env::var(name).ok(),
    });
    let config = match config {
        Ok(config) => config,
        Err(e) => {
            eprintln!("{}", render_error(&e));
            return Err(e.into());
        }
    };

    let cache = Arc::new(DatasetCache::for_files().with_revalidation(config.revalidate_source));
    let source_key = args.source.to_string_lossy().to_string();
    let agent = Arc::new(QueryAgent::connect(config, cache, source_key).await?);
    let presenter = Presenter::new(agent);
    let suggestions = presenter.suggested_questions();

    if let Some(load_error) = presenter.agent().load_error() {
        let e = farm_query::AgentError::Load(load_error);
        eprintln!("{}", render_error(&e));
        return Err(e.into());
    }
    info!("Answering questions over '{}'", presenter.agent().source_key());

    match args.command {
        Commands::Ask { question } => ask(&presenter, &question, args.json).await,
        Commands::Suggest { run: None } => {
            println!("Sugestões de Perguntas");
            for (idx, question) in suggestions.iter().enumerate() {
                println!("  {}. {}", idx + 1, question);
            }
            Ok(())
        }
        Commands::Suggest { run: Some(number) } => {
            match number.checked_sub(1).and_then(|i| suggestions.get(i)) {
                Some(question) => {
                    println!("{}", question);
                    ask(&presenter, question, args.json).await
                }
                None => Err(anyhow::anyhow!(
                    "Suggestion {} does not exist (1-{})",
                    number,
                    suggestions.len()
                )),
            }
        }
        Commands::Summarize { context } => summarize(&presenter, &context, args.json).await,
        Commands::Preview { rows } => {
            if let Some(dataset) = presenter.agent().current_dataset() {
                println!("{}", render_preview(&dataset, rows));
            }
            Ok(())
        }
        Commands::Repl => repl(&presenter, args.json).await,
    }
}

async fn ask(presenter: &Presenter, question: &str, json: bool) -> Result<()> {
    let outcome = presenter.ask(question).await;
    match (&outcome, json) {
        (Ok(result), true) => println!("{}", serde_json::to_string_pretty(&result.to_json())?),
        (Err(e), true) => println!(
            "{}",
            serde_json::to_string_pretty(&serde_json::json!({
                "error": e.kind(),
                "message": render_error(e),
            }))?
        ),
        (_, false) => println!("{}", presenter.render_outcome(&outcome)),
    }
    if let Err(e) = outcome {
        error!("Question failed: {}", e);
    }
    Ok(())
}

async fn summarize(presenter: &Presenter, context: &str, json: bool) -> Result<()> {
    match presenter.agent().summarize(context).await {
        Ok(narrative) if json => println!("{}", serde_json::to_string_pretty(&narrative)?),
        Ok(narrative) => println!("{}", render_narrative(&narrative)),
        Err(e) => {
            eprintln!("{}", render_error(&e));
            return Err(e.into());
        }
    }
    Ok(())
}

/// Reads one question per line. `#N` runs suggestion N, `resumo <contexto>`
/// asks for a narrative and `sair` quits.
async fn repl(presenter: &Presenter, json: bool) -> Result<()> {
    println!("Faça uma pergunta sobre os dados (\"sair\" para encerrar).");
    let suggestions = presenter.suggested_questions();
    for (idx, question) in suggestions.iter().enumerate() {
        println!("  #{} {}", idx + 1, question);
    }

    let stdin = io::stdin();
    loop {
        print!("\n> ");
        io::stdout().flush()?;

        let mut line = String::new();
        if stdin.lock().read_line(&mut line)? == 0 {
            break;
        }
        let line = line.trim();

        if line.eq_ignore_ascii_case("sair") || line.eq_ignore_ascii_case("exit") {
            break;
        }
        if let Some(context) = line.strip_prefix("resumo ") {
            if let Err(e) = summarize(presenter, context, json).await {
                error!("Summary failed: {}", e);
            }
            continue;
        }
        if let Some(number) = line.strip_prefix('#').and_then(|n| n.trim().parse::<usize>().ok()) {
            match number.checked_sub(1) {
                Some(index) if index < suggestions.len() => {
                    println!("{}", suggestions[index]);
                    if let Some(outcome) = presenter.ask_suggested(index).await {
                        println!("{}", presenter.render_outcome(&outcome));
                    }
                }
                _ => println!("Sugestão inexistente."),
            }
            continue;
        }
        ask(presenter, line, json).await?;
    }
    Ok(())
}
