use std::io::Write;
use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::Arc;

use clap::{Parser, Subcommand};
use futures::stream;
use tokio::io::{self, AsyncBufReadExt};
use tracing_subscriber::EnvFilter;

use cortex_agent_chat::{
    collect_answer, AgentClient, AgentConfig, AnswerKind, CitationStyle, CredentialSigner,
    FinalAnswer, QueryExecutor, SnowflakeEngine, WarehouseConfig,
};

#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Load environment variables from this file first
    #[arg(short, long, global = true, env = "CORTEX_ENV_FILE")]
    env_file: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Ask the agent one question
    Ask {
        query: String,

        /// Run returned SQL against the warehouse (needs SNOWFLAKE_PASSWORD)
        #[arg(short = 'x', long)]
        execute: bool,
    },
    /// Interactive chat with the agent
    Chat,
    /// Print the principal, key fingerprint and a fresh token
    Token,
    /// Assemble the answer from a recorded SSE transcript without calling the API
    Replay {
        file: PathBuf,

        #[arg(long, default_value = "last")]
        citation_style: CitationStyle,
    },
}

fn print_chat_help() {
    println!("Commands:");
    println!("  /help      - Show this command menu");
    println!("  /execute   - Run the SQL from the last answer");
    println!("  /token     - Show token issuer and renewal time");
    println!("  /exit      - Exit chat");
    println!();
}

fn init_tracing() {
    let default_level = if std::env::var("SNOWFLAKE_DEBUG").is_ok() {
        "debug"
    } else {
        "info"
    };
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_level));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .init();
}

fn build_client() -> Result<AgentClient, String> {
    let config = AgentConfig::from_env().map_err(|e| e.to_string())?;
    let signer = CredentialSigner::from_config(&config).map_err(|e| e.to_string())?;
    AgentClient::new(config, Arc::new(signer)).map_err(|e| e.to_string())
}

async fn connect_warehouse() -> Result<Option<SnowflakeEngine>, String> {
    match WarehouseConfig::from_env().map_err(|e| e.to_string())? {
        Some(config) => SnowflakeEngine::connect(&config)
            .await
            .map(Some)
            .map_err(|e| e.to_string()),
        None => Ok(None),
    }
}

async fn run_sql(engine: &dyn QueryExecutor, sql: &str) {
    match engine.execute(sql).await {
        Ok(result) => println!("{}\n", result.to_table_string()),
        Err(err) => println!("✗ Query execution failed: {}\n", err),
    }
}

async fn render_answer(answer: &FinalAnswer, engine: Option<&dyn QueryExecutor>) {
    match answer.kind() {
        AnswerKind::Sql => {
            if !answer.text.is_empty() {
                println!("{}\n", answer.text);
            }
            println!("SQL:\n{}\n", answer.sql);
            if let Some(engine) = engine {
                run_sql(engine, &answer.sql).await;
            }
        }
        AnswerKind::Cited => println!("{}\n{}\n", answer.text, answer.citations),
        AnswerKind::Plain => println!("{}\n", answer.text),
    }
}

async fn chat(client: AgentClient, engine: Option<SnowflakeEngine>) {
    println!("Cortex Agent Chat");
    println!("Endpoint: {}", client.endpoint());
    print_chat_help();

    let mut lines = io::BufReader::new(io::stdin()).lines();
    let mut last_sql: Option<String> = None;

    loop {
        print!("You: ");
        let _ = std::io::stdout().flush();

        let input = match lines.next_line().await {
            Ok(Some(line)) => line.trim().to_string(),
            _ => break,
        };

        if input.is_empty() {
            continue;
        }

        if input == "/exit" {
            println!("Goodbye!");
            break;
        }

        if input == "/help" {
            print_chat_help();
            continue;
        }

        if input == "/token" {
            match client.signer().current_credential() {
                Ok(credential) => println!(
                    "Issuer: {}\nIssued: {}\nRenews: {}\n",
                    client.signer().issuer(),
                    credential.issued_at,
                    credential.renew_at
                ),
                Err(err) => println!("✗ Failed to issue token: {}\n", err),
            }
            continue;
        }

        if input == "/execute" {
            match (&engine, &last_sql) {
                (Some(engine), Some(sql)) => run_sql(engine, sql).await,
                (None, _) => println!("✗ No warehouse configured. Set SNOWFLAKE_PASSWORD.\n"),
                (_, None) => println!("✗ No SQL to execute. Ask the agent for SQL first.\n"),
            }
            continue;
        }

        let answer = client.ask(&input).await;
        if answer.kind() == AnswerKind::Sql {
            last_sql = Some(answer.sql.clone());
        }
        render_answer(&answer, None).await;
    }
}

async fn run(args: Args) -> Result<(), String> {
    match args.command {
        Commands::Ask { query, execute } => {
            let client = build_client()?;
            let engine = if execute { connect_warehouse().await? } else { None };
            let answer = client.ask(&query).await;
            render_answer(&answer, engine.as_ref().map(|e| e as &dyn QueryExecutor)).await;
        }
        Commands::Chat => {
            let client = build_client()?;
            let engine = connect_warehouse().await?;
            chat(client, engine).await;
        }
        Commands::Token => {
            let config = AgentConfig::from_env().map_err(|e| e.to_string())?;
            let signer = CredentialSigner::from_config(&config).map_err(|e| e.to_string())?;
            let token = signer.current_token().map_err(|e| e.to_string())?;
            println!("Principal:   {}", signer.principal().qualified_name());
            println!("Fingerprint: {}", signer.fingerprint());
            println!("Token:       {}", token);
        }
        Commands::Replay {
            file,
            citation_style,
        } => {
            let transcript = std::fs::read(&file)
                .map_err(|e| format!("Failed to read {}: {}", file.display(), e))?;
            let bytes = stream::iter([Ok::<_, std::io::Error>(transcript)]);
            let answer = collect_answer(bytes, citation_style)
                .await
                .map_err(|e| e.to_string())?;
            render_answer(&answer, None).await;
        }
    }
    Ok(())
}

#[tokio::main]
async fn main() -> ExitCode {
    let args = Args::parse();

    if let Some(path) = &args.env_file {
        if let Err(e) = dotenvy::from_path(path) {
            eprintln!("Failed to load {}: {}", path.display(), e);
            return ExitCode::FAILURE;
        }
    } else {
        let _ = dotenvy::dotenv();
    }

    init_tracing();

    match run(args).await {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            eprintln!("✗ {}", e);
            ExitCode::FAILURE
        }
    }
}
