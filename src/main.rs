use clap::{Parser, Subcommand};

mod commands;

#[derive(Parser)]
#[command(
    name = "bo1",
    version,
    about = "Board of One — a panel of AI expert personas debates your decision and returns an advisory recommendation"
)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run a full deliberation on a problem statement
    Deliberate {
        /// The decision problem, in natural language
        problem: String,
        /// Optional business context for the panel
        #[arg(long)]
        context: Option<String>,
        /// Owner identity for the session (defaults to $USER)
        #[arg(long)]
        owner: Option<String>,
        /// Answers to critical questions, as question=answer (repeatable)
        #[arg(long = "answer", value_name = "QUESTION=ANSWER")]
        answers: Vec<String>,
        /// Write the canonical JSON export here
        #[arg(long)]
        export_json: Option<std::path::PathBuf>,
        /// Write the Markdown transcript here
        #[arg(long)]
        export_md: Option<std::path::PathBuf>,
    },
    /// Resume a paused session from its latest checkpoint
    Resume {
        session_id: String,
        #[arg(long)]
        owner: Option<String>,
        #[arg(long = "answer", value_name = "QUESTION=ANSWER")]
        answers: Vec<String>,
    },
    /// List stored sessions
    Sessions {
        #[arg(long)]
        owner: Option<String>,
        /// List all active sessions (admin)
        #[arg(long)]
        admin: bool,
    },
    /// Kill a session
    Kill {
        session_id: String,
        #[arg(long)]
        owner: Option<String>,
        /// Kill as admin, bypassing ownership (audited)
        #[arg(long)]
        admin: bool,
        #[arg(long)]
        reason: Option<String>,
    },
    /// Export a stored session
    Export {
        session_id: String,
        #[arg(long)]
        owner: Option<String>,
        /// Output format: json or markdown
        #[arg(long, default_value = "markdown")]
        format: String,
    },
}

#[tokio::main]
async fn main() {
    let _ = dotenvy::dotenv();
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("bo1=info,bo1_engine=info")),
        )
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();
    let code = match run(cli).await {
        Ok(code) => code,
        Err(e) => {
            eprintln!("error: {:#}", e);
            1
        }
    };
    std::process::exit(code);
}

async fn run(cli: Cli) -> anyhow::Result<i32> {
    match cli.command {
        Commands::Deliberate {
            problem,
            context,
            owner,
            answers,
            export_json,
            export_md,
        } => {
            commands::deliberate(problem, context, owner, answers, export_json, export_md).await
        }
        Commands::Resume {
            session_id,
            owner,
            answers,
        } => commands::resume(session_id, owner, answers).await,
        Commands::Sessions { owner, admin } => commands::sessions(owner, admin).await,
        Commands::Kill {
            session_id,
            owner,
            admin,
            reason,
        } => commands::kill(session_id, owner, admin, reason).await,
        Commands::Export {
            session_id,
            owner,
            format,
        } => commands::export(session_id, owner, format).await,
    }
}
