//! Command-line front end for replaying, fetching, and producing tutoring streams.

mod commands;
mod output;

use std::path::Path;

use clap::Parser;

use crate::commands::{EntityKind, FetchArgs, GenerateArgs, ReplayArgs};

/// tutor-stream: NDJSON/SSE streams of generated curriculum days and assignment variants
#[derive(Parser)]
#[command(name = "tutor-stream", version)]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(clap::Subcommand)]
enum Command {
    /// Feed a captured stream body through the pipeline in fixed-size chunks.
    Replay(ReplayArgs),
    /// POST a request and print the classified events as they arrive.
    Fetch(FetchArgs),
    /// Generate entities with OpenAI and print the NDJSON body a server would send.
    Generate(GenerateArgs),
}

/// Loads `.env` next to the crate manifest, then from the working directory.
fn load_env() {
    let _ = dotenvy::from_path(Path::new(env!("CARGO_MANIFEST_DIR")).join(".env"));
    dotenvy::dotenv().ok();
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    load_env();
    tutor_stream::init_observability();
    let cli = Cli::parse();

    match cli.command {
        Command::Replay(args) => match args.entity {
            EntityKind::Curriculum => commands::replay::<tutor_stream::CurriculumDay>(args).await,
            EntityKind::Assignment => {
                commands::replay::<tutor_stream::AssignmentVariant>(args).await
            }
        },
        Command::Fetch(args) => match args.entity {
            EntityKind::Curriculum => commands::fetch::<tutor_stream::CurriculumDay>(args).await,
            EntityKind::Assignment => {
                commands::fetch::<tutor_stream::AssignmentVariant>(args).await
            }
        },
        Command::Generate(args) => match args.entity {
            EntityKind::Curriculum => {
                commands::generate::<tutor_stream::CurriculumDay>(args).await
            }
            EntityKind::Assignment => {
                commands::generate::<tutor_stream::AssignmentVariant>(args).await
            }
        },
    }
}
