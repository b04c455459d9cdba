mod commands;

use clap::{Parser, Subcommand};
use std::path::PathBuf;
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

#[derive(Parser)]
#[command(name = "chatcell")]
#[command(about = "Drive browser chat assistants through a local HTTP daemon", long_about = None)]
#[command(version)]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Enable verbose logging
    #[arg(short, long, global = true)]
    verbose: bool,

    /// Emit logs as JSON lines
    #[arg(long, global = true)]
    json_logs: bool,

    /// Config file (defaults to ~/.chatcell/config.json)
    #[arg(long, global = true)]
    config: Option<PathBuf>,
}

#[derive(Subcommand)]
enum Commands {
    /// Start the daemon (long-running)
    Daemon {
        /// Write the default configuration and exit
        #[arg(long)]
        init_config: bool,

        /// Port to listen on (overrides config daemon.port)
        #[arg(short, long)]
        port: Option<u16>,

        /// Host to bind to (overrides config daemon.host)
        #[arg(long)]
        host: Option<String>,
    },

    /// Send a prompt to one assistant
    Send {
        /// Assistant id (claude, chatgpt, gemini)
        target: String,
        /// Prompt text
        prompt: String,
        /// Return right after submitting instead of waiting for the reply
        #[arg(long)]
        no_wait: bool,
        /// Seconds to wait for the reply
        #[arg(short, long)]
        timeout: Option<u64>,
        /// Named prompt template
        #[arg(long)]
        template: Option<String>,
        /// Template variable as key=value (repeatable)
        #[arg(long = "var")]
        vars: Vec<String>,
        /// Named context preset to prepend
        #[arg(long)]
        context: Option<String>,
    },

    /// Show daemon and per-assistant status
    Status,

    /// Manage an assistant's chats
    Chats {
        #[command(subcommand)]
        command: ChatsCommands,
    },
}

#[derive(Subcommand)]
enum ChatsCommands {
    /// List chats visible in the assistant's sidebar
    List {
        target: String,
    },
    /// Open a fresh chat
    New {
        target: String,
    },
    /// Switch to an existing chat by id
    Switch {
        target: String,
        chat_id: String,
    },
    /// Export the current chat as markdown
    Export {
        target: String,
        /// Also write the markdown to this path (on the daemon host)
        #[arg(short, long)]
        output: Option<PathBuf>,
    },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| {
        if cli.verbose {
            EnvFilter::new("debug")
        } else {
            EnvFilter::new("info")
        }
    });

    if cli.json_logs {
        tracing_subscriber::registry()
            .with(fmt::layer().json().with_writer(std::io::stderr))
            .with(filter)
            .init();
    } else {
        tracing_subscriber::registry()
            .with(fmt::layer().with_writer(std::io::stderr))
            .with(filter)
            .init();
    }

    match cli.command {
        Commands::Daemon {
            init_config,
            port,
            host,
        } => {
            commands::daemon::run(cli.config, init_config, host, port).await?;
        }
        Commands::Send {
            target,
            prompt,
            no_wait,
            timeout,
            template,
            vars,
            context,
        } => {
            let args = commands::send::SendArgs {
                target,
                prompt,
                wait: !no_wait,
                timeout,
                template,
                vars,
                context,
            };
            commands::send::run(cli.config, args).await?;
        }
        Commands::Status => {
            commands::status::run(cli.config).await?;
        }
        Commands::Chats { command } => match command {
            ChatsCommands::List { target } => {
                commands::chats::list(cli.config, &target).await?;
            }
            ChatsCommands::New { target } => {
                commands::chats::new_chat(cli.config, &target).await?;
            }
            ChatsCommands::Switch { target, chat_id } => {
                commands::chats::switch(cli.config, &target, &chat_id).await?;
            }
            ChatsCommands::Export { target, output } => {
                commands::chats::export(cli.config, &target, output).await?;
            }
        },
    }

    Ok(())
}
