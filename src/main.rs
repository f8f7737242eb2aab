mod cli;

use std::error::Error;
use std::sync::Arc;

use aurora_qa::{
    AskService, EntityResolver, IngestReport, QaConfig, SharedQa, SqliteMessageIndex, SystemStats,
    ingest_path, serve,
};
use clap::Parser;
use serde::Serialize;
use tracing::info;
use tracing_subscriber::EnvFilter;

use crate::cli::{Cli, Command};

fn init_tracing(json: bool) {
    let filter = EnvFilter::try_from_env("AURORA_LOG").unwrap_or_else(|_| EnvFilter::new("info"));
    let builder = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .with_target(false);
    if json {
        builder.json().init();
    } else {
        builder.init();
    }
}

fn print_json<T: Serialize>(value: &T) -> Result<(), Box<dyn Error>> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}

fn load_config(cli: &Cli) -> Result<QaConfig, Box<dyn Error>> {
    let mut config = QaConfig::load(cli.config.as_deref())?;
    if let Some(db) = &cli.db {
        config.db_path = db.clone();
    }
    if let Some(provider) = &cli.provider {
        config.provider = provider.parse()?;
    }
    if let Some(model) = &cli.model {
        config.model = Some(model.clone());
    }
    Ok(config)
}

fn main() -> Result<(), Box<dyn Error>> {
    let cli = Cli::parse();
    init_tracing(cli.log_json);
    let mut config = load_config(&cli)?;

    match cli.command {
        Command::Ingest { ref path } => {
            let index = SqliteMessageIndex::open_or_create(&config.db_path, config.search_timeout())?;
            let report: IngestReport = ingest_path(&index, path)?;
            info!(
                files = report.files,
                indexed = report.indexed,
                db = %index.path().display(),
                "ingest finished"
            );
            if cli.json {
                print_json(&report)?;
            } else {
                println!(
                    "Indexed {} of {} messages from {} file(s) into {} ({} empty skipped)",
                    report.indexed,
                    report.seen,
                    report.files,
                    index.path().display(),
                    report.skipped_empty
                );
            }
        }

        Command::Ask { ref question } => {
            let qa = config.build_qa()?;
            let answer = qa.answer_detailed(question);
            if cli.json {
                print_json(&answer)?;
            } else {
                println!("{}", answer.answer);
            }
        }

        Command::Agent {
            ref question,
            ref thread,
            max_steps,
        } => {
            if let Some(steps) = max_steps {
                config.max_agent_steps = steps;
            }
            let qa: SharedQa = Arc::new(config.build_qa()?);
            let agent = config.build_agent(qa)?;
            let outcome = agent.run_detailed(thread, question);
            if cli.json {
                print_json(&outcome)?;
            } else {
                println!("{}", outcome.answer);
            }
        }

        Command::Resolve { ref question } => {
            let retriever = config.open_retriever();
            let registry = config.load_registry(&retriever);
            let resolver = EntityResolver::new(
                Arc::new(registry),
                config.match_cutoff,
                config.match_limit,
            );
            let names = resolver.resolve(question);
            if cli.json {
                print_json(&serde_json::json!({
                    "candidates": resolver.candidates(question),
                    "resolved": names,
                }))?;
            } else if names.is_empty() {
                println!("(no member resolved)");
            } else {
                for name in names {
                    println!("{name}");
                }
            }
        }

        Command::Search {
            ref query,
            ref user,
            limit,
        } => {
            let retriever = config.open_retriever();
            let k = limit.unwrap_or(if user.is_some() {
                config.entity_k
            } else {
                config.unscoped_k
            });
            let hits = retriever.search_hits(user.as_deref(), query, k)?;
            if cli.json {
                print_json(&hits)?;
            } else {
                for hit in hits {
                    println!("[{:.3}] {}", hit.score, hit.text);
                }
            }
        }

        Command::Stats => {
            let retriever = config.open_retriever();
            let registry = config.load_registry(&retriever);
            let stats = SystemStats::collect(&registry, &retriever)?;
            if cli.json {
                print_json(&stats)?;
            } else {
                println!("Number of users: {}", stats.number_of_users);
                println!("Number of messages: {}", stats.number_of_messages);
                println!("Users: {}", stats.users.join(", "));
            }
        }

        Command::Config { ref save } => match save {
            Some(path) => {
                config.save(path)?;
                println!("Saved {}", path.display());
            }
            None => print_json(&config)?,
        },

        Command::Serve {
            bind,
            port,
            no_agent,
        } => {
            if let Some(bind) = bind {
                config.bind = bind;
            }
            if let Some(port) = port {
                config.port = port;
            }
            let qa: SharedQa = Arc::new(config.build_qa()?);
            let agent = if no_agent {
                None
            } else {
                Some(config.build_agent(Arc::clone(&qa))?)
            };
            let service = Arc::new(AskService::new(qa, agent));
            serve(service, &config.bind, config.port, config.http_workers)?;
        }
    }
    Ok(())
}
