use std::path::PathBuf;
use std::sync::Arc;

use clap::{Parser, Subcommand};
use meridian::bag::ResourceBag;
use meridian::resource::Manager;
use meridian::settings::Settings;
use meridian::source::{Controller, ContextResolver, DatabaseSource};
use meridian::{check, web};
use migration::{Migrator, MigratorTrait};
use miette::{IntoDiagnostic, Result};
use tracing_subscriber::{fmt, EnvFilter};

#[derive(Parser, Debug)]
#[command(
    name = "meridian",
    version,
    about = "Multi-tenant configuration source and resource resolution engine"
)]
struct Cli {
    /// Path to configuration file
    #[arg(short, long, default_value = "meridian.toml")]
    config: String,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Run the HTTP server
    Serve,
    /// Print a directory as a JSON resource bag
    Pack { directory: PathBuf },
    /// Write a JSON resource bag out as a directory tree
    Unpack {
        #[arg(long)]
        data_json_file: PathBuf,
        #[arg(long)]
        output_directory: PathBuf,
    },
    /// Manage database-backed apps
    Configsource {
        #[command(subcommand)]
        command: ConfigsourceCommand,
    },
    /// Manage plans and their feature limits
    Plan {
        #[command(subcommand)]
        command: PlanCommand,
    },
    /// Control-plane database maintenance
    Database {
        #[command(subcommand)]
        command: DatabaseCommand,
    },
}

#[derive(Subcommand, Debug)]
enum ConfigsourceCommand {
    /// Store an app directory as a new database-backed app
    Create {
        directory: PathBuf,
        #[arg(long, default_value = "")]
        plan_name: String,
    },
    /// Validate stored apps; all apps when none are given
    CheckDatabase { app_ids: Vec<String> },
    /// Map a domain to a stored app
    AddDomain { app_id: String, domain: String },
    /// Remove a domain mapping
    RemoveDomain { domain: String },
}

#[derive(Subcommand, Debug)]
enum PlanCommand {
    /// Create a plan or replace its authgear.features.yaml
    Update {
        name: String,
        #[arg(long)]
        feature_config_file: PathBuf,
    },
}

#[derive(Subcommand, Debug)]
enum DatabaseCommand {
    Migrate {
        #[command(subcommand)]
        command: MigrateCommand,
    },
}

#[derive(Subcommand, Debug)]
enum MigrateCommand {
    /// Apply pending migrations
    Up,
    /// List migrations; fails if any are pending
    Status,
}

#[tokio::main]
async fn main() -> Result<()> {
    // logging
    let env_filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    fmt().with_env_filter(env_filter).with_writer(std::io::stderr).init();

    let cli = Cli::parse();

    match cli.command {
        Command::Pack { directory } => {
            let bag = ResourceBag::pack_directory(&directory)?;
            println!("{}", bag.to_json_pretty()?);
            Ok(())
        }
        Command::Unpack {
            data_json_file,
            output_directory,
        } => {
            let json = std::fs::read_to_string(&data_json_file).into_diagnostic()?;
            ResourceBag::from_json(&json)?.unpack_into(&output_directory)?;
            tracing::info!(directory = %output_directory.display(), "Unpacked resources");
            Ok(())
        }
        command => {
            let settings = Settings::load(&cli.config)?;
            tracing::info!(?settings, "Loaded configuration");
            run(settings, command).await
        }
    }
}

async fn run(settings: Settings, command: Command) -> Result<()> {
    match command {
        Command::Serve => {
            let controller = Arc::new(Controller::connect(&settings).await?);
            controller.open().await?;
            let served = web::serve(settings, controller.clone()).await;
            controller.close().await?;
            served
        }
        Command::Configsource { command } => {
            let db = sea_orm::Database::connect(&settings.database.url)
                .await
                .into_diagnostic()?;
            let builtin = Manager::builtin(&settings);
            match command {
                ConfigsourceCommand::Create {
                    directory,
                    plan_name,
                } => {
                    let ctx = check::check_directory(&builtin, &directory)?;
                    let files = ResourceBag::pack_directory(&directory)?.files()?;
                    let source = DatabaseSource::new(&settings, builtin, db);
                    source
                        .create_database_source(&ctx.app_id, files, &plan_name)
                        .await?;
                    source.close().await?;
                    println!("{}", ctx.app_id);
                    Ok(())
                }
                ConfigsourceCommand::CheckDatabase { app_ids } => {
                    let report = check::check_database(&db, &builtin, &app_ids).await?;
                    for failure in &report.failures {
                        println!("{}: {}", failure.app_id, failure.error);
                    }
                    if report.is_ok() {
                        Ok(())
                    } else {
                        Err(miette::miette!(
                            "{} of {} apps failed validation",
                            report.failures.len(),
                            report.checked
                        ))
                    }
                }
                ConfigsourceCommand::AddDomain { app_id, domain } => {
                    DatabaseSource::new(&settings, builtin, db)
                        .add_domain(&app_id, &domain)
                        .await?;
                    Ok(())
                }
                ConfigsourceCommand::RemoveDomain { domain } => {
                    let removed = DatabaseSource::new(&settings, builtin, db)
                        .remove_domain(&domain)
                        .await?;
                    if removed {
                        Ok(())
                    } else {
                        Err(miette::miette!("domain `{domain}` is not mapped"))
                    }
                }
            }
        }
        Command::Plan {
            command:
                PlanCommand::Update {
                    name,
                    feature_config_file,
                },
        } => {
            let db = sea_orm::Database::connect(&settings.database.url)
                .await
                .into_diagnostic()?;
            let feature_config = std::fs::read_to_string(&feature_config_file).into_diagnostic()?;
            DatabaseSource::new(&settings, Manager::builtin(&settings), db)
                .upsert_plan(&name, &feature_config)
                .await?;
            tracing::info!(plan = %name, "Plan updated");
            Ok(())
        }
        Command::Database {
            command: DatabaseCommand::Migrate { command },
        } => {
            let db = sea_orm::Database::connect(&settings.database.url)
                .await
                .into_diagnostic()?;
            match command {
                MigrateCommand::Up => {
                    Migrator::up(&db, None).await.into_diagnostic()?;
                    tracing::info!("Migrations applied");
                    Ok(())
                }
                MigrateCommand::Status => {
                    let pending = Migrator::get_pending_migrations(&db)
                        .await
                        .into_diagnostic()?;
                    for migration in &pending {
                        println!("pending: {}", migration.name());
                    }
                    if pending.is_empty() {
                        println!("up to date");
                        Ok(())
                    } else {
                        Err(miette::miette!("{} pending migrations", pending.len()))
                    }
                }
            }
        }
        Command::Pack { .. } | Command::Unpack { .. } => Ok(()),
    }
}
