use anyhow::Result;
use dotenvy::dotenv;
use std::sync::Arc;
use teloxide::prelude::*;

use subgate::cli::{Cli, Commands};
use subgate::core::{config, init_logger, logging::log_startup_configuration};
use subgate::payments::{build_provider, TariffCatalog};
use subgate::storage::create_pool;
use subgate::subscription::{start_scheduler, LifecyclePolicy, ReminderScheduler, RenewalSweeper, SubscriptionService};
use subgate::telegram::{create_bot, schema, setup_bot_commands, HandlerDeps, TelegramGateway};
use subgate::webhook;

/// Entry point: parses the command line and dispatches to a subcommand.
#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse_args();

    // Load environment variables from .env if present
    let _ = dotenv();

    init_logger(&config::LOG_FILE_PATH)?;

    match cli.command {
        Some(Commands::Run { no_sweeper }) => run_bot(!no_sweeper).await,
        Some(Commands::Sweep) => run_sweep_once().await,
        Some(Commands::Remind) => run_reminders_once().await,
        Some(Commands::CheckConfig) => check_config(),
        None => {
            log::info!("No command specified, running bot in default mode");
            run_bot(true).await
        }
    }
}

/// Wires storage, provider, gateway and policy into the engine.
fn build_service(bot: &Bot) -> Result<Arc<SubscriptionService>> {
    let pool = create_pool(&config::DATABASE_PATH, config::db_busy_timeout())?;
    let provider = build_provider(Some(bot.clone()))?;
    let gateway = Arc::new(TelegramGateway::new(bot.clone(), *config::GROUP_CHAT_ID));

    let service = SubscriptionService::new(pool, provider, gateway.clone(), gateway)
        .with_tariffs(TariffCatalog::from_config())
        .with_policy(LifecyclePolicy::from_config())
        .with_admins(config::admin::ADMIN_IDS.clone());
    Ok(Arc::new(service))
}

async fn run_bot(with_sweeper: bool) -> Result<()> {
    config::validate()?;
    log_startup_configuration();

    let bot = create_bot()?;
    if let Err(e) = setup_bot_commands(&bot).await {
        log::warn!("Failed to register bot commands: {}", e);
    }

    let service = build_service(&bot)?;
    log::info!("Payment provider: {}", service.provider_name());

    let scheduler = if with_sweeper {
        Some(start_scheduler(Arc::clone(&service), config::sweeper::interval()))
    } else {
        log::info!("Background sweeper disabled for this instance");
        None
    };

    let webhook_service = Arc::clone(&service);
    let webhook_task = tokio::spawn(async move {
        if let Err(e) = webhook::serve(webhook_service, config::webhook::BIND_ADDR.as_str()).await {
            log::error!("Webhook server error: {}", e);
        }
    });

    log::info!("Starting bot dispatcher (long polling)");
    Dispatcher::builder(bot, schema(HandlerDeps::new(service)))
        .dependencies(DependencyMap::new())
        .enable_ctrlc_handler()
        .build()
        .dispatch()
        .await;

    log::info!("Dispatcher shutdown gracefully");
    webhook_task.abort();
    if let Some(scheduler) = scheduler {
        scheduler.abort();
    }
    Ok(())
}

async fn run_sweep_once() -> Result<()> {
    let bot = create_bot()?;
    let service = build_service(&bot)?;
    let report = RenewalSweeper::new(service).run_once().await?;
    println!("{:#?}", report);
    Ok(())
}

async fn run_reminders_once() -> Result<()> {
    let bot = create_bot()?;
    let service = build_service(&bot)?;
    let report = ReminderScheduler::new(service).run_once().await?;
    println!("{:#?}", report);
    Ok(())
}

fn check_config() -> Result<()> {
    match config::validate() {
        Ok(()) => {
            log_startup_configuration();
            println!("Configuration OK");
            Ok(())
        }
        Err(e) => {
            println!("Configuration error: {}", e);
            Err(e.into())
        }
    }
}
